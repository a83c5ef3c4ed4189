//! Scripted in-memory transports for driving sessions from tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use glowline_hass::websocket::{Connector, Message, Transport};
use glowline_hass::HassError;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

/// The server side of one in-memory connection.
pub struct MockPeer {
    to_client: Option<mpsc::UnboundedSender<Result<Message, HassError>>>,
    from_client: mpsc::UnboundedReceiver<Message>,
}

impl MockPeer {
    /// Push a JSON text frame to the client.
    pub fn send_json(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(Message::Text(text.to_string().into())));
        }
    }

    /// Push a transport error to the client.
    pub fn send_error(&self, message: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Err(HassError::Transport(message.to_string())));
        }
    }

    /// End the client's inbound stream without a close frame.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }

    /// Next frame written by the client, decoded as JSON.
    pub async fn recv_json(&mut self) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed the transport");
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("client sent invalid JSON"),
            other => panic!("unexpected client message: {other:?}"),
        }
    }

    /// Wait until the client drops its sink, returning the text frames still
    /// queued before that.
    pub async fn wait_closed(&mut self) -> Vec<String> {
        let mut remaining = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
                .await
                .expect("transport was not closed");
            match msg {
                Some(Message::Text(text)) => remaining.push(text.to_string()),
                Some(_) => {}
                None => return remaining,
            }
        }
    }
}

/// Connector handing each connection's server side to the test.
pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    fail: bool,
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<Instant>>,
}

impl MockConnector {
    /// A connector whose connections succeed; peers arrive on the receiver.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers: tx,
            fail: false,
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
        });
        (connector, rx)
    }

    /// A connector whose every connection attempt is refused.
    pub fn refusing() -> Arc<Self> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peers: tx,
            fail: true,
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, _url: &Url) -> BoxFuture<'static, glowline_hass::Result<Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().push(Instant::now());

        if self.fail {
            return Box::pin(async {
                Err::<Transport, _>(HassError::Transport("connection refused".into()))
            });
        }

        let (to_client, client_inbound) = mpsc::unbounded_channel();
        let (client_outbound, from_client) = mpsc::unbounded_channel::<Message>();

        let _ = self.peers.send(MockPeer {
            to_client: Some(to_client),
            from_client,
        });

        let sink = futures_util::sink::unfold(client_outbound, |tx, msg: Message| async move {
            tx.send(msg)
                .map_err(|_| HassError::Transport("peer gone".into()))?;
            Ok::<_, HassError>(tx)
        });
        let stream = UnboundedReceiverStream::new(client_inbound);

        Box::pin(async move { Ok::<_, HassError>(Transport::new(sink, stream)) })
    }
}

/// Test URL; never dialled by the mock connector.
pub fn test_url() -> Url {
    Url::parse("ws://127.0.0.1:8123/api/websocket").unwrap()
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
