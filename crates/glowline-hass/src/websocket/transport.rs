//! Transport seam between a session and the network.
//!
//! A [`Connector`] opens one physical connection and returns it as a
//! [`Transport`]: a sink of outgoing websocket messages and a stream of
//! incoming ones. [`TungsteniteConnector`] is the production implementation;
//! tests plug in scripted connectors.

use std::pin::Pin;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{HassError, Result};

/// Outgoing half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = HassError> + Send>>;

/// Incoming half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// One open connection, split into its write and read halves.
pub struct Transport {
    /// Messages written here go to the server.
    pub sink: FrameSink,
    /// Messages from the server. Ends when the connection is gone.
    pub stream: FrameStream,
}

impl Transport {
    /// Box a sink and a stream into a transport.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Message, Error = HassError> + Send + 'static,
        R: Stream<Item = Result<Message>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports to a websocket URL.
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection. Each call must yield an independent transport.
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Transport>>;
}

/// Connector backed by `tokio-tungstenite`, supporting `ws://` and `wss://`.
#[derive(Clone, Debug, Default)]
pub struct TungsteniteConnector {
    connect_timeout: Option<Duration>,
}

impl TungsteniteConnector {
    /// Create a connector without a connect timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit how long opening the connection (TCP + TLS + upgrade) may take.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TungsteniteConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Transport>> {
        Box::pin(open_websocket(url.to_string(), self.connect_timeout))
    }
}

async fn open_websocket(url: String, connect_timeout: Option<Duration>) -> Result<Transport> {
    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (ws_stream, _response) = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| HassError::Timeout)??,
        None => connect.await?,
    };

    let (write, read) = ws_stream.split();
    Ok(Transport::new(
        write.sink_map_err(HassError::from),
        read.map(|msg| msg.map_err(HassError::from)),
    ))
}
