//! One physical connection to Home Assistant: handshake, dispatch and sends.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::frame::{AuthRequest, CommandBody, FrameKind, InboundFrame, OutboundCommand, RgbColor};
use super::state::ConnectionState;
use super::transport::{Connector, FrameSink, Transport};
use crate::error::{HassError, Result};
use crate::targets;

/// How long closing the transport may take before it is abandoned.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Error type host callbacks may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of host callbacks.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type ReadyFn = dyn Fn(&SessionHandle) -> HandlerResult + Send + Sync;
type MessageFn = dyn Fn(InboundFrame) -> HandlerResult + Send + Sync;

fn ignore_ready(_: &SessionHandle) -> HandlerResult {
    Ok(())
}

fn ignore_message(_: InboundFrame) -> HandlerResult {
    Ok(())
}

/// Host callbacks invoked by a session.
///
/// Callbacks run on a dedicated blocking thread, one at a time and in arrival
/// order, never on the receive loop. An error or panic inside a callback is logged
/// and otherwise ignored.
#[derive(Clone)]
pub struct Callbacks {
    on_ready: Arc<ReadyFn>,
    on_message: Arc<MessageFn>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_ready: Arc::new(ignore_ready),
            on_message: Arc::new(ignore_message),
        }
    }
}

impl Callbacks {
    /// Callbacks that do nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per successful handshake with a handle for sending commands.
    pub fn on_ready<F>(mut self, f: F) -> Self
    where
        F: Fn(&SessionHandle) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_ready = Arc::new(f);
        self
    }

    /// Called for every non-handshake frame received while ready.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(InboundFrame) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_message = Arc::new(f);
        self
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

/// Work queued for the dispatcher thread.
enum Dispatch {
    Ready,
    Message(InboundFrame),
}

/// Feeds the dispatcher thread.
///
/// Message frames are bounded by `capacity`; ready notifications are never
/// dropped.
struct DispatchQueue {
    tx: mpsc::UnboundedSender<Dispatch>,
    queued_messages: Arc<AtomicUsize>,
    capacity: usize,
}

impl DispatchQueue {
    fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<Dispatch>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued_messages = Arc::new(AtomicUsize::new(0));
        let queue = Self {
            tx,
            queued_messages: queued_messages.clone(),
            capacity,
        };
        (queue, rx, queued_messages)
    }

    fn ready(&self) {
        let _ = self.tx.send(Dispatch::Ready);
    }

    fn message(&self, frame: InboundFrame) {
        if self.queued_messages.fetch_add(1, Ordering::SeqCst) >= self.capacity {
            self.queued_messages.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(
                target: targets::SESSION,
                frame_type = frame.type_name(),
                "Callback queue full, dropping frame"
            );
            return;
        }
        if self.tx.send(Dispatch::Message(frame)).is_err() {
            self.queued_messages.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Request sent from a handle to the receive loop.
enum Outbound {
    Text(String),
    Close,
}

/// What the receive loop does after a frame.
enum Flow {
    Continue,
    Close,
}

/// State shared between a session's receive loop and its handles.
struct SessionShared {
    state: Mutex<ConnectionState>,
    next_request_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

/// Cloneable handle for sending on a session from anywhere.
///
/// Sends never wait on the network: the text is queued and written by the
/// session's receive loop.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(SessionShared {
                state: Mutex::new(ConnectionState::Disconnected),
                next_request_id: AtomicU64::new(1),
                outbound: Mutex::new(None),
            }),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Check if the session is authenticated.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Check if the transport is open.
    pub fn is_connected(&self) -> bool {
        self.shared.outbound.lock().is_some()
    }

    /// Whether both handles refer to the same session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Serialize and queue a command.
    ///
    /// Fails with [`HassError::NotConnected`] when no transport is open.
    pub fn send(&self, command: &OutboundCommand) -> Result<()> {
        let text = command.to_text()?;
        self.send_text(text)
    }

    /// Assign the next request id to `body` and queue it.
    ///
    /// Only valid once authenticated; returns the id used.
    pub fn send_command(&self, body: CommandBody) -> Result<u64> {
        // Lock order: outbound, then state. Ids advance only on a queued send.
        let outbound = self.shared.outbound.lock();
        let tx = outbound.as_ref().ok_or(HassError::NotConnected)?;
        if !self.state().is_ready() {
            return Err(HassError::NotConnected);
        }

        let id = self.shared.next_request_id.load(Ordering::SeqCst);
        let text = OutboundCommand::new(id, body).to_text()?;
        tx.send(Outbound::Text(text))
            .map_err(|_| HassError::NotConnected)?;
        self.shared.next_request_id.store(id + 1, Ordering::SeqCst);
        Ok(id)
    }

    /// Set `light.<entity>` to `rgb`.
    pub fn send_light_command(&self, rgb: RgbColor, entity: &str) -> Result<u64> {
        self.send_command(CommandBody::light_turn_on(rgb, entity))
    }

    /// Ask the receive loop to close the transport. No-op when already closed.
    pub fn disconnect(&self) {
        if let Some(tx) = self.shared.outbound.lock().take() {
            let _ = tx.send(Outbound::Close);
        }
    }

    fn send_text(&self, text: String) -> Result<()> {
        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Outbound::Text(text))
                .map_err(|_| HassError::NotConnected),
            None => Err(HassError::NotConnected),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.shared.state.lock() = state;
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.shared.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn mark_closed(&self) {
        let mut outbound = self.shared.outbound.lock();
        outbound.take();
        self.set_state(ConnectionState::Closed);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// State scoped to one connection attempt.
///
/// A session is consumed by [`connect_and_run`](Self::connect_and_run);
/// reconnecting means building a new one, so request ids start over at 1.
pub struct Session {
    url: Url,
    credential: String,
    dispatch_capacity: usize,
    handle: SessionHandle,
}

impl Session {
    /// Create a session for `url` authenticating with `credential`.
    pub fn new(url: Url, credential: impl Into<String>) -> Self {
        Self {
            url,
            credential: credential.into(),
            dispatch_capacity: 256,
            handle: SessionHandle::new(),
        }
    }

    /// Set the capacity of the callback queue (minimum 1).
    pub fn dispatch_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = capacity.max(1);
        self
    }

    /// A handle for sending on this session.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// The websocket URL this session connects to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open the transport and run the handshake and receive loop until the
    /// connection ends.
    ///
    /// Returns `Ok(())` when the server or a handle closed the connection,
    /// [`HassError::Cancelled`] when `shutdown` turned `true`, and any other
    /// error when the transport failed or a frame could not be decoded.
    pub async fn connect_and_run(
        self,
        connector: &dyn Connector,
        callbacks: &Callbacks,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let connected = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => Err(HassError::Cancelled),
            result = connector.connect(&self.url) => result,
        };
        let Transport {
            mut sink,
            mut stream,
        } = match connected {
            Ok(transport) => transport,
            Err(e) => {
                self.handle.mark_closed();
                return Err(e);
            }
        };

        tracing::info!(target: targets::SESSION, url = %self.url, "Websocket connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        *self.handle.shared.outbound.lock() = Some(outbound_tx);
        self.handle.set_state(ConnectionState::AwaitingAuthRequired);

        let (dispatch, dispatch_rx, queued_messages) = DispatchQueue::new(self.dispatch_capacity);
        let dispatcher_callbacks = callbacks.clone();
        let dispatcher_handle = self.handle.clone();
        tokio::task::spawn_blocking(move || {
            run_dispatcher(dispatch_rx, queued_messages, dispatcher_callbacks, dispatcher_handle)
        });

        let result = loop {
            tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown) => {
                    tracing::debug!(target: targets::SESSION, "Stop requested, closing websocket");
                    break Err(HassError::Cancelled);
                }

                // Queued sends and close requests from handles
                command = outbound_rx.recv() => {
                    match command {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                break Err(e);
                            }
                        }
                        Some(Outbound::Close) | None => {
                            tracing::debug!(target: targets::SESSION, "Disconnect requested");
                            break Ok(());
                        }
                    }
                }

                // Frames from the server
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match self.handle_text(text.as_str(), &mut sink, &dispatch).await {
                                Ok(Flow::Continue) => {}
                                Ok(Flow::Close) => break Ok(()),
                                Err(e) => break Err(e),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::debug!(target: targets::SESSION, ?frame, "Server closed the websocket");
                            break Ok(());
                        }
                        Some(Ok(_)) => {
                            // Binary, ping/pong and raw frames carry nothing for us
                        }
                        Some(Err(e)) => break Err(e),
                        None => {
                            break Err(HassError::Transport("connection dropped".into()));
                        }
                    }
                }
            }
        };

        self.handle.mark_closed();
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(target: targets::SESSION, error = %e, "Error while closing websocket");
            }
            Err(_) => {
                tracing::debug!(target: targets::SESSION, "Timed out closing websocket");
            }
        }

        match &result {
            Ok(()) => tracing::info!(target: targets::SESSION, "Websocket closed"),
            Err(e) => tracing::debug!(target: targets::SESSION, error = %e, "Websocket session ended"),
        }
        result
    }

    async fn handle_text(
        &self,
        text: &str,
        sink: &mut FrameSink,
        dispatch: &DispatchQueue,
    ) -> Result<Flow> {
        let frame = InboundFrame::parse(text)?;
        tracing::debug!(target: targets::SESSION, kind = %frame.kind(), "Frame received");

        match frame.kind() {
            FrameKind::Close => {
                tracing::info!(target: targets::SESSION, "Server requested close");
                Ok(Flow::Close)
            }
            FrameKind::AuthRequired => {
                // Answered every time, whatever the current state
                let auth = AuthRequest::new(&self.credential).to_text()?;
                sink.send(Message::Text(auth.into())).await?;
                self.handle.set_state(ConnectionState::Authenticating);
                tracing::debug!(target: targets::SESSION, "Credentials sent");
                Ok(Flow::Continue)
            }
            FrameKind::AuthOk => {
                if self
                    .handle
                    .transition(ConnectionState::Authenticating, ConnectionState::Ready)
                {
                    tracing::info!(target: targets::SESSION, "Authenticated");
                    dispatch.ready();
                } else {
                    tracing::debug!(
                        target: targets::SESSION,
                        state = %self.handle.state(),
                        "Ignoring auth_ok outside of handshake"
                    );
                }
                Ok(Flow::Continue)
            }
            FrameKind::AuthInvalid => {
                tracing::warn!(
                    target: targets::SESSION,
                    reason = frame.message().unwrap_or("unknown"),
                    "Authentication rejected"
                );
                Ok(Flow::Continue)
            }
            _ => {
                if self.handle.is_ready() {
                    dispatch.message(frame);
                } else {
                    tracing::debug!(
                        target: targets::SESSION,
                        frame_type = frame.type_name(),
                        "Ignoring frame before authentication"
                    );
                }
                Ok(Flow::Continue)
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once `shutdown` holds `true`. Never resolves if the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs callbacks until every [`DispatchQueue`] sender is gone.
fn run_dispatcher(
    mut queue: mpsc::UnboundedReceiver<Dispatch>,
    queued_messages: Arc<AtomicUsize>,
    callbacks: Callbacks,
    handle: SessionHandle,
) {
    while let Some(item) = queue.blocking_recv() {
        match item {
            Dispatch::Ready => invoke("on_ready", || (callbacks.on_ready)(&handle)),
            Dispatch::Message(frame) => {
                queued_messages.fetch_sub(1, Ordering::SeqCst);
                invoke("on_message", || (callbacks.on_message)(frame));
            }
        }
    }
}

fn invoke(callback: &'static str, f: impl FnOnce() -> HandlerResult) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let err = HassError::Handler(e.to_string());
            tracing::warn!(target: targets::SESSION, callback, error = %err, "Callback failed");
        }
        Err(panic) => {
            tracing::warn!(
                target: targets::SESSION,
                callback,
                panic = panic_message(panic.as_ref()),
                "Callback panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
