//! Connection supervisor: keeps a session alive across failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use super::frame::RgbColor;
use super::session::{Callbacks, Session, SessionHandle, wait_for_shutdown};
use super::transport::{Connector, TungsteniteConnector};
use crate::config::RetryPolicy;
use crate::error::{HassError, Result};
use crate::targets;

/// A running supervision loop.
struct RunningLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything the loop task needs, moved into it on start.
struct LoopContext {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    url: Url,
    credential: String,
    callbacks: Callbacks,
    active: Arc<Mutex<Option<SessionHandle>>>,
    attempts: Arc<AtomicU64>,
}

/// Owns the reconnect loop for one remote endpoint.
///
/// [`start`](Self::start) spawns a task that builds a fresh [`Session`],
/// runs it until it ends for any reason, waits [`RetryPolicy::interval`] and
/// tries again, forever, until [`stop`](Self::stop) is called. There is no
/// backoff growth and no attempt limit.
///
/// Must be started from within a tokio runtime.
///
/// # Example
///
/// ```ignore
/// let supervisor = Supervisor::new(RetryPolicy::default());
/// supervisor.start(
///     url,
///     token,
///     Callbacks::new()
///         .on_ready(|_session| { tracing::info!("ready"); Ok(()) })
///         .on_message(|frame| { tracing::info!(?frame, "message"); Ok(()) }),
/// );
///
/// supervisor.send_light_command([255, 0, 0], "desk")?;
/// supervisor.stop();
/// ```
pub struct Supervisor {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    active: Arc<Mutex<Option<SessionHandle>>>,
    attempts: Arc<AtomicU64>,
    running: Mutex<Option<RunningLoop>>,
}

impl Supervisor {
    /// Create a supervisor that connects with `tokio-tungstenite`.
    pub fn new(policy: RetryPolicy) -> Self {
        let connector = TungsteniteConnector::new().connect_timeout(policy.connect_timeout);
        Self::with_connector(Arc::new(connector), policy)
    }

    /// Create a supervisor with a custom connector.
    pub fn with_connector(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            active: Arc::new(Mutex::new(None)),
            attempts: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Start the supervised loop and return immediately.
    ///
    /// Calling this while a loop is running stops that loop first and
    /// replaces it.
    pub fn start(&self, url: Url, credential: impl Into<String>, callbacks: Callbacks) {
        let mut running = self.running.lock();
        if let Some(previous) = running.take() {
            tracing::debug!(target: targets::SUPERVISOR, "Replacing running connection loop");
            Self::signal_stop(previous);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = LoopContext {
            connector: self.connector.clone(),
            policy: self.policy.clone(),
            url,
            credential: credential.into(),
            callbacks,
            active: self.active.clone(),
            attempts: self.attempts.clone(),
        };
        let task = tokio::spawn(supervise(context, shutdown_rx));

        *running = Some(RunningLoop {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stop the loop.
    ///
    /// A pending read or connect is interrupted promptly. No new attempt
    /// starts after this returns; the current one may still be closing its
    /// transport in the background.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            tracing::info!(target: targets::SUPERVISOR, "Stopping connection loop");
            Self::signal_stop(running);
        }
    }

    /// Check if a loop has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Number of connection attempts started since creation.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Handle to the session currently owned by the loop, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.active.lock().clone()
    }

    /// Send a light color through the active session.
    ///
    /// Fails with [`HassError::NotConnected`] when no session is ready.
    pub fn send_light_command(&self, rgb: RgbColor, entity: &str) -> Result<u64> {
        self.session()
            .ok_or(HassError::NotConnected)?
            .send_light_command(rgb, entity)
    }

    /// The retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn signal_stop(running: RunningLoop) {
        // The task may already have exited; nothing to do then.
        let _ = running.shutdown.send(true);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("policy", &self.policy)
            .field("attempts", &self.attempts())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn supervise(context: LoopContext, mut shutdown: watch::Receiver<bool>) {
    let LoopContext {
        connector,
        policy,
        url,
        credential,
        callbacks,
        active,
        attempts,
    } = context;

    tracing::info!(target: targets::SUPERVISOR, url = %url, "Connection loop started");

    loop {
        let session = Session::new(url.clone(), credential.as_str())
            .dispatch_capacity(policy.dispatch_capacity);
        let handle = session.handle();
        {
            // A replacing loop may already own the slot once stop is signalled
            let mut slot = active.lock();
            if *shutdown.borrow() {
                break;
            }
            *slot = Some(handle.clone());
        }
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::debug!(target: targets::SUPERVISOR, attempt, "Connecting");
        let result = session
            .connect_and_run(connector.as_ref(), &callbacks, shutdown.clone())
            .await;

        {
            let mut slot = active.lock();
            if slot.as_ref().is_some_and(|current| current.same_session(&handle)) {
                *slot = None;
            }
        }

        match result {
            Ok(()) => {
                tracing::info!(target: targets::SUPERVISOR, attempt, "Connection closed, reconnecting");
            }
            Err(HassError::Cancelled) => break,
            Err(e) if e.is_retryable() => {
                tracing::warn!(target: targets::SUPERVISOR, attempt, error = %e, "Connection failed, retrying");
            }
            Err(e) => {
                tracing::error!(target: targets::SUPERVISOR, attempt, error = %e, "Connection failed, retrying");
            }
        }

        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    tracing::info!(target: targets::SUPERVISOR, url = %url, "Connection loop stopped");
}
