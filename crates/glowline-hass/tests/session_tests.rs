//! Tests for the protocol session over scripted transports.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use glowline_hass::websocket::{Callbacks, ConnectionState, Session, SessionHandle};
use glowline_hass::HassError;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::{MockConnector, MockPeer, test_url, wait_until};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Ready,
    Message(Value),
}

fn recording_callbacks() -> (Callbacks, Arc<Mutex<Vec<Call>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let ready_calls = calls.clone();
    let message_calls = calls.clone();
    let callbacks = Callbacks::new()
        .on_ready(move |_| {
            ready_calls.lock().push(Call::Ready);
            Ok(())
        })
        .on_message(move |frame| {
            message_calls.lock().push(Call::Message(frame.into_payload()));
            Ok(())
        });
    (callbacks, calls)
}

struct Running {
    handle: SessionHandle,
    peer: MockPeer,
    task: JoinHandle<glowline_hass::Result<()>>,
    shutdown: watch::Sender<bool>,
}

async fn start_session(callbacks: Callbacks) -> Running {
    start_session_with(Session::new(test_url(), "secret-token"), callbacks).await
}

/// Run `session` on a mock connector and wait for its server side.
async fn start_session_with(session: Session, callbacks: Callbacks) -> Running {
    let (connector, mut peers) = MockConnector::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = session.handle();

    let task = tokio::spawn(async move {
        session
            .connect_and_run(&*connector, &callbacks, shutdown_rx)
            .await
    });

    let peer = tokio::time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("session never connected")
        .expect("connector dropped");

    assert!(wait_until(|| handle.state() == ConnectionState::AwaitingAuthRequired).await);

    Running {
        handle,
        peer,
        task,
        shutdown,
    }
}

/// Drive the handshake to `Ready`.
async fn authenticate(running: &mut Running) {
    running.peer.send_json(r#"{"type":"auth_required","ha_version":"2024.6.0"}"#);
    let auth = running.peer.recv_json().await;
    assert_eq!(auth, json!({"type": "auth", "access_token": "secret-token"}));
    running.peer.send_json(r#"{"type":"auth_ok","ha_version":"2024.6.0"}"#);
    assert!(wait_until(|| running.handle.is_ready()).await);
}

async fn finish(task: JoinHandle<glowline_hass::Result<()>>) -> glowline_hass::Result<()> {
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("session did not end")
        .expect("session task panicked")
}

#[tokio::test]
async fn test_handshake_then_event_in_order() {
    let (callbacks, calls) = recording_callbacks();
    let mut running = start_session(callbacks).await;

    running.peer.send_json(r#"{"type":"auth_required"}"#);
    let auth = running.peer.recv_json().await;
    assert_eq!(auth, json!({"type": "auth", "access_token": "secret-token"}));
    assert!(wait_until(|| running.handle.state() == ConnectionState::Authenticating).await);

    running.peer.send_json(r#"{"type":"auth_ok"}"#);
    running.peer.send_json(r#"{"type":"event","data":"x"}"#);

    assert!(wait_until(|| calls.lock().len() == 2).await);
    assert_eq!(
        *calls.lock(),
        vec![
            Call::Ready,
            Call::Message(json!({"type": "event", "data": "x"})),
        ]
    );

    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
    assert_eq!(running.handle.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_early_auth_ok_is_ignored() {
    let (callbacks, calls) = recording_callbacks();
    let mut running = start_session(callbacks).await;

    running.peer.send_json(r#"{"type":"auth_ok"}"#);
    running.peer.send_json(r#"{"type":"event","data":"too early"}"#);
    running.peer.send_json(r#"{"type":"auth_required"}"#);
    let _auth = running.peer.recv_json().await;

    assert!(wait_until(|| running.handle.state() == ConnectionState::Authenticating).await);
    assert!(calls.lock().is_empty());

    running.peer.send_json(r#"{"type":"auth_ok"}"#);
    running.peer.send_json(r#"{"type":"event","data":"on time"}"#);

    assert!(wait_until(|| calls.lock().len() == 2).await);
    assert_eq!(
        *calls.lock(),
        vec![
            Call::Ready,
            Call::Message(json!({"type": "event", "data": "on time"})),
        ]
    );

    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
}

#[tokio::test]
async fn test_repeated_auth_required_resends_credentials() {
    let (callbacks, calls) = recording_callbacks();
    let mut running = start_session(callbacks).await;
    authenticate(&mut running).await;

    running.peer.send_json(r#"{"type":"auth_required"}"#);
    let auth = running.peer.recv_json().await;
    assert_eq!(auth["type"], "auth");
    assert!(wait_until(|| running.handle.state() == ConnectionState::Authenticating).await);

    running.peer.send_json(r#"{"type":"auth_ok"}"#);
    assert!(wait_until(|| calls.lock().len() == 2).await);
    assert_eq!(*calls.lock(), vec![Call::Ready, Call::Ready]);

    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
}

#[tokio::test]
async fn test_close_frame_ends_session_without_dispatch() {
    let (callbacks, calls) = recording_callbacks();
    let mut running = start_session(callbacks).await;
    authenticate(&mut running).await;

    let started = Instant::now();
    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
    assert!(started.elapsed() < Duration::from_millis(500));

    // Transport is closed and nothing else was written
    assert!(running.peer.wait_closed().await.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*calls.lock(), vec![Call::Ready]);
}

#[tokio::test]
async fn test_request_ids_increase_and_restart_per_session() {
    let mut running = start_session(Callbacks::new()).await;
    authenticate(&mut running).await;

    assert_eq!(running.handle.send_light_command([10, 20, 30], "lamp1").unwrap(), 1);
    assert_eq!(running.handle.send_light_command([1, 2, 3], "lamp2").unwrap(), 2);
    assert_eq!(running.handle.send_light_command([4, 5, 6], "lamp1").unwrap(), 3);

    let first = running.peer.recv_json().await;
    assert_eq!(
        first,
        json!({
            "id": 1,
            "type": "call_service",
            "domain": "light",
            "service": "turn_on",
            "service_data": {"rgb_color": [10, 20, 30]},
            "target": {"entity_id": "light.lamp1"}
        })
    );
    assert_eq!(running.peer.recv_json().await["id"], 2);
    assert_eq!(running.peer.recv_json().await["id"], 3);

    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());

    let mut second = start_session(Callbacks::new()).await;
    authenticate(&mut second).await;
    assert_eq!(second.handle.send_light_command([7, 8, 9], "lamp1").unwrap(), 1);
    assert_eq!(second.peer.recv_json().await["id"], 1);

    second.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(second.task).await.is_ok());
}

#[tokio::test]
async fn test_light_command_writes_exactly_one_frame() {
    let mut running = start_session(Callbacks::new()).await;
    authenticate(&mut running).await;

    running.handle.send_light_command([10, 20, 30], "lamp1").unwrap();
    let frame = running.peer.recv_json().await;
    assert_eq!(frame["service_data"]["rgb_color"], json!([10, 20, 30]));
    assert_eq!(frame["target"]["entity_id"], "light.lamp1");

    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
    assert!(running.peer.wait_closed().await.is_empty());
}

#[tokio::test]
async fn test_commands_rejected_outside_ready() {
    let mut running = start_session(Callbacks::new()).await;

    // Transport open but not authenticated yet
    assert!(matches!(
        running.handle.send_light_command([1, 1, 1], "desk"),
        Err(HassError::NotConnected)
    ));

    authenticate(&mut running).await;
    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());

    assert_eq!(running.handle.state(), ConnectionState::Closed);
    assert!(matches!(
        running.handle.send_light_command([1, 1, 1], "desk"),
        Err(HassError::NotConnected)
    ));
}

#[tokio::test]
async fn test_transport_error_ends_session() {
    let mut running = start_session(Callbacks::new()).await;
    authenticate(&mut running).await;

    running.peer.send_error("connection reset by peer");
    let result = finish(running.task).await;
    assert!(matches!(result, Err(HassError::Transport(_))));
    assert_eq!(running.handle.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_abrupt_disconnect_is_a_failure() {
    let mut running = start_session(Callbacks::new()).await;
    running.peer.drop_connection();

    let result = finish(running.task).await;
    assert!(matches!(result, Err(HassError::Transport(_))));
}

#[tokio::test]
async fn test_malformed_frame_closes_with_protocol_error() {
    let mut running = start_session(Callbacks::new()).await;
    authenticate(&mut running).await;

    running.peer.send_json("{this is not json");
    let result = finish(running.task).await;
    assert!(matches!(result, Err(HassError::Protocol(_))));
    assert!(running.peer.wait_closed().await.is_empty());
}

#[tokio::test]
async fn test_handler_failures_do_not_stop_session() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    let callbacks = Callbacks::new()
        .on_ready(|_| Err("ready handler failed".into()))
        .on_message(move |frame| {
            let data = frame.payload()["data"].as_str().unwrap_or_default().to_string();
            seen_in_handler.lock().push(data.clone());
            match data.as_str() {
                "error" => Err("handler returned an error".into()),
                "panic" => panic!("handler panicked"),
                _ => Ok(()),
            }
        });

    let mut running = start_session(callbacks).await;
    authenticate(&mut running).await;

    running.peer.send_json(r#"{"type":"event","data":"error"}"#);
    running.peer.send_json(r#"{"type":"event","data":"panic"}"#);
    running.peer.send_json(r#"{"type":"event","data":"fine"}"#);

    assert!(wait_until(|| seen.lock().len() == 3).await);
    assert_eq!(*seen.lock(), vec!["error", "panic", "fine"]);
    assert!(running.handle.is_ready());

    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
}

#[tokio::test]
async fn test_slow_handler_does_not_block_receive_loop() {
    let callbacks = Callbacks::new().on_message(|_| {
        std::thread::sleep(Duration::from_millis(1500));
        Ok(())
    });

    let mut running = start_session(callbacks).await;
    authenticate(&mut running).await;

    running.peer.send_json(r#"{"type":"event","data":"slow"}"#);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn test_slow_ready_handler_does_not_block_receive_loop() {
    let callbacks = Callbacks::new().on_ready(|_| {
        std::thread::sleep(Duration::from_millis(1500));
        Ok(())
    });

    let mut running = start_session(callbacks).await;
    authenticate(&mut running).await;

    let started = Instant::now();
    running.peer.send_error("connection reset by peer");
    let result = finish(running.task).await;
    assert!(matches!(result, Err(HassError::Transport(_))));
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn test_ready_survives_full_callback_queue() {
    let readies = Arc::new(AtomicUsize::new(0));
    let counter = readies.clone();
    let callbacks = Callbacks::new()
        .on_ready(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .on_message(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });

    let session = Session::new(test_url(), "secret-token").dispatch_capacity(1);
    let mut running = start_session_with(session, callbacks).await;
    authenticate(&mut running).await;
    assert!(wait_until(|| readies.load(Ordering::SeqCst) == 1).await);

    // One frame in flight, one queued, the rest over capacity
    for n in 0..4 {
        running.peer.send_json(&format!(r#"{{"type":"event","data":{n}}}"#));
    }
    running.peer.send_json(r#"{"type":"auth_required"}"#);
    let _auth = running.peer.recv_json().await;
    running.peer.send_json(r#"{"type":"auth_ok"}"#);

    assert!(wait_until(|| readies.load(Ordering::SeqCst) == 2).await);
    assert!(running.handle.is_ready());

    running.peer.send_json(r#"{"type":"close"}"#);
    assert!(finish(running.task).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_interrupts_blocked_read() {
    let mut running = start_session(Callbacks::new()).await;
    authenticate(&mut running).await;

    let started = Instant::now();
    running.shutdown.send(true).unwrap();
    let result = finish(running.task).await;
    assert!(matches!(result, Err(HassError::Cancelled)));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(running.peer.wait_closed().await.is_empty());
}

#[tokio::test]
async fn test_disconnect_closes_transport() {
    let mut running = start_session(Callbacks::new()).await;
    authenticate(&mut running).await;

    running.handle.disconnect();
    running.handle.disconnect();
    assert!(finish(running.task).await.is_ok());
    assert_eq!(running.handle.state(), ConnectionState::Closed);
    assert!(!running.handle.is_connected());
    assert!(running.peer.wait_closed().await.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_connect() {
    let (connector, _peers) = MockConnector::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    shutdown.send(true).unwrap();

    let session = Session::new(test_url(), "secret-token");
    let handle = session.handle();
    let result = session
        .connect_and_run(&*connector, &Callbacks::new(), shutdown_rx)
        .await;

    assert!(matches!(result, Err(HassError::Cancelled)));
    assert_eq!(handle.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_refused_connection_is_transport_error() {
    let connector = MockConnector::refusing();
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let session = Session::new(test_url(), "secret-token");
    let result = session
        .connect_and_run(&*connector, &Callbacks::new(), shutdown_rx)
        .await;

    assert!(matches!(result, Err(HassError::Transport(_))));
    assert_eq!(connector.attempts(), 1);
}
