//! Control-plane tests: dispatcher, control socket and the HTTP proxy core
//! against a local stand-in for the core's REST controller.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use tunbridge_engine::control::{read_frame, write_frame};
use tunbridge_engine::{
    AdminClient, ControlClient, ControlServer, CoreProcess, Dispatcher, Error, HttpCore,
    ProxyMode, SessionState, TunnelController,
};

fn http_core(mock: &MockController) -> Arc<HttpCore> {
    Arc::new(HttpCore::new(admin(mock, Duration::from_secs(5))))
}

/// HTTP core that spawns a stand-in child to hold the interface
fn spawning_core(mock: &MockController, home: &std::path::Path) -> Arc<HttpCore> {
    let command = vec!["sleep".to_string(), "30".to_string()];
    let process = CoreProcess::new(&command, home)
        .unwrap()
        .with_grace(Duration::from_secs(2));
    Arc::new(
        HttpCore::new(admin(mock, Duration::from_secs(5)))
            .with_process(process, Duration::from_secs(2)),
    )
}

fn admin(mock: &MockController, timeout: Duration) -> AdminClient {
    AdminClient::new(format!("http://{}", mock.controller()), None, timeout).unwrap()
}

/// Dispatcher whose controller talks to `mock` for mode changes
fn dispatcher(home: &std::path::Path, mock: &MockController) -> Arc<Dispatcher> {
    let mut config = test_config(home);
    config.core.controller = mock.controller();
    let controller =
        TunnelController::new(config, http_core(mock), MockProvider::new()).unwrap();
    Arc::new(Dispatcher::new(
        Arc::new(controller),
        admin(mock, Duration::from_secs(5)),
    ))
}

async fn ask(dispatcher: &Dispatcher, message: &str) -> String {
    let reply = dispatcher.dispatch(message.as_bytes()).await.unwrap();
    String::from_utf8(reply).unwrap()
}

fn error_of(reply: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(reply)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_string)
}

#[tokio::test]
async fn test_ping() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    assert_eq!(ask(&dispatcher, "ping").await, "pong");
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_mode_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    assert_eq!(ask(&dispatcher, "getMode").await, "rule");
    assert_eq!(ask(&dispatcher, "setMode:global").await, "OK");
    assert_eq!(mock.mode(), "global");
    assert_eq!(ask(&dispatcher, "getMode").await, "global");

    let patch = mock
        .requests()
        .into_iter()
        .find(|r| r.method == "PATCH")
        .unwrap();
    assert_eq!(patch.path, "/configs");
    let body: serde_json::Value = serde_json::from_str(&patch.body).unwrap();
    assert_eq!(body["mode"], "global");
}

#[tokio::test]
async fn test_invalid_mode_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    let reply = ask(&dispatcher, "setMode:sideways").await;
    assert!(error_of(&reply).is_some());
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_get_mode_falls_back_to_rule() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let mut config = test_config(dir.path());
    config.core.controller = mock.controller();
    let controller = TunnelController::new(config, MockCore::new(), MockProvider::new()).unwrap();
    let dispatcher = Dispatcher::new(Arc::new(controller), admin(&mock, Duration::from_secs(5)));

    assert_eq!(ask(&dispatcher, "getMode").await, "rule");
}

#[tokio::test]
async fn test_api_forwarding() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    let reply = ask(&dispatcher, "GET|||/version|||").await;
    let version: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(version["version"], "v1.18.0");

    assert_eq!(
        ask(&dispatcher, "DELETE|||/connections|||").await,
        r#"{"success":true}"#
    );

    // Non-success bodies pass through untouched
    assert_eq!(
        ask(&dispatcher, "GET|||/nowhere|||").await,
        r#"{"message":"Resource not found"}"#
    );

    let reply = ask(&dispatcher, r#"PATCH|||/configs|||{"mode":"direct"}"#).await;
    assert_eq!(reply, r#"{"success":true}"#);
    assert_eq!(mock.mode(), "direct");

    let seen = mock.requests();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[3].method, "PATCH");
    assert_eq!(seen[3].body, r#"{"mode":"direct"}"#);
}

#[tokio::test]
async fn test_legacy_forms_match_canonical() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    let canonical = ask(&dispatcher, "GET|||/version|||").await;
    let colon = ask(&dispatcher, "GET:/version:").await;
    assert_eq!(canonical, colon);

    let lowercase = ask(&dispatcher, "get|||version|||").await;
    assert_eq!(canonical, lowercase);

    for legacy in ["ping", "getMode", "stats", "GET:/version"] {
        let reply = ask(&dispatcher, legacy).await;
        assert!(error_of(&reply).is_none(), "{} -> {}", legacy, reply);
    }

    let seen = mock.requests();
    assert!(seen
        .iter()
        .all(|r| r.method == "GET" && (r.path == "/version" || r.path == "/configs")));
}

#[tokio::test]
async fn test_unreachable_controller_yields_error_payload() {
    let dir = tempfile::tempdir().unwrap();
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap();
    drop(closed);

    let controller =
        TunnelController::new(test_config(dir.path()), MockCore::new(), MockProvider::new())
            .unwrap();
    let dead = AdminClient::new(format!("http://{}", dead_addr), None, Duration::from_secs(2))
        .unwrap();
    let dispatcher = Dispatcher::new(Arc::new(controller), dead);

    let reply = ask(&dispatcher, "GET|||/version|||").await;
    assert!(error_of(&reply).is_some(), "{}", reply);

    // Still answering afterwards
    assert_eq!(ask(&dispatcher, "ping").await, "pong");
}

#[tokio::test]
async fn test_slow_controller_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let controller =
        TunnelController::new(test_config(dir.path()), MockCore::new(), MockProvider::new())
            .unwrap();
    let dispatcher = Dispatcher::new(
        Arc::new(controller),
        admin(&mock, Duration::from_millis(200)),
    );

    let reply = ask(&dispatcher, "GET|||/slow|||").await;
    assert!(error_of(&reply).is_some(), "{}", reply);
}

#[tokio::test]
async fn test_stats_reply_is_json() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    let reply = ask(&dispatcher, "stats").await;
    let stats: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(stats["packets_in"], 0);
    assert_eq!(stats["dropped"], 0);
}

#[tokio::test]
async fn test_undecodable_and_unrecognized_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (tx, rx) = std::sync::mpsc::channel();
    dispatcher
        .handle_app_message(vec![0xff, 0xfe, 0xfd], move |reply| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(reply).unwrap();
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rx.recv().unwrap(), None);

    let counter = calls.clone();
    let (tx, rx) = std::sync::mpsc::channel();
    dispatcher
        .handle_app_message(b"hello".to_vec(), move |reply| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(reply).unwrap();
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let reply = String::from_utf8(rx.recv().unwrap().unwrap()).unwrap();
    assert_eq!(error_of(&reply).as_deref(), Some("unrecognized message format"));

    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_control_socket_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let socket = dir.path().join("control.sock");

    let server = ControlServer::new(&socket, dispatcher(dir.path(), &mock));
    let listener = server.bind().unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    let serving = tokio::spawn(async move { server.serve(listener).await });

    let client = ControlClient::new(&socket).with_timeout(Duration::from_secs(5));
    client.ping().await.unwrap();
    assert_eq!(client.get_mode().await.unwrap(), ProxyMode::Rule);
    client.set_mode(ProxyMode::Direct).await.unwrap();
    assert_eq!(client.get_mode().await.unwrap(), ProxyMode::Direct);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.packets_out, 0);

    let version = client.api_request("get", "/version", "").await.unwrap();
    assert!(version.contains("v1.18.0"));

    // Undecodable input gets an empty frame back
    assert_eq!(client.send_raw(&[0xc3, 0x28]).await.unwrap(), None);

    serving.abort();
}

#[tokio::test]
async fn test_control_socket_many_frames_per_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let socket = dir.path().join("control.sock");

    let server = ControlServer::new(&socket, dispatcher(dir.path(), &mock));
    let listener = server.bind().unwrap();
    let serving = tokio::spawn(async move { server.serve(listener).await });

    let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    for message in ["ping", "getMode", "ping"] {
        write_frame(&mut stream, message.as_bytes()).await.unwrap();
    }
    let mut replies = Vec::new();
    for _ in 0..3 {
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        replies.push(String::from_utf8(frame).unwrap());
    }
    assert_eq!(replies, vec!["pong", "rule", "pong"]);

    serving.abort();
}

#[tokio::test]
async fn test_client_without_server() {
    let dir = tempfile::tempdir().unwrap();
    let client = ControlClient::new(dir.path().join("absent.sock"));
    assert!(client.ping().await.is_err());
}

#[tokio::test]
async fn test_http_core_session() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let source = write_core_config(dir.path(), "profile.yaml");
    let home = dir.path().join("home");

    let mut config = test_config(&home);
    config.core.controller = mock.controller();
    let provider = MockProvider::new();
    let (fd, peer) = tun_pair();
    provider.push(fd);

    let controller =
        TunnelController::new(config, spawning_core(&mock, &home), provider.clone()).unwrap();
    controller.start(&source).await.unwrap();
    assert_eq!(controller.state().await, SessionState::Running);

    let written = std::fs::read_to_string(home.join("config.yaml")).unwrap();
    assert!(written.contains("mixed-port: 7890"));

    let seen = mock.requests();
    let order: Vec<(&str, &str)> = seen
        .iter()
        .map(|r| (r.method.as_str(), r.path.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("GET", "/version"),
            ("PUT", "/configs?force=true"),
            ("PATCH", "/configs"),
        ]
    );
    let put: serde_json::Value = serde_json::from_str(&seen[1].body).unwrap();
    assert!(put["path"].as_str().unwrap().ends_with("config.yaml"));

    let patch: serde_json::Value = serde_json::from_str(&seen[2].body).unwrap();
    let tun = &patch["tun"];
    assert_eq!(tun["enable"], true);
    assert_eq!(tun["stack"], "gvisor");
    assert_eq!(tun["inet4-address"][0], "198.18.0.1/16");
    assert_eq!(tun["dns-hijack"][0], "8.8.8.8:53");
    assert!(tun["file-descriptor"].as_i64().unwrap() > 2);

    // Only the core child holds the interface now
    assert!(!peer_closed(&peer));

    controller.stop().await.unwrap();
    controller.stop().await.unwrap();

    let seen = mock.requests();
    let disables: Vec<_> = seen
        .iter()
        .filter(|r| r.method == "PATCH" && r.body.contains(r#""enable":false"#))
        .collect();
    assert_eq!(disables.len(), 1);
    assert!(wait_for(|| peer_closed(&peer)).await);
    assert_eq!(controller.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_attached_core_refuses_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let source = write_core_config(dir.path(), "profile.yaml");
    let home = dir.path().join("home");

    let mut config = test_config(&home);
    config.core.controller = mock.controller();
    let provider = MockProvider::new();
    let (fd, peer) = tun_pair();
    provider.push(fd);

    let controller = TunnelController::new(config, http_core(&mock), provider.clone()).unwrap();
    let err = controller.start(&source).await.unwrap_err();

    assert!(matches!(err, Error::CoreTun(_)));
    assert!(err.to_string().contains("core.command"));
    assert!(peer_closed(&peer));
    assert_eq!(controller.state().await, SessionState::Idle);
    assert_eq!(provider.deactivations(), 1);

    let seen = mock.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "PUT");
}

#[tokio::test]
async fn test_restart_message_restarts_session() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let config_path = write_core_config(dir.path(), "profile.yaml");
    let socket = dir.path().join("control.sock");

    let core = MockCore::new();
    let provider = MockProvider::new();
    let (first, first_peer) = tun_pair();
    let (second, second_peer) = tun_pair();
    let (third, third_peer) = tun_pair();
    provider.push(first);
    provider.push(second);
    provider.push(third);

    let controller = Arc::new(
        TunnelController::new(test_config(dir.path()), core.clone(), provider.clone()).unwrap(),
    );
    controller.start(&config_path).await.unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        controller.clone(),
        admin(&mock, Duration::from_secs(5)),
    ));

    assert_eq!(ask(&dispatcher, "restart").await, "OK");
    assert_eq!(core.init_calls(), 2);
    assert_eq!(controller.state().await, SessionState::Running);
    assert!(peer_closed(&first_peer));
    assert!(!peer_closed(&second_peer));

    let server = ControlServer::new(&socket, dispatcher);
    let listener = server.bind().unwrap();
    let serving = tokio::spawn(async move { server.serve(listener).await });

    let client = ControlClient::new(&socket).with_timeout(Duration::from_secs(5));
    client.restart().await.unwrap();
    assert_eq!(core.init_calls(), 3);
    assert!(peer_closed(&second_peer));
    assert!(!peer_closed(&third_peer));

    serving.abort();
    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_without_config_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::start().await;
    let dispatcher = dispatcher(dir.path(), &mock);

    let reply = ask(&dispatcher, "restart").await;
    let message = error_of(&reply).unwrap();
    assert!(message.contains("config.yaml"), "{}", message);
}
