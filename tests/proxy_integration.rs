//! End-to-end tests: a real client, the full proxy stack, a live control
//! client, and a local origin.

use futures_util::{SinkExt, StreamExt};
use holdpoint::ca::CertificateAuthority;
use holdpoint::control::{ControlServer, Hub, SharedState};
use holdpoint::filter::DomainFilter;
use holdpoint::proxy::{DecisionRegistry, Interceptor, ProxyContext, ProxyServer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

struct TestStack {
    proxy_addr: SocketAddr,
    control_addr: SocketAddr,
    ca_pem: String,
    registry: Arc<DecisionRegistry>,
    _shutdown_tx: watch::Sender<bool>,
    _ca_dir: tempfile::TempDir,
}

/// Spawn the whole proxy stack on ephemeral ports.
async fn spawn_stack(decision_timeout: Duration) -> TestStack {
    let ca_dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(
        CertificateAuthority::open(
            &ca_dir.path().join("holdpoint-ca.crt"),
            &ca_dir.path().join("holdpoint-ca.key"),
        )
        .unwrap(),
    );
    let ca_pem = ca.cert_pem().to_string();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(DecisionRegistry::new());
    let state = Arc::new(SharedState::new());
    let (hub, hub_handle) = Hub::new();
    tokio::spawn(hub.run());

    let (launch_tx, mut launch_rx) = tokio::sync::mpsc::channel(8);
    tokio::spawn(async move { while launch_rx.recv().await.is_some() {} });

    let control = ControlServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        hub_handle.clone(),
        registry.clone(),
        state,
        launch_tx,
        shutdown_rx.clone(),
    )
    .await
    .unwrap();
    let control_addr = control.local_addr().unwrap();
    tokio::spawn(control.run());

    let interceptor = Interceptor::with_timeout(registry.clone(), hub_handle, decision_timeout);
    let ctx = Arc::new(
        ProxyContext::new(ca, DomainFilter::default(), interceptor).unwrap(),
    );

    let proxy = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), ctx, shutdown_rx)
        .await
        .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    TestStack {
        proxy_addr,
        control_addr,
        ca_pem,
        registry,
        _shutdown_tx: shutdown_tx,
        _ca_dir: ca_dir,
    }
}

/// Minimal origin: answers every request with `Hello` and records the
/// request line paths it saw.
async fn spawn_origin() -> (SocketAddr, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let paths = Arc::new(Mutex::new(Vec::new()));

    let hits_clone = hits.clone();
    let paths_clone = paths.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let hits = hits_clone.clone();
            let paths = paths_clone.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
                hits.fetch_add(1, Ordering::SeqCst);

                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                if let Some(line) = head.lines().next() {
                    if let Some(path) = line.split_whitespace().nth(1) {
                        paths.lock().unwrap().push(path.to_string());
                    }
                }

                let response =
                    "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nHello";
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    (addr, hits, paths)
}

fn proxied_client(stack: &TestStack) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{}", stack.proxy_addr)).unwrap())
        .add_root_certificate(reqwest::Certificate::from_pem(stack.ca_pem.as_bytes()).unwrap())
        .build()
        .unwrap()
}

async fn connect_operator(
    stack: &TestStack,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", stack.control_addr))
        .await
        .unwrap();
    // Let the registration reach the hub loop before traffic starts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws
}

/// Read frames until a `request` notice arrives; return its JSON.
async fn next_request_notice(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a request notice")
            .expect("control stream ended")
            .expect("control stream error");
        if let Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "request" {
                return value;
            }
        }
    }
}

#[tokio::test]
async fn https_interception_with_url_rewrite() {
    let stack = spawn_stack(Duration::from_secs(30)).await;
    let (origin_addr, hits, paths) = spawn_origin().await;
    let mut operator = connect_operator(&stack).await;

    // TLS toward the proxy verifies against the root CA only: success
    // means the leaf names example.test and chains to our root.
    let client = proxied_client(&stack);
    let request_task =
        tokio::spawn(async move { client.get("https://example.test/").send().await });

    let notice = next_request_notice(&mut operator).await;
    assert_eq!(notice["data"]["url"], "https://example.test/");
    assert_eq!(notice["data"]["method"], "GET");
    assert_eq!(notice["data"]["status"], "pending");

    // Release it, rerouted to the local origin.
    let id = notice["data"]["id"].as_str().unwrap();
    let decision = format!(
        r#"{{"type":"modify_request","data":{{"id":"{id}","action":"send","url":"http://{origin_addr}/changed"}}}}"#
    );
    operator.send(Message::Text(decision)).await.unwrap();

    let response = timeout(Duration::from_secs(10), request_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(paths.lock().unwrap().as_slice(), ["/changed"]);
}

#[tokio::test]
async fn dropped_request_never_reaches_origin() {
    let stack = spawn_stack(Duration::from_secs(30)).await;
    let (origin_addr, hits, _paths) = spawn_origin().await;
    let mut operator = connect_operator(&stack).await;

    let client = proxied_client(&stack);
    let url = format!("http://{origin_addr}/secret");
    let request_task = tokio::spawn(async move { client.get(url).send().await });

    let notice = next_request_notice(&mut operator).await;
    let id = notice["data"]["id"].as_str().unwrap();
    let decision =
        format!(r#"{{"type":"modify_request","data":{{"id":"{id}","action":"drop"}}}}"#);
    operator.send(Message::Text(decision)).await.unwrap();

    let response = timeout(Duration::from_secs(10), request_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn silence_forwards_unchanged_after_timeout() {
    // Short decision window; no operator connected at all.
    let stack = spawn_stack(Duration::from_millis(300)).await;
    let (origin_addr, hits, paths) = spawn_origin().await;

    let client = proxied_client(&stack);
    let response = timeout(
        Duration::from_secs(10),
        client.get(format!("http://{origin_addr}/as-is")).send(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(paths.lock().unwrap().as_slice(), ["/as-is"]);

    // The hold was cleaned up on timeout.
    assert!(stack.registry.is_empty());
    assert_eq!(stack.registry.waiting_count(), 0);
}

#[tokio::test]
async fn method_and_body_overrides_apply() {
    let stack = spawn_stack(Duration::from_secs(30)).await;
    let (origin_addr, _hits, paths) = spawn_origin().await;
    let mut operator = connect_operator(&stack).await;

    let client = proxied_client(&stack);
    let url = format!("http://{origin_addr}/form");
    let request_task = tokio::spawn(async move {
        client.post(url).body("name=original").send().await
    });

    let notice = next_request_notice(&mut operator).await;
    assert_eq!(notice["data"]["method"], "POST");
    assert_eq!(notice["data"]["body"], "name=original");

    let id = notice["data"]["id"].as_str().unwrap();
    let decision = format!(
        r#"{{"type":"modify_request","data":{{"id":"{id}","action":"send","method":"PUT","body":"name=edited"}}}}"#
    );
    operator.send(Message::Text(decision)).await.unwrap();

    let response = timeout(Duration::from_secs(10), request_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(paths.lock().unwrap().as_slice(), ["/form"]);
}

#[tokio::test]
async fn operator_disconnect_does_not_break_traffic() {
    let stack = spawn_stack(Duration::from_millis(300)).await;
    let (origin_addr, hits, _paths) = spawn_origin().await;

    // A client that connects and immediately leaves.
    let operator = connect_operator(&stack).await;
    drop(operator);

    let client = proxied_client(&stack);
    let response = timeout(
        Duration::from_secs(10),
        client.get(format!("http://{origin_addr}/")).send(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
