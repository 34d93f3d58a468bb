//! Integration tests for wsgate

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use wsgate::config::ServerConfig;
use wsgate::logger::{EventLogger, MemorySink};
use wsgate::server::GatewayServer;
use wsgate::types::FieldValue;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Running server with an in-memory capture of its event log
struct TestGateway {
    server: Arc<GatewayServer>,
    addr: SocketAddr,
    capture: Arc<MemorySink>,
    task: JoinHandle<wsgate::Result<()>>,
}

impl TestGateway {
    async fn start(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig::default();
        config.server.bind_address = "127.0.0.1:0".to_string();
        config.server.shutdown_timeout_seconds = 2;
        configure(&mut config);

        let capture = Arc::new(MemorySink::new("capture"));
        let logger = Arc::new(EventLogger::builder().sink(capture.clone()).build());
        let server = Arc::new(GatewayServer::with_logger(config, logger, None));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        Self {
            server,
            addr,
            capture,
            task,
        }
    }

    async fn connect(&self) -> Client {
        let url = format!("ws://{}/ws", self.addr);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    fn messages(&self) -> Vec<String> {
        self.capture
            .records()
            .unwrap()
            .into_iter()
            .map(|r| r.message)
            .collect()
    }

    async fn stop(self) {
        self.server.shutdown();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    if timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("timed out waiting for {}", what);
    }
}

/// First close frame the client sees, as a status code
async fn close_code(client: &mut Client) -> Option<u16> {
    let next = timeout(Duration::from_secs(5), async {
        while let Some(frame) = client.next().await {
            match frame {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    });
    next.await.expect("no close frame received")
}

/// A frame over the size limit closes the connection with 1008 and is never delivered
#[tokio::test]
async fn test_oversized_frame_policy_violation() {
    let gateway = TestGateway::start(|_| {}).await;

    let delivered = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let delivered = delivered.clone();
        let disconnects = disconnects.clone();
        gateway.server.gateway().on_connect(move |conn| {
            let delivered = delivered.clone();
            conn.on_message(move |_, _| {
                delivered.fetch_add(1, Ordering::SeqCst);
            });
            let disconnects = disconnects.clone();
            conn.on_disconnect(move |_, _| {
                disconnects.fetch_add(1, Ordering::SeqCst);
            });
        });
    }

    let mut client = gateway.connect().await;
    client.send(Message::text("x".repeat(5000))).await.unwrap();
    assert_eq!(close_code(&mut client).await, Some(1008));

    let server = gateway.server.clone();
    eventually("connection removal", || server.gateway().connection_count() == 0).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    let closed = gateway
        .capture
        .records()
        .unwrap()
        .into_iter()
        .find(|r| r.message == "connection closed")
        .expect("disconnect logged");
    assert_eq!(closed.fields.get("policy_violation"), Some(&FieldValue::Bool(true)));

    gateway.stop().await;
}

/// A frame far past the limit is refused by the transport and still reported as oversized
#[tokio::test]
async fn test_huge_frame_reported_as_too_large() {
    let gateway = TestGateway::start(|config| config.gateway.max_message_size = 1024).await;

    let mut client = gateway.connect().await;
    client.send(Message::text("y".repeat(200_000))).await.unwrap();
    assert_eq!(close_code(&mut client).await, Some(1008));

    let server = gateway.server.clone();
    eventually("connection removal", || server.gateway().connection_count() == 0).await;
    let closed = gateway
        .capture
        .records()
        .unwrap()
        .into_iter()
        .find(|r| r.message == "connection closed")
        .expect("disconnect logged");
    assert_eq!(closed.fields.get("policy_violation"), Some(&FieldValue::Bool(true)));

    gateway.stop().await;
}

/// Frames reach handlers in the order the peer sent them
#[tokio::test]
async fn test_messages_delivered_in_order() {
    let gateway = TestGateway::start(|_| {}).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        gateway.server.gateway().on_connect(move |conn| {
            let received = received.clone();
            conn.on_message(move |_, data| {
                received.lock().push(String::from_utf8_lossy(&data).to_string());
            });
        });
    }

    let mut client = gateway.connect().await;
    for i in 0..50 {
        client.send(Message::text(format!("message {}", i))).await.unwrap();
    }
    client.close(None).await.unwrap();

    let server = gateway.server.clone();
    eventually("connection removal", || {
        server.gateway().total_accepted() == 1 && server.gateway().connection_count() == 0
    })
    .await;

    let expected: Vec<String> = (0..50).map(|i| format!("message {}", i)).collect();
    assert_eq!(*received.lock(), expected);

    // The default handlers log every payload as its own record.
    let logged = gateway.messages();
    assert!(logged.contains(&"message 0".to_string()));
    assert!(logged.contains(&"message 49".to_string()));
    assert!(logged.contains(&"connection opened".to_string()));

    gateway.stop().await;
}

/// Frames up to the limit are delivered; the first larger one ends the connection
#[tokio::test]
async fn test_random_sizes_around_limit() {
    let gateway = TestGateway::start(|config| config.gateway.max_message_size = 256).await;
    let sizes = Arc::new(Mutex::new(Vec::new()));
    {
        let sizes = sizes.clone();
        gateway.server.gateway().on_connect(move |conn| {
            let sizes = sizes.clone();
            conn.on_message(move |_, data| sizes.lock().push(data.len()));
        });
    }

    let sent: Vec<usize> = {
        let mut rng = rand::thread_rng();
        let mut sizes: Vec<usize> = (0..20).map(|_| rng.gen_range(1..=256)).collect();
        sizes.push(rng.gen_range(257..=1024));
        sizes
    };

    let mut client = gateway.connect().await;
    for size in &sent {
        client.send(Message::text("a".repeat(*size))).await.unwrap();
    }
    assert_eq!(close_code(&mut client).await, Some(1008));

    let server = gateway.server.clone();
    eventually("connection removal", || server.gateway().connection_count() == 0).await;
    assert_eq!(*sizes.lock(), sent[..20].to_vec());

    gateway.stop().await;
}

/// Outbound sends reach the peer
#[tokio::test]
async fn test_echo_through_outbound_queue() {
    let gateway = TestGateway::start(|_| {}).await;
    gateway.server.gateway().on_connect(|conn| {
        conn.send_text("welcome");
        conn.on_message(|conn, data| {
            conn.send_binary(data);
        });
    });

    let mut client = gateway.connect().await;
    match client.next().await {
        Some(Ok(Message::Text(text))) => assert_eq!(text.as_str(), "welcome"),
        other => panic!("expected welcome, got {:?}", other),
    }
    client.send(Message::text("ping me")).await.unwrap();
    match client.next().await {
        Some(Ok(Message::Binary(data))) => assert_eq!(&data[..], b"ping me"),
        other => panic!("expected echo, got {:?}", other),
    }

    client.close(None).await.unwrap();
    gateway.stop().await;
}

/// Concurrent connections get distinct ids and are all registered
#[tokio::test]
async fn test_concurrent_connections_distinct_ids() {
    let gateway = TestGateway::start(|_| {}).await;

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(gateway.connect().await);
    }

    let server = gateway.server.clone();
    eventually("registration", || server.gateway().connection_count() == 10).await;
    let ids: HashSet<_> = gateway.server.gateway().ids().into_iter().collect();
    assert_eq!(ids.len(), 10);

    for mut client in clients {
        client.close(None).await.unwrap();
    }
    eventually("all closed", || server.gateway().connection_count() == 0).await;

    let closes = gateway
        .messages()
        .iter()
        .filter(|m| *m == "connection closed")
        .count();
    assert_eq!(closes, 10);

    gateway.stop().await;
}

/// Binary frames close the connection with 1003 when disabled
#[tokio::test]
async fn test_binary_rejected_when_disabled() {
    let gateway = TestGateway::start(|config| config.gateway.binary_messages = false).await;

    let mut client = gateway.connect().await;
    client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(close_code(&mut client).await, Some(1003));

    gateway.stop().await;
}

/// Shutdown closes open connections with 1001 and the server returns
#[tokio::test]
async fn test_shutdown_closes_connections() {
    let gateway = TestGateway::start(|_| {}).await;

    let mut first = gateway.connect().await;
    let mut second = gateway.connect().await;
    let server = gateway.server.clone();
    eventually("registration", || server.gateway().connection_count() == 2).await;

    gateway.server.shutdown();
    assert_eq!(close_code(&mut first).await, Some(1001));
    assert_eq!(close_code(&mut second).await, Some(1001));

    timeout(Duration::from_secs(5), gateway.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(gateway.server.gateway().connection_count(), 0);

    let messages: Vec<String> = gateway
        .capture
        .records()
        .unwrap()
        .into_iter()
        .map(|r| r.message)
        .collect();
    assert_eq!(messages.last().map(String::as_str), Some("gateway stopped"));
}

/// POST /msg logs the form value and the request itself
#[tokio::test]
async fn test_post_message_over_http() {
    let gateway = TestGateway::start(|_| {}).await;

    let body = "msg=hello+from+http";
    let request = format!(
        "POST /msg HTTP/1.1\r\nHost: {}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        gateway.addr,
        body.len(),
        body
    );
    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);

    let records = gateway.capture.records().unwrap();
    assert!(records.iter().any(|r| r.message == "hello from http"));
    let access = records
        .iter()
        .find(|r| r.message == "http request")
        .expect("request logged");
    assert_eq!(access.fields.get("ip"), Some(&FieldValue::String("127.0.0.1".to_string())));
    assert_eq!(access.fields.get("status").and_then(FieldValue::as_u64), Some(200));

    gateway.stop().await;
}
