use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use topic_subscriber::protocol::{SubscribeRequest, encode_ack, encode_message, status};
use topic_subscriber::{Consumer, ConsumerConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

struct MockBroker {
    listener: TcpListener,
    port: u16,
}

impl MockBroker {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Accept one consumer connection and read its subscription request.
    async fn accept_subscriber(
        &self,
    ) -> Result<(WsStream, SubscribeRequest), Box<dyn std::error::Error>> {
        let (tcp, _) = self.listener.accept().await?;
        let mut ws = tokio_tungstenite::accept_async(tcp).await?;
        let request = read_request(&mut ws).await?;
        Ok((ws, request))
    }
}

async fn read_request(ws: &mut WsStream) -> Result<SubscribeRequest, Box<dyn std::error::Error>> {
    loop {
        let frame = ws.next().await.ok_or("WebSocket closed unexpectedly")??;
        if let tungstenite::Message::Text(text) = frame {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
}

async fn send_text(ws: &mut WsStream, frame: String) -> Result<(), Box<dyn std::error::Error>> {
    ws.send(tungstenite::Message::Text(frame.into())).await?;
    Ok(())
}

/// Route consumer logs to the test harness (`RUST_LOG=topic_subscriber=debug`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        max_retry_interval_ms: 50,
        connect_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn collector() -> (
    impl Fn(Vec<u8>) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |payload| {
            let _ = tx.send(payload);
        },
        rx,
    )
}

async fn next_payload(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("callback dropped")
}

// ---------------------------------------------------------------------------
// Test 1: subscribe, ack, receive messages in order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_and_receive_messages() {
    init_tracing();
    let broker = MockBroker::start().await.unwrap();
    let host = broker.host();

    let server = tokio::spawn(async move {
        let (mut ws, request) = broker.accept_subscriber().await.unwrap();
        assert_eq!(request.topic, "news");
        assert_eq!(request.offset, -1);
        send_text(&mut ws, encode_ack(status::SUCCESS, None).unwrap())
            .await
            .unwrap();
        for (i, payload) in ["first", "second", "third"].iter().enumerate() {
            send_text(&mut ws, encode_message("news", i as i64, payload.as_bytes()).unwrap())
                .await
                .unwrap();
        }
        ws
    });

    let consumer = Consumer::with_config(&host, test_config()).unwrap();
    let (callback, mut delivered) = collector();
    consumer.subscribe("news", callback).unwrap();

    assert_eq!(next_payload(&mut delivered).await, b"first");
    assert_eq!(next_payload(&mut delivered).await, b"second");
    assert_eq!(next_payload(&mut delivered).await, b"third");
    assert_eq!(consumer.offset("news"), Some(-1 + 5 + 40 + 6 + 40 + 5 + 40));

    let _ws = server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Test 2: broker drops the connection, consumer resumes at its offset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_resumes_from_offset() {
    init_tracing();
    let broker = MockBroker::start().await.unwrap();
    let host = broker.host();

    let server = tokio::spawn(async move {
        {
            let (mut ws, request) = broker.accept_subscriber().await.unwrap();
            assert_eq!(request.offset, -1);
            send_text(&mut ws, encode_ack(status::SUCCESS, None).unwrap())
                .await
                .unwrap();
            send_text(&mut ws, encode_message("t", 0, b"hello").unwrap())
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        }

        let (mut ws, request) = broker.accept_subscriber().await.unwrap();
        assert_eq!(request.topic, "t");
        assert_eq!(request.offset, 44);
        send_text(&mut ws, encode_ack(status::SUCCESS, None).unwrap())
            .await
            .unwrap();
        send_text(&mut ws, encode_message("t", 1, b"world").unwrap())
            .await
            .unwrap();
        ws
    });

    let consumer = Consumer::with_config(&host, test_config()).unwrap();
    let (callback, mut delivered) = collector();
    consumer.subscribe("t", callback).unwrap();

    assert_eq!(next_payload(&mut delivered).await, b"hello");
    assert_eq!(next_payload(&mut delivered).await, b"world");
    assert_eq!(consumer.offset("t"), Some(89));

    let _ws = tokio::time::timeout(TIMEOUT, server)
        .await
        .unwrap()
        .unwrap();
}

// ---------------------------------------------------------------------------
// Test 3: redirect to a second broker keeps the offset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redirect_to_second_broker() {
    init_tracing();
    let registry = MockBroker::start().await.unwrap();
    let replica = MockBroker::start().await.unwrap();
    let host = registry.host();
    let replica_host = replica.host();
    let expected_endpoint = format!("ws://{replica_host}/subscribe");

    let registry_task = tokio::spawn(async move {
        let (mut ws, request) = registry.accept_subscriber().await.unwrap();
        assert_eq!(request.offset, 300);
        send_text(
            &mut ws,
            encode_ack(status::REDIRECT, Some(replica_host.as_bytes())).unwrap(),
        )
        .await
        .unwrap();
        ws
    });

    let replica_task = tokio::spawn(async move {
        let (mut ws, request) = replica.accept_subscriber().await.unwrap();
        assert_eq!(request.topic, "t");
        assert_eq!(request.offset, 300);
        send_text(&mut ws, encode_ack(status::SUCCESS, None).unwrap())
            .await
            .unwrap();
        send_text(&mut ws, encode_message("t", 9, b"from replica").unwrap())
            .await
            .unwrap();
        ws
    });

    let consumer = Consumer::with_config(&host, test_config()).unwrap();
    let (callback, mut delivered) = collector();
    consumer.subscribe_from("t", 300, callback).unwrap();

    assert_eq!(next_payload(&mut delivered).await, b"from replica");
    assert_eq!(consumer.offset("t"), Some(300 + 12 + 40));
    assert_eq!(consumer.current_endpoint().as_str(), expected_endpoint);
    assert_eq!(
        consumer.registry_endpoint().as_str(),
        format!("ws://{host}/subscribe")
    );

    let _ = registry_task.await.unwrap();
    let _ = replica_task.await.unwrap();
}

// ---------------------------------------------------------------------------
// Test 4: unsubscribe closes the WebSocket and does not reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsubscribe_closes_connection() {
    init_tracing();
    let broker = MockBroker::start().await.unwrap();
    let host = broker.host();

    let consumer = Consumer::with_config(&host, test_config()).unwrap();
    consumer.subscribe("t", |_| {}).unwrap();

    let (mut ws, _request) = broker.accept_subscriber().await.unwrap();
    send_text(&mut ws, encode_ack(status::SUCCESS, None).unwrap())
        .await
        .unwrap();

    consumer.unsubscribe("t").unwrap();

    // The consumer side closes; the stream ends with a close frame or EOF.
    let closed = tokio::time::timeout(TIMEOUT, async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // No reconnect follows.
    let reconnect = tokio::time::timeout(Duration::from_millis(500), broker.listener.accept()).await;
    assert!(reconnect.is_err());
    assert!(!consumer.is_subscribed("t"));
}

// ---------------------------------------------------------------------------
// Test 5: unreachable broker keeps retrying until it comes up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_until_broker_available() {
    init_tracing();
    // Reserve a port, then release it so the first attempts are refused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let host = format!("127.0.0.1:{port}");

    let consumer = Consumer::with_config(&host, test_config()).unwrap();
    let (callback, mut delivered) = collector();
    consumer.subscribe("t", callback).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(consumer.is_subscribed("t"));

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let broker = MockBroker { listener, port };
    let (mut ws, request) = tokio::time::timeout(TIMEOUT, broker.accept_subscriber())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.offset, -1);
    send_text(&mut ws, encode_ack(status::SUCCESS, None).unwrap())
        .await
        .unwrap();
    send_text(&mut ws, encode_message("t", 0, b"up").unwrap())
        .await
        .unwrap();

    assert_eq!(next_payload(&mut delivered).await, b"up");
}
