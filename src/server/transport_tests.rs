// End-to-end transport tests against a real router on an ephemeral port
use crate::{
    config::{ProviderConfig, RouterConfig},
    engine::{
        entities::StaticEntitySource,
        metrics::Counters,
        sources::{memory::MemoryEventSource, EventSource},
    },
    models::schema::tests::{employee_field, EMPLOYEE_QUERY},
    server::{AppState, RouterServerBuilder},
};

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::oneshot, time};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};

const WAIT: Duration = Duration::from_secs(3);

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = time::Instant::now() + WAIT;
    while time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

const MISSING_ID: &str = r#"{"__typename":"Employee","update":{"name":"foo"}}"#;
const EMPLOYEE_1: &str = r#"{"__typename":"Employee","id":1,"update":{"name":"foo"}}"#;

fn employee_1_data() -> Value {
    json!({
        "data": {
            "employeeUpdatedMyKafka": {
                "id": 1,
                "details": {"forename": "Jens", "surname": "Neuse"}
            }
        }
    })
}

fn blocked() -> Value {
    json!({
        "errors": [{"message": "operation type 'subscription' is blocked"}],
        "data": null
    })
}

// Test helpers
struct TestRouter {
    addr: SocketAddr,
    broker: Arc<MemoryEventSource>,
    counters: Arc<Counters>,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRouter {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with<F: FnOnce(&mut RouterConfig)>(customize: F) -> Self {
        let mut config = RouterConfig::default();
        config.shutdown_delay_ms = 200;
        config.providers = vec![ProviderConfig::memory("my-kafka")];
        config.events = vec![employee_field()];
        config.engine.sse_keep_alive_ms = 50;
        customize(&mut config);

        let broker = Arc::new(MemoryEventSource::new("my-kafka"));
        let counters = Arc::new(Counters::new());
        let entities = StaticEntitySource::new().with_record(
            "Employee",
            json!({"id": 1, "details": {"forename": "Jens", "surname": "Neuse"}}),
        );

        let server = RouterServerBuilder::new()
            .with_config(config)
            .with_source(Arc::clone(&broker) as Arc<dyn EventSource>)
            .with_entity_source(Arc::new(entities))
            .with_counters(Arc::clone(&counters))
            .build()
            .await
            .expect("Failed to build router");
        let state = server.state().clone();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, signal) = oneshot::channel::<()>();
        tokio::spawn(server.serve(listener, async move {
            let _ = signal.await;
        }));

        Self {
            addr,
            broker,
            counters,
            state,
            shutdown: Some(shutdown),
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/graphql", self.addr)
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn produce(&self, payload: &'static str) {
        self.broker
            .produce("employeeUpdated", Bytes::from_static(payload.as_bytes()))
            .await
            .unwrap();
    }

    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

// WebSocket client for testing
struct TestWebSocketClient {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestWebSocketClient {
    async fn connect(url: &str, protocol: Option<&'static str>) -> Self {
        let mut request = url.into_client_request().unwrap();
        if let Some(protocol) = protocol {
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
        }
        let (ws_stream, _) = connect_async(request).await.expect("Failed to connect");
        Self { ws_stream }
    }

    /// Connects and completes `connection_init`
    async fn initialised(url: &str, protocol: Option<&'static str>) -> Self {
        let mut client = Self::connect(url, protocol).await;
        client.send(json!({"type": "connection_init"})).await;
        assert_eq!(client.receive_json().await["type"], "connection_ack");
        client
    }

    async fn send(&mut self, message: Value) {
        self.ws_stream
            .send(WsMessage::Text(message.to_string()))
            .await
            .expect("Failed to send message");
    }

    async fn subscribe(&mut self, id: &str) {
        self.send(json!({"id": id, "type": "subscribe", "payload": {"query": EMPLOYEE_QUERY}}))
            .await;
    }

    /// Next text message as JSON
    async fn receive_json(&mut self) -> Value {
        match self.receive_message().await {
            Some(WsMessage::Text(text)) => serde_json::from_str(&text).expect("Failed to parse message"),
            other => panic!("Expected text message, got {:?}", other),
        }
    }

    /// Next message, skipping socket-level ping/pong frames
    async fn receive_message(&mut self) -> Option<WsMessage> {
        loop {
            let message = time::timeout(WAIT, self.ws_stream.next())
                .await
                .expect("Timed out waiting for a message")?
                .ok()?;
            match message {
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => return Some(other),
            }
        }
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Option<Value> {
        match time::timeout(timeout, self.ws_stream.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    async fn close(mut self) {
        let _ = self.ws_stream.close(None).await;
    }
}

/// Client-side handler harness: every message goes to `handler(payload, error)`.
///
/// A handler failure is counted, never treated as a stream fault.
struct SubscriptionClient<H> {
    client: TestWebSocketClient,
    handler: H,
    handled: usize,
    handler_failures: usize,
}

impl<H> SubscriptionClient<H>
where
    H: FnMut(Option<&Value>, Option<&Value>) -> Result<(), String>,
{
    fn new(client: TestWebSocketClient, handler: H) -> Self {
        Self {
            client,
            handler,
            handled: 0,
            handler_failures: 0,
        }
    }

    /// Feeds `count` messages to the handler; false if the stream completed first
    async fn pump(&mut self, count: usize) -> bool {
        for _ in 0..count {
            let message = self.client.receive_json().await;
            let outcome = match message["type"].as_str() {
                Some("next") => (self.handler)(Some(&message["payload"]), None),
                Some("error") => (self.handler)(None, Some(&message["payload"])),
                _ => return false,
            };
            self.handled += 1;
            if outcome.is_err() {
                self.handler_failures += 1;
            }
        }
        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transport_ws_employee_updates() {
    let router = TestRouter::start().await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), Some("graphql-transport-ws")).await;

    client.subscribe("1").await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);

    router.produce(MISSING_ID).await;
    let error = client.receive_json().await;
    assert_eq!(
        error,
        json!({
            "id": "1",
            "type": "error",
            "payload": [{
                "message": "Cannot return null for non-nullable field 'Subscription.employeeUpdatedMyKafka.id'.",
                "path": ["employeeUpdatedMyKafka", "id"]
            }]
        })
    );

    // The subscription survives the error
    router.produce(EMPLOYEE_1).await;
    let next = client.receive_json().await;
    assert_eq!(next["type"], "next");
    assert_eq!(next["id"], "1");
    assert_eq!(next["payload"], employee_1_data());

    router.produce("").await;
    let error = client.receive_json().await;
    assert_eq!(error["payload"], json!([{"message": "Internal server error"}]));

    client.send(json!({"id": "1", "type": "complete"})).await;
    assert!(router.counters.wait_for_subscription_count(0, WAIT).await);

    client.close().await;
    assert!(router.counters.wait_for_connection_count(0, WAIT).await);
    assert!(router.state.registry.active_bindings().is_empty());
}

#[tokio::test]
async fn test_default_protocol_when_none_offered() {
    let router = TestRouter::start().await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), None).await;

    client.send(json!({"type": "ping", "payload": {"n": 1}})).await;
    assert_eq!(client.receive_json().await, json!({"type": "pong", "payload": {"n": 1}}));
    client.close().await;
}

#[tokio::test]
async fn test_legacy_graphql_ws() {
    let router = TestRouter::start().await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), Some("graphql-ws")).await;
    assert_eq!(client.receive_json().await["type"], "ka");

    client
        .send(json!({"id": "7", "type": "start", "payload": {"query": EMPLOYEE_QUERY}}))
        .await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);

    router.produce(MISSING_ID).await;
    router.produce(EMPLOYEE_1).await;

    let error = client.receive_json().await;
    assert_eq!(error["type"], "data");
    assert_eq!(error["payload"]["data"], Value::Null);
    assert_eq!(
        error["payload"]["errors"][0]["message"],
        "Cannot return null for non-nullable field 'Subscription.employeeUpdatedMyKafka.id'."
    );

    let data = client.receive_json().await;
    assert_eq!(data, json!({"id": "7", "type": "data", "payload": employee_1_data()}));

    client.send(json!({"id": "7", "type": "stop"})).await;
    assert_eq!(client.receive_json().await, json!({"id": "7", "type": "complete"}));
    assert!(router.counters.wait_for_subscription_count(0, WAIT).await);
    client.send(json!({"type": "connection_terminate"})).await;
    assert!(router.counters.wait_for_connection_count(0, WAIT).await);
}

async fn fan_out_with(configure: fn(&mut RouterConfig)) -> Vec<Value> {
    let router = TestRouter::start_with(configure).await;
    let url = router.ws_url();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = TestWebSocketClient::initialised(&url, Some("graphql-transport-ws")).await;
        client.subscribe("1").await;
        clients.push(client);
    }
    assert!(router.counters.wait_for_subscription_count(3, WAIT).await);
    assert_eq!(router.broker.stats().consumers_opened(), 1);

    router.produce(EMPLOYEE_1).await;

    let mut received = Vec::new();
    for client in clients.iter_mut() {
        received.push(client.receive_json().await);
    }
    assert!(router.counters.wait_for_messages_sent(3, WAIT).await);

    for client in clients {
        client.close().await;
    }
    assert!(router.counters.wait_for_subscription_count(0, WAIT).await);
    assert!(router.counters.wait_for_connection_count(0, WAIT).await);
    received
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_deadline_matches_evented_readiness() {
    let evented = fan_out_with(|_| {}).await;
    let deadline = fan_out_with(|config| {
        config.engine.enable_readiness_polling = false;
        config.engine.websocket_read_timeout_ms = 100;
    })
    .await;

    assert_eq!(evented.len(), 3);
    assert!(evented.iter().all(|m| m["payload"] == employee_1_data()));
    assert_eq!(evented, deadline);
}

#[tokio::test]
async fn test_blocked_websocket_gets_one_error() {
    let router = TestRouter::start_with(|config| config.security.block_subscriptions = true).await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), Some("graphql-transport-ws")).await;

    client.subscribe("1").await;
    assert_eq!(
        client.receive_json().await,
        json!({"id": "1", "type": "next", "payload": blocked()})
    );
    assert_eq!(client.receive_json().await, json!({"id": "1", "type": "complete"}));
    assert!(client.receive_timeout(Duration::from_millis(100)).await.is_none());

    assert_eq!(router.counters.open_connections(), 0);
    assert_eq!(router.counters.active_subscriptions(), 0);
    assert!(router.state.registry.active_bindings().is_empty());
    assert_eq!(router.broker.stats().consumers_opened(), 0);
}

#[tokio::test]
async fn test_duplicate_subscription_id_closes_socket() {
    let router = TestRouter::start().await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), Some("graphql-transport-ws")).await;

    client.subscribe("1").await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);
    client.subscribe("1").await;

    match client.receive_message().await {
        Some(WsMessage::Close(Some(frame))) => {
            assert_eq!(u16::from(frame.code), 4409);
            assert_eq!(frame.reason, "Subscriber for 1 already exists");
        }
        other => panic!("expected a close frame, got {:?}", other),
    }
    assert!(router.counters.wait_for_subscription_count(0, WAIT).await);
    assert!(router.counters.wait_for_connection_count(0, WAIT).await);
}

#[tokio::test]
async fn test_subscribe_errors_are_reported_per_id() {
    let router = TestRouter::start_with(|config| config.engine.max_subscriptions_per_connection = 1).await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), None).await;

    client
        .send(json!({"id": "a", "type": "subscribe", "payload": {"query": "subscription { nope { id } }"}}))
        .await;
    assert_eq!(
        client.receive_json().await,
        json!({
            "id": "a",
            "type": "error",
            "payload": [{"message": "Cannot query field \"nope\" on type \"Subscription\"."}]
        })
    );
    assert_eq!(client.receive_json().await, json!({"id": "a", "type": "complete"}));

    client.subscribe("b").await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);
    client.subscribe("c").await;
    assert_eq!(
        client.receive_json().await,
        json!({"id": "c", "type": "error", "payload": [{"message": "Too many subscriptions"}]})
    );
    assert_eq!(client.receive_json().await["type"], "complete");
    assert_eq!(router.counters.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_init_timeout_closes_socket() {
    let router = TestRouter::start_with(|config| config.engine.connection_init_timeout_ms = 50).await;
    let mut client = TestWebSocketClient::connect(&router.ws_url(), None).await;

    match client.receive_message().await {
        Some(WsMessage::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4408),
        other => panic!("expected a close frame, got {:?}", other),
    }
    assert!(router.counters.wait_for_connection_count(0, WAIT).await);
}

#[tokio::test]
async fn test_handler_failure_is_not_a_stream_fault() {
    let router = TestRouter::start().await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), None).await;
    client.subscribe("1").await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);

    let mut seen = Vec::new();
    let mut subscription = SubscriptionClient::new(client, |payload: Option<&Value>, error: Option<&Value>| {
        seen.push((payload.cloned(), error.cloned()));
        match error {
            Some(_) => Err("handler rejected the error".to_string()),
            None => Ok(()),
        }
    });

    router.produce(MISSING_ID).await;
    router.produce(EMPLOYEE_1).await;
    assert!(subscription.pump(2).await);

    assert_eq!(subscription.handled, 2);
    assert_eq!(subscription.handler_failures, 1);
    assert_eq!(router.counters.active_subscriptions(), 1);
    drop(subscription);

    assert!(seen[0].1.is_some());
    assert_eq!(seen[1].0, Some(employee_1_data()));
}

async fn open_sse(router: &TestRouter) -> impl Stream<Item = eventsource_stream::Event> {
    let response = reqwest::Client::new()
        .post(router.http_url("/graphql"))
        .header("Accept", "text/event-stream")
        .json(&json!({"query": EMPLOYEE_QUERY}))
        .send()
        .await
        .expect("Failed to open SSE stream");
    assert!(response.status().is_success());

    response
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move { event.ok() })
}

async fn next_sse<S: Stream<Item = eventsource_stream::Event> + Unpin>(
    events: &mut S,
) -> eventsource_stream::Event {
    time::timeout(WAIT, events.next())
        .await
        .expect("Timed out waiting for an SSE event")
        .expect("SSE stream ended")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sse_subscription() {
    let router = TestRouter::start().await;
    let mut events = Box::pin(open_sse(&router).await);
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);
    assert_eq!(router.counters.open_connections(), 1);

    router.produce(MISSING_ID).await;
    router.produce(EMPLOYEE_1).await;

    let error = next_sse(&mut events).await;
    assert_eq!(error.event, "next");
    assert_eq!(
        error.data,
        r#"{"errors":[{"message":"Cannot return null for non-nullable field 'Subscription.employeeUpdatedMyKafka.id'.","path":["employeeUpdatedMyKafka","id"]}],"data":null}"#
    );

    let next = next_sse(&mut events).await;
    assert_eq!(next.event, "next");
    assert_eq!(
        serde_json::from_str::<Value>(&next.data).unwrap(),
        employee_1_data()
    );

    // Client disconnect cancels the subscription
    drop(events);
    assert!(router.counters.wait_for_subscription_count(0, WAIT).await);
    assert!(router.counters.wait_for_connection_count(0, WAIT).await);
    let stats = router.broker.stats();
    assert!(eventually(|| stats.consumers_closed() == 1).await);
}

#[tokio::test]
async fn test_blocked_sse_gets_one_error() {
    let router = TestRouter::start_with(|config| config.security.block_subscriptions = true).await;
    let mut events = Box::pin(open_sse(&router).await);

    let next = next_sse(&mut events).await;
    assert_eq!(next.event, "next");
    assert_eq!(serde_json::from_str::<Value>(&next.data).unwrap(), blocked());
    assert_eq!(next_sse(&mut events).await.event, "complete");

    assert_eq!(router.counters.open_connections(), 0);
    assert_eq!(router.counters.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_sse_requires_event_stream_accept() {
    let router = TestRouter::start().await;
    let response = reqwest::Client::new()
        .post(router.http_url("/graphql"))
        .json(&json!({"query": EMPLOYEE_QUERY}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_ACCEPTABLE);
    assert_eq!(router.counters.open_connections(), 0);
}

#[tokio::test]
async fn test_health_endpoints() {
    let router = TestRouter::start().await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), None).await;
    client.subscribe("1").await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);

    let health = reqwest::get(router.http_url("/health")).await.unwrap();
    assert!(health.status().is_success());

    let counters: Value = reqwest::get(router.http_url("/health/subscriptions"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        counters,
        json!({
            "active_subscriptions": 1,
            "open_connections": 1,
            "messages_sent": 0,
            "bindings": 1,
            "accepting": true
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_completes_subscriptions() {
    let mut router = TestRouter::start().await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), None).await;
    client.subscribe("1").await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);

    router.stop().await;

    assert_eq!(client.receive_json().await, json!({"id": "1", "type": "complete"}));
    assert!(router.counters.wait_for_subscription_count(0, WAIT).await);
    assert!(router.counters.wait_for_connection_count(0, WAIT).await);
    assert!(!router.state.registry.is_accepting());
    let stats = router.broker.stats();
    assert!(eventually(|| stats.consumers_closed() == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_websocket_reader_is_evicted() {
    let router = TestRouter::start_with(|config| {
        config.engine.outbound_queue_size = 2;
        config.engine.slow_consumer_grace_ms = 100;
    })
    .await;
    let mut client = TestWebSocketClient::initialised(&router.ws_url(), Some("graphql-transport-ws")).await;
    client.subscribe("1").await;
    assert!(router.counters.wait_for_subscription_count(1, WAIT).await);

    // Large frames fill the socket buffers while the client reads nothing
    let forename = "x".repeat(64 * 1024);
    let payload = json!({
        "__typename": "Employee",
        "id": 1,
        "details": {"forename": forename, "surname": "Neuse"}
    })
    .to_string();
    for _ in 0..400 {
        router
            .broker
            .produce("employeeUpdated", Bytes::from(payload.clone()))
            .await
            .unwrap();
        if router.counters.open_connections() == 0 {
            break;
        }
        time::sleep(Duration::from_millis(1)).await;
    }

    let patience = Duration::from_secs(10);
    assert!(router.counters.wait_for_connection_count(0, patience).await);
    assert!(router.counters.wait_for_subscription_count(0, patience).await);
    assert!(router.state.registry.active_bindings().is_empty());

    // Whatever was buffered drains, then the server side is gone
    let drained = time::timeout(patience, async {
        while let Some(Ok(message)) = client.ws_stream.next().await {
            if let WsMessage::Close(_) = message {
                break;
            }
        }
    })
    .await;
    assert!(drained.is_ok(), "socket stayed open after eviction");
}
