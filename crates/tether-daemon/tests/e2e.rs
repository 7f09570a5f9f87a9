//! End-to-end tests for the connection manager against a real WebSocket
//! server: heartbeats, forced close on missing pongs, reconnection with
//! backoff, and clean shutdown.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::{EventBus, ReconnectConfig, Subscription, SyncEvent};
use tether_daemon::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
use tether_daemon::frame::{CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

/// Server side of the tests: accepts raw WebSocket connections.
struct TestServer {
    listener: TcpListener,
}

impl TestServer {
    async fn bind() -> (Self, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (Self { listener }, url)
    }

    async fn accept(&self) -> WebSocketStream<TcpStream> {
        let (stream, _) = self.listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }
}

fn fast_config(url: &str) -> ConnectionConfig {
    ConnectionConfig {
        url: url.to_string(),
        ping_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(80),
        connect_timeout: Duration::from_secs(1),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: Some(5),
        },
        require_auth: false,
    }
}

/// Collect every bus event for later assertions.
fn collect(bus: &Arc<EventBus>) -> (Arc<Mutex<Vec<SyncEvent>>>, Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let sub = bus.subscribe(move |event| {
        sink.lock().unwrap().push(event);
    });
    (events, sub)
}

fn count(events: &Arc<Mutex<Vec<SyncEvent>>>, pred: impl Fn(&SyncEvent) -> bool) -> usize {
    events.lock().unwrap().iter().filter(|e| pred(e)).count()
}

/// Poll a condition until it holds or a second passes.
async fn wait_for(mut pred: impl FnMut() -> bool) {
    for _ in 0..100 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 1s");
}

#[tokio::test]
async fn connect_reaches_connected_state_and_announces_it() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let (events, _sub) = collect(&bus);
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    manager.connect();
    let _ws = server.accept().await;

    wait_for(|| manager.state() == ConnectionState::Connected).await;
    assert_eq!(count(&events, |e| matches!(e, SyncEvent::Connected)), 1);
}

#[tokio::test]
async fn server_events_reach_listeners_and_the_bus() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let (events, _sub) = collect(&bus);
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    manager.on("task_assigned", move |data| {
        sink.lock().unwrap().push(data.clone());
    });

    manager.connect();
    let mut ws = server.accept().await;
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    ws.send(Message::Text(
        json!({"type": "task_assigned", "data": {"id": 7}}).to_string(),
    ))
    .await
    .unwrap();

    wait_for(|| !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap()[0], json!({"id": 7}));

    // The same event is republished on the bus under the connection prefix.
    assert_eq!(
        count(&events, |e| matches!(
            e,
            SyncEvent::Custom { name, .. } if name == "connection:task_assigned"
        )),
        1
    );
}

#[tokio::test]
async fn removed_listener_no_longer_fires() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    let hits = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&hits);
    let id = manager.on("notify", move |_| {
        *sink.lock().unwrap() += 1;
    });
    manager.off("notify", id);

    manager.connect();
    let mut ws = server.accept().await;
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    ws.send(Message::Text(
        json!({"type": "notify", "data": null}).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*hits.lock().unwrap(), 0);
}

#[tokio::test]
async fn send_requires_a_live_connection() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    assert!(!manager.send("notify", json!({"n": 1})));

    manager.connect();
    let mut ws = server.accept().await;
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    assert!(manager.send("notify", json!({"n": 1})));
    let frame = loop {
        match timeout(Duration::from_secs(1), ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "ping" {
                    continue;
                }
                break value;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(frame["type"], "notify");
    assert_eq!(frame["data"], json!({"n": 1}));
}

#[tokio::test]
async fn heartbeat_pings_flow_and_pongs_keep_the_connection_alive() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    manager.connect();
    let mut ws = server.accept().await;
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    // Answer pings for several intervals; the connection must outlive
    // multiple pong deadlines.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(450);
    let mut pings = 0;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                if text.contains("ping") {
                    pings += 1;
                    ws.send(Message::Text(json!({"type": "pong"}).to_string()))
                        .await
                        .unwrap();
                }
            }
            Ok(other) => panic!("unexpected frame: {other:?}"),
        }
    }

    assert!(pings >= 2, "expected several pings, saw {pings}");
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn missing_pong_forces_close_and_reconnect() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    manager.connect();
    let mut ws = server.accept().await;
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    // Never answer pings: the client must close with the heartbeat code.
    let code = loop {
        match timeout(Duration::from_secs(1), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => break u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(code, CLOSE_HEARTBEAT_TIMEOUT);

    // A reconnect attempt follows the backoff.
    let _ws2 = timeout(Duration::from_secs(1), server.accept())
        .await
        .expect("client did not reconnect");
    wait_for(|| manager.state() == ConnectionState::Connected).await;
}

#[tokio::test]
async fn clean_disconnect_suppresses_reconnection() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let (events, _sub) = collect(&bus);
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    manager.connect();
    let mut ws = server.accept().await;
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    manager.disconnect(CLOSE_NORMAL, "done");
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let code = loop {
        match timeout(Duration::from_secs(1), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => break u16::from(frame.code),
            Some(Ok(_)) => continue,
            None => panic!("stream ended without a close frame"),
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(code, CLOSE_NORMAL);

    // No reconnect attempt arrives.
    let reconnect = timeout(Duration::from_millis(300), server.accept()).await;
    assert!(reconnect.is_err(), "client reconnected after clean disconnect");

    assert_eq!(
        count(&events, |e| matches!(
            e,
            SyncEvent::Disconnected { code: 1000, .. }
        )),
        1
    );
}

#[tokio::test]
async fn abnormal_drop_reconnects_after_backoff() {
    let (server, url) = TestServer::bind().await;
    let bus = Arc::new(EventBus::new());
    let (events, _sub) = collect(&bus);
    let manager = ConnectionManager::new(fast_config(&url), Arc::clone(&bus));

    manager.connect();
    let ws = server.accept().await;
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    // Kill the TCP stream without a close handshake.
    drop(ws);

    let _ws2 = timeout(Duration::from_secs(1), server.accept())
        .await
        .expect("client did not reconnect");
    wait_for(|| manager.state() == ConnectionState::Connected).await;

    // One Disconnected for the drop, then a second Connected.
    assert_eq!(
        count(&events, |e| matches!(e, SyncEvent::Disconnected { .. })),
        1
    );
    assert_eq!(count(&events, |e| matches!(e, SyncEvent::Connected)), 2);
}

#[tokio::test]
async fn manual_connect_during_backoff_skips_the_wait() {
    let (server, url) = TestServer::bind().await;
    let addr = server.listener.local_addr().unwrap();
    // Refuse the first attempt so the manager enters its backoff.
    drop(server);

    let bus = Arc::new(EventBus::new());
    let mut config = fast_config(&url);
    config.reconnect.base_delay = Duration::from_secs(5);
    config.reconnect.max_delay = Duration::from_secs(5);
    let manager = ConnectionManager::new(config, Arc::clone(&bus));

    manager.connect();
    wait_for(|| manager.state() == ConnectionState::Reconnecting).await;

    // Rebind and connect by hand: the attempt must land well before the
    // five-second backoff would have elapsed.
    let listener = TcpListener::bind(addr).await.unwrap();
    manager.connect();
    let _ws = timeout(Duration::from_secs(1), async {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    })
    .await
    .expect("manual connect waited out the backoff");

    wait_for(|| manager.state() == ConnectionState::Connected).await;
}

#[tokio::test]
async fn reconnection_gives_up_after_exhausting_attempts() {
    // Bind to learn a free port, then close the listener so every connect
    // attempt is refused.
    let (server, url) = TestServer::bind().await;
    drop(server);

    let bus = Arc::new(EventBus::new());
    let (events, _sub) = collect(&bus);
    let mut config = fast_config(&url);
    config.reconnect.max_attempts = Some(2);
    let manager = ConnectionManager::new(config, Arc::clone(&bus));

    manager.connect();
    wait_for(|| {
        count(&events, |e| matches!(e, SyncEvent::ReconnectFailed { .. })) == 1
    })
    .await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(count(&events, |e| matches!(e, SyncEvent::ConnectionError { .. })) >= 1);
    let attempts = events.lock().unwrap().iter().find_map(|e| match e {
        SyncEvent::ReconnectFailed { attempts } => Some(*attempts),
        _ => None,
    });
    assert_eq!(attempts, Some(2));
}
