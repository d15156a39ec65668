//! End-to-end scenarios: a client and a server composed over the in-process
//! strategies, exercising routing, correlation, timeouts and pub/sub.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use framelink_client::{Client, EventCallback, RequestOptions};
use framelink_common::transport::{BridgeStrategy, LoopbackStrategy, MessageHub};
use framelink_common::FramelinkError;
use framelink_server::Server;

#[tokio::test]
async fn test_echo_round_trip_preserves_query_and_transaction() {
    let strategy = LoopbackStrategy::new();
    let server = Server::new(strategy.clone());
    server
        .get("/echo", |req, mut res, _next| async move {
            let _ = res.send(200, req.serialize()).await;
        })
        .unwrap();
    server.listen().await.unwrap();

    let client = Client::new(strategy).await.unwrap();
    let response = client.get("/echo?x=1", RequestOptions::default()).await.unwrap();

    assert_eq!(response.code, 200);
    assert_eq!(response.payload["query"]["x"], "1");
    assert_eq!(response.payload["resource"], "/echo");
    // The echoed request carries the transaction id the response answers.
    assert_eq!(response.payload["transactionId"], json!(response.transaction_id));
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let strategy = LoopbackStrategy::new();
    let server = Server::new(strategy.clone());
    server.listen().await.unwrap();

    let client = Client::new(strategy).await.unwrap();
    let started = tokio::time::Instant::now();
    let result = client
        .post(
            "/slow",
            RequestOptions {
                timeout: Some(Duration::from_millis(100)),
                ..RequestOptions::default()
            },
        )
        .await;

    assert!(matches!(result, Err(FramelinkError::Timeout(100))));
    assert!(started.elapsed() < Duration::from_millis(600));
}

#[tokio::test]
async fn test_describe_surfaces_registered_routes() {
    let strategy = LoopbackStrategy::new();
    let server = Server::new(strategy.clone());
    server
        .get("/user/:id", |_req, mut res, _next| async move {
            let _ = res.send(200, json!({})).await;
        })
        .unwrap();
    server
        .post("/user/:id", |_req, mut res, _next| async move {
            let _ = res.send(200, json!({})).await;
        })
        .unwrap();
    server.listen().await.unwrap();

    let client = Client::new(strategy).await.unwrap();
    let response = client.describe().await.unwrap();

    assert_eq!(response.code, 200);
    let route = &response.payload["/user/:id"];
    assert_eq!(route["params"], json!(["id"]));
    assert!(route["get"].is_object());
    assert!(route["post"].is_object());
}

#[tokio::test]
async fn test_route_params_reach_the_handler() {
    let strategy = LoopbackStrategy::new();
    let server = Server::new(strategy.clone());
    server
        .get("/user/:id/post/:post", |req, mut res, _next| async move {
            let _ = res
                .send(200, json!({ "params": req.params }))
                .await;
        })
        .unwrap();
    server.listen().await.unwrap();

    let client = Client::new(strategy).await.unwrap();
    let response = client
        .get("/user/42/post/7", RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.payload["params"]["id"], "42");
    assert_eq!(response.payload["params"]["post"], "7");
}

fn collecting_callback() -> (EventCallback, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: EventCallback = Arc::new(move |event| {
        sink.lock().unwrap().push(event.payload.clone());
    });
    (callback, seen)
}

#[tokio::test]
async fn test_publish_subscribe_end_to_end() {
    let strategy = LoopbackStrategy::new();
    let server = Server::new(strategy.clone());
    server.listen().await.unwrap();
    let client = Client::new(strategy).await.unwrap();

    let (first, first_seen) = collecting_callback();
    let (second, second_seen) = collecting_callback();
    client.subscribe("/topic/news", first.clone()).await.unwrap();
    client.subscribe("/topic/news", second.clone()).await.unwrap();

    let report = server.publish("/topic/news", json!({"headline": "one"})).await;
    assert_eq!(report.delivered, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*first_seen.lock().unwrap(), vec![json!({"headline": "one"})]);
    assert_eq!(*second_seen.lock().unwrap(), vec![json!({"headline": "one"})]);

    // One callback gone: the other keeps receiving.
    client.unsubscribe("/topic/news", &first).await.unwrap();
    server.publish("/topic/news", json!({"headline": "two"})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first_seen.lock().unwrap().len(), 1);
    assert_eq!(second_seen.lock().unwrap().len(), 2);

    // Last callback gone: the server-side subscription is torn down.
    client.unsubscribe("/topic/news", &second).await.unwrap();
    let report = server.publish("/topic/news", json!({"headline": "three"})).await;
    assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn test_subscription_survives_unrelated_unsubscribe() {
    let strategy = LoopbackStrategy::new();
    let server = Server::new(strategy.clone());
    server.listen().await.unwrap();
    let client = Client::new(strategy).await.unwrap();

    let (callback, _) = collecting_callback();
    client.subscribe("/topic/news", callback).await.unwrap();

    let (stranger, _) = collecting_callback();
    let result = client.unsubscribe("/topic/other", &stranger).await;
    assert!(matches!(result, Err(FramelinkError::Subscription(_))));

    // The registered subscription is untouched.
    let report = server.publish("/topic/news", json!({})).await;
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_bridge_round_trip_between_contexts() {
    let hub = MessageHub::new();

    let server_strategy = BridgeStrategy::endpoint(hub.clone(), "https://service.example");
    let server = Server::new(server_strategy);
    server
        .get("/echo", |req, mut res, _next| async move {
            let _ = res.send(200, req.serialize()).await;
        })
        .unwrap();
    server.listen().await.unwrap();

    let client_strategy = BridgeStrategy::connect(hub, "https://service.example");
    let client = Client::new(client_strategy).await.unwrap();

    let response = client.get("/echo?side=far", RequestOptions::default()).await.unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(response.payload["query"]["side"], "far");
}

#[tokio::test]
async fn test_bridge_pub_sub_between_contexts() {
    let hub = MessageHub::new();

    let server_strategy = BridgeStrategy::endpoint(hub.clone(), "https://feed.example");
    let server = Server::new(server_strategy);
    server.listen().await.unwrap();

    let client_strategy = BridgeStrategy::connect(hub, "https://feed.example");
    let client = Client::new(client_strategy).await.unwrap();

    let (callback, seen) = collecting_callback();
    client.subscribe("/topic/news", callback).await.unwrap();

    let report = server.publish("/topic/news", json!({"n": 1})).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_do_not_block_each_other() {
    let strategy = LoopbackStrategy::new();
    let server = Server::new(strategy.clone());
    let in_flight = Arc::new(AtomicUsize::new(0));

    let gauge = Arc::clone(&in_flight);
    server
        .get("/slow", move |_req, mut res, _next| {
            let gauge = Arc::clone(&gauge);
            async move {
                gauge.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = res.send(200, json!({})).await;
            }
        })
        .unwrap();
    server.listen().await.unwrap();

    let client = Arc::new(Client::new(strategy).await.unwrap());
    let started = tokio::time::Instant::now();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.get("/slow", RequestOptions::default()).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    // Four 100ms handlers overlapped instead of serializing.
    assert!(started.elapsed() < Duration::from_millis(350));
}
