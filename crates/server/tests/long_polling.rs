use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use bayeux_server::ack::AckExtension;
use bayeux_server::broker::Broker;
use bayeux_server::config::{Options, ServerConfig};
use bayeux_server::events::ServerEvent;
use bayeux_server::long_polling;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_server(options: Options) -> (Router, Arc<Broker>) {
    let broker = Broker::new(options);
    let config = ServerConfig::default();
    let (path, handler) =
        long_polling::service(&config, Arc::clone(&broker)).expect("transport enabled");
    (Router::new().route(path, handler), broker)
}

async fn post(router: &Router, cookie: Option<&str>, body: Value) -> Response {
    let mut request = Request::builder()
        .method("POST")
        .uri("/bayeux")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    let request = request.body(Body::from(body.to_string())).unwrap();

    router.clone().oneshot(request).await.unwrap()
}

async fn read_body(response: Response) -> Vec<u8> {
    use http_body_util::BodyExt;

    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn read_json(response: Response) -> Vec<Value> {
    let bytes = read_body(response).await;
    serde_json::from_slice(&bytes).unwrap()
}

/// Handshakes a fresh browser; returns `(client_id, cookie)`.
async fn handshake(router: &Router) -> (String, String) {
    let response = post(
        router,
        None,
        json!([{
            "channel": "/meta/handshake",
            "version": "1.0",
            "supportedConnectionTypes": ["long-polling"],
        }]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("browser cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_owned();

    let body = read_json(response).await;
    let client_id = body[0]["clientId"].as_str().expect("clientId").to_owned();
    (client_id, cookie)
}

async fn subscribe(router: &Router, client_id: &str, cookie: &str, subscription: &str) {
    let response = post(
        router,
        Some(cookie),
        json!([{
            "channel": "/meta/subscribe",
            "clientId": client_id,
            "subscription": subscription,
        }]),
    )
    .await;
    let body = read_json(response).await;
    assert_eq!(body.last().unwrap()["successful"], json!(true));
}

fn connect(client_id: &str) -> Value {
    json!([{
        "channel": "/meta/connect",
        "clientId": client_id,
        "connectionType": "long-polling",
    }])
}

fn primed_connect(client_id: &str) -> Value {
    json!([{
        "channel": "/meta/connect",
        "clientId": client_id,
        "connectionType": "long-polling",
        "advice": {"timeout": 0},
    }])
}

#[tokio::test]
async fn handshake_only_request() {
    let (router, broker) = test_server(Options::default());

    let response = post(
        &router,
        None,
        json!([{
            "channel": "/meta/handshake",
            "version": "1.0",
            "supportedConnectionTypes": ["long-polling"],
        }]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("browser cookie")
        .to_str()
        .unwrap()
        .to_owned();
    assert!(cookie.starts_with("BAYEUX_BROWSER="));
    assert!(cookie.contains("HttpOnly"));
    let value = cookie
        .trim_start_matches("BAYEUX_BROWSER=")
        .split(';')
        .next()
        .unwrap();
    assert_eq!(value.len(), 40);
    assert!(value.chars().all(|c| c.is_ascii_hexdigit()));

    let body = read_json(response).await;
    assert_eq!(body.len(), 1);
    let reply = &body[0];
    assert_eq!(reply["channel"], json!("/meta/handshake"));
    assert_eq!(reply["successful"], json!(true));
    assert_eq!(reply["version"], json!("1.0"));
    assert_eq!(reply["advice"]["reconnect"], json!("retry"));

    let client_id = reply["clientId"].as_str().unwrap();
    assert_eq!(client_id.len(), 40);
    assert!(client_id.chars().all(|c| c.is_ascii_hexdigit()));

    broker.close();
}

#[tokio::test]
async fn non_post_requests_are_rejected() {
    let (router, broker) = test_server(Options::default());

    let request = Request::builder()
        .method("GET")
        .uri("/bayeux")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Empty batches and unparseable bodies are protocol violations too.
    let response = post(&router, None, json!([])).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    broker.close();
}

#[tokio::test]
async fn handshake_must_travel_alone() {
    let (router, broker) = test_server(Options::default());

    let response = post(
        &router,
        None,
        json!([
            {"channel": "/meta/handshake", "version": "1.0"},
            {"channel": "/foo", "data": 1},
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    broker.close();
}

#[tokio::test]
async fn stale_client_id_is_told_to_rehandshake() {
    let (router, broker) = test_server(Options::default());

    let response = post(
        &router,
        None,
        json!([{
            "channel": "/meta/connect",
            "clientId": "00112233445566778899aabbccddeeff00112233",
            "connectionType": "long-polling",
        }]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = read_json(response).await;
    let reply = body.last().unwrap();
    assert_eq!(reply["successful"], json!(false));
    assert_eq!(reply["error"], json!("402::session_unknown"));
    assert_eq!(reply["advice"]["reconnect"], json!("handshake"));
    assert_eq!(reply["advice"]["interval"], json!(0));

    broker.close();
}

#[tokio::test]
async fn held_connect_returns_on_timeout() {
    let (router, broker) = test_server(Options {
        timeout: 400,
        ..Options::default()
    });

    let (client_id, cookie) = handshake(&router).await;

    // Primed connect: the client advertises timeout 0 and gets an immediate
    // answer.
    let response = post(&router, Some(&cookie), primed_connect(&client_id)).await;
    assert_eq!(read_json(response).await.len(), 1);

    let started = Instant::now();
    let response = post(&router, Some(&cookie), connect(&client_id)).await;
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body.len(), 1);
    assert_eq!(body[0]["successful"], json!(true));
    assert!(elapsed >= Duration::from_millis(200), "returned in {elapsed:?}");

    broker.close();
}

#[tokio::test]
async fn held_connect_wakes_on_publish() {
    let (router, broker) = test_server(Options {
        timeout: 5_000,
        ..Options::default()
    });

    let (subscriber, cookie) = handshake(&router).await;
    subscribe(&router, &subscriber, &cookie, "/foo").await;

    let held = {
        let router = router.clone();
        let subscriber = subscriber.clone();
        let cookie = cookie.clone();
        tokio::spawn(async move { post(&router, Some(&cookie), connect(&subscriber)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (publisher, publisher_cookie) = handshake(&router).await;
    let started = Instant::now();
    let response = post(
        &router,
        Some(&publisher_cookie),
        json!([{"channel": "/foo", "clientId": publisher, "data": "data"}]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = tokio::time::timeout(Duration::from_secs(2), held)
        .await
        .expect("held connect woke")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let body = read_json(response).await;
    assert_eq!(body.len(), 2);
    assert_eq!(body[0]["channel"], json!("/foo"));
    assert_eq!(body[0]["data"], json!("data"));
    assert_eq!(body[1]["channel"], json!("/meta/connect"));
    assert_eq!(body[1]["successful"], json!(true));

    broker.close();
}

#[tokio::test]
async fn duplicate_connect_preempts_the_held_one() {
    let (router, broker) = test_server(Options {
        timeout: 600,
        duplicate_meta_connect_http_response_code: 400,
        ..Options::default()
    });

    let (client_id, cookie) = handshake(&router).await;

    let first = {
        let router = router.clone();
        let client_id = client_id.clone();
        let cookie = cookie.clone();
        tokio::spawn(async move { post(&router, Some(&cookie), connect(&client_id)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let second = {
        let router = router.clone();
        let client_id = client_id.clone();
        let cookie = cookie.clone();
        tokio::spawn(async move { post(&router, Some(&cookie), connect(&client_id)).await })
    };

    // The first connect answers promptly with the configured status and no
    // body.
    let response = tokio::time::timeout(Duration::from_millis(500), first)
        .await
        .expect("preempted connect returned")
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(read_body(response).await.is_empty());

    // The second is then held and expires normally.
    let response = tokio::time::timeout(Duration::from_secs(2), second)
        .await
        .expect("second connect returned")
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body.last().unwrap()["successful"], json!(true));
    assert!(elapsed >= Duration::from_millis(300), "returned in {elapsed:?}");

    broker.close();
}

#[tokio::test]
async fn sweeper_expires_an_idle_session() {
    let (router, broker) = test_server(Options {
        sweep_period: 100,
        max_interval: 400,
        ..Options::default()
    });

    let mut events = broker.events();
    let (client_id, _cookie) = handshake(&router).await;

    let removed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(ServerEvent::SessionRemoved { session, timeout }) => break (session, timeout),
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("session swept in time");

    assert_eq!(removed.0.to_string(), client_id);
    assert!(removed.1, "removal must be flagged as a timeout");

    broker.close();
}

#[tokio::test]
async fn ack_extension_replays_after_a_broken_connection() {
    let (router, broker) = test_server(Options {
        timeout: 5_000,
        ..Options::default()
    });
    broker.add_extension(Arc::new(AckExtension));

    // Handshake opting into acknowledged delivery.
    let response = post(
        &router,
        None,
        json!([{
            "channel": "/meta/handshake",
            "version": "1.0",
            "supportedConnectionTypes": ["long-polling"],
            "ext": {"ack": true},
        }]),
    )
    .await;
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_owned();
    let body = read_json(response).await;
    assert_eq!(body[0]["ext"]["ack"], json!(true));
    let client_id = body[0]["clientId"].as_str().unwrap().to_owned();

    subscribe(&router, &client_id, &cookie, "/foo").await;

    // First connect acknowledges nothing and is primed to return at once;
    // its reply opens the numbering at 0.
    let response = post(
        &router,
        Some(&cookie),
        json!([{
            "channel": "/meta/connect",
            "clientId": client_id,
            "connectionType": "long-polling",
            "advice": {"timeout": 0},
            "ext": {"ack": -1},
        }]),
    )
    .await;
    let body = read_json(response).await;
    assert_eq!(body.last().unwrap()["ext"]["ack"], json!(0));

    // Second connect is held, then the connection breaks mid-hold.
    let held = {
        let router = router.clone();
        let client_id = client_id.clone();
        let cookie = cookie.clone();
        tokio::spawn(async move {
            post(
                &router,
                Some(&cookie),
                json!([{
                    "channel": "/meta/connect",
                    "clientId": client_id,
                    "connectionType": "long-polling",
                    "ext": {"ack": 0},
                }]),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    held.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A message published while the client is away.
    let (publisher, publisher_cookie) = handshake(&router).await;
    let response = post(
        &router,
        Some(&publisher_cookie),
        json!([{"channel": "/foo", "clientId": publisher, "data": "missed"}]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // The client reconnects still acknowledging batch 0 and receives both
    // the missed message and the new connect reply.
    let response = post(
        &router,
        Some(&cookie),
        json!([{
            "channel": "/meta/connect",
            "clientId": client_id,
            "connectionType": "long-polling",
            "ext": {"ack": 0},
        }]),
    )
    .await;
    let body = read_json(response).await;
    assert_eq!(body.len(), 2);
    assert_eq!(body[0]["channel"], json!("/foo"));
    assert_eq!(body[0]["data"], json!("missed"));
    let reply = &body[1];
    assert_eq!(reply["channel"], json!("/meta/connect"));
    assert_eq!(reply["successful"], json!(true));
    assert_eq!(reply["ext"]["ack"], json!(1));

    broker.close();
}

#[tokio::test]
async fn browser_cap_yields_multiple_clients_advice() {
    let (router, broker) = test_server(Options {
        timeout: 5_000,
        max_sessions_per_browser: 1,
        multi_session_interval: 1_500,
        ..Options::default()
    });

    // Two sessions sharing one browser cookie.
    let (first_id, cookie) = handshake(&router).await;
    let response = post(
        &router,
        Some(&cookie),
        json!([{
            "channel": "/meta/handshake",
            "version": "1.0",
            "supportedConnectionTypes": ["long-polling"],
        }]),
    )
    .await;
    let second_id = read_json(response).await[0]["clientId"]
        .as_str()
        .unwrap()
        .to_owned();

    let held = {
        let router = router.clone();
        let cookie = cookie.clone();
        tokio::spawn(async move { post(&router, Some(&cookie), connect(&first_id)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = post(&router, Some(&cookie), connect(&second_id)).await;
    let body = read_json(response).await;
    let reply = body.last().unwrap();
    assert_eq!(reply["advice"]["multiple-clients"], json!(true));
    assert_eq!(reply["advice"]["reconnect"], json!("retry"));
    assert_eq!(reply["advice"]["interval"], json!(1_500));

    held.abort();
    broker.close();
}
