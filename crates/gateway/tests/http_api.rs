use std::time::{Duration, Instant};

use {
    serde_json::{Value, json},
    wagate_channels::InboundMessage,
};

use common::{fast_pairing, spawn_gateway, test_config};

mod common;

#[tokio::test]
async fn health_is_public() {
    let gw = spawn_gateway(test_config(), fast_pairing()).await;
    let resp = gw.http.get(gw.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["sessions"]["total"], 0);
}

#[tokio::test]
async fn control_plane_requires_bearer_token() {
    let gw = spawn_gateway(test_config(), fast_pairing()).await;

    let resp = gw.http.get(gw.url("/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());

    let resp = gw
        .http
        .get(gw.url("/sessions"))
        .bearer_auth("not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let token = gw.token().await;
    let resp = gw
        .http
        .get(gw.url("/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn session_crud() {
    let gw = spawn_gateway(test_config(), fast_pairing()).await;
    let token = gw.token().await;

    let body = gw
        .create_session(&token, json!({ "id": "9999999999", "name": "Sales" }))
        .await;
    assert_eq!(body["data"]["id"], "9999999999");
    assert_eq!(body["data"]["connected"], false);
    assert_eq!(body["data"]["authenticated"], false);

    // Duplicate id.
    let resp = gw
        .http
        .post(gw.url("/sessions"))
        .bearer_auth(&token)
        .json(&json!({ "id": "9999999999" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = gw
        .http
        .put(gw.url("/sessions/9999999999/name"))
        .bearer_auth(&token)
        .json(&json!({ "name": "Support" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = gw
        .http
        .put(gw.url("/sessions/9999999999/webhook"))
        .bearer_auth(&token)
        .json(&json!({ "webhook_url": "not a url" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = gw
        .http
        .get(gw.url("/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sessions = body["data"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["name"], "Support");

    let resp = gw
        .http
        .delete(gw.url("/sessions/9999999999"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = gw.get_session(&token, "9999999999").await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let gw = spawn_gateway(test_config(), fast_pairing()).await;
    let token = gw.token().await;
    let resp = gw
        .http
        .post(gw.url("/sessions"))
        .bearer_auth(&token)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn unpaired_session_cannot_connect() {
    let gw = spawn_gateway(test_config(), fast_pairing()).await;
    let token = gw.token().await;
    gw.create_session(&token, json!({ "id": "12345" })).await;

    let resp = gw
        .http
        .post(gw.url("/sessions/12345/connect"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = gw
        .http
        .get(gw.url("/sessions/12345/qr"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let resp = gw
        .http
        .post(gw.url("/sessions/00000/disconnect"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn repeated_login_failures_are_blocked() {
    let gw = spawn_gateway(test_config(), fast_pairing()).await;
    let attempt = |ip: &'static str| {
        gw.http
            .post(gw.url("/login"))
            .header("x-forwarded-for", ip)
            .json(&json!({ "username": "admin", "password": "wrong" }))
            .send()
    };

    for _ in 0..5 {
        let resp = attempt("203.0.113.5").await.unwrap();
        assert_eq!(resp.status(), 401);
    }

    let resp = attempt("203.0.113.5").await.unwrap();
    assert_eq!(resp.status(), 429);
    let retry_after: u64 = resp.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);

    // Other addresses are unaffected.
    let resp = attempt("198.51.100.7").await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn blocked_addresses_skip_the_login_delay() {
    let mut config = test_config();
    config.auth.login_delay_ms = 300;
    config.rate_limit.max_attempts = 1;
    let gw = spawn_gateway(config, fast_pairing()).await;
    let attempt = || {
        gw.http
            .post(gw.url("/login"))
            .header("x-forwarded-for", "203.0.113.9")
            .json(&json!({ "username": "admin", "password": "wrong" }))
            .send()
    };

    let started = Instant::now();
    let resp = attempt().await.unwrap();
    assert_eq!(resp.status(), 401);
    assert!(started.elapsed() >= Duration::from_millis(300));

    let started = Instant::now();
    let resp = attempt().await.unwrap();
    assert_eq!(resp.status(), 429);
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn inbound_messages_reach_the_webhook() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/hook")
        .match_header("content-type", "application/json")
        .match_body(mockito::Matcher::PartialJson(json!({
            "session_id": "12345",
            "message_id": "m1",
            "message_type": "text",
            "content": "halo",
        })))
        .with_status(200)
        .create_async()
        .await;

    let gw = spawn_gateway(test_config(), fast_pairing()).await;
    let token = gw.token().await;
    gw.create_session(
        &token,
        json!({ "id": "12345", "webhook_url": format!("{}/hook", server.url()) }),
    )
    .await;

    gw.client("12345")
        .inject(InboundMessage::text("m1", "628123@s.whatsapp.net", "halo"));

    for _ in 0..200 {
        if mock.matched_async().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    mock.assert_async().await;
}
