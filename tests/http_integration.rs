//! Integration tests for the HTTP surface

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tokio_stream::StreamExt;
use tower::ServiceExt;

use common::{session_id, test_state, ScriptedProvider, PLAIN_RESPONSE};
use weave::server::router;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_session(uri: &str, sid: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, format!("session={}", sid))
        .body(Body::empty())
        .unwrap()
}

fn post_form(uri: &str, sid: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::COOKIE, format!("session={}", sid))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_index_issues_session_cookie() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let response = router(state).oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("first visit sets a session cookie")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("session="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));

    let value = cookie
        .trim_start_matches("session=")
        .split(';')
        .next()
        .unwrap();
    assert_eq!(value.len(), 32);
    assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_existing_cookie_is_not_replaced() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let sid = session_id('a');
    let response = router(state)
        .oneshot(get_with_session("/", &sid))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn test_malformed_cookie_is_replaced() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let response = router(state)
        .oneshot(get_with_session("/", "NOT-HEX"))
        .await
        .unwrap();

    assert!(response.headers().get(header::SET_COOKIE).is_some());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let response = router(state).oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ready");
}

#[tokio::test]
async fn test_static_assets_served() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let app = router(state);

    let response = app.clone().oneshot(get("/static/app.js")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/static/nope.js")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_events_requires_presented_cookie() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let response = router(state).oneshot(get("/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_events_with_cookie_streams() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let sid = session_id('b');
    let response = router(state)
        .oneshot(get_with_session("/events", &sid))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );
}

#[tokio::test]
async fn test_chat_happy_path_appends_both_turns() {
    let provider = ScriptedProvider::new(vec![PLAIN_RESPONSE]);
    let state = test_state(provider.clone());
    let sid = session_id('c');

    let response = router(state.clone())
        .oneshot(post_form("/chat", &sid, "message=hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["session_id"], sid);

    let session = state.sessions.get(&sid).expect("session exists");
    session.with_conversation(|conversation| {
        let messages = conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, "assistant");
        // Conversational text only: no delimiter, no JSON.
        assert_eq!(messages[1].content, "Hi!");
    });
}

#[tokio::test]
async fn test_chat_user_turn_not_written_before_response() {
    // The outbound context must not contain the new user message from
    // history (it is appended in-memory only).
    let provider = ScriptedProvider::new(vec![PLAIN_RESPONSE, PLAIN_RESPONSE]);
    let state = test_state(provider.clone());
    let sid = session_id('d');
    let app = router(state);

    app.clone()
        .oneshot(post_form("/chat", &sid, "message=first"))
        .await
        .unwrap();
    app.oneshot(post_form("/chat", &sid, "message=second"))
        .await
        .unwrap();

    let contexts = provider.contexts.lock().unwrap();
    // First call: system + settings? (defaults are zero -> none) + new user message.
    let first_roles: Vec<&str> = contexts[0].iter().map(|m| m.role.as_str()).collect();
    assert_eq!(first_roles.first().copied(), Some("system"));
    assert_eq!(contexts[0].last().unwrap().content, "first");
    // Second call sees both prior turns from history plus the new one.
    let second_contents: Vec<&str> =
        contexts[1].iter().map(|m| m.content.as_str()).collect();
    assert!(second_contents.contains(&"first"));
    assert!(second_contents.contains(&"Hi!"));
    assert_eq!(contexts[1].last().unwrap().content, "second");
}

#[tokio::test]
async fn test_chat_empty_message_is_400() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let response = router(state)
        .oneshot(post_form("/chat", &session_id('e'), "message=++"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_oversize_message_is_413() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let long = "x".repeat(11 * 1024);
    let response = router(state)
        .oneshot(post_form(
            "/chat",
            &session_id('f'),
            &format!("message={}", long),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_chat_rate_limit_429() {
    let provider = ScriptedProvider::new(vec![PLAIN_RESPONSE]);
    let mut config = weave::config::Config::default();
    config.compute.disabled = true;
    config.limits.chat_per_minute = 1;
    let state = weave::server::AppState::new(config, provider);
    let sid = session_id('1');
    let app = router(state);

    let first = app
        .clone()
        .oneshot(post_form("/chat", &sid, "message=one"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post_form("/chat", &sid, "message=two"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_chat_format_recovery_emits_retry_event() {
    // First response has no delimiter; the retry succeeds. The SSE
    // stream must carry agent-retry before agent-done.
    let provider = ScriptedProvider::new(vec!["Hi", PLAIN_RESPONSE]);
    let state = test_state(provider);
    let sid = session_id('2');

    let mut registration = state.broker.register(&sid).unwrap();
    let response = router(state.clone())
        .oneshot(post_form("/chat", &sid, "message=hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        registration.events.next(),
    )
    .await
    {
        seen.push(event.event.clone());
        if event.event == "agent-done" {
            break;
        }
    }

    let retry_pos = seen.iter().position(|e| e == "agent-retry");
    let done_pos = seen.iter().position(|e| e == "agent-done");
    assert!(retry_pos.is_some(), "agent-retry seen: {:?}", seen);
    assert!(done_pos.is_some(), "agent-done seen: {:?}", seen);
    assert!(retry_pos < done_pos);
}

#[tokio::test]
async fn test_chat_exhaustion_resets_conversation() {
    // Four malformed responses exhaust every level.
    let provider = ScriptedProvider::new(vec!["bad", "bad", "bad", "bad"]);
    let state = test_state(provider);
    let sid = session_id('3');

    let response = router(state.clone())
        .oneshot(post_form("/chat", &sid, "message=hello"))
        .await
        .unwrap();
    // 200 so the client does not raise; status says reset.
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "reset");

    let session = state.sessions.get(&sid).unwrap();
    assert_eq!(session.with_conversation(|c| c.len()), 0);
}

#[tokio::test]
async fn test_prompt_update_roundtrip() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let sid = session_id('4');

    let response = router(state.clone())
        .oneshot(post_form("/prompt", &sid, "prompt=a+quiet+lake"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session = state.sessions.get(&sid).unwrap();
    session.with_conversation(|conversation| {
        assert_eq!(conversation.current_prompt(), "a quiet lake");
        assert!(conversation.prompt_edited());
    });
}

#[tokio::test]
async fn test_new_chat_clears_history() {
    let provider = ScriptedProvider::new(vec![PLAIN_RESPONSE]);
    let state = test_state(provider);
    let sid = session_id('5');
    let app = router(state.clone());

    app.clone()
        .oneshot(post_form("/chat", &sid, "message=hello"))
        .await
        .unwrap();
    assert_eq!(
        state.sessions.get(&sid).unwrap().with_conversation(|c| c.len()),
        2
    );

    let response = app
        .oneshot(post_form("/new-chat", &sid, ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        state.sessions.get(&sid).unwrap().with_conversation(|c| c.len()),
        0
    );
}

#[tokio::test]
async fn test_generate_without_worker_is_503_and_history_untouched() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let sid = session_id('6');

    let mut registration = state.broker.register(&sid).unwrap();
    let response = router(state.clone())
        .oneshot(post_form("/generate", &sid, "prompt=a+cat"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // SSE error with readable text; history untouched.
    let _connected = registration.events.next().await.unwrap();
    let event = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        registration.events.next(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(event.event, "error");
    assert!(event.data["message"].as_str().unwrap().contains("worker"));

    let session = state.sessions.get(&sid).unwrap();
    assert_eq!(session.with_conversation(|c| c.len()), 0);
}

#[tokio::test]
async fn test_generate_without_any_prompt_is_400() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let response = router(state)
        .oneshot(post_form("/generate", &session_id('7'), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_image_endpoint_status_codes() {
    let state = test_state(ScriptedProvider::new(vec![]));
    let app = router(state.clone());

    // Malformed id.
    let response = app
        .clone()
        .oneshot(get("/images/not-a-uuid.png"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown but well-formed id.
    let response = app
        .clone()
        .oneshot(get(&format!("/images/{}.png", uuid::Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Stored image round-trips with immutable caching, with or without
    // the .png suffix.
    let stored = state.images.insert(vec![1, 2, 3], 1, 1);
    for uri in [
        format!("/images/{}.png", stored.id),
        format!("/images/{}", stored.id),
    ] {
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
        assert!(response
            .headers()
            .get(header::CACHE_CONTROL)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("immutable"));
    }
}
