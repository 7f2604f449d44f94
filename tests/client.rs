mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::routing::post;
use axum::Router;

use common::{spawn_relay, ScriptedProvider, Step};
use tutor_relay::client::{ChatSession, TranscriptEvent, TurnState};
use tutor_relay::domains::conversation::MessageRole;
use tutor_relay::error::TutorRelayError;

/// Serves a fixed `/chat-stream` response, bypassing the relay.
async fn spawn_raw(status: StatusCode, content_type: &'static str, body: &'static str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route(
        "/chat-stream",
        post(move || async move { (status, [(header::CONTENT_TYPE, content_type)], body) }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn hello_scenario_builds_one_assistant_message() {
    let provider = ScriptedProvider::new(vec![Step::Delta("He"), Step::Delta("llo")]);
    let session = ChatSession::new(spawn_relay(provider.clone()).await);
    let mut events = session.subscribe();

    let report = session.send_turn("Hi", Some("coding")).await.unwrap();
    assert_eq!(report.state, TurnState::Settled);
    assert!(report.error.is_none());

    let transcript = session.transcript();
    assert_eq!(transcript.len(), 2);
    let messages = transcript.messages();
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "Hi");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(report.assistant_message_id.as_deref(), Some(messages[1].id.as_str()));
    assert_eq!(session.state(), TurnState::Settled);
    assert!(session.banner().is_none());

    let mut assistant_updates = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TranscriptEvent::Upserted(message) = event {
            if message.role == MessageRole::Assistant {
                assistant_updates.push(message.content);
            }
        }
    }
    assert_eq!(assistant_updates, vec!["He", "Hello"]);
}

#[tokio::test]
async fn second_turn_sends_whole_history() {
    let provider = ScriptedProvider::new(vec![Step::Delta("Hello")]);
    let session = ChatSession::new(spawn_relay(provider.clone()).await);

    session.send_turn("Hi", None).await.unwrap();
    session.send_turn("Explain traits", None).await.unwrap();

    let forwarded = provider.last_request();
    let contents: Vec<_> = forwarded.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(&contents[1..], &["Hi", "Hello", "Explain traits"]);
    assert_eq!(session.transcript().len(), 4);
}

#[tokio::test]
async fn pre_stream_failure_keeps_only_user_message_and_sets_banner() {
    let provider = ScriptedProvider::new(vec![Step::Fail("upstream unavailable")]);
    let session = ChatSession::new(spawn_relay(provider).await);

    let report = session.send_turn("Hi", None).await.unwrap();
    assert_eq!(report.state, TurnState::Errored);
    assert!(report.assistant_message_id.is_none());

    let transcript = session.transcript();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript.messages()[0].role, MessageRole::User);

    let banner = session.banner().unwrap();
    assert!(banner.contains("502"), "{banner}");
    assert!(banner.contains("upstream unavailable"), "{banner}");
}

#[tokio::test]
async fn mid_stream_failure_keeps_partial_reply() {
    let provider = ScriptedProvider::new(vec![Step::Delta("Par"), Step::Fail("reset")]);
    let session = ChatSession::new(spawn_relay(provider).await);

    let report = session.send_turn("Hi", None).await.unwrap();
    assert_eq!(report.state, TurnState::Errored);
    assert!(report.error.unwrap().contains("reset"));
    assert_eq!(session.transcript().last().unwrap().content, "Par");
}

#[tokio::test]
async fn malformed_frame_is_skipped_without_failing_the_turn() {
    let base = spawn_raw(
        StatusCode::OK,
        "text/event-stream",
        concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9} \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"oops\"}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\u{1f980}\"}}]}\n\n",
            "data: [DONE]\n\n",
        ),
    )
    .await;
    let session = ChatSession::new(base);

    let report = session.send_turn("Hi", None).await.unwrap();
    assert_eq!(report.state, TurnState::Settled);
    assert_eq!(session.transcript().last().unwrap().content, "caf\u{e9} \u{1f980}");
}

#[tokio::test]
async fn plain_text_error_body_is_used_verbatim() {
    let base = spawn_raw(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "maintenance").await;
    let session = ChatSession::new(base);

    let report = session.send_turn("Hi", None).await.unwrap();
    assert_eq!(report.state, TurnState::Errored);
    assert_eq!(
        session.banner().unwrap(),
        "Request failed (503 Service Unavailable): maintenance"
    );
}

#[tokio::test]
async fn unreachable_relay_errors_the_turn() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let session = ChatSession::new(format!("http://{addr}"));

    let report = session.send_turn("Hi", None).await.unwrap();
    assert_eq!(report.state, TurnState::Errored);
    assert!(session.banner().unwrap().starts_with("Request failed"));
    assert_eq!(session.transcript().len(), 1);
}

#[tokio::test]
async fn stalled_stream_times_out_with_partial_content() {
    let provider = ScriptedProvider::new(vec![Step::Delta("He"), Step::Stall]);
    let session = ChatSession::new(spawn_relay(provider).await)
        .with_stream_timeout(Duration::from_millis(300));

    let report = session.send_turn("Hi", None).await.unwrap();
    assert_eq!(report.state, TurnState::Errored);
    assert!(report.assistant_message_id.is_some());
    assert_eq!(session.transcript().last().unwrap().content, "He");
    assert!(session.banner().unwrap().contains("timed out"));
}

#[tokio::test]
async fn overlapping_turn_is_rejected() {
    let provider = ScriptedProvider::new(vec![Step::Stall]);
    let session = Arc::new(ChatSession::new(spawn_relay(provider).await));

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.send_turn("first", None).await }
    });
    while !session.state().is_active() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let second = session.send_turn("second", None).await;
    assert!(matches!(second, Err(TutorRelayError::TurnInProgress)));
    assert_eq!(session.transcript().len(), 1);

    first.abort();
    let _ = first.await;
    assert_eq!(session.state(), TurnState::Errored);

    let roles = session.fetch_roles().await.unwrap();
    assert_eq!(roles.len(), 6);
}
