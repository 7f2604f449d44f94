#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream};
use futures::StreamExt;

use tutor_relay::daemon::{build_router, AppState};
use tutor_relay::domains::roles::{RolePromptTable, UnknownRolePolicy};
use tutor_relay::error::{Result, TutorRelayError};
use tutor_relay::interfaces::providers::{ChatDelta, ChatProvider, UpstreamMessage};
use tutor_relay::services::RelayService;

/// Upstream stand-in that replays a fixed script for every call.
pub struct ScriptedProvider {
    script: Vec<Step>,
    pub seen: Mutex<Vec<Vec<UpstreamMessage>>>,
}

#[derive(Clone)]
pub enum Step {
    Delta(&'static str),
    Fail(&'static str),
    Stall,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn last_request(&self) -> Vec<UpstreamMessage> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn chat_stream(&self, messages: Vec<UpstreamMessage>) -> BoxStream<'static, Result<ChatDelta>> {
        self.seen.lock().unwrap().push(messages);
        let script = self.script.clone();
        Box::pin(
            stream::iter(script)
                .then(|step| async move {
                    match step {
                        Step::Delta(text) => Some(Ok(ChatDelta::text(text))),
                        Step::Fail(message) => {
                            Some(Err(TutorRelayError::Upstream(message.to_string())))
                        }
                        Step::Stall => {
                            futures::future::pending::<()>().await;
                            None
                        }
                    }
                })
                .take_while(|item| futures::future::ready(item.is_some()))
                .filter_map(futures::future::ready),
        )
    }
}

pub fn relay(provider: Arc<ScriptedProvider>, policy: UnknownRolePolicy) -> RelayService {
    RelayService::new(provider, Arc::new(RolePromptTable::default()))
        .with_unknown_role_policy(policy)
}

pub fn router(provider: Arc<ScriptedProvider>) -> axum::Router {
    build_router(AppState::new(relay(provider, UnknownRolePolicy::Reject)))
}

/// Serves the relay on an ephemeral loopback port and returns its base URL.
pub async fn spawn_relay(provider: Arc<ScriptedProvider>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(provider);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
