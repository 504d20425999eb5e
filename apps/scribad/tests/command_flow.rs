use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scriba_core::{
    ChatAction, ExecutionEnv, InboundEvent, MemberDirectory, OutputSink, RequestContext,
    SandboxExecutor, ScriptService, ServiceConfig,
};
use scriba_storage::SqliteStore;
use uuid::Uuid;

const CHAT: i64 = -100_500;
const AUTHOR: i64 = 7;

struct EchoExecutor;

#[async_trait]
impl SandboxExecutor for EchoExecutor {
    fn builtin_whitelist(&self) -> Vec<String> {
        vec!["math".to_string()]
    }

    async fn execute(
        &self,
        code: &str,
        _env: ExecutionEnv,
        sink: Arc<dyn OutputSink>,
    ) -> Result<()> {
        // Echoes the payload of each print("...") line, which is all the
        // flow below needs from a runtime.
        for line in code.lines() {
            if let Some(inner) = line
                .trim()
                .strip_prefix("print(\"")
                .and_then(|rest| rest.strip_suffix("\")"))
            {
                sink.emit(inner).await?;
            }
        }
        Ok(())
    }
}

struct CollectingSink {
    emitted: Mutex<Vec<String>>,
}

#[async_trait]
impl OutputSink for CollectingSink {
    async fn emit(&self, text: &str) -> Result<()> {
        self.emitted.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

struct StaticDirectory;

#[async_trait]
impl MemberDirectory for StaticDirectory {
    async fn resolve_display_name(&self, _chat_id: i64, user_id: i64) -> Result<String> {
        Ok(format!("member-{user_id}"))
    }
}

async fn build_service() -> ScriptService {
    let db_path = format!("/tmp/scribad-flow-test-{}.db", Uuid::new_v4());
    let store = SqliteStore::connect(&db_path).await.unwrap();
    ScriptService::new(
        Arc::new(store),
        Arc::new(EchoExecutor),
        Arc::new(StaticDirectory),
        ServiceConfig {
            authorized_chat_id: CHAT,
            session_ttl: Duration::from_secs(1800),
        },
    )
}

fn ctx() -> RequestContext {
    RequestContext {
        chat_id: CHAT,
        user_id: AUTHOR,
        message_id: 1,
    }
}

fn first_text(actions: &[ChatAction]) -> &str {
    actions
        .iter()
        .find_map(|a| match a {
            ChatAction::Reply { text, .. } | ChatAction::EditMessage { text, .. } => {
                Some(text.as_str())
            }
            ChatAction::AnswerCallback { .. } => None,
        })
        .expect("no textual action")
}

async fn send(
    service: &ScriptService,
    sink: &Arc<CollectingSink>,
    text: &str,
) -> Vec<ChatAction> {
    let sink: Arc<dyn OutputSink> = sink.clone();
    service
        .handle_event(
            InboundEvent::Message {
                ctx: ctx(),
                text: text.to_string(),
            },
            sink,
        )
        .await
        .unwrap()
}

async fn press(
    service: &ScriptService,
    sink: &Arc<CollectingSink>,
    data: &str,
) -> Vec<ChatAction> {
    let sink: Arc<dyn OutputSink> = sink.clone();
    service
        .handle_event(
            InboundEvent::Callback {
                ctx: ctx(),
                callback_id: "cb".to_string(),
                data: data.to_string(),
            },
            sink,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn full_save_load_and_list_flow_against_sqlite() {
    let service = build_service().await;
    let sink = Arc::new(CollectingSink {
        emitted: Mutex::new(Vec::new()),
    });

    // Creation workflow end to end, skipping the test step.
    let actions = send(&service, &sink, "/save weather").await;
    assert!(first_text(&actions).starts_with("Great!"));
    let actions = send(&service, &sink, "shows the current temperature").await;
    assert!(first_text(&actions).starts_with("Excellent!"));
    let actions = send(&service, &sink, "print(\"sunny, 21 degrees\")").await;
    assert!(first_text(&actions).starts_with("Almost done."));
    let actions = press(&service, &sink, "no").await;
    assert!(first_text(&actions).starts_with("✅ Script saved as weather"));

    // The saved script runs and its output reaches the sink, no reply.
    let actions = send(&service, &sink, "/load weather").await;
    assert!(actions.is_empty());
    assert_eq!(
        sink.emitted.lock().unwrap().clone(),
        vec!["sunny, 21 degrees"]
    );

    // A second script with the same name is refused at the door.
    let actions = send(&service, &sink, "/save weather").await;
    assert_eq!(
        first_text(&actions),
        "❌ A script with that name already exists"
    );

    // The listing shows the entry with the resolved author name.
    let actions = send(&service, &sink, "/scripts").await;
    assert_eq!(
        first_text(&actions),
        "1. weather - shows the current temperature. Author - member-7"
    );
}
