use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use scriba_core::{
    ChatAction, InboundEvent, InlineKeyboard, MemberDirectory, OutputSink, RequestContext,
};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Consumer of converted chat events; the bot pushes every inbound message
/// and callback query through this seam.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_event(
        &self,
        event: InboundEvent,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Vec<ChatAction>>;
}

#[derive(Debug, Clone)]
pub struct TelegramBotConfig {
    pub token: String,
    pub polling_timeout_seconds: u64,
}

pub struct TelegramBot {
    client: Client,
    base_url: String,
    polling_timeout_seconds: u64,
}

impl TelegramBot {
    pub fn new(config: TelegramBotConfig) -> Result<Self> {
        if config.token.trim().is_empty() {
            return Err(anyhow!("telegram token cannot be empty"));
        }
        if config.polling_timeout_seconds == 0 {
            return Err(anyhow!("polling_timeout_seconds must be greater than zero"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.polling_timeout_seconds + 10))
            .build()
            .context("failed to build telegram HTTP client")?;

        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{}", config.token),
            polling_timeout_seconds: config.polling_timeout_seconds,
        })
    }

    /// Display-name resolver backed by getChatMember, sharing this bot's
    /// HTTP client.
    pub fn member_directory(&self) -> Arc<dyn MemberDirectory> {
        Arc::new(TelegramMemberDirectory {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        })
    }

    pub async fn run_until_shutdown(&self, handler: Arc<dyn UpdateHandler>) -> Result<()> {
        info!("telegram channel started");
        let mut offset: Option<i64> = None;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("telegram channel stopped");
                    break;
                }
                poll_result = self.poll_once(offset, handler.clone()) => {
                    match poll_result {
                        Ok(next_offset) => offset = Some(next_offset),
                        Err(err) => {
                            warn!("telegram poll error: {err:#}");
                            sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Fetches one batch of updates and hands each one off to its own task,
    /// so a slow handler (a long sandboxed execution) never holds up the
    /// poll loop or the other chats' commands.
    async fn poll_once(
        &self,
        current_offset: Option<i64>,
        handler: Arc<dyn UpdateHandler>,
    ) -> Result<i64> {
        let response = self.get_updates(current_offset).await?;
        let mut next_offset = current_offset.unwrap_or(0);

        for update in response.result {
            next_offset = next_offset.max(update.update_id + 1);

            let Some(event) = event_from_update(update) else {
                continue;
            };
            spawn_update_task(
                self.client.clone(),
                self.base_url.clone(),
                handler.clone(),
                event,
            );
        }

        Ok(next_offset)
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<GetUpdatesResponse> {
        let mut request = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("timeout", self.polling_timeout_seconds.to_string()),
                (
                    "allowed_updates",
                    r#"["message","callback_query"]"#.to_string(),
                ),
            ]);

        if let Some(offset) = offset {
            request = request.query(&[("offset", offset.to_string())]);
        }

        let response = request.send().await.context("telegram getUpdates failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(anyhow!("telegram getUpdates error ({status}): {body}"));
        }

        let payload = response
            .json::<GetUpdatesResponse>()
            .await
            .context("invalid telegram getUpdates payload")?;

        if !payload.ok {
            return Err(anyhow!("telegram getUpdates returned ok=false"));
        }

        Ok(payload)
    }
}

/// Output sink bound to one chat. Script output goes out as plain messages
/// while the execution is still running.
struct ChatSink {
    client: Client,
    base_url: String,
    chat_id: i64,
}

#[async_trait]
impl OutputSink for ChatSink {
    async fn emit(&self, text: &str) -> Result<()> {
        debug!(chat_id = self.chat_id, "emitting script output");
        send_message(
            &self.client,
            &self.base_url,
            self.chat_id,
            &truncate_for_telegram(text),
            None,
        )
        .await
    }
}

struct TelegramMemberDirectory {
    client: Client,
    base_url: String,
}

#[async_trait]
impl MemberDirectory for TelegramMemberDirectory {
    async fn resolve_display_name(&self, chat_id: i64, user_id: i64) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/getChatMember", self.base_url))
            .query(&[
                ("chat_id", chat_id.to_string()),
                ("user_id", user_id.to_string()),
            ])
            .send()
            .await
            .context("telegram getChatMember failed")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("telegram getChatMember error ({status})"));
        }

        let payload = response
            .json::<GetChatMemberResponse>()
            .await
            .context("invalid telegram getChatMember payload")?;
        if !payload.ok {
            return Err(anyhow!("telegram getChatMember returned ok=false"));
        }

        Ok(payload.result.user.first_name)
    }
}

/// Converts one raw update into a routable event. Updates without text or
/// callback data are skipped.
fn event_from_update(update: TelegramUpdate) -> Option<InboundEvent> {
    if let Some(message) = update.message {
        let text = message.text.filter(|t| !t.trim().is_empty())?;
        let from = message.from?;
        return Some(InboundEvent::Message {
            ctx: RequestContext {
                chat_id: message.chat.id,
                user_id: from.id,
                message_id: message.message_id,
            },
            text,
        });
    }

    if let Some(callback) = update.callback_query {
        let data = callback.data?;
        // The carried message is the one holding the keyboard; edits from
        // the handler target it.
        let message = callback.message?;
        return Some(InboundEvent::Callback {
            ctx: RequestContext {
                chat_id: message.chat.id,
                user_id: callback.from.id,
                message_id: message.message_id,
            },
            callback_id: callback.id,
            data,
        });
    }

    None
}

fn event_chat_id(event: &InboundEvent) -> i64 {
    match event {
        InboundEvent::Message { ctx, .. } | InboundEvent::Callback { ctx, .. } => ctx.chat_id,
    }
}

/// Runs one converted update through the handler on its own task: builds
/// the chat-bound sink, drives the handler, and delivers the resulting
/// actions.
fn spawn_update_task(
    client: Client,
    base_url: String,
    handler: Arc<dyn UpdateHandler>,
    event: InboundEvent,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let chat_id = event_chat_id(&event);
        let sink: Arc<dyn OutputSink> = Arc::new(ChatSink {
            client: client.clone(),
            base_url: base_url.clone(),
            chat_id,
        });

        match handler.handle_event(event, sink).await {
            Ok(actions) => {
                for action in actions {
                    if let Err(err) = execute_action(&client, &base_url, chat_id, &action).await {
                        warn!(chat_id, "failed to execute chat action: {err:#}");
                    }
                }
            }
            Err(err) => {
                warn!(chat_id, "failed to process telegram update: {err:#}");
                let _ = send_message(
                    &client,
                    &base_url,
                    chat_id,
                    "Request failed. Check server logs for details.",
                    None,
                )
                .await;
            }
        }
    })
}

async fn execute_action(
    client: &Client,
    base_url: &str,
    chat_id: i64,
    action: &ChatAction,
) -> Result<()> {
    match action {
        ChatAction::Reply { text, keyboard } => {
            send_message(
                client,
                base_url,
                chat_id,
                &truncate_for_telegram(text),
                keyboard.as_ref(),
            )
            .await
        }
        ChatAction::EditMessage {
            message_id,
            text,
            keyboard,
        } => {
            let payload = EditMessageRequest {
                chat_id,
                message_id: *message_id,
                text: &truncate_for_telegram(text),
                reply_markup: keyboard.as_ref().map(markup_from),
            };
            post_api(client, base_url, "editMessageText", &payload).await
        }
        ChatAction::AnswerCallback { callback_id, text } => {
            let payload = AnswerCallbackRequest {
                callback_query_id: callback_id,
                text: text.as_deref(),
            };
            post_api(client, base_url, "answerCallbackQuery", &payload).await
        }
    }
}

async fn send_message(
    client: &Client,
    base_url: &str,
    chat_id: i64,
    text: &str,
    keyboard: Option<&InlineKeyboard>,
) -> Result<()> {
    let payload = SendMessageRequest {
        chat_id,
        text,
        reply_markup: keyboard.map(markup_from),
    };
    post_api(client, base_url, "sendMessage", &payload).await
}

async fn post_api<T: Serialize>(
    client: &Client,
    base_url: &str,
    method: &str,
    payload: &T,
) -> Result<()> {
    let response = client
        .post(format!("{base_url}/{method}"))
        .json(payload)
        .send()
        .await
        .with_context(|| format!("telegram {method} failed"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unavailable>".to_string());
        return Err(anyhow!("telegram {method} error ({status}): {body}"));
    }

    Ok(())
}

fn markup_from(keyboard: &InlineKeyboard) -> ReplyMarkup {
    ReplyMarkup {
        inline_keyboard: keyboard
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|button| KeyboardButton {
                        text: button.label.clone(),
                        callback_data: button.data.clone(),
                    })
                    .collect()
            })
            .collect(),
    }
}

fn truncate_for_telegram(input: &str) -> String {
    const MAX_CHARS: usize = 3500;
    let count = input.chars().count();
    if count <= MAX_CHARS {
        return input.to_string();
    }

    let mut trimmed = input.chars().take(MAX_CHARS).collect::<String>();
    trimmed.push_str("\n\n[truncated]");
    trimmed
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetChatMemberResponse {
    ok: bool,
    result: ChatMember,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    user: TelegramUser,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<ReplyMarkup>,
}

#[derive(Debug, Serialize)]
struct EditMessageRequest<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<ReplyMarkup>,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackRequest<'a> {
    callback_query_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ReplyMarkup {
    inline_keyboard: Vec<Vec<KeyboardButton>>,
}

#[derive(Debug, Serialize)]
struct KeyboardButton {
    text: String,
    callback_data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriba_core::InlineButton;

    #[test]
    fn message_update_becomes_event() {
        let update = TelegramUpdate {
            update_id: 7,
            message: Some(TelegramMessage {
                message_id: 42,
                chat: TelegramChat { id: -100 },
                from: Some(TelegramUser {
                    id: 11,
                    first_name: "Alice".to_string(),
                }),
                text: Some("/scripts".to_string()),
            }),
            callback_query: None,
        };

        let Some(InboundEvent::Message { ctx, text }) = event_from_update(update) else {
            panic!("expected a message event");
        };
        assert_eq!(ctx.chat_id, -100);
        assert_eq!(ctx.user_id, 11);
        assert_eq!(ctx.message_id, 42);
        assert_eq!(text, "/scripts");
    }

    #[test]
    fn callback_update_carries_keyboard_message_id() {
        let update = TelegramUpdate {
            update_id: 8,
            message: None,
            callback_query: Some(TelegramCallbackQuery {
                id: "cb-1".to_string(),
                from: TelegramUser {
                    id: 22,
                    first_name: "Bob".to_string(),
                },
                message: Some(TelegramMessage {
                    message_id: 99,
                    chat: TelegramChat { id: -100 },
                    from: None,
                    text: Some("page one".to_string()),
                }),
                data: Some("scripts#2#22".to_string()),
            }),
        };

        let Some(InboundEvent::Callback { ctx, callback_id, data }) = event_from_update(update)
        else {
            panic!("expected a callback event");
        };
        assert_eq!(ctx.user_id, 22);
        assert_eq!(ctx.message_id, 99);
        assert_eq!(callback_id, "cb-1");
        assert_eq!(data, "scripts#2#22");
    }

    #[test]
    fn empty_updates_are_skipped() {
        let update = TelegramUpdate {
            update_id: 9,
            message: Some(TelegramMessage {
                message_id: 1,
                chat: TelegramChat { id: -100 },
                from: Some(TelegramUser {
                    id: 11,
                    first_name: "Alice".to_string(),
                }),
                text: Some("   ".to_string()),
            }),
            callback_query: None,
        };
        assert!(event_from_update(update).is_none());
    }

    #[test]
    fn keyboard_serializes_to_inline_markup() {
        let keyboard = InlineKeyboard {
            rows: vec![vec![
                InlineButton {
                    label: "Yes".to_string(),
                    data: "yes".to_string(),
                },
                InlineButton {
                    label: "No".to_string(),
                    data: "no".to_string(),
                },
            ]],
        };

        let value = serde_json::to_value(markup_from(&keyboard)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "inline_keyboard": [[
                    {"text": "Yes", "callback_data": "yes"},
                    {"text": "No", "callback_data": "no"},
                ]]
            })
        );
    }

    #[tokio::test]
    async fn slow_handlers_do_not_serialize_updates() {
        struct SlowHandler;

        #[async_trait]
        impl UpdateHandler for SlowHandler {
            async fn handle_event(
                &self,
                _event: InboundEvent,
                _sink: Arc<dyn OutputSink>,
            ) -> Result<Vec<ChatAction>> {
                sleep(Duration::from_millis(200)).await;
                Ok(Vec::new())
            }
        }

        let handler: Arc<dyn UpdateHandler> = Arc::new(SlowHandler);
        let client = Client::new();
        let started = std::time::Instant::now();

        let tasks: Vec<_> = (0..3)
            .map(|i| {
                spawn_update_task(
                    client.clone(),
                    "http://localhost/bot".to_string(),
                    handler.clone(),
                    InboundEvent::Message {
                        ctx: RequestContext {
                            chat_id: -100,
                            user_id: i,
                            message_id: i,
                        },
                        text: "/scripts".to_string(),
                    },
                )
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // Three 200 ms handlers overlap instead of running back to back.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn truncate_for_telegram_limits_length() {
        let source = "a".repeat(4000);
        let output = truncate_for_telegram(&source);
        assert!(output.chars().count() < 3600);
        assert!(output.contains("[truncated]"));
        assert_eq!(truncate_for_telegram("short"), "short");
    }
}
