use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub author_id: i64,
    pub code: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewScript {
    pub name: String,
    pub author_id: i64,
    pub code: String,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a script named '{0}' already exists")]
    DuplicateName(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// User-facing rejection kinds. The display text is the exact message sent
/// back to the chat, prefixed with the failure indicator at the reply
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),
    #[error("No script exists with that name")]
    NotFound,
    #[error("{0}")]
    NotAuthorized(String),
    #[error("A script with that name already exists")]
    DuplicateName,
    #[error("{0}")]
    Malformed(String),
}

#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Option<Script>, StoreError>;
    /// Full catalog in creation order; used as the display order.
    async fn list_all(&self) -> Result<Vec<Script>, StoreError>;
    async fn create(&self, script: NewScript) -> Result<Script, StoreError>;
    async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError>;
    async fn change_description(&self, name: &str, description: &str) -> Result<(), StoreError>;
    /// Returns false when no script carried that name.
    async fn delete_by_name(&self, name: &str) -> Result<bool, StoreError>;
}

/// Capability handed to executed code for emitting text back into the
/// originating chat. The only side-effect channel scripts have.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn emit(&self, text: &str) -> Result<()>;
}

/// Restricted environment for one execution: the executor's fixed builtin
/// allow-list plus a locals map holding only the request-context handle.
#[derive(Debug, Clone)]
pub struct ExecutionEnv {
    pub builtins: Vec<String>,
    pub locals: serde_json::Value,
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// The fixed allow-list of safe builtin names this executor exposes.
    /// Consumed as given, never assembled per call.
    fn builtin_whitelist(&self) -> Vec<String>;
    /// Runs untrusted code. The print capability is bound to `sink` inside
    /// the executor; nothing besides `env` crosses the boundary.
    async fn execute(&self, code: &str, env: ExecutionEnv, sink: Arc<dyn OutputSink>)
        -> Result<()>;
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn resolve_display_name(&self, chat_id: i64, user_id: i64) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub chat_id: i64,
    pub user_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message {
        ctx: RequestContext,
        text: String,
    },
    Callback {
        ctx: RequestContext,
        callback_id: String,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    Reply {
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
    EditMessage {
        message_id: i64,
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
    AnswerCallback {
        callback_id: String,
        text: Option<String>,
    },
}

impl ChatAction {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply {
            text: text.into(),
            keyboard: None,
        }
    }

    fn edit(message_id: i64, text: impl Into<String>, keyboard: Option<InlineKeyboard>) -> Self {
        Self::EditMessage {
            message_id,
            text: text.into(),
            keyboard,
        }
    }

    fn ack(callback_id: &str) -> Self {
        Self::AnswerCallback {
            callback_id: callback_id.to_string(),
            text: None,
        }
    }

    fn ack_with_text(callback_id: &str, text: impl Into<String>) -> Self {
        Self::AnswerCallback {
            callback_id: callback_id.to_string(),
            text: Some(text.into()),
        }
    }
}

fn reject(err: &CommandError) -> ChatAction {
    ChatAction::reply(format!("❌ {err}"))
}

#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    authorized_chat_id: i64,
}

impl AuthorizationGate {
    pub fn new(authorized_chat_id: i64) -> Self {
        Self { authorized_chat_id }
    }

    pub fn is_whitelisted_chat(&self, chat_id: i64) -> bool {
        chat_id == self.authorized_chat_id
    }

    pub fn is_author(&self, script: &Script, actor_id: i64) -> bool {
        script.author_id == actor_id
    }
}

fn is_valid_script_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=30).contains(&len)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn validate_script_name(name: &str) -> Result<(), CommandError> {
    if !is_valid_script_name(name) {
        return Err(CommandError::Validation(
            "You cannot create a script with that name".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_save_name_length(name: &str) -> Result<(), CommandError> {
    let len = name.chars().count();
    if !(2..=40).contains(&len) {
        return Err(CommandError::Validation(
            "The script name must be between 2 and 40 characters".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> Result<(), CommandError> {
    let len = description.chars().count();
    if !(2..=300).contains(&len) {
        return Err(CommandError::Validation(
            "The description must not be empty and must be at most 300 characters".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_code(code: &str) -> Result<(), CommandError> {
    let len = code.chars().count();
    if len > 2000 {
        return Err(CommandError::Validation(
            "A script may not exceed 2000 characters".to_string(),
        ));
    }
    if len < 7 {
        return Err(CommandError::Validation(
            "You are trying to save an empty script".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exec { code: String },
    Load { rest: String },
    Save { rest: String },
    Rename { rest: String },
    ChangeDesc { rest: String },
    Delete { rest: String },
    Scripts,
    Cancel,
    Test { rest: String },
    About,
}

/// Parses a `/command` message. Keywords are case-sensitive; an optional
/// `@botname` suffix on the keyword is tolerated. Returns None for plain
/// text and unknown commands.
pub fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    let keyword = head.trim_start_matches('/');
    let keyword = keyword.split('@').next().unwrap_or(keyword);

    match keyword {
        "exec" => Some(Command::Exec {
            code: rest.to_string(),
        }),
        "load" => Some(Command::Load {
            rest: rest.to_string(),
        }),
        "save" => Some(Command::Save {
            rest: rest.to_string(),
        }),
        "rename" => Some(Command::Rename {
            rest: rest.to_string(),
        }),
        "changedesc" => Some(Command::ChangeDesc {
            rest: rest.to_string(),
        }),
        "delete" => Some(Command::Delete {
            rest: rest.to_string(),
        }),
        "scripts" => Some(Command::Scripts),
        "cancel" => Some(Command::Cancel),
        "test" => Some(Command::Test {
            rest: rest.to_string(),
        }),
        "about_scripts" => Some(Command::About),
        _ => None,
    }
}

/// Variable name the bound arguments are injected under, visible to the
/// executed code.
pub const BOUND_ARGS_VARIABLE: &str = "args";

// Literal substitutions, not patterns. Known internal error strings of the
// restricted runtime are masked before the text reaches the chat.
const ERROR_SUBSTITUTIONS: &[(&str, &str)] = &[(
    "'NoneType' object is not subscriptable",
    "Operation forbidden!",
)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
}

/// Prepends the argument binding to the user code. JSON serialization keeps
/// the values inside the literal no matter what they contain.
pub fn bind_arguments(code: &str, bound_args: &[String]) -> Result<String> {
    if bound_args.is_empty() {
        return Ok(code.to_string());
    }
    let literal =
        serde_json::to_string(bound_args).context("failed to serialize bound arguments")?;
    Ok(format!("{BOUND_ARGS_VARIABLE} = {literal}\n{code}"))
}

pub fn sanitize_error_text(raw: &str) -> String {
    ERROR_SUBSTITUTIONS
        .iter()
        .fold(raw.to_string(), |acc, (needle, replacement)| {
            acc.replace(needle, replacement)
        })
}

fn request_locals(ctx: RequestContext) -> serde_json::Value {
    json!({
        "request": {
            "chat_id": ctx.chat_id,
            "user_id": ctx.user_id,
            "message_id": ctx.message_id,
        }
    })
}

pub struct ExecutionDispatcher {
    executor: Arc<dyn SandboxExecutor>,
}

impl ExecutionDispatcher {
    pub fn new(executor: Arc<dyn SandboxExecutor>) -> Self {
        Self { executor }
    }

    pub fn builtin_names(&self) -> Vec<String> {
        self.executor.builtin_whitelist()
    }

    /// Runs `code` with `bound_args` injected. Output reaches the chat only
    /// through `sink` while the code runs; a failure is caught here and
    /// returned as sanitized text, never propagated.
    pub async fn dispatch(
        &self,
        code: &str,
        bound_args: &[String],
        ctx: RequestContext,
        sink: Arc<dyn OutputSink>,
    ) -> ExecutionOutcome {
        let code = match bind_arguments(code, bound_args) {
            Ok(code) => code,
            Err(err) => return ExecutionOutcome::Failed(format!("{err:#}")),
        };

        let env = ExecutionEnv {
            builtins: self.executor.builtin_whitelist(),
            locals: request_locals(ctx),
        };

        match self.executor.execute(&code, env, sink).await {
            Ok(()) => ExecutionOutcome::Completed,
            Err(err) => {
                warn!(
                    user_id = ctx.user_id,
                    chat_id = ctx.chat_id,
                    error = %err,
                    "sandboxed execution failed"
                );
                ExecutionOutcome::Failed(sanitize_error_text(&format!("{err:#}")))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SelectDesc,
    SelectCode,
    TestCode,
    TestCodeWaitingCommand,
}

#[derive(Debug, Clone)]
pub struct ScriptDraft {
    pub name: String,
    pub description: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug)]
struct ConversationSession {
    chat_id: i64,
    draft: ScriptDraft,
    state: SessionState,
    last_activity: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLookup {
    Active(SessionState),
    Expired,
    None,
}

/// Explicit keyed store for per-user creation sessions. Each session is
/// bound to the chat it started in; inputs from any other chat never match
/// it. Entries older than the TTL are dropped on next access and reported
/// once as Expired.
pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<i64, ConversationSession>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a session for `user_id` in `chat_id`. Returns false if a live
    /// session is already open; an expired leftover is replaced silently.
    pub fn begin(&self, user_id: i64, chat_id: i64, name: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        if let Some(existing) = sessions.get(&user_id) {
            if existing.last_activity.elapsed() < self.ttl {
                return false;
            }
        }
        sessions.insert(
            user_id,
            ConversationSession {
                chat_id,
                draft: ScriptDraft {
                    name: name.to_string(),
                    description: None,
                    code: None,
                },
                state: SessionState::SelectDesc,
                last_activity: Instant::now(),
            },
        );
        true
    }

    pub fn lookup(&self, user_id: i64, chat_id: i64) -> SessionLookup {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        match sessions.get(&user_id) {
            Some(session) if session.chat_id != chat_id => SessionLookup::None,
            Some(session) if session.last_activity.elapsed() < self.ttl => {
                SessionLookup::Active(session.state)
            }
            Some(_) => {
                sessions.remove(&user_id);
                SessionLookup::Expired
            }
            None => SessionLookup::None,
        }
    }

    /// Mutates the live session for `user_id` and refreshes its activity
    /// timestamp. Returns None if no live session exists in `chat_id`.
    pub fn update<R>(
        &self,
        user_id: i64,
        chat_id: i64,
        f: impl FnOnce(&mut ScriptDraft, &mut SessionState) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        let session = sessions.get_mut(&user_id)?;
        if session.chat_id != chat_id {
            return None;
        }
        if session.last_activity.elapsed() >= self.ttl {
            sessions.remove(&user_id);
            return None;
        }
        let result = f(&mut session.draft, &mut session.state);
        session.last_activity = Instant::now();
        Some(result)
    }

    pub fn snapshot(&self, user_id: i64, chat_id: i64) -> Option<ScriptDraft> {
        let sessions = self.sessions.lock().expect("session store poisoned");
        sessions
            .get(&user_id)
            .filter(|s| s.chat_id == chat_id && s.last_activity.elapsed() < self.ttl)
            .map(|s| s.draft.clone())
    }

    pub fn end(&self, user_id: i64, chat_id: i64) -> bool {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        match sessions.get(&user_id) {
            Some(session) if session.chat_id == chat_id => {
                sessions.remove(&user_id);
                true
            }
            _ => false,
        }
    }
}

pub const PAGE_SIZE: usize = 10;
pub const LISTING_TAG: &str = "scripts";

#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub description: String,
    pub author_name: String,
}

/// Partitions the catalog into pages of [`PAGE_SIZE`] entries, numbered
/// globally from 1.
pub fn build_pages(entries: &[ListingEntry]) -> Vec<String> {
    entries
        .chunks(PAGE_SIZE)
        .enumerate()
        .map(|(page_index, chunk)| {
            chunk
                .iter()
                .enumerate()
                .map(|(offset, entry)| {
                    format!(
                        "{}. {} - {}. Author - {}",
                        page_index * PAGE_SIZE + offset + 1,
                        entry.name,
                        entry.description,
                        entry.author_name
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .collect()
}

pub fn page_callback_data(page: usize, user_id: i64) -> String {
    format!("{LISTING_TAG}#{page}#{user_id}")
}

pub fn parse_page_callback(data: &str) -> Option<(usize, i64)> {
    let mut parts = data.split('#');
    if parts.next()? != LISTING_TAG {
        return None;
    }
    let page = parts.next()?.parse().ok()?;
    let user_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((page, user_id))
}

/// Page-navigation keyboard bound to the requesting user. None when a
/// single page holds everything.
pub fn page_keyboard(
    total_pages: usize,
    current_page: usize,
    user_id: i64,
) -> Option<InlineKeyboard> {
    if total_pages <= 1 {
        return None;
    }
    let row = (1..=total_pages)
        .map(|page| InlineButton {
            label: if page == current_page {
                format!("· {page} ·")
            } else {
                page.to_string()
            },
            data: page_callback_data(page, user_id),
        })
        .collect();
    Some(InlineKeyboard { rows: vec![row] })
}

const CALLBACK_YES: &str = "yes";
const CALLBACK_NO: &str = "no";
const CALLBACK_SAVE: &str = "save";
const CALLBACK_EDIT: &str = "edit";

fn yes_no_keyboard() -> InlineKeyboard {
    InlineKeyboard {
        rows: vec![vec![
            InlineButton {
                label: "Yes".to_string(),
                data: CALLBACK_YES.to_string(),
            },
            InlineButton {
                label: "No".to_string(),
                data: CALLBACK_NO.to_string(),
            },
        ]],
    }
}

fn save_edit_keyboard() -> InlineKeyboard {
    InlineKeyboard {
        rows: vec![vec![
            InlineButton {
                label: "Save".to_string(),
                data: CALLBACK_SAVE.to_string(),
            },
            InlineButton {
                label: "Edit".to_string(),
                data: CALLBACK_EDIT.to_string(),
            },
        ]],
    }
}

const PROMPT_SEND_CODE: &str = "Excellent! Now send the code of your script. \
    Use 4 spaces for indentation. \
    To avoid Markdown formatting, send your code as monospace.";

const PROMPT_EXPIRED: &str =
    "❌ Your script draft expired due to inactivity. Start again with /save <name>.";

fn saved_text(name: &str) -> String {
    format!(
        "✅ Script saved as {name}. Use /load {name} to run it.\n\n\
         If your script takes parameters, pass them right after the name."
    )
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub authorized_chat_id: i64,
    pub session_ttl: Duration,
}

/// Routes inbound chat events to the lifecycle operations. One instance is
/// shared across all concurrently handled updates.
pub struct ScriptService {
    store: Arc<dyn ScriptStore>,
    dispatcher: ExecutionDispatcher,
    gate: AuthorizationGate,
    sessions: SessionStore,
    directory: Arc<dyn MemberDirectory>,
}

impl ScriptService {
    pub fn new(
        store: Arc<dyn ScriptStore>,
        executor: Arc<dyn SandboxExecutor>,
        directory: Arc<dyn MemberDirectory>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            dispatcher: ExecutionDispatcher::new(executor),
            gate: AuthorizationGate::new(config.authorized_chat_id),
            sessions: SessionStore::new(config.session_ttl),
            directory,
        }
    }

    /// Single entry point for the transport. `sink` emits into the chat the
    /// event came from, live, while untrusted code runs.
    pub async fn handle_event(
        &self,
        event: InboundEvent,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Vec<ChatAction>> {
        match event {
            InboundEvent::Message { ctx, text } => {
                if let Some(command) = parse_command(&text) {
                    self.handle_command(ctx, command, sink).await
                } else {
                    self.handle_session_text(ctx, &text)
                }
            }
            InboundEvent::Callback {
                ctx,
                callback_id,
                data,
            } => self.handle_callback(ctx, &callback_id, &data).await,
        }
    }

    async fn handle_command(
        &self,
        ctx: RequestContext,
        command: Command,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Vec<ChatAction>> {
        let requires_whitelist = matches!(
            command,
            Command::Exec { .. }
                | Command::Load { .. }
                | Command::Save { .. }
                | Command::Rename { .. }
                | Command::ChangeDesc { .. }
                | Command::Delete { .. }
        );
        if requires_whitelist && !self.gate.is_whitelisted_chat(ctx.chat_id) {
            debug!(
                chat_id = ctx.chat_id,
                user_id = ctx.user_id,
                "ignoring command from non-whitelisted chat"
            );
            return Ok(Vec::new());
        }

        match command {
            Command::Exec { code } => self.exec_snippet(ctx, &code, sink).await,
            Command::Load { rest } => self.load_script(ctx, &rest, sink).await,
            Command::Save { rest } => self.start_save(ctx, &rest).await,
            Command::Rename { rest } => self.rename_script(ctx, &rest).await,
            Command::ChangeDesc { rest } => self.change_description(ctx, &rest).await,
            Command::Delete { rest } => self.delete_script(ctx, &rest).await,
            Command::Scripts => self.list_scripts(ctx).await,
            Command::Cancel => Ok(self.cancel_session(ctx)),
            Command::Test { rest } => self.test_draft(ctx, &rest, sink).await,
            Command::About => Ok(vec![ChatAction::reply(self.about_text())]),
        }
    }

    async fn exec_snippet(
        &self,
        ctx: RequestContext,
        code: &str,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Vec<ChatAction>> {
        info!(
            user_id = ctx.user_id,
            code_len = code.chars().count(),
            "executing ad-hoc snippet"
        );
        match self.dispatcher.dispatch(code, &[], ctx, sink).await {
            ExecutionOutcome::Completed => Ok(Vec::new()),
            ExecutionOutcome::Failed(text) => Ok(vec![ChatAction::reply(format!("❌ {text}"))]),
        }
    }

    async fn load_script(
        &self,
        ctx: RequestContext,
        rest: &str,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Vec<ChatAction>> {
        let tokens = match shell_words::split(rest) {
            Ok(tokens) => tokens,
            Err(_) => {
                return Ok(vec![reject(&CommandError::Malformed(
                    "Could not parse the arguments".to_string(),
                ))])
            }
        };
        let Some((name, args)) = tokens.split_first() else {
            return Ok(vec![reject(&CommandError::Malformed(
                "You must provide a script name. Example: /load my_script".to_string(),
            ))]);
        };

        let Some(script) = self.store.get_by_name(name).await? else {
            return Ok(vec![reject(&CommandError::NotFound)]);
        };

        info!(
            user_id = ctx.user_id,
            name = %script.name,
            arg_count = args.len(),
            "loading stored script"
        );
        match self.dispatcher.dispatch(&script.code, args, ctx, sink).await {
            ExecutionOutcome::Completed => Ok(Vec::new()),
            ExecutionOutcome::Failed(text) => Ok(vec![ChatAction::reply(format!("❌ {text}"))]),
        }
    }

    async fn start_save(&self, ctx: RequestContext, rest: &str) -> Result<Vec<ChatAction>> {
        let Some(name) = rest.split_whitespace().next() else {
            return Ok(vec![reject(&CommandError::Malformed(
                "You must provide a name for your script. Example: /save my_new_script"
                    .to_string(),
            ))]);
        };

        if let Err(err) = validate_script_name(name) {
            return Ok(vec![reject(&err)]);
        }
        if let Err(err) = validate_save_name_length(name) {
            return Ok(vec![reject(&err)]);
        }
        if self.store.get_by_name(name).await?.is_some() {
            return Ok(vec![reject(&CommandError::DuplicateName)]);
        }

        if !self.sessions.begin(ctx.user_id, ctx.chat_id, name) {
            return Ok(vec![reject(&CommandError::Validation(
                "You already have a script draft in progress. Finish it or send /cancel first."
                    .to_string(),
            ))]);
        }

        debug!(user_id = ctx.user_id, name, "creation session started");
        Ok(vec![ChatAction::reply(
            "Great! Now give your script a description. \
             It will be shown in the script list (/scripts). \
             Include usage examples if they matter.\n\n\
             Send /cancel to abort script creation.",
        )])
    }

    async fn rename_script(&self, ctx: RequestContext, rest: &str) -> Result<Vec<ChatAction>> {
        let mut tokens = rest.split_whitespace();
        let (Some(old_name), Some(new_name)) = (tokens.next(), tokens.next()) else {
            return Ok(vec![reject(&CommandError::Malformed(
                "Usage: /rename <old_name> <new_name>".to_string(),
            ))]);
        };

        let Some(script) = self.store.get_by_name(old_name).await? else {
            return Ok(vec![reject(&CommandError::NotFound)]);
        };
        if !self.gate.is_author(&script, ctx.user_id) {
            return Ok(vec![reject(&CommandError::NotAuthorized(
                "Only the author may rename a script".to_string(),
            ))]);
        }
        if !is_valid_script_name(new_name) {
            return Ok(vec![reject(&CommandError::Validation(
                "You cannot rename the script to that name".to_string(),
            ))]);
        }

        match self.store.rename(old_name, new_name).await {
            Ok(()) => {
                info!(user_id = ctx.user_id, old_name, new_name, "script renamed");
                Ok(vec![ChatAction::reply(format!(
                    "✅ Script {old_name} renamed to {new_name}"
                ))])
            }
            Err(StoreError::DuplicateName(_)) => Ok(vec![reject(&CommandError::DuplicateName)]),
            Err(StoreError::Other(err)) => Err(err),
        }
    }

    async fn change_description(&self, ctx: RequestContext, rest: &str) -> Result<Vec<ChatAction>> {
        let name = rest.split_whitespace().next();
        let description = rest.split_once('\n').map(|(_, tail)| tail.trim());
        let (Some(name), Some(description)) = (name, description) else {
            return Ok(vec![reject(&CommandError::Malformed(
                "Usage: /changedesc <name> with the new description on the next line".to_string(),
            ))]);
        };

        let Some(script) = self.store.get_by_name(name).await? else {
            return Ok(vec![reject(&CommandError::NotFound)]);
        };
        if !self.gate.is_author(&script, ctx.user_id) {
            return Ok(vec![reject(&CommandError::NotAuthorized(
                "Only the author may change a script's description".to_string(),
            ))]);
        }
        if let Err(err) = validate_description(description) {
            return Ok(vec![reject(&err)]);
        }

        match self.store.change_description(name, description).await {
            Ok(()) => {
                info!(user_id = ctx.user_id, name, "script description updated");
                Ok(vec![ChatAction::reply(format!(
                    "✅ Description of {name} updated"
                ))])
            }
            Err(StoreError::DuplicateName(other)) => Err(anyhow!(
                "unexpected duplicate on description change: {other}"
            )),
            Err(StoreError::Other(err)) => Err(err),
        }
    }

    async fn delete_script(&self, ctx: RequestContext, rest: &str) -> Result<Vec<ChatAction>> {
        let Some(name) = rest.split_whitespace().next() else {
            return Ok(vec![reject(&CommandError::Malformed(
                "Usage: /delete <name>".to_string(),
            ))]);
        };

        let Some(script) = self.store.get_by_name(name).await? else {
            return Ok(vec![reject(&CommandError::NotFound)]);
        };
        if !self.gate.is_author(&script, ctx.user_id) {
            return Ok(vec![reject(&CommandError::NotAuthorized(
                "Only the author may delete a script".to_string(),
            ))]);
        }

        if !self.store.delete_by_name(name).await? {
            return Ok(vec![reject(&CommandError::NotFound)]);
        }
        info!(user_id = ctx.user_id, name, "script deleted");
        Ok(vec![ChatAction::reply(format!("✅ Script {name} deleted"))])
    }

    async fn list_scripts(&self, ctx: RequestContext) -> Result<Vec<ChatAction>> {
        let scripts = self.store.list_all().await?;
        if scripts.is_empty() {
            return Ok(vec![ChatAction::reply("❌ There are no scripts yet.")]);
        }

        let entries = self.resolve_entries(ctx.chat_id, &scripts).await;
        let pages = build_pages(&entries);
        let keyboard = page_keyboard(pages.len(), 1, ctx.user_id);
        Ok(vec![ChatAction::Reply {
            text: pages[0].clone(),
            keyboard,
        }])
    }

    /// The catalog and author names are recomputed on every navigation; the
    /// displayed listing may shift under concurrent mutation, which is
    /// accepted.
    async fn resolve_entries(&self, chat_id: i64, scripts: &[Script]) -> Vec<ListingEntry> {
        let mut names: HashMap<i64, String> = HashMap::new();
        let mut entries = Vec::with_capacity(scripts.len());
        for script in scripts {
            let author_name = match names.get(&script.author_id) {
                Some(name) => name.clone(),
                None => {
                    let resolved = match self
                        .directory
                        .resolve_display_name(chat_id, script.author_id)
                        .await
                    {
                        Ok(name) => name,
                        Err(err) => {
                            warn!(
                                author_id = script.author_id,
                                error = %err,
                                "failed to resolve author display name"
                            );
                            "unknown".to_string()
                        }
                    };
                    names.insert(script.author_id, resolved.clone());
                    resolved
                }
            };
            entries.push(ListingEntry {
                name: script.name.clone(),
                description: script.description.clone(),
                author_name,
            });
        }
        entries
    }

    fn cancel_session(&self, ctx: RequestContext) -> Vec<ChatAction> {
        if self.sessions.end(ctx.user_id, ctx.chat_id) {
            debug!(user_id = ctx.user_id, "creation session cancelled");
            vec![ChatAction::reply("You cancelled script creation.")]
        } else {
            Vec::new()
        }
    }

    async fn test_draft(
        &self,
        ctx: RequestContext,
        rest: &str,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Vec<ChatAction>> {
        match self.sessions.lookup(ctx.user_id, ctx.chat_id) {
            SessionLookup::Active(SessionState::TestCodeWaitingCommand) => {}
            SessionLookup::Expired => return Ok(vec![ChatAction::reply(PROMPT_EXPIRED)]),
            _ => return Ok(Vec::new()),
        }

        let Some(code) = self
            .sessions
            .snapshot(ctx.user_id, ctx.chat_id)
            .and_then(|d| d.code)
        else {
            return Ok(Vec::new());
        };
        let args = match shell_words::split(rest) {
            Ok(args) => args,
            Err(_) => {
                return Ok(vec![reject(&CommandError::Malformed(
                    "Could not parse the test arguments".to_string(),
                ))])
            }
        };

        let mut actions = Vec::new();
        if let ExecutionOutcome::Failed(text) =
            self.dispatcher.dispatch(&code, &args, ctx, sink).await
        {
            actions.push(ChatAction::reply(format!("❌ {text}")));
        }
        actions.push(ChatAction::Reply {
            text: "Do you want to save the script or continue editing it?".to_string(),
            keyboard: Some(save_edit_keyboard()),
        });
        self.sessions.update(ctx.user_id, ctx.chat_id, |_, _| {});
        Ok(actions)
    }

    fn handle_session_text(&self, ctx: RequestContext, text: &str) -> Result<Vec<ChatAction>> {
        // Command-shaped text never lands in a draft; an unknown /command is
        // ignored rather than captured as a description or code.
        if text.trim_start().starts_with('/') {
            return Ok(Vec::new());
        }

        match self.sessions.lookup(ctx.user_id, ctx.chat_id) {
            SessionLookup::None => Ok(Vec::new()),
            SessionLookup::Expired => Ok(vec![ChatAction::reply(PROMPT_EXPIRED)]),
            SessionLookup::Active(SessionState::SelectDesc) => {
                if let Err(err) = validate_description(text) {
                    return Ok(vec![reject(&err)]);
                }
                self.sessions.update(ctx.user_id, ctx.chat_id, |draft, state| {
                    draft.description = Some(text.to_string());
                    *state = SessionState::SelectCode;
                });
                Ok(vec![ChatAction::reply(PROMPT_SEND_CODE)])
            }
            SessionLookup::Active(SessionState::SelectCode) => {
                if let Err(err) = validate_code(text) {
                    return Ok(vec![reject(&err)]);
                }
                self.sessions.update(ctx.user_id, ctx.chat_id, |draft, state| {
                    draft.code = Some(text.to_string());
                    *state = SessionState::TestCode;
                });
                Ok(vec![ChatAction::Reply {
                    text: "Almost done.\n\nDo you want to test your script before saving it?"
                        .to_string(),
                    keyboard: Some(yes_no_keyboard()),
                }])
            }
            // Waiting on a button press or the /test command.
            SessionLookup::Active(_) => Ok(Vec::new()),
        }
    }

    async fn handle_callback(
        &self,
        ctx: RequestContext,
        callback_id: &str,
        data: &str,
    ) -> Result<Vec<ChatAction>> {
        if let Some((page, owner)) = parse_page_callback(data) {
            return self.navigate_listing(ctx, callback_id, page, owner).await;
        }

        match (self.sessions.lookup(ctx.user_id, ctx.chat_id), data) {
            (SessionLookup::Active(SessionState::TestCode), CALLBACK_YES) => {
                self.sessions.update(ctx.user_id, ctx.chat_id, |_, state| {
                    *state = SessionState::TestCodeWaitingCommand;
                });
                Ok(vec![
                    ChatAction::ack(callback_id),
                    ChatAction::edit(
                        ctx.message_id,
                        "To test the code, send /test <optional arguments>",
                        None,
                    ),
                ])
            }
            (SessionLookup::Active(SessionState::TestCode), CALLBACK_NO)
            | (SessionLookup::Active(SessionState::TestCodeWaitingCommand), CALLBACK_SAVE) => {
                self.commit_draft(ctx, callback_id).await
            }
            (SessionLookup::Active(SessionState::TestCodeWaitingCommand), CALLBACK_EDIT) => {
                self.sessions.update(ctx.user_id, ctx.chat_id, |_, state| {
                    *state = SessionState::SelectCode;
                });
                Ok(vec![
                    ChatAction::ack(callback_id),
                    ChatAction::edit(
                        ctx.message_id,
                        "Send the edited code for your script. \
                         Use 4 spaces for indentation. \
                         To avoid Markdown formatting, send your code as monospace.",
                        None,
                    ),
                ])
            }
            (SessionLookup::Expired, _) => Ok(vec![ChatAction::ack_with_text(
                callback_id,
                "Your script draft expired, start again with /save",
            )]),
            // Stale or foreign keyboards are acknowledged and otherwise ignored.
            _ => Ok(vec![ChatAction::ack(callback_id)]),
        }
    }

    async fn navigate_listing(
        &self,
        ctx: RequestContext,
        callback_id: &str,
        page: usize,
        owner: i64,
    ) -> Result<Vec<ChatAction>> {
        if ctx.user_id != owner {
            return Ok(vec![ChatAction::ack_with_text(
                callback_id,
                "You cannot use this keyboard",
            )]);
        }

        let scripts = self.store.list_all().await?;
        if scripts.is_empty() {
            return Ok(vec![
                ChatAction::ack(callback_id),
                ChatAction::edit(ctx.message_id, "❌ There are no scripts yet.", None),
            ]);
        }

        let entries = self.resolve_entries(ctx.chat_id, &scripts).await;
        let pages = build_pages(&entries);
        let page = page.clamp(1, pages.len());
        Ok(vec![
            ChatAction::ack(callback_id),
            ChatAction::edit(
                ctx.message_id,
                pages[page - 1].clone(),
                page_keyboard(pages.len(), page, owner),
            ),
        ])
    }

    async fn commit_draft(
        &self,
        ctx: RequestContext,
        callback_id: &str,
    ) -> Result<Vec<ChatAction>> {
        let Some(draft) = self.sessions.snapshot(ctx.user_id, ctx.chat_id) else {
            return Ok(vec![ChatAction::ack(callback_id)]);
        };
        let (Some(description), Some(code)) = (draft.description, draft.code) else {
            self.sessions.end(ctx.user_id, ctx.chat_id);
            return Ok(vec![
                ChatAction::ack(callback_id),
                ChatAction::edit(ctx.message_id, "❌ The script draft is incomplete", None),
            ]);
        };

        match self
            .store
            .create(NewScript {
                name: draft.name.clone(),
                author_id: ctx.user_id,
                code,
                description,
            })
            .await
        {
            Ok(script) => {
                self.sessions.end(ctx.user_id, ctx.chat_id);
                info!(
                    user_id = ctx.user_id,
                    name = %script.name,
                    "script created"
                );
                Ok(vec![
                    ChatAction::ack(callback_id),
                    ChatAction::edit(ctx.message_id, saved_text(&script.name), None),
                ])
            }
            // Lost the race for the name since the entry check.
            Err(StoreError::DuplicateName(name)) => {
                self.sessions.end(ctx.user_id, ctx.chat_id);
                warn!(user_id = ctx.user_id, name, "duplicate name on commit");
                Ok(vec![
                    ChatAction::ack(callback_id),
                    ChatAction::edit(
                        ctx.message_id,
                        format!("❌ {}", CommandError::DuplicateName),
                        None,
                    ),
                ])
            }
            Err(StoreError::Other(err)) => Err(err),
        }
    }

    fn about_text(&self) -> String {
        let modules = self.dispatcher.builtin_names().join(", ");
        format!(
            "This group supports user scripts executed in an isolated runtime \
             with access to the following modules: {modules}\n\n\
             /exec <code> - run a code snippet\n\
             /scripts - list available scripts\n\
             /save <script_name> - create a new script\n\
             /load <script_name> <script_args> - run a saved script\n\
             /rename <old_script_name> <new_script_name> - rename a script\n\
             /changedesc <script_name>\n(next line) <new_script_desc> - change a script description\n\
             /delete <script_name> - delete a script"
        )
    }
}
