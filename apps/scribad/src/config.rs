use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_path: String,
    pub telegram: TelegramConfig,
    pub sandbox: SandboxConfig,
    pub session: Option<SessionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token_env: String,
    pub polling_timeout_seconds: Option<u64>,
    /// The single group chat the bot serves; mutating commands from any
    /// other chat are ignored.
    pub authorized_chat_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Argv of the restricted interpreter binary.
    pub interpreter: Vec<String>,
    pub timeout_seconds: Option<u64>,
    /// Builtin names the interpreter exposes to user scripts.
    pub builtins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub ttl_minutes: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg = toml::from_str::<Self>(&raw).context("failed to parse TOML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.database_path.trim().is_empty() {
            return Err(anyhow!("database_path must not be empty"));
        }
        if self.telegram.bot_token_env.trim().is_empty() {
            return Err(anyhow!("telegram.bot_token_env must not be empty"));
        }
        if self.telegram.authorized_chat_id == 0 {
            return Err(anyhow!("telegram.authorized_chat_id must be set"));
        }
        if let Some(timeout) = self.telegram.polling_timeout_seconds {
            if timeout == 0 {
                return Err(anyhow!(
                    "telegram.polling_timeout_seconds must be > 0 when set"
                ));
            }
        }
        if self.sandbox.interpreter.is_empty() {
            return Err(anyhow!("sandbox.interpreter must not be empty"));
        }
        for part in &self.sandbox.interpreter {
            if part.trim().is_empty() {
                return Err(anyhow!("sandbox.interpreter values must not be empty"));
            }
        }
        if let Some(timeout) = self.sandbox.timeout_seconds {
            if timeout == 0 || timeout > 900 {
                return Err(anyhow!(
                    "sandbox.timeout_seconds must be between 1 and 900 when set"
                ));
            }
        }
        for name in &self.sandbox.builtins {
            if name.trim().is_empty() {
                return Err(anyhow!("sandbox.builtins values must not be empty"));
            }
        }
        if let Some(session) = &self.session {
            if let Some(ttl) = session.ttl_minutes {
                if ttl == 0 {
                    return Err(anyhow!("session.ttl_minutes must be > 0 when set"));
                }
            }
        }
        Ok(())
    }

    pub fn polling_timeout_seconds(&self) -> u64 {
        self.telegram.polling_timeout_seconds.unwrap_or(30)
    }

    pub fn sandbox_timeout_seconds(&self) -> u64 {
        self.sandbox.timeout_seconds.unwrap_or(10)
    }

    pub fn session_ttl_minutes(&self) -> u64 {
        self.session
            .as_ref()
            .and_then(|session| session.ttl_minutes)
            .unwrap_or(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_config() {
        let raw = r#"
        database_path = "data/scripts.db"

        [telegram]
        bot_token_env = "SCRIBA_BOT_TOKEN"
        polling_timeout_seconds = 25
        authorized_chat_id = -1001234567890

        [sandbox]
        interpreter = ["restricted-py", "--safe"]
        timeout_seconds = 5
        builtins = ["math", "re", "random"]

        [session]
        ttl_minutes = 15
        "#;

        let parsed: AppConfig = toml::from_str(raw).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.telegram.authorized_chat_id, -1001234567890);
        assert_eq!(parsed.polling_timeout_seconds(), 25);
        assert_eq!(parsed.sandbox_timeout_seconds(), 5);
        assert_eq!(parsed.session_ttl_minutes(), 15);
        assert_eq!(parsed.sandbox.interpreter, vec!["restricted-py", "--safe"]);
    }

    #[test]
    fn defaults_apply_when_sections_are_minimal() {
        let raw = r#"
        database_path = "data/scripts.db"

        [telegram]
        bot_token_env = "SCRIBA_BOT_TOKEN"
        authorized_chat_id = -100

        [sandbox]
        interpreter = ["restricted-py"]
        builtins = ["math"]
        "#;

        let parsed: AppConfig = toml::from_str(raw).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.polling_timeout_seconds(), 30);
        assert_eq!(parsed.sandbox_timeout_seconds(), 10);
        assert_eq!(parsed.session_ttl_minutes(), 30);
    }

    #[test]
    fn reject_empty_interpreter() {
        let raw = r#"
        database_path = "data/scripts.db"

        [telegram]
        bot_token_env = "SCRIBA_BOT_TOKEN"
        authorized_chat_id = -100

        [sandbox]
        interpreter = []
        builtins = []
        "#;

        let parsed: AppConfig = toml::from_str(raw).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn reject_invalid_limits() {
        let raw = r#"
        database_path = "data/scripts.db"

        [telegram]
        bot_token_env = "SCRIBA_BOT_TOKEN"
        polling_timeout_seconds = 0
        authorized_chat_id = -100

        [sandbox]
        interpreter = ["restricted-py"]
        builtins = []
        "#;

        let parsed: AppConfig = toml::from_str(raw).unwrap();
        assert!(parsed.validate().is_err());

        let raw = r#"
        database_path = "data/scripts.db"

        [telegram]
        bot_token_env = "SCRIBA_BOT_TOKEN"
        authorized_chat_id = -100

        [sandbox]
        interpreter = ["restricted-py"]
        timeout_seconds = 901
        builtins = []
        "#;

        let parsed: AppConfig = toml::from_str(raw).unwrap();
        assert!(parsed.validate().is_err());
    }
}
