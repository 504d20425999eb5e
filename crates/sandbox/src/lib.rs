use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use scriba_core::{ExecutionEnv, OutputSink, SandboxExecutor};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Environment variable carrying the comma-joined builtin allow-list into
/// the restricted interpreter.
pub const BUILTINS_ENV: &str = "SCRIBA_BUILTINS";
/// Environment variable carrying the locals map as JSON.
pub const LOCALS_ENV: &str = "SCRIBA_LOCALS";

#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    /// Argv of the restricted interpreter; the code arrives on its stdin.
    pub interpreter: Vec<String>,
    pub timeout_secs: u64,
    pub builtin_whitelist: Vec<String>,
}

/// Runs untrusted code through an external restricted interpreter, one
/// short-lived process per execution. Capability enforcement (what the code
/// may import or call) lives in the interpreter itself; this side only
/// delivers the allow-list, the locals, and the hard deadline.
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ProcessExecutorConfig) -> Result<Self> {
        if config.interpreter.is_empty() {
            return Err(anyhow!("interpreter command cannot be empty"));
        }
        if config.timeout_secs == 0 {
            return Err(anyhow!("timeout must be greater than zero"));
        }
        if config.timeout_secs > 900 {
            return Err(anyhow!("timeout exceeds hard cap of 900 seconds"));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl SandboxExecutor for ProcessExecutor {
    fn builtin_whitelist(&self) -> Vec<String> {
        self.config.builtin_whitelist.clone()
    }

    async fn execute(
        &self,
        code: &str,
        env: ExecutionEnv,
        sink: Arc<dyn OutputSink>,
    ) -> Result<()> {
        let (binary, args) = self
            .config
            .interpreter
            .split_first()
            .context("interpreter command is empty")?;

        let locals =
            serde_json::to_string(&env.locals).context("failed to serialize execution locals")?;

        let mut command = Command::new(binary);
        command
            .args(args)
            .env(BUILTINS_ENV, env.builtins.join(","))
            .env(LOCALS_ENV, locals)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary, timeout_secs = self.config.timeout_secs, "spawning sandbox process");
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch interpreter '{binary}'"))?;

        let mut stdin = child.stdin.take().context("child stdin not captured")?;
        stdin
            .write_all(code.as_bytes())
            .await
            .context("failed to write code to interpreter stdin")?;
        drop(stdin);

        let stdout = child.stdout.take().context("child stdout not captured")?;
        let mut stderr = child.stderr.take().context("child stderr not captured")?;

        // Stdout is forwarded line by line while the process runs; stderr is
        // drained on the side so a chatty failure cannot deadlock the pipes.
        let run = async {
            let stderr_reader = tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            });

            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if !line.trim().is_empty() {
                    sink.emit(&line).await?;
                }
            }

            let status = child.wait().await?;
            let stderr_buf = stderr_reader.await.unwrap_or_default();
            Ok::<_, anyhow::Error>((status, stderr_buf))
        };

        let (status, stderr_buf) = timeout(Duration::from_secs(self.config.timeout_secs), run)
            .await
            .map_err(|_| {
                anyhow!("execution timed out after {} seconds", self.config.timeout_secs)
            })??;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_buf);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                return Err(anyhow!(
                    "execution failed with exit code {}",
                    status.code().unwrap_or(-1)
                ));
            }
            return Err(anyhow!("{stderr}"));
        }
        Ok(())
    }
}
