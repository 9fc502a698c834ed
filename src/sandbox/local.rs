//! Default/dev `SandboxBackend`: one OS process per instance, a working
//! directory under a shared base dir.
//!
//! Grounded directly on `ClaudeCodeCliClient::execute_claude_command_with_session`
//! (piped stdio subprocess, `current_dir` set to an isolated workspace) and
//! its companion workspace helpers (`get_or_create_session_workspace`,
//! `cleanup_old_workspaces`), repurposed from a single Claude Code CLI
//! invocation into a general command-execution sandbox.

use super::{CreateOptions, OutputSink, RunOptions, RunResult, SandboxBackend};
use crate::error::{CoreError, Result};
use crate::models::{SandboxInstance, SandboxStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct LocalProcessBackend {
    base_dir: PathBuf,
}

impl LocalProcessBackend {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn workspace_for(&self, sandbox_id: &str) -> PathBuf {
        self.base_dir.join(sandbox_id)
    }

    fn resolve(&self, sandbox: &SandboxInstance, path: &str) -> Result<PathBuf> {
        let relative = PathBuf::from(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(CoreError::Validation(format!(
                "path {path} escapes sandbox workspace"
            )));
        }
        Ok(self.workspace_for(&sandbox.id).join(relative))
    }
}

#[async_trait]
impl SandboxBackend for LocalProcessBackend {
    async fn create(&self, options: &CreateOptions) -> Result<SandboxInstance> {
        let sandbox_id = format!("local-{}", Uuid::new_v4());
        let workspace = self.workspace_for(&sandbox_id);
        fs::create_dir_all(&workspace)
            .await
            .map_err(|err| CoreError::Transient(format!("failed to create sandbox workspace: {err}")))?;

        let now = Utc::now();
        Ok(SandboxInstance {
            id: sandbox_id,
            agent_id: options.agent_id.clone(),
            project_id: options.project_id.clone(),
            status: SandboxStatus::Running,
            template: options.template.clone(),
            started_at: now,
            last_activity_at: now,
            metadata: Default::default(),
        })
    }

    async fn run(&self, sandbox: &SandboxInstance, command: &str, options: &RunOptions) -> Result<RunResult> {
        let workspace = match &options.cwd {
            Some(cwd) => self.resolve(sandbox, cwd)?,
            None => self.workspace_for(&sandbox.id),
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CoreError::Transient(format!("failed to spawn sandbox command: {err}")))?;

        let output = tokio::time::timeout(options.timeout, child.wait_with_output())
            .await
            .map_err(|_| CoreError::Transient(format!("command timed out after {:?}", options.timeout)))?
            .map_err(|err| CoreError::Transient(format!("sandbox command failed: {err}")))?;

        Ok(RunResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_streaming(
        &self,
        sandbox: &SandboxInstance,
        command: &str,
        options: &RunOptions,
        on_stdout: OutputSink,
        on_stderr: OutputSink,
    ) -> Result<RunResult> {
        let workspace = match &options.cwd {
            Some(cwd) => self.resolve(sandbox, cwd)?,
            None => self.workspace_for(&sandbox.id),
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CoreError::Transient(format!("failed to spawn sandbox command: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Fatal("sandbox child missing stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::Fatal("sandbox child missing stderr pipe".into()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut collected_stdout = String::new();
        let mut collected_stderr = String::new();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            on_stdout(&line);
                            collected_stdout.push_str(&line);
                            collected_stdout.push('\n');
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("sandbox stdout stream error: {err}");
                            break;
                        }
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Ok(Some(line)) = line {
                        on_stderr(&line);
                        collected_stderr.push_str(&line);
                        collected_stderr.push('\n');
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| CoreError::Transient(format!("sandbox command failed: {err}")))?;

        Ok(RunResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: collected_stdout,
            stderr: collected_stderr,
        })
    }

    async fn read_file(&self, sandbox: &SandboxInstance, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve(sandbox, path)?;
        fs::read(&resolved)
            .await
            .map_err(|err| CoreError::NotFound(format!("{path}: {err}")))
    }

    async fn write_file(&self, sandbox: &SandboxInstance, path: &str, content: &[u8]) -> Result<()> {
        let resolved = self.resolve(sandbox, path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| CoreError::Transient(format!("failed to create parent dir: {err}")))?;
        }
        fs::write(&resolved, content)
            .await
            .map_err(|err| CoreError::Transient(format!("failed to write {path}: {err}")))
    }

    async fn remove_file(&self, sandbox: &SandboxInstance, path: &str) -> Result<()> {
        let resolved = self.resolve(sandbox, path)?;
        fs::remove_file(&resolved)
            .await
            .map_err(|err| CoreError::NotFound(format!("{path}: {err}")))
    }

    async fn list_files(&self, sandbox: &SandboxInstance, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve(sandbox, path)?;
        let mut entries = fs::read_dir(&resolved)
            .await
            .map_err(|err| CoreError::NotFound(format!("{path}: {err}")))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| CoreError::Transient(format!("failed to read dir entry: {err}")))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn kill(&self, sandbox: &SandboxInstance) -> Result<()> {
        let workspace = self.workspace_for(&sandbox.id);
        debug!("tearing down sandbox workspace {:?}", workspace);
        if workspace.exists() {
            fs::remove_dir_all(&workspace)
                .await
                .map_err(|err| CoreError::Transient(format!("failed to remove workspace: {err}")))?;
        }
        Ok(())
    }
}
