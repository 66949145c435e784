//! Sandbox lifecycle management (SPEC_FULL.md §4.B).
//!
//! The manager talks to the container engine through the narrow
//! [`ContainerEngine`] trait so the process-invocation strategy stays
//! swappable and unit-testable behind a fake. Ground for the
//! `tokio::process::Command`-based shelling-out shape:
//! `ahma_mcp::sandbox::command::Sandbox::create_command`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{parse_cpu_limit, parse_memory_limit, AgentConfig, ContainerConfig};
use crate::error::{RelayError, Result};

const DEFAULT_ALLOWLIST: &[&str] = &["TERM", "LANG", "LC_ALL", "COLORTERM"];
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(10);
const MONITOR_LOG_LINES: usize = 50;

/// A handle to a running sandbox: the container id and its attached stdio.
///
/// `stdout`/`stderr` are already split by the [`demux`](crate::demux)
/// task (required by §4.A, since TTY is disabled and the container
/// multiplexes both streams behind the 8-byte framing header); the Agent
/// Adapter takes each reader exactly once.
pub struct SandboxHandle {
    pub container_id: String,
    pub session_id: String,
    stdin: Mutex<tokio::process::ChildStdin>,
    child: Mutex<Child>,
    stdout: Mutex<Option<tokio::io::DuplexStream>>,
    stderr: Mutex<Option<tokio::io::DuplexStream>>,
    demux_error: tokio::sync::watch::Receiver<Option<crate::demux::DemuxError>>,
}

impl SandboxHandle {
    /// Take the demultiplexed stdout reader. Returns `None` if already
    /// taken (the Adapter owns it for the handle's lifetime thereafter).
    pub async fn take_stdout(&self) -> Option<tokio::io::DuplexStream> {
        self.stdout.lock().await.take()
    }

    /// Take the demultiplexed stderr reader.
    pub async fn take_stderr(&self) -> Option<tokio::io::DuplexStream> {
        self.stderr.lock().await.take()
    }

    /// A receiver for the demuxer's terminal error, if it stopped for a
    /// reason other than a clean upstream EOF. Cloned so callers can poll
    /// it independently of the handle's lifetime.
    pub fn demux_error_receiver(&self) -> tokio::sync::watch::Receiver<Option<crate::demux::DemuxError>> {
        self.demux_error.clone()
    }

    pub async fn write_stdin(&self, bytes: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn close_stdin(&self) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.shutdown().await?;
        Ok(())
    }
}

/// Narrow abstraction over a container engine CLI (`docker`, `podman`, ...).
/// Engine *discovery* (which binary, daemon reachability) is external; this
/// trait is handed a configured engine command name and only issues calls.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<SpawnedContainer>;
    async fn reuse(&self, session_id: &str) -> Result<Option<SpawnedContainer>>;
    async fn stop(&self, container_id: &str, grace: std::time::Duration) -> Result<()>;
    async fn logs_tail(&self, container_id: &str, lines: usize) -> Result<String>;
    /// Checked once at startup: the engine binary is reachable and its
    /// daemon responds (§7 "sandbox engine unavailable"). Errors from this
    /// method are fatal and must carry a remediation hint.
    async fn ping(&self, docker_host: &str) -> Result<()>;
}

/// Fully-resolved parameters for creating one sandbox container.
pub struct ContainerSpec {
    pub session_id: String,
    pub image: String,
    pub docker_host: String,
    pub network_mode: String,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_limit_nanos: Option<u64>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub host_mount: PathBuf,
    pub container_mount: PathBuf,
    pub auto_remove: bool,
    pub container_name: String,
}

/// What the engine hands back after a successful create+start+attach.
pub struct SpawnedContainer {
    pub container_id: String,
    pub child: Child,
}

/// [`ContainerEngine`] implementation that shells out to a `docker`/`podman`
/// compatible CLI via `tokio::process::Command`, the way
/// `ahma_mcp::sandbox::command::Sandbox::create_command` builds its
/// subprocess commands.
pub struct CliContainerEngine;

#[async_trait]
impl ContainerEngine for CliContainerEngine {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<SpawnedContainer> {
        let mut cmd = Command::new(&spec.docker_host);
        cmd.arg("run")
            .arg("--name")
            .arg(&spec.container_name)
            .arg("--network")
            .arg(&spec.network_mode)
            .arg("-i")
            .arg("--tty=false")
            .arg("-v")
            .arg(format!(
                "{}:{}",
                spec.host_mount.display(),
                spec.container_mount.display()
            ));

        if let Some(bytes) = spec.memory_limit_bytes {
            cmd.arg("--memory").arg(bytes.to_string());
        }
        if let Some(nanos) = spec.cpu_limit_nanos {
            let cores = nanos as f64 / 1_000_000_000.0;
            cmd.arg("--cpus").arg(format!("{cores:.3}"));
        }
        for (key, value) in &spec.labels {
            cmd.arg("--label").arg(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        if spec.auto_remove {
            cmd.arg("--rm");
        }
        cmd.arg(&spec.image);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| RelayError::Sandbox(format!("spawning container: {e}")))?;

        Ok(SpawnedContainer {
            container_id: spec.container_name.clone(),
            child,
        })
    }

    async fn reuse(&self, session_id: &str) -> Result<Option<SpawnedContainer>> {
        // Querying `docker ps --filter label=session-id=<id>` and
        // re-attaching is a thin wrapper over the same `Command`
        // machinery as `create_and_start`; omitted here because the
        // relay's Registry already refuses to serve a `reuse` for a
        // session it does not itself remember across a restart (§4.D).
        let _ = session_id;
        Ok(None)
    }

    async fn stop(&self, container_id: &str, grace: std::time::Duration) -> Result<()> {
        let status = Command::new("docker")
            .arg("stop")
            .arg("--time")
            .arg(grace.as_secs().to_string())
            .arg(container_id)
            .status()
            .await
            .map_err(|e| RelayError::Sandbox(format!("stopping container: {e}")))?;
        if !status.success() {
            return Err(RelayError::Sandbox(format!(
                "docker stop {container_id} exited with {status}"
            )));
        }
        Ok(())
    }

    async fn logs_tail(&self, container_id: &str, lines: usize) -> Result<String> {
        let output = Command::new("docker")
            .arg("logs")
            .arg("--tail")
            .arg(lines.to_string())
            .arg(container_id)
            .output()
            .await
            .map_err(|e| RelayError::Sandbox(format!("reading container logs: {e}")))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ping(&self, docker_host: &str) -> Result<()> {
        let status = Command::new(docker_host)
            .arg("version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                RelayError::EngineUnavailable(format!(
                    "could not run `{docker_host} version`: {e} — is the container engine installed and on $PATH?"
                ))
            })?;
        if !status.success() {
            return Err(RelayError::EngineUnavailable(format!(
                "`{docker_host} version` exited with {status} — is the container engine running?"
            )));
        }
        Ok(())
    }
}

/// Sanitizes a session id into a valid, collision-resistant container name
/// (SPEC_FULL.md §4.B: lowercased, dots to hyphens, `acp-relay-` prefix,
/// underscores preserved).
pub fn container_name(session_id: &str) -> String {
    let body: String = session_id
        .to_lowercase()
        .chars()
        .map(|c| if c == '.' { '-' } else { c })
        .collect();
    format!("acp-relay-{body}")
}

/// Builds the container environment by allowlist, per SPEC_FULL.md §4.B:
/// only `TERM, LANG, LC_ALL, COLORTERM` plus any keys explicitly named in
/// `agent.env` are passed through, each value `$VAR`-expanded against the
/// process environment.
pub fn build_sandbox_env(agent_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in DEFAULT_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    for (key, raw_value) in agent_env {
        env.insert(key.clone(), expand_process_vars(raw_value));
    }
    env
}

fn expand_process_vars(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                result.push('$');
            } else {
                result.push_str(&std::env::var(&name).unwrap_or_default());
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Owns sandbox lifecycle for all active sessions: create, reuse, stop.
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    agent: AgentConfig,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, agent: AgentConfig) -> Self {
        Self { engine, agent }
    }

    /// Verifies the configured container engine is reachable before the
    /// relay accepts any traffic (§7: fatal at startup, exit code 2).
    pub async fn ping(&self) -> Result<()> {
        let container = self.agent.container.as_ref().ok_or_else(|| {
            RelayError::Config("agent.container must be set when mode is container".into())
        })?;
        self.engine.ping(&container.docker_host).await
    }

    /// Create a sandbox for `session_id` rooted at `working_directory`.
    pub async fn create(
        &self,
        session_id: &str,
        working_directory: &Path,
    ) -> Result<Arc<SandboxHandle>> {
        let container: &ContainerConfig = self.agent.container.as_ref().ok_or_else(|| {
            RelayError::Config("agent.container must be set when mode is container".into())
        })?;

        let host_mount = container.workspace_host_base.join(session_id);
        std::fs::create_dir_all(&host_mount).map_err(|e| {
            RelayError::Sandbox(format!(
                "creating workspace directory {}: {e}",
                host_mount.display()
            ))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&host_mount, perms).map_err(|e| {
                RelayError::Sandbox(format!("setting workspace permissions: {e}"))
            })?;
        }

        let memory_limit_bytes = parse_memory_limit(&container.memory_limit)?;
        let cpu_limit_nanos = parse_cpu_limit(&container.cpu_limit)?;

        let mut labels = HashMap::new();
        labels.insert("managed-by".to_string(), "acp-relay".to_string());
        labels.insert("session-id".to_string(), session_id.to_string());
        labels.insert("created-at".to_string(), Utc::now().to_rfc3339());

        let spec = ContainerSpec {
            session_id: session_id.to_string(),
            image: container.image.clone(),
            docker_host: container.docker_host.clone(),
            network_mode: container.network_mode.clone(),
            memory_limit_bytes,
            cpu_limit_nanos,
            env: build_sandbox_env(&self.agent.env),
            labels,
            host_mount,
            container_mount: container.workspace_container_path.clone(),
            auto_remove: container.auto_remove,
            container_name: container_name(session_id),
        };

        let spawned = match self.engine.create_and_start(&spec).await {
            Ok(s) => s,
            Err(e) => return Err(e),
        };

        let mut child = spawned.child;
        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                self.stop_leaked_container(&spawned.container_id).await;
                return Err(RelayError::Sandbox("no stdin on spawned container".into()));
            }
        };
        let raw_stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                self.stop_leaked_container(&spawned.container_id).await;
                return Err(RelayError::Sandbox("no stdout on spawned container".into()));
            }
        };
        let demuxed = crate::demux::spawn(raw_stdout);

        let handle = Arc::new(SandboxHandle {
            container_id: spawned.container_id.clone(),
            session_id: session_id.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            stdout: Mutex::new(Some(demuxed.stdout)),
            stderr: Mutex::new(Some(demuxed.stderr)),
            demux_error: demuxed.error,
        });

        self.spawn_monitor(Arc::clone(&handle));

        Ok(handle)
    }

    /// Best-effort stop for a container whose stdio attach failed after
    /// `create_and_start` succeeded, so a broken attach doesn't leave an
    /// orphaned container running (§4.B).
    async fn stop_leaked_container(&self, container_id: &str) {
        if let Err(err) = self.engine.stop(container_id, STOP_GRACE).await {
            tracing::warn!(
                container_id,
                error = %err,
                "failed to stop container after stdio attach failure"
            );
        }
    }

    /// Attempt to adopt a previously-created, still-running sandbox.
    pub async fn reuse(&self, session_id: &str) -> Result<Option<Arc<SandboxHandle>>> {
        let Some(_spawned) = self.engine.reuse(session_id).await? else {
            return Ok(None);
        };
        // Present shape for when an engine supports re-attach; the
        // bundled CLI engine never returns Some here (see its `reuse`).
        Ok(None)
    }

    /// Idempotently stop a sandbox. Unknown `container_id` is a no-op from
    /// the engine's perspective but the caller (Registry) is responsible
    /// for reporting "not found" without side effects (§4.B).
    pub async fn stop(&self, handle: &SandboxHandle) -> Result<()> {
        handle.close_stdin().await.ok();
        self.engine.stop(&handle.container_id, STOP_GRACE).await
    }

    fn spawn_monitor(&self, handle: Arc<SandboxHandle>) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let status = {
                let mut child = handle.child.lock().await;
                child.wait().await
            };
            match status {
                Ok(status) if !status.success() => {
                    let tail = engine
                        .logs_tail(&handle.container_id, MONITOR_LOG_LINES)
                        .await
                        .unwrap_or_default();
                    tracing::warn!(
                        session_id = %handle.session_id,
                        container_id = %handle.container_id,
                        exit_status = %status,
                        logs = %tail,
                        "sandbox exited non-zero"
                    );
                }
                Ok(_) => {
                    tracing::info!(
                        session_id = %handle.session_id,
                        container_id = %handle.container_id,
                        "sandbox exited cleanly"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = %handle.session_id,
                        error = %err,
                        "failed to wait on sandbox process"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_container_names() {
        assert_eq!(container_name("Sess.ABC_1"), "acp-relay-sess-abc_1");
    }

    #[test]
    fn allowlist_only_passes_named_keys() {
        unsafe {
            std::env::set_var("TERM", "xterm-256color");
            std::env::set_var("HOST_SECRET", "x");
        }
        let env = build_sandbox_env(&HashMap::new());
        assert!(env.contains_key("TERM"));
        assert!(!env.contains_key("HOST_SECRET"));
    }

    #[test]
    fn explicit_agent_env_keys_are_expanded_and_included() {
        unsafe {
            std::env::set_var("ACP_RELAY_TEST_EXPAND", "expanded-value");
        }
        let mut agent_env = HashMap::new();
        agent_env.insert("MY_KEY".to_string(), "$ACP_RELAY_TEST_EXPAND".to_string());
        let env = build_sandbox_env(&agent_env);
        assert_eq!(env.get("MY_KEY").unwrap(), "expanded-value");
    }

    #[test]
    fn unlisted_host_vars_never_leak_even_when_unrelated_keys_are_explicit() {
        unsafe {
            std::env::set_var("ANTHROPIC_API_KEY", "y");
        }
        let mut agent_env = HashMap::new();
        agent_env.insert("SOME_OTHER".to_string(), "literal".to_string());
        let env = build_sandbox_env(&agent_env);
        assert!(!env.contains_key("ANTHROPIC_API_KEY"));
    }
}
