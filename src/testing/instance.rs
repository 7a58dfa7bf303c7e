//! Server instance lifecycle
//!
//! Each scenario gets its own aggregator process with a private config tree
//! and port. The manager owns every spawned child; a single lock guards the
//! port offset, the reserved ports and the process registry so concurrent
//! scenarios never collide.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::config::{HarnessConfig, Timeouts};
use crate::common::{Error, Result};

use super::client::{tool_available, ToolClient};
use super::preconfig::{write_main_config, PreConfiguration};
use super::result::InstanceLogs;
use super::sleep_or_cancel;

/// Ports tried before allocation gives up
const MAX_PORT_CANDIDATES: u16 = 100;

/// Lines kept per output stream
const MAX_LOG_LINES: usize = 5000;

/// How long to wait for output readers after the process exits
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to launch instances
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
    pub host: String,
    pub base_port: u16,
    pub endpoint_path: String,
    pub work_dir: PathBuf,
    pub timeouts: Timeouts,
    /// Leave config trees on disk after teardown
    pub keep_instances: bool,
}

impl InstanceSettings {
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        Ok(Self {
            binary: config.resolve_server_binary()?,
            extra_args: config.server.args.clone(),
            host: config.server.host.clone(),
            base_port: config.server.base_port,
            endpoint_path: config.server.endpoint_path.clone(),
            work_dir: config.paths.work_dir(),
            timeouts: config.timeouts.clone(),
            keep_instances: false,
        })
    }
}

/// A running server instance
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub scenario: String,
    pub config_dir: PathBuf,
    pub port: u16,
    pub endpoint: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    /// Tools that must be advertised before the instance counts as ready
    pub expected_tools: Vec<String>,
}

type LogBuffer = Arc<std::sync::Mutex<VecDeque<String>>>;

/// Output readers for one child; they run until the pipes close
struct LogCapture {
    stdout: LogBuffer,
    stderr: LogBuffer,
    readers: Vec<JoinHandle<()>>,
}

impl LogCapture {
    fn start(
        instance: &str,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) -> Self {
        let stdout_buf = LogBuffer::default();
        let stderr_buf = LogBuffer::default();
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            readers.push(spawn_reader(instance.to_string(), "stdout", out, stdout_buf.clone()));
        }
        if let Some(err) = stderr {
            readers.push(spawn_reader(instance.to_string(), "stderr", err, stderr_buf.clone()));
        }
        Self {
            stdout: stdout_buf,
            stderr: stderr_buf,
            readers,
        }
    }

    fn stderr_tail(&self, lines: usize) -> String {
        let buffer = match self.stderr.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = buffer.len().saturating_sub(lines);
        buffer.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }

    async fn finish(self) -> InstanceLogs {
        for reader in self.readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, reader).await.is_err() {
                abort.abort();
            }
        }
        InstanceLogs {
            stdout: snapshot(&self.stdout),
            stderr: snapshot(&self.stderr),
        }
    }
}

fn spawn_reader<R>(instance: String, stream: &'static str, reader: R, buffer: LogBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::trace!(instance = %instance, stream, "{}", line);
                    let mut buffer = match buffer.lock() {
                        Ok(buffer) => buffer,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if buffer.len() >= MAX_LOG_LINES {
                        buffer.pop_front();
                    }
                    buffer.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(instance = %instance, stream, error = %e, "Output reader stopped");
                    break;
                }
            }
        }
    })
}

fn snapshot(buffer: &LogBuffer) -> String {
    let buffer = match buffer.lock() {
        Ok(buffer) => buffer,
        Err(poisoned) => poisoned.into_inner(),
    };
    buffer.iter().cloned().collect::<Vec<_>>().join("\n")
}

struct ManagedProcess {
    child: Child,
    port: u16,
    config_dir: PathBuf,
    logs: LogCapture,
}

#[derive(Default)]
struct Registry {
    next_offset: u32,
    next_seq: u64,
    reserved_ports: HashSet<u16>,
    processes: HashMap<String, ManagedProcess>,
}

/// Creates, probes and destroys server instances
pub struct InstanceManager {
    settings: InstanceSettings,
    state: Mutex<Registry>,
}

impl InstanceManager {
    pub fn new(settings: InstanceSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(Registry::default()),
        }
    }

    /// Number of instances not yet destroyed
    pub async fn live_count(&self) -> usize {
        self.state.lock().await.processes.len()
    }

    /// Allocate a port, write the config tree and start the server
    pub async fn create_instance(
        &self,
        scenario: &str,
        preconfig: Option<&PreConfiguration>,
    ) -> Result<Instance> {
        let (id, port) = {
            let mut state = self.state.lock().await;
            state.next_seq += 1;
            let id = format!(
                "{}-{}-{}",
                sanitize_name(scenario),
                std::process::id(),
                state.next_seq
            );
            let port = self.allocate_port(&mut state)?;
            (id, port)
        };

        match self.start(&id, scenario, port, preconfig).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.state.lock().await.reserved_ports.remove(&port);
                let dir = self.settings.work_dir.join(&id);
                if !self.settings.keep_instances && dir.exists() {
                    let _ = tokio::fs::remove_dir_all(&dir).await;
                }
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        id: &str,
        scenario: &str,
        port: u16,
        preconfig: Option<&PreConfiguration>,
    ) -> Result<Instance> {
        let config_dir = self.settings.work_dir.join(id);
        if config_dir.exists() {
            tokio::fs::remove_dir_all(&config_dir).await?;
        }
        tokio::fs::create_dir_all(&config_dir).await?;

        let empty = PreConfiguration::default();
        preconfig.unwrap_or(&empty).materialize(&config_dir)?;
        write_main_config(&config_dir, &self.settings.host, port, preconfig)?;

        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("serve")
            .arg("--headless")
            .arg("--config-path")
            .arg(&config_dir)
            .arg("--debug")
            .args(&self.settings.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::spawn_failed(id, format!("{}: {}", self.settings.binary.display(), e))
        })?;
        let pid = child.id();
        let logs = LogCapture::start(id, child.stdout.take(), child.stderr.take());

        let endpoint = format!(
            "http://{}:{}{}",
            self.settings.host, port, self.settings.endpoint_path
        );
        tracing::info!(instance = %id, port, pid = ?pid, "Started server instance");

        self.state.lock().await.processes.insert(
            id.to_string(),
            ManagedProcess {
                child,
                port,
                config_dir: config_dir.clone(),
                logs,
            },
        );

        Ok(Instance {
            id: id.to_string(),
            scenario: scenario.to_string(),
            config_dir,
            port,
            endpoint,
            pid,
            started_at: Utc::now(),
            expected_tools: preconfig.map(|p| p.expected_tools()).unwrap_or_default(),
        })
    }

    /// Scan from the shared offset for a port that is neither reserved nor bound
    fn allocate_port(&self, state: &mut Registry) -> Result<u16> {
        let base = u32::from(self.settings.base_port);
        let span = u32::from(u16::MAX) - base + 1;

        for _ in 0..MAX_PORT_CANDIDATES {
            let offset = state.next_offset % span;
            state.next_offset = (offset + 1) % span;
            let port = (base + offset) as u16;
            if port == 0 || state.reserved_ports.contains(&port) {
                continue;
            }
            if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
                state.reserved_ports.insert(port);
                return Ok(port);
            }
            tracing::debug!(port, "Port in use, trying next");
        }

        Err(Error::PortExhausted {
            base: self.settings.base_port,
            scanned: MAX_PORT_CANDIDATES,
        })
    }

    #[cfg(test)]
    async fn reserve_port(&self) -> Result<u16> {
        let mut state = self.state.lock().await;
        self.allocate_port(&mut state)
    }

    /// Wait until the instance accepts connections and advertises its tools
    ///
    /// Fails fast when the process exits. With no expected tools a fixed
    /// settle delay replaces tool polling.
    pub async fn wait_for_ready(&self, instance: &Instance, cancel: &CancellationToken) -> Result<()> {
        let timeouts = &self.settings.timeouts;
        let started = Instant::now();
        let deadline = started + timeouts.readiness();

        loop {
            self.check_alive(&instance.id).await?;
            if self.probe_port(instance.port).await {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::PortTimeout {
                    instance: instance.id.clone(),
                    port: instance.port,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            sleep_or_cancel(timeouts.tcp_poll(), cancel).await?;
        }
        tracing::debug!(instance = %instance.id, port = instance.port, "Port accepting connections");

        let mut client = ToolClient::http(&instance.endpoint, timeouts.step())?;
        loop {
            match client.connect().await {
                Ok(()) => break,
                Err(e) if Instant::now() < deadline => {
                    tracing::debug!(instance = %instance.id, error = %e, "Handshake not accepted yet");
                    self.check_alive(&instance.id).await?;
                    sleep_or_cancel(timeouts.tool_poll(), cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let result = self
            .await_tools(instance, &mut client, started, deadline, cancel)
            .await;
        client.close().await;
        result
    }

    async fn await_tools(
        &self,
        instance: &Instance,
        client: &mut ToolClient,
        started: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeouts = &self.settings.timeouts;
        if instance.expected_tools.is_empty() {
            sleep_or_cancel(timeouts.settle(), cancel).await?;
            tracing::info!(instance = %instance.id, "Instance ready");
            return Ok(());
        }

        let tool_deadline = deadline.min(Instant::now() + timeouts.tool_registration());
        let mut available = Vec::new();
        loop {
            match client.list_tools().await {
                Ok(tools) => available = tools,
                Err(e) => tracing::debug!(instance = %instance.id, error = %e, "Listing tools failed"),
            }

            let missing: Vec<String> = instance
                .expected_tools
                .iter()
                .filter(|tool| !tool_available(tool, &available))
                .cloned()
                .collect();
            if missing.is_empty() {
                tracing::info!(
                    instance = %instance.id,
                    tools = available.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Instance ready"
                );
                return Ok(());
            }

            if Instant::now() >= tool_deadline {
                return Err(Error::ReadinessTimeout {
                    instance: instance.id.clone(),
                    waited_secs: started.elapsed().as_secs(),
                    expected: instance.expected_tools.clone(),
                    available,
                    missing,
                });
            }
            tracing::debug!(instance = %instance.id, missing = ?missing, "Waiting for tools");
            self.check_alive(&instance.id).await?;
            sleep_or_cancel(timeouts.tool_poll(), cancel).await?;
        }
    }

    async fn probe_port(&self, port: u16) -> bool {
        let connect = TcpStream::connect((self.settings.host.as_str(), port));
        matches!(
            tokio::time::timeout(Duration::from_secs(1), connect).await,
            Ok(Ok(_))
        )
    }

    /// Error out if the process has exited or was already destroyed
    async fn check_alive(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(process) = state.processes.get_mut(id) else {
            return Err(Error::InstanceExited {
                instance: id.to_string(),
                status: "destroyed".to_string(),
            });
        };
        match process.child.try_wait() {
            Ok(Some(status)) => {
                let tail = process.logs.stderr_tail(20);
                let status = if tail.is_empty() {
                    status.to_string()
                } else {
                    format!("{}; stderr:\n{}", status, tail)
                };
                Err(Error::InstanceExited {
                    instance: id.to_string(),
                    status,
                })
            }
            Ok(None) => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Stop the instance, collect its output and remove its config tree
    ///
    /// Returns `None` when the instance was already destroyed. Failures are
    /// logged, never returned.
    pub async fn destroy_instance(&self, id: &str) -> Option<InstanceLogs> {
        let process = self.state.lock().await.processes.remove(id);
        let Some(mut process) = process else {
            tracing::debug!(instance = %id, "Instance already destroyed");
            return None;
        };

        self.terminate(id, &mut process.child).await;
        self.state.lock().await.reserved_ports.remove(&process.port);

        let logs = process.logs.finish().await;

        if self.settings.keep_instances {
            tracing::info!(instance = %id, dir = %process.config_dir.display(), "Keeping instance config");
        } else if let Err(e) = tokio::fs::remove_dir_all(&process.config_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(instance = %id, error = %e, "Failed to remove instance directory");
            }
        }

        tracing::info!(instance = %id, "Destroyed server instance");
        Some(logs)
    }

    /// Destroy every instance still registered
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.state.lock().await.processes.keys().cloned().collect();
        for id in ids {
            self.destroy_instance(&id).await;
        }
    }

    async fn terminate(&self, id: &str, child: &mut Child) {
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(instance = %id, %status, "Instance already exited");
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SIGTERM first so the server can shut down cleanly
                let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if rc == 0 {
                    let grace = self.settings.timeouts.shutdown_grace();
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::debug!(instance = %id, %status, "Instance stopped");
                            return;
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(instance = %id, error = %e, "Waiting for instance failed")
                        }
                        Err(_) => tracing::warn!(
                            instance = %id,
                            grace_secs = grace.as_secs(),
                            "Instance ignored SIGTERM, killing"
                        ),
                    }
                }
            }
        }

        if let Err(e) = child.kill().await {
            tracing::warn!(instance = %id, error = %e, "Failed to kill instance");
        }
    }
}

/// Lowercase alphanumerics and dashes, safe as a directory name
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(48).collect();
    if trimmed.is_empty() {
        "scenario".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(binary: &str, base_port: u16, work_dir: &std::path::Path) -> InstanceSettings {
        InstanceSettings {
            binary: PathBuf::from(binary),
            extra_args: Vec::new(),
            host: "127.0.0.1".to_string(),
            base_port,
            endpoint_path: "/mcp".to_string(),
            work_dir: work_dir.to_path_buf(),
            timeouts: Timeouts {
                readiness_secs: 5,
                tcp_poll_ms: 50,
                shutdown_grace_secs: 2,
                ..Timeouts::default()
            },
            keep_instances: false,
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Create & Delete: resource"), "create-delete-resource");
        assert_eq!(sanitize_name("--x--"), "x");
        assert_eq!(sanitize_name("!!!"), "scenario");
        assert_eq!(sanitize_name(&"a".repeat(100)).len(), 48);
    }

    #[tokio::test]
    async fn test_concurrent_port_allocation_is_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = Arc::new(InstanceManager::new(settings("sh", 38100, tmp.path())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.reserve_port().await.unwrap() }));
        }
        let mut ports = HashSet::new();
        for handle in handles {
            assert!(ports.insert(handle.await.unwrap()));
        }
        assert_eq!(ports.len(), 8);
    }

    #[tokio::test]
    async fn test_port_in_use_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = held.local_addr().unwrap().port();

        let manager = InstanceManager::new(settings("sh", busy, tmp.path()));
        let port = manager.reserve_port().await.unwrap();
        assert_ne!(port, busy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_detected_and_destroy_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        // `sh serve ...` exits immediately: there is no script named "serve"
        let manager = InstanceManager::new(settings("/bin/sh", 38200, tmp.path()));
        let instance = manager.create_instance("Early Exit", None).await.unwrap();
        assert!(instance.config_dir.join("config.yaml").is_file());
        assert!(instance.config_dir.join("mcpservers").is_dir());
        assert!(instance.id.starts_with("early-exit-"));

        let err = manager
            .wait_for_ready(&instance, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstanceExited { .. }), "got {err}");

        assert!(manager.destroy_instance(&instance.id).await.is_some());
        assert!(!instance.config_dir.exists());
        assert_eq!(manager.live_count().await, 0);

        assert!(manager.destroy_instance(&instance.id).await.is_none());
        assert!(!instance.config_dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_keep_instances_leaves_config() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = settings("/bin/sh", 38300, tmp.path());
        settings.keep_instances = true;
        let manager = InstanceManager::new(settings);

        let instance = manager.create_instance("kept", None).await.unwrap();
        manager.destroy_instance(&instance.id).await;
        assert!(instance.config_dir.join("config.yaml").is_file());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = InstanceManager::new(settings("/nonexistent/aggregator", 38400, tmp.path()));
        let err = manager.create_instance("missing", None).await.unwrap_err();
        assert!(matches!(err, Error::InstanceSpawn { .. }));
        assert!(manager.state.lock().await.reserved_ports.is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
