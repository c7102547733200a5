//! Host collaborators used by collectibles.
//!
//! The sysinfo pipeline never touches processes, the package database, or
//! the system journal directly. It goes through the traits in this module so
//! tests can substitute in-memory fakes. [`Host::local`] wires the real
//! implementations:
//!
//! - [`LocalExecutor`] runs commands through `sh -c` and daemons in their
//!   own process group, terminating the whole group with `SIGTERM` then
//!   `SIGKILL`.
//! - [`LocalPackageManager`] asks `rpm` or `dpkg-query`.
//! - [`LocalJournal`] talks to `journalctl`.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::collectible::{CollectibleError, CollectibleResult};

/// `PATH` used when the environment has none.
pub const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// Time a daemon gets between `SIGTERM` and `SIGKILL`.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Exit code `sh` uses when the command cannot be found.
const SHELL_NOT_FOUND: i32 = 127;

/// Output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

/// A spawned background process.
///
/// Clones share the termination flag, so whichever path terminates the
/// process first (the pipeline or an exit-time fallback) wins and the
/// others become no-ops.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    terminated: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Marks the process as terminated. Returns `true` for the first caller.
    pub fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst)
    }
}

/// Runs commands and background daemons.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Runs `cmd` through the shell and captures its combined output.
    async fn run(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
        locale: &str,
    ) -> CollectibleResult<CommandOutput>;

    /// Starts `cmd` in the background with stdout and stderr going to
    /// `output`.
    async fn spawn(
        &self,
        cmd: &str,
        locale: &str,
        output: std::fs::File,
    ) -> CollectibleResult<ProcessHandle>;

    /// Terminates the process tree of `handle` and waits for it.
    ///
    /// Returns the exit code when the process had already exited on its own.
    async fn kill_tree(&self, handle: &ProcessHandle) -> CollectibleResult<Option<i32>>;

    /// Synchronous last-resort kill, usable from exit-time callbacks.
    fn kill_now(&self, handle: &ProcessHandle);
}

/// Lists installed packages.
#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn list_installed(&self) -> CollectibleResult<BTreeSet<String>>;
}

/// Reads the system journal.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Cursor of the newest record, `None` when the journal is empty.
    async fn cursor(&self) -> CollectibleResult<Option<String>>;

    /// Records written after `cursor`.
    async fn since(&self, cursor: &str) -> CollectibleResult<Vec<u8>>;
}

/// The set of collaborators a sysinfo pipeline runs against.
#[derive(Clone)]
pub struct Host {
    pub executor: Arc<dyn ProcessExecutor>,
    pub packages: Arc<dyn PackageManager>,
    pub journal: Arc<dyn Journal>,
    /// Candidate system logs; the first that exists is watched.
    pub syslog_candidates: Vec<PathBuf>,
}

impl Host {
    /// Real processes, package database, and journal.
    pub fn local() -> Self {
        let executor: Arc<dyn ProcessExecutor> = Arc::new(LocalExecutor::new());
        Self {
            packages: Arc::new(LocalPackageManager::new(executor.clone())),
            journal: Arc::new(LocalJournal::new(executor.clone())),
            executor,
            syslog_candidates: vec![
                PathBuf::from("/var/log/messages"),
                PathBuf::from("/var/log/syslog"),
                PathBuf::from("/var/log/system.log"),
            ],
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ProcessExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_packages(mut self, packages: Arc<dyn PackageManager>) -> Self {
        self.packages = packages;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_syslog_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.syslog_candidates = candidates;
        self
    }

    /// The first existing system log, if any.
    pub fn syslog_path(&self) -> Option<PathBuf> {
        self.syslog_candidates.iter().find(|p| p.exists()).cloned()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("syslog_candidates", &self.syslog_candidates)
            .finish_non_exhaustive()
    }
}

fn apply_env(process: &mut tokio::process::Command, locale: &str) {
    if std::env::var_os("PATH").is_none() {
        process.env("PATH", DEFAULT_PATH);
    }
    if !locale.is_empty() {
        process.env("LC_ALL", locale);
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = nix::sys::signal::killpg(Pid::from_raw(raw), signal) {
        if e != nix::errno::Errno::ESRCH {
            debug!("Failed to send {} to process group {}: {}", signal, pid, e);
        }
    }
}

/// Runs processes on the local machine.
pub struct LocalExecutor {
    children: Mutex<HashMap<u32, tokio::process::Child>>,
    grace: Duration,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    /// Sets the time between `SIGTERM` and `SIGKILL`.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn take_child(&self, pid: u32) -> Option<tokio::process::Child> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessExecutor for LocalExecutor {
    async fn run(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
        locale: &str,
    ) -> CollectibleResult<CommandOutput> {
        // stderr joins stdout inside the shell so ordering is preserved.
        let script = format!("exec 2>&1\n{cmd}");
        let mut process = tokio::process::Command::new("sh");
        process
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);
        apply_env(&mut process, locale);

        let mut child = process.spawn().map_err(|e| CollectibleError::ExecFailed {
            cmd: cmd.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        let mut stdout = child.stdout.take().ok_or_else(|| CollectibleError::ExecFailed {
            cmd: cmd.to_string(),
            reason: "stdout was not captured".to_string(),
        })?;

        let collect = async {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((output, status))
        };

        let (output, status) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(result) => result?,
                Err(_) => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                    return Err(CollectibleError::Timeout {
                        cmd: cmd.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => collect.await?,
        };

        if status.code() == Some(SHELL_NOT_FOUND) {
            return Err(CollectibleError::CommandNotFound(cmd.to_string()));
        }
        Ok(CommandOutput {
            output,
            exit_code: status.code(),
        })
    }

    async fn spawn(
        &self,
        cmd: &str,
        locale: &str,
        output: std::fs::File,
    ) -> CollectibleResult<ProcessHandle> {
        let argv = shell_words::split(cmd).map_err(|e| CollectibleError::ExecFailed {
            cmd: cmd.to_string(),
            reason: e.to_string(),
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(CollectibleError::ExecFailed {
                cmd: cmd.to_string(),
                reason: "empty command".to_string(),
            });
        };

        let stderr = output.try_clone()?;
        let mut process = tokio::process::Command::new(program);
        process
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        process.process_group(0);
        apply_env(&mut process, locale);

        let child = process.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CollectibleError::CommandNotFound(program.clone()),
            _ => CollectibleError::ExecFailed {
                cmd: cmd.to_string(),
                reason: e.to_string(),
            },
        })?;
        let pid = child.id().ok_or_else(|| CollectibleError::ExecFailed {
            cmd: cmd.to_string(),
            reason: "process exited before it could be tracked".to_string(),
        })?;
        debug!("Started daemon '{}' (pid {})", cmd, pid);

        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, child);
        Ok(ProcessHandle::new(pid))
    }

    async fn kill_tree(&self, handle: &ProcessHandle) -> CollectibleResult<Option<i32>> {
        let pid = handle.pid();
        let Some(mut child) = self.take_child(pid) else {
            handle.mark_terminated();
            return Ok(None);
        };

        if let Some(status) = child.try_wait()? {
            handle.mark_terminated();
            return Ok(status.code());
        }

        if handle.mark_terminated() {
            #[cfg(unix)]
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            #[cfg(not(unix))]
            child.start_kill()?;
        }

        if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
            warn!("Daemon (pid {}) ignored SIGTERM, killing it", pid);
            #[cfg(unix)]
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            #[cfg(not(unix))]
            child.start_kill()?;
            child.wait().await?;
        }
        Ok(None)
    }

    fn kill_now(&self, handle: &ProcessHandle) {
        if !handle.mark_terminated() {
            return;
        }
        #[cfg(unix)]
        signal_group(handle.pid(), nix::sys::signal::Signal::SIGKILL);
        if let Some(mut child) = self.take_child(handle.pid()) {
            let _ = child.start_kill();
            let _ = child.try_wait();
        }
    }
}

/// Package list from `rpm` or `dpkg-query`, whichever is available.
pub struct LocalPackageManager {
    executor: Arc<dyn ProcessExecutor>,
}

impl LocalPackageManager {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { executor }
    }
}

const LIST_PACKAGES: &str = "if command -v rpm >/dev/null 2>&1; then \
     rpm -qa --qf '%{NAME}-%{VERSION}-%{RELEASE}.%{ARCH}\\n'; \
     else dpkg-query -W -f '${Package}-${Version}\\n'; fi";

#[async_trait]
impl PackageManager for LocalPackageManager {
    async fn list_installed(&self) -> CollectibleResult<BTreeSet<String>> {
        let result = self.executor.run(LIST_PACKAGES, None, "C").await?;
        if result.exit_code != Some(0) {
            return Err(CollectibleError::ExecFailed {
                cmd: "list installed packages".to_string(),
                reason: String::from_utf8_lossy(&result.output).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&result.output)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// The systemd journal through `journalctl`.
pub struct LocalJournal {
    executor: Arc<dyn ProcessExecutor>,
}

impl LocalJournal {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Journal for LocalJournal {
    async fn cursor(&self) -> CollectibleResult<Option<String>> {
        let cmd = "journalctl --quiet --lines 1 --output json";
        let result = self.executor.run(cmd, None, "C").await?;
        if result.exit_code != Some(0) {
            return Err(CollectibleError::ExecFailed {
                cmd: cmd.to_string(),
                reason: String::from_utf8_lossy(&result.output).trim().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&result.output);
        let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        let record: serde_json::Value =
            serde_json::from_str(line).map_err(|e| CollectibleError::ExecFailed {
                cmd: cmd.to_string(),
                reason: format!("unexpected journal record: {e}"),
            })?;
        Ok(record
            .get("__CURSOR")
            .and_then(|c| c.as_str())
            .map(str::to_string))
    }

    async fn since(&self, cursor: &str) -> CollectibleResult<Vec<u8>> {
        let cmd = format!(
            "journalctl --quiet --after-cursor {}",
            shell_words::quote(cursor)
        );
        let result = self.executor.run(&cmd, None, "C").await?;
        if result.exit_code != Some(0) {
            return Err(CollectibleError::ExecFailed {
                cmd,
                reason: String::from_utf8_lossy(&result.output).trim().to_string(),
            });
        }
        Ok(result.output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_combines_output() {
        let executor = LocalExecutor::new();
        let result = executor
            .run("echo out; echo err >&2; exit 3", None, "C")
            .await
            .unwrap();
        assert_eq!(result.output, b"out\nerr\n");
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_run_sets_locale() {
        let executor = LocalExecutor::new();
        let result = executor.run("echo $LC_ALL", None, "C").await.unwrap();
        assert_eq!(result.output, b"C\n");
    }

    #[tokio::test]
    async fn test_run_unknown_command() {
        let executor = LocalExecutor::new();
        let err = executor
            .run("definitely-not-a-command-xyz", None, "C")
            .await
            .unwrap_err();
        assert!(matches!(err, CollectibleError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let executor = LocalExecutor::new();
        let err = executor
            .run("sleep 10", Some(Duration::from_millis(200)), "C")
            .await
            .unwrap_err();
        assert!(matches!(err, CollectibleError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_spawn_and_kill_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("spool");
        let file = std::fs::File::create(&path).unwrap();
        let executor = LocalExecutor::new().with_grace(Duration::from_secs(2));

        let handle = executor
            .spawn("sh -c 'echo ready; exec sleep 30'", "C", file)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(executor.kill_tree(&handle).await.unwrap(), None);
        assert!(handle.is_terminated());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ready\n");

        let pid = nix::unistd::Pid::from_raw(handle.pid() as i32);
        assert!(nix::sys::signal::kill(pid, None).is_err());

        // A second termination is a no-op.
        assert_eq!(executor.kill_tree(&handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = std::fs::File::create(dir.path().join("spool")).unwrap();
        let executor = LocalExecutor::new();
        let err = executor
            .spawn("no-such-profiler-xyz --flag", "C", file)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectibleError::CommandNotFound(_)));
    }
}
