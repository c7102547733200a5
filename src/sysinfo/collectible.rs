//! Producers of the byte streams sysinfo captures into files.
//!
//! A [`Collectible`] is one of a fixed set of kinds. Each yields its bytes as
//! a [`ChunkStream`] of chunks no larger than the requested chunk size, so a
//! large log never has to be held in memory. Two collectibles are equal when
//! they are of the same kind and share their identifying tuple; runtime
//! state (watcher offsets, daemon handles) does not take part, which lets
//! [`CollectibleSet`] deduplicate configuration entries.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use tempfile::NamedTempFile;
use tokio::io::AsyncSeekExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::host::{Host, ProcessHandle};
use crate::layout::{string_to_safe_path, truncate_to_bytes};

/// Default size of the chunks yielded by [`Collectible::collect`].
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Output name of the journal watcher.
pub const JOURNALCTL_NAME: &str = "journalctl";

/// Result type for collectible operations.
pub type CollectibleResult<T> = Result<T, CollectibleError>;

/// Lazily produced bytes of one collectible.
pub type ChunkStream = Pin<Box<dyn Stream<Item = CollectibleResult<Vec<u8>>> + Send>>;

/// Recoverable collection failures.
///
/// None of these abort a collection pass; the pipeline logs them and moves
/// on to the next collectible.
#[derive(Debug, thiserror::Error)]
pub enum CollectibleError {
    #[error("Not logging {} (file not found)", .0.display())]
    NotFound(PathBuf),

    #[error("Not logging {} (lack of permissions)", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Not logging '{0}' (command was not found)")]
    CommandNotFound(String),

    #[error("Command '{cmd}' timed out after {timeout:?}")]
    Timeout { cmd: String, timeout: Duration },

    #[error("Could not execute \"{cmd}\": {reason}")]
    ExecFailed { cmd: String, reason: String },

    #[error("Daemon '{0}' is not running")]
    NotRunning(String),

    #[error("Journal collection skipped (no cursor)")]
    NoCursor,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectibleError {
    /// Failures caused by something simply not being there.
    ///
    /// These are logged at debug level; everything else is a warning.
    pub fn is_absence(&self) -> bool {
        matches!(
            self,
            CollectibleError::NotFound(_)
                | CollectibleError::CommandNotFound(_)
                | CollectibleError::NoCursor
        )
    }

    fn from_open(path: &Path, e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => CollectibleError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                CollectibleError::PermissionDenied(path.to_path_buf())
            }
            _ => CollectibleError::Io(e),
        }
    }
}

/// A shell command whose output is captured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandSpec {
    pub cmd: String,
    pub timeout: Option<Duration>,
    pub locale: String,
}

impl CommandSpec {
    pub fn new(cmd: impl Into<String>, timeout: Option<Duration>, locale: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            timeout,
            locale: locale.into(),
        }
    }
}

/// Appended-bytes tracker for a growing log.
#[derive(Debug, Clone)]
pub struct LogWatcher {
    path: PathBuf,
    inode: Option<u64>,
    size: u64,
}

impl LogWatcher {
    /// Remembers the current inode and size of `path`.
    ///
    /// A file that does not exist yet is watched from its first byte.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (inode, size) = match std::fs::metadata(&path) {
            Ok(meta) => (inode_of(&meta), meta.len()),
            Err(e) => {
                debug!("Watching {} from scratch: {}", path.display(), e);
                (None, 0)
            }
        };
        Self { path, inode, size }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset to read from, updating the remembered position to `meta`.
    fn advance(&mut self, meta: &std::fs::Metadata) -> u64 {
        let inode = inode_of(meta);
        let same_file = inode.is_some() && inode == self.inode;
        let skip = if same_file && meta.len() >= self.size {
            self.size
        } else {
            0
        };
        self.inode = inode;
        self.size = meta.len();
        skip
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Journal records written since construction.
#[derive(Debug, Clone, Default)]
pub struct JournalctlWatcher {
    cursor: Option<String>,
}

impl JournalctlWatcher {
    /// Remembers the journal's current cursor.
    pub async fn new(host: &Host) -> Self {
        let cursor = match host.journal.cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                debug!("Journalctl collection disabled: {}", e);
                None
            }
        };
        Self { cursor }
    }

    pub fn with_cursor(cursor: impl Into<String>) -> Self {
        Self {
            cursor: Some(cursor.into()),
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }
}

/// Lifecycle of a background daemon.
#[derive(Debug, Default)]
pub enum DaemonState {
    #[default]
    Registered,
    Running {
        handle: ProcessHandle,
        spool: NamedTempFile,
    },
    Terminated,
}

/// A long-running command active between sysinfo start and end.
#[derive(Debug)]
pub struct Daemon {
    spec: CommandSpec,
    state: DaemonState,
}

impl Daemon {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            state: DaemonState::Registered,
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// The running process, if any.
    pub fn handle(&self) -> Option<&ProcessHandle> {
        match &self.state {
            DaemonState::Running { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Spawns the daemon, spooling its output to a temp file in `spool_dir`.
    pub async fn run(&mut self, host: &Host, spool_dir: &Path) -> CollectibleResult<ProcessHandle> {
        if !matches!(self.state, DaemonState::Registered) {
            return Err(CollectibleError::ExecFailed {
                cmd: self.spec.cmd.clone(),
                reason: "daemon was already started".to_string(),
            });
        }
        let spool = tempfile::Builder::new()
            .prefix(&format!(
                "{}.",
                truncate_to_bytes(&string_to_safe_path(&self.spec.cmd), 64)
            ))
            .tempfile_in(spool_dir)?;
        let output = spool.reopen()?;
        let handle = host
            .executor
            .spawn(&self.spec.cmd, &self.spec.locale, output)
            .await?;
        self.state = DaemonState::Running {
            handle: handle.clone(),
            spool,
        };
        Ok(handle)
    }

    /// Terminates the daemon and streams what it wrote.
    ///
    /// A failed kill leaves the daemon running with its spool intact, so a
    /// later stop can still collect the output.
    async fn stop(&mut self, host: &Host, chunk_size: usize) -> CollectibleResult<ChunkStream> {
        let DaemonState::Running { handle, .. } = &self.state else {
            return Err(CollectibleError::NotRunning(self.spec.cmd.clone()));
        };
        let handle = handle.clone();
        if let Some(code) = host.executor.kill_tree(&handle).await? {
            warn!(
                "Daemon process '{}' (pid {}) terminated abnormally (code {})",
                self.spec.cmd,
                handle.pid(),
                code
            );
        }
        let DaemonState::Running { spool, .. } =
            std::mem::replace(&mut self.state, DaemonState::Terminated)
        else {
            return Err(CollectibleError::NotRunning(self.spec.cmd.clone()));
        };
        // The open handle keeps the spooled bytes readable after the temp
        // file is unlinked on drop.
        let file = tokio::fs::File::from_std(spool.reopen()?);
        Ok(file_stream(file, chunk_size))
    }
}

/// Identifying tuple of a collectible, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectibleKey {
    Command(CommandSpec),
    Logfile(PathBuf),
    LogWatcher(PathBuf),
    Journalctl,
    Daemon(CommandSpec),
}

/// Something sysinfo can capture into a file.
#[derive(Debug)]
pub enum Collectible {
    Command(CommandSpec),
    Logfile(PathBuf),
    LogWatcher(LogWatcher),
    Journalctl(JournalctlWatcher),
    Daemon(Daemon),
}

impl Collectible {
    pub fn command(cmd: impl Into<String>, timeout: Option<Duration>, locale: impl Into<String>) -> Self {
        Collectible::Command(CommandSpec::new(cmd, timeout, locale))
    }

    pub fn logfile(path: impl Into<PathBuf>) -> Self {
        Collectible::Logfile(path.into())
    }

    pub fn log_watcher(path: impl Into<PathBuf>) -> Self {
        Collectible::LogWatcher(LogWatcher::new(path))
    }

    pub fn daemon(cmd: impl Into<String>, timeout: Option<Duration>, locale: impl Into<String>) -> Self {
        Collectible::Daemon(Daemon::new(CommandSpec::new(cmd, timeout, locale)))
    }

    pub fn key(&self) -> CollectibleKey {
        match self {
            Collectible::Command(spec) => CollectibleKey::Command(spec.clone()),
            Collectible::Logfile(path) => CollectibleKey::Logfile(path.clone()),
            Collectible::LogWatcher(w) => CollectibleKey::LogWatcher(w.path.clone()),
            Collectible::Journalctl(_) => CollectibleKey::Journalctl,
            Collectible::Daemon(d) => CollectibleKey::Daemon(d.spec.clone()),
        }
    }

    /// File name the collected bytes are stored under.
    pub fn name(&self) -> String {
        match self {
            Collectible::Command(spec) => string_to_safe_path(&spec.cmd),
            Collectible::Daemon(d) => string_to_safe_path(&d.spec.cmd),
            Collectible::Logfile(path) => basename(path),
            Collectible::LogWatcher(w) => basename(&w.path),
            Collectible::Journalctl(_) => JOURNALCTL_NAME.to_string(),
        }
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self, Collectible::Daemon(_))
    }

    /// Produces the collectible's bytes.
    ///
    /// For a daemon this terminates the process first.
    pub async fn collect(&mut self, host: &Host, chunk_size: usize) -> CollectibleResult<ChunkStream> {
        let chunk_size = chunk_size.max(1);
        match self {
            Collectible::Command(spec) => {
                let result = host
                    .executor
                    .run(&spec.cmd, spec.timeout, &spec.locale)
                    .await?;
                Ok(bytes_stream(result.output, chunk_size))
            }
            Collectible::Logfile(path) => {
                let path: &Path = path;
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| CollectibleError::from_open(path, e))?;
                Ok(file_stream(file, chunk_size))
            }
            Collectible::LogWatcher(watcher) => {
                let path = watcher.path.clone();
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| CollectibleError::from_open(&path, e))?;
                let skip = watcher.advance(&meta);
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| CollectibleError::from_open(&path, e))?;
                file.seek(SeekFrom::Start(skip)).await?;
                Ok(file_stream(file, chunk_size))
            }
            Collectible::Journalctl(watcher) => {
                let cursor = watcher.cursor.as_deref().ok_or(CollectibleError::NoCursor)?;
                let records = host.journal.since(cursor).await?;
                Ok(bytes_stream(records, chunk_size))
            }
            Collectible::Daemon(daemon) => daemon.stop(host, chunk_size).await,
        }
    }
}

impl PartialEq for Collectible {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Collectible {}

impl Hash for Collectible {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

fn basename(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    string_to_safe_path(&name)
}

fn bytes_stream(data: Vec<u8>, chunk_size: usize) -> ChunkStream {
    let chunks: Vec<CollectibleResult<Vec<u8>>> =
        data.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();
    Box::pin(stream::iter(chunks))
}

fn file_stream(file: tokio::fs::File, chunk_size: usize) -> ChunkStream {
    Box::pin(
        ReaderStream::with_capacity(file, chunk_size)
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(CollectibleError::from)),
    )
}

/// Insertion-ordered, deduplicated collection of collectibles.
#[derive(Debug, Default)]
pub struct CollectibleSet {
    items: Vec<Collectible>,
    keys: HashSet<CollectibleKey>,
}

impl CollectibleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `collectible` unless an equal one is present. Returns whether it
    /// was added.
    pub fn insert(&mut self, collectible: Collectible) -> bool {
        if !self.keys.insert(collectible.key()) {
            return false;
        }
        self.items.push(collectible);
        true
    }

    pub fn contains(&self, key: &CollectibleKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Collectible> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Collectible> {
        self.items.iter_mut()
    }
}
