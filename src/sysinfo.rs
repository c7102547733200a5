//! Before/after system information collection.
//!
//! A [`SysInfo`] captures collectibles into `pre/` when an event (a job or a
//! single test) starts and into `post/` when it ends:
//!
//! ```text
//! <basedir>/
//!   pre/<name>            start-side commands and files
//!   pre/installed_packages
//!   post/<name>           end-side commands, files, watchers, daemon output
//!   post/added_packages
//!   post/removed_packages
//!   profile/              daemon output while the daemons run
//! ```
//!
//! No collectible failure aborts a pass. Daemons started by [`SysInfo::start`]
//! are stopped by [`SysInfo::end`]; a kill fallback is also kept in the
//! pipeline's callback register and in the process-wide
//! [`at_exit`](crate::callback::at_exit) register, so a daemon never
//! outlives the process even when `end` is never reached.

pub mod collectible;
pub mod host;

pub use collectible::{
    ChunkStream, Collectible, CollectibleError, CollectibleKey, CollectibleResult, CollectibleSet,
    CommandSpec, DEFAULT_CHUNK_SIZE, Daemon, DaemonState, JournalctlWatcher, LogWatcher,
};
pub use host::{
    CommandOutput, Host, Journal, LocalExecutor, LocalJournal, LocalPackageManager,
    PackageManager, ProcessExecutor, ProcessHandle,
};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::callback::{CallbackArgs, CallbackFn, CallbackKwargs, CallbackRegister, at_exit};
use crate::config::{CollectiblesConfig, SysInfoCollectConfig};
use crate::layout::SysInfoDirs;
use crate::message::TestStatus;

pub const INSTALLED_PACKAGES: &str = "installed_packages";
pub const ADDED_PACKAGES: &str = "added_packages";
pub const REMOVED_PACKAGES: &str = "removed_packages";

/// Read size when comparing `pre/` and `post/` files.
const COMPARE_BUFFER: usize = 8 * 1024;

/// Entries read from the collectible list files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectibleLists {
    pub commands: Vec<String>,
    pub fail_commands: Vec<String>,
    pub files: Vec<String>,
    pub fail_files: Vec<String>,
    pub profilers: Vec<String>,
}

impl CollectibleLists {
    /// Reads every list file named in `config`.
    pub fn load(config: &CollectiblesConfig) -> Self {
        Self {
            commands: read_list(&config.commands),
            fail_commands: read_list(&config.fail_commands),
            files: read_list(&config.files),
            fail_files: read_list(&config.fail_files),
            profilers: read_list(&config.profilers),
        }
        .normalized()
    }

    /// Drops fail-only entries that are already collected unconditionally.
    pub fn normalized(mut self) -> Self {
        let commands = &self.commands;
        self.fail_commands.retain(|c| !commands.contains(c));
        let files = &self.files;
        self.fail_files.retain(|f| !files.contains(f));
        self
    }
}

/// Reads a list file: one entry per line, `#` comments and blank lines
/// ignored. A missing or unreadable file yields an empty list.
pub fn read_list(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            info!("Collectibles configured by file: {}", path.display());
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect()
        }
        Err(e) => {
            debug!("File {} not used: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Before/after collection for one event.
pub struct SysInfo {
    dirs: SysInfoDirs,
    options: SysInfoCollectConfig,
    host: Host,
    chunk_size: usize,
    start_collectibles: CollectibleSet,
    end_collectibles: CollectibleSet,
    end_fail_collectibles: CollectibleSet,
    installed_packages: Option<BTreeSet<String>>,
    register: CallbackRegister,
    exit_fallbacks: Vec<(CallbackFn, CallbackArgs)>,
}

impl SysInfo {
    /// Builds the collectible sets from `lists`.
    ///
    /// Watchers remember their position here, so only what changes after
    /// construction ends up in `post/`.
    pub async fn new(
        dirs: SysInfoDirs,
        options: SysInfoCollectConfig,
        lists: &CollectibleLists,
        host: Host,
    ) -> Self {
        let timeout = options.timeout();
        let locale = options.locale.clone();
        let mut start_collectibles = CollectibleSet::new();
        let mut end_collectibles = CollectibleSet::new();
        let mut end_fail_collectibles = CollectibleSet::new();

        if options.profiler {
            if lists.profilers.is_empty() {
                info!("Profiler disabled: no profiler commands configured");
            }
            for cmd in &lists.profilers {
                start_collectibles.insert(Collectible::daemon(cmd, timeout, &locale));
            }
        }

        for cmd in &lists.commands {
            start_collectibles.insert(Collectible::command(cmd, timeout, &locale));
            end_collectibles.insert(Collectible::command(cmd, timeout, &locale));
        }
        for cmd in &lists.fail_commands {
            end_fail_collectibles.insert(Collectible::command(cmd, timeout, &locale));
        }
        for file in &lists.files {
            start_collectibles.insert(Collectible::logfile(file));
            end_collectibles.insert(Collectible::logfile(file));
        }
        for file in &lists.fail_files {
            end_fail_collectibles.insert(Collectible::logfile(file));
        }

        match host.syslog_path() {
            Some(path) => {
                end_collectibles.insert(Collectible::log_watcher(path));
            }
            None => debug!(
                "System log file not found (looked for {:?})",
                host.syslog_candidates
            ),
        }
        end_collectibles.insert(Collectible::Journalctl(JournalctlWatcher::new(&host).await));

        let name = format!("SysInfo({})", dirs.basedir.display());
        Self {
            dirs,
            options,
            host,
            chunk_size: DEFAULT_CHUNK_SIZE,
            start_collectibles,
            end_collectibles,
            end_fail_collectibles,
            installed_packages: None,
            register: CallbackRegister::new(name),
            exit_fallbacks: Vec::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn dirs(&self) -> &SysInfoDirs {
        &self.dirs
    }

    pub fn start_collectibles(&self) -> &CollectibleSet {
        &self.start_collectibles
    }

    pub fn end_collectibles(&self) -> &CollectibleSet {
        &self.end_collectibles
    }

    pub fn end_fail_collectibles(&self) -> &CollectibleSet {
        &self.end_fail_collectibles
    }

    /// Collects the start-side set into `pre/` and starts the daemons.
    ///
    /// Returns the number of collectibles that failed.
    pub async fn start(&mut self) -> usize {
        if let Err(e) = self.dirs.create().await {
            warn!("Could not create {}: {}", self.dirs.basedir.display(), e);
            return self.start_collectibles.len();
        }

        let mut failures = 0;
        for collectible in self.start_collectibles.iter_mut() {
            let outcome = match &mut *collectible {
                Collectible::Daemon(daemon) => {
                    match daemon.run(&self.host, &self.dirs.profile_dir).await {
                        Ok(handle) => {
                            let fallback = kill_fallback(&self.host, handle.clone());
                            let args = vec![daemon.spec().cmd.clone(), handle.pid().to_string()];
                            self.register
                                .register(fallback.clone(), args.clone(), CallbackKwargs::new(), true);
                            register_at_exit(&fallback, &args);
                            self.exit_fallbacks.push((fallback, args));
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                other => {
                    collect_into(other, &self.host, &self.dirs.pre_dir, self.chunk_size)
                        .await
                        .map(|_| ())
                }
            };
            if let Err(e) = outcome {
                failures += 1;
                log_failure(collectible, &e);
            }
        }

        if self.options.installed_packages {
            match self.host.packages.list_installed().await {
                Ok(packages) => {
                    let path = self.dirs.pre_dir.join(INSTALLED_PACKAGES);
                    if let Err(e) = write_lines(&path, &packages).await {
                        warn!("Could not write {}: {}", path.display(), e);
                    }
                    self.installed_packages = Some(packages);
                }
                Err(e) => {
                    failures += 1;
                    warn!("Could not list installed packages: {}", e);
                }
            }
        }
        failures
    }

    /// Collects the end-side set into `post/`, adds the fail-only set when
    /// `status` is failing, and stops every daemon.
    ///
    /// Returns the number of collectibles that failed.
    pub async fn end(&mut self, status: Option<TestStatus>) -> usize {
        if let Err(e) = self.dirs.create().await {
            warn!("Could not create {}: {}", self.dirs.basedir.display(), e);
        }

        let mut failures = 0;
        let pre_dir = self.dirs.pre_dir.clone();
        let post_dir = self.dirs.post_dir.clone();
        let optimize = self.options.optimize;

        for collectible in self.end_collectibles.iter_mut() {
            failures +=
                collect_post(collectible, &self.host, &pre_dir, &post_dir, optimize, self.chunk_size)
                    .await;
        }

        if status.is_some_and(|s| s.is_failing()) {
            for collectible in self.end_fail_collectibles.iter_mut() {
                failures +=
                    collect_post(collectible, &self.host, &pre_dir, &post_dir, optimize, self.chunk_size)
                        .await;
            }
        }

        failures += self.stop_daemons(&post_dir).await;
        // Daemons that refused to stop are killed here, then collected from
        // their spool.
        failures += self.register.run();
        failures += self.stop_daemons(&post_dir).await;
        for (fallback, args) in self.exit_fallbacks.drain(..) {
            unregister_at_exit(&fallback, &args);
        }

        if self.options.installed_packages {
            failures += self.log_modified_packages(&post_dir).await;
        }
        failures
    }

    /// Stops every running daemon, writing its output into `post_dir`.
    async fn stop_daemons(&mut self, post_dir: &Path) -> usize {
        let mut failures = 0;
        for collectible in self.start_collectibles.iter_mut() {
            let Collectible::Daemon(daemon) = &*collectible else {
                continue;
            };
            if daemon.handle().is_none() {
                continue;
            }
            if let Err(e) = collect_into(collectible, &self.host, post_dir, self.chunk_size).await {
                failures += 1;
                log_failure(collectible, &e);
            }
        }
        failures
    }

    async fn log_modified_packages(&mut self, post_dir: &Path) -> usize {
        let Some(old) = self.installed_packages.as_ref() else {
            warn!("Package changes not logged: no package list was captured at start");
            return 1;
        };
        let new = match self.host.packages.list_installed().await {
            Ok(packages) => packages,
            Err(e) => {
                warn!("Could not list installed packages: {}", e);
                return 1;
            }
        };
        let added: BTreeSet<String> = new.difference(old).cloned().collect();
        let removed: BTreeSet<String> = old.difference(&new).cloned().collect();

        let mut failures = 0;
        for (name, set) in [(ADDED_PACKAGES, &added), (REMOVED_PACKAGES, &removed)] {
            let path = post_dir.join(name);
            if let Err(e) = write_lines(&path, set).await {
                failures += 1;
                warn!("Could not write {}: {}", path.display(), e);
            }
        }
        self.installed_packages = Some(new);
        failures
    }
}

impl std::fmt::Debug for SysInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysInfo")
            .field("dirs", &self.dirs)
            .field("options", &self.options)
            .field("start_collectibles", &self.start_collectibles.len())
            .field("end_collectibles", &self.end_collectibles.len())
            .field("end_fail_collectibles", &self.end_fail_collectibles.len())
            .finish_non_exhaustive()
    }
}

fn kill_fallback(host: &Host, handle: ProcessHandle) -> CallbackFn {
    let executor = host.executor.clone();
    Arc::new(move |_args, _kwargs| {
        executor.kill_now(&handle);
        Ok(())
    })
}

fn register_at_exit(fallback: &CallbackFn, args: &CallbackArgs) {
    let mut register = at_exit().lock().unwrap_or_else(PoisonError::into_inner);
    register.register(fallback.clone(), args.clone(), BTreeMap::new(), true);
}

fn unregister_at_exit(fallback: &CallbackFn, args: &CallbackArgs) {
    let mut register = at_exit().lock().unwrap_or_else(PoisonError::into_inner);
    register.unregister(fallback, args, &BTreeMap::new());
}

fn log_failure(collectible: &Collectible, e: &CollectibleError) {
    if e.is_absence() {
        debug!("{} ({})", e, collectible.name());
    } else {
        warn!("Collection of {} failed: {}", collectible.name(), e);
    }
}

/// Streams `collectible` into `dir/<name>`.
async fn collect_into(
    collectible: &mut Collectible,
    host: &Host,
    dir: &Path,
    chunk_size: usize,
) -> CollectibleResult<PathBuf> {
    let stream = collectible.collect(host, chunk_size).await?;
    let path = dir.join(collectible.name());
    write_stream(&path, stream).await?;
    Ok(path)
}

/// Writes every chunk of `stream` into `path`. A stream failing midway
/// leaves no file behind.
async fn write_stream(path: &Path, mut stream: ChunkStream) -> CollectibleResult<()> {
    let mut file = tokio::fs::File::create(path).await?;
    let written = async {
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok::<_, CollectibleError>(())
    }
    .await;
    if written.is_err() {
        drop(file);
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Could not remove partial {}: {}", path.display(), e);
        }
    }
    written
}

/// Collects into `post/`, dropping the result when it matches `pre/`.
async fn collect_post(
    collectible: &mut Collectible,
    host: &Host,
    pre_dir: &Path,
    post_dir: &Path,
    optimize: bool,
    chunk_size: usize,
) -> usize {
    let post = match collect_into(collectible, host, post_dir, chunk_size).await {
        Ok(path) => path,
        Err(e) => {
            log_failure(collectible, &e);
            return 1;
        }
    };
    if !optimize {
        return 0;
    }
    let pre = pre_dir.join(collectible.name());
    match same_contents(&pre, &post).await {
        Ok(true) => {
            debug!("Not logging {} (no change detected)", collectible.name());
            if let Err(e) = tokio::fs::remove_file(&post).await {
                warn!("Could not remove {}: {}", post.display(), e);
            }
        }
        Ok(false) => {}
        Err(e) => debug!("Could not compare {} with {}: {}", pre.display(), post.display(), e),
    }
    0
}

async fn same_contents(a: &Path, b: &Path) -> std::io::Result<bool> {
    if !tokio::fs::try_exists(a).await? {
        return Ok(false);
    }
    if tokio::fs::metadata(a).await?.len() != tokio::fs::metadata(b).await?.len() {
        return Ok(false);
    }
    let mut a = BufReader::with_capacity(COMPARE_BUFFER, tokio::fs::File::open(a).await?);
    let mut b = BufReader::with_capacity(COMPARE_BUFFER, tokio::fs::File::open(b).await?);
    loop {
        let left = a.fill_buf().await?;
        let right = b.fill_buf().await?;
        if left.is_empty() || right.is_empty() {
            return Ok(left.is_empty() && right.is_empty());
        }
        let n = left.len().min(right.len());
        if left[..n] != right[..n] {
            return Ok(false);
        }
        a.consume(n);
        b.consume(n);
    }
}

async fn write_lines(path: &Path, lines: &BTreeSet<String>) -> std::io::Result<()> {
    let mut content = lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
    content.push('\n');
    tokio::fs::write(path, content).await
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory host collaborators.

    use std::collections::{BTreeSet, HashMap};
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeExecutor {
        pub outputs: Mutex<HashMap<String, Vec<u8>>>,
        pub runs: Mutex<Vec<String>>,
        pub killed: Mutex<Vec<u32>>,
        /// Pids whose first `kill_tree` failed ("stubborn*" commands).
        pub refused: Mutex<Vec<u32>>,
        spawned: Mutex<HashMap<u32, String>>,
        next_pid: AtomicU32,
    }

    impl FakeExecutor {
        pub fn set_output(&self, cmd: &str, output: &[u8]) {
            self.outputs.lock().unwrap().insert(cmd.to_string(), output.to_vec());
        }
    }

    #[async_trait]
    impl ProcessExecutor for FakeExecutor {
        async fn run(
            &self,
            cmd: &str,
            _timeout: Option<Duration>,
            _locale: &str,
        ) -> CollectibleResult<CommandOutput> {
            self.runs.lock().unwrap().push(cmd.to_string());
            if cmd.starts_with("broken") {
                return Err(CollectibleError::ExecFailed {
                    cmd: cmd.to_string(),
                    reason: "induced failure".to_string(),
                });
            }
            let output = self
                .outputs
                .lock()
                .unwrap()
                .get(cmd)
                .cloned()
                .unwrap_or_else(|| format!("output of {cmd}\n").into_bytes());
            Ok(CommandOutput {
                output,
                exit_code: Some(0),
            })
        }

        async fn spawn(
            &self,
            cmd: &str,
            _locale: &str,
            mut output: std::fs::File,
        ) -> CollectibleResult<ProcessHandle> {
            if cmd.starts_with("broken") {
                return Err(CollectibleError::CommandNotFound(cmd.to_string()));
            }
            writeln!(output, "output of {cmd}")?;
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.spawned.lock().unwrap().insert(pid, cmd.to_string());
            Ok(ProcessHandle::new(pid))
        }

        async fn kill_tree(&self, handle: &ProcessHandle) -> CollectibleResult<Option<i32>> {
            let cmd = self.spawned.lock().unwrap().get(&handle.pid()).cloned().unwrap_or_default();
            if cmd.starts_with("stubborn") {
                let mut refused = self.refused.lock().unwrap();
                if !refused.contains(&handle.pid()) {
                    refused.push(handle.pid());
                    return Err(CollectibleError::ExecFailed {
                        cmd,
                        reason: "induced kill failure".to_string(),
                    });
                }
            }
            if handle.mark_terminated() {
                self.killed.lock().unwrap().push(handle.pid());
            }
            Ok(None)
        }

        fn kill_now(&self, handle: &ProcessHandle) {
            if handle.mark_terminated() {
                self.killed.lock().unwrap().push(handle.pid());
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct FakePackages {
        pub lists: Mutex<Vec<BTreeSet<String>>>,
    }

    #[async_trait]
    impl PackageManager for FakePackages {
        async fn list_installed(&self) -> CollectibleResult<BTreeSet<String>> {
            let mut lists = self.lists.lock().unwrap();
            if lists.len() > 1 {
                Ok(lists.remove(0))
            } else {
                Ok(lists.first().cloned().unwrap_or_default())
            }
        }
    }

    pub(crate) struct FakeJournal;

    #[async_trait]
    impl Journal for FakeJournal {
        async fn cursor(&self) -> CollectibleResult<Option<String>> {
            Ok(Some("s=fake".to_string()))
        }

        async fn since(&self, cursor: &str) -> CollectibleResult<Vec<u8>> {
            Ok(format!("journal after {cursor}\n").into_bytes())
        }
    }

    pub(crate) fn fake_host_with(
        executor: Arc<FakeExecutor>,
        packages: Arc<FakePackages>,
    ) -> Host {
        Host {
            executor,
            packages,
            journal: Arc::new(FakeJournal),
            syslog_candidates: Vec::new(),
        }
    }

    pub(crate) fn fake_host() -> Host {
        fake_host_with(Arc::default(), Arc::default())
    }
}
