//! The job: one run of many tasks.
//!
//! A [`Job`] owns everything with job scope: the artifact layout, the task
//! store, the handler tree, the result aggregator with its listeners, the
//! job-level sysinfo, and a cleanup register.
//!
//! ```text
//! Job::new       -> logdir/, test-results/, sysinfo/{pre,post,profile}/
//! pre_tests      -> sysinfo start
//! process_*      -> handler tree, one message at a time
//! post_tests     -> unfinished tests marked ERROR, residual output flushed,
//!                   sysinfo end, cleanups, results.json + results.xml
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, info, warn};

use crate::callback::CallbackRegister;
use crate::config::{Config, EarlyMessagePolicy};
use crate::handler::{DispatchKey, HandlerContext, HandlerTree, SysInfoHandler};
use crate::layout::{JobLayout, RESULTS_JSON, RESULTS_XML};
use crate::message::{Envelope, Message, TestStatus};
use crate::report::{JobReport, JUnitReport};
use crate::result::{ResultEvent, ResultEventDispatcher, ResultListener, ResultSnapshot, ResultState};
use crate::sysinfo::{CollectibleLists, Host, SysInfo};
use crate::task::{RuntimeTask, Task, TaskStore};

/// Fail reason of tests still running when the job ends.
pub const NOT_FINISHED_REASON: &str = "Test did not finish before the end of the job";

/// Counters of one [`Job::replay`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub messages: usize,
    pub invalid: usize,
    pub handler_failures: usize,
}

/// A job consuming runner messages.
pub struct Job {
    unique_id: String,
    config: Config,
    layout: JobLayout,
    tasks: TaskStore,
    handlers: HandlerTree,
    results: ResultState,
    listeners: ResultEventDispatcher,
    junit: Arc<JUnitReport>,
    sysinfo: Option<SysInfo>,
    callbacks: CallbackRegister,
}

impl Job {
    /// Creates the job and its directories, reading the collectible lists
    /// named in the configuration.
    pub async fn new(config: Config, host: Host) -> anyhow::Result<Self> {
        let lists = if config.sysinfo.collect.enabled || config.sysinfo.collect.per_test {
            CollectibleLists::load(&config.sysinfo.collectibles)
        } else {
            CollectibleLists::default()
        };
        Self::with_lists(config, host, lists).await
    }

    /// Like [`Job::new`] with explicit collectible lists.
    pub async fn with_lists(
        config: Config,
        host: Host,
        lists: CollectibleLists,
    ) -> anyhow::Result<Self> {
        let unique_id = config
            .job
            .unique_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let layout = JobLayout::new(&config.job.logdir);
        layout
            .create()
            .await
            .with_context(|| format!("Failed to create {}", layout.logdir().display()))?;

        let collect = &config.sysinfo.collect;
        let lists = Arc::new(lists);
        let mut handlers = HandlerTree::with_defaults();
        if collect.per_test {
            handlers.register(
                DispatchKey::Started,
                Box::new(SysInfoHandler::new(collect.clone(), lists.clone(), host.clone())),
            );
        }

        let sysinfo = if collect.enabled {
            let dirs = layout.sysinfo_dirs();
            dirs.create()
                .await
                .with_context(|| format!("Failed to create {}", dirs.basedir.display()))?;
            Some(SysInfo::new(dirs, collect.clone(), &lists, host).await)
        } else {
            None
        };

        let junit = Arc::new(JUnitReport::new());
        let mut listeners = ResultEventDispatcher::new();
        listeners.register(ResultEvent::EndTest, junit.clone());

        info!("Job {} logging to {}", unique_id, layout.logdir().display());
        Ok(Self {
            callbacks: CallbackRegister::new(format!("Job({unique_id})")),
            unique_id,
            config,
            layout,
            tasks: TaskStore::new(),
            handlers,
            results: ResultState::new(),
            listeners,
            junit,
            sysinfo,
        })
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    pub fn results(&self) -> &ResultState {
        &self.results
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerTree {
        &mut self.handlers
    }

    /// Cleanups run by [`Job::post_tests`].
    pub fn callbacks_mut(&mut self) -> &mut CallbackRegister {
        &mut self.callbacks
    }

    /// Subscribes `listener` to `event`, or to every event when `None`.
    pub fn add_listener(&mut self, event: Option<ResultEvent>, listener: Arc<dyn ResultListener>) {
        match event {
            Some(event) => self.listeners.register(event, listener),
            None => self.listeners.register_all(listener),
        }
    }

    /// Registers a task; returns the key its messages are addressed with.
    pub fn add_task(&mut self, task: RuntimeTask) -> String {
        self.tasks.insert(task)
    }

    /// Starts job-level sysinfo collection.
    pub async fn pre_tests(&mut self) -> usize {
        match self.sysinfo.as_mut() {
            Some(sysinfo) => sysinfo.start().await,
            None => 0,
        }
    }

    /// Handles one message for the task registered under `task_id`.
    ///
    /// Unknown ids get a default test task. A second `finished` for the same
    /// task is dropped. Returns the number of handler failures.
    pub async fn process_message(&mut self, task_id: &str, message: &Message) -> usize {
        let task = self.tasks.get_or_create(task_id);
        if matches!(message, Message::Finished(_)) && task.metadata().is_finished() {
            warn!("Dropping duplicate 'finished' message for task {}", task_id);
            return 0;
        }

        let ctx = HandlerContext {
            layout: &self.layout,
            job_id: &self.unique_id,
            results: &self.results,
            listeners: &self.listeners,
            early_messages: self.config.job.early_messages,
        };
        self.handlers.dispatch(&ctx, task_id, task, message).await
    }

    /// Handles a decoded message; messages without a task are dropped.
    pub async fn process_envelope(&mut self, envelope: &Envelope) -> usize {
        match &envelope.task {
            Some(task_id) => self.process_message(task_id, &envelope.message).await,
            None => {
                warn!(
                    "Dropping {} message without a task",
                    envelope.message.summary()
                );
                0
            }
        }
    }

    /// Feeds every JSON line of `reader` to [`Job::process_envelope`].
    ///
    /// Blank lines are skipped; lines that are not UTF-8 or not a message are
    /// logged and counted. Only a failing reader aborts the replay.
    pub async fn replay<R>(&mut self, reader: R) -> anyhow::Result<ReplayStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = ReplayStats::default();
        let mut lines = SplitStream::new(reader.split(b'\n'));
        let mut number = 0;
        while let Some(line) = lines.next().await {
            number += 1;
            let line = line.with_context(|| format!("Failed to read message line {number}"))?;
            let line = match String::from_utf8(line) {
                Ok(line) => line,
                Err(e) => {
                    stats.invalid += 1;
                    warn!("Skipping message line {}: {}", number, e);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Envelope::decode_line(&line) {
                Ok(envelope) => {
                    stats.messages += 1;
                    stats.handler_failures += self.process_envelope(&envelope).await;
                }
                Err(e) => {
                    stats.invalid += 1;
                    warn!("Skipping message line {}: {}", number, e);
                }
            }
        }
        Ok(stats)
    }

    /// Closes the job and writes its result files.
    pub async fn post_tests(&mut self) -> anyhow::Result<ResultSnapshot> {
        let ctx = HandlerContext {
            layout: &self.layout,
            job_id: &self.unique_id,
            results: &self.results,
            listeners: &self.listeners,
            early_messages: EarlyMessagePolicy::Create,
        };

        for (key, task) in self.tasks.iter_mut() {
            if task.is_test() && ctx.results.is_in_progress(key) {
                let metadata = task.metadata_mut();
                metadata.status = Some(TestStatus::Error);
                metadata.fail_reason = Some(NOT_FINISHED_REASON.to_string());
            }
        }
        let aborted = self
            .results
            .abort_in_progress(TestStatus::Error, NOT_FINISHED_REASON);
        let event_ctx = ctx.event_context();
        for state in &aborted {
            warn!("Test {} did not finish, recorded as ERROR", state.id);
            self.listeners
                .map_method(ResultEvent::EndTest, &event_ctx, state)
                .await;
        }

        for (key, task) in self.tasks.iter_mut() {
            self.handlers.finish_task(&ctx, key, task).await;
        }

        let snapshot = self.results.snapshot();
        if let Some(sysinfo) = self.sysinfo.as_mut() {
            let status = if snapshot.passed() {
                TestStatus::Pass
            } else {
                TestStatus::Fail
            };
            let failures = sysinfo.end(Some(status)).await;
            debug!("Job sysinfo ended with {} failures", failures);
        }
        self.callbacks.run();

        JobReport::new(&self.unique_id, self.layout.logdir(), &snapshot)
            .write(&self.layout.logdir().join(RESULTS_JSON))?;
        self.junit
            .write(&self.layout.logdir().join(RESULTS_XML), &self.unique_id)?;
        Ok(snapshot)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("unique_id", &self.unique_id)
            .field("logdir", &self.layout.logdir())
            .field("tasks", &self.tasks.len())
            .field("handlers", &self.handlers)
            .field("sysinfo", &self.sysinfo)
            .finish_non_exhaustive()
    }
}
