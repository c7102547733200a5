//! Routing of runner messages to their side effects.
//!
//! A [`HandlerTree`] maps each message to a [`DispatchKey`] and runs the
//! handlers registered for it, in registration order:
//!
//! ```text
//! started            -> StartHandler, [SysInfoHandler]
//! finished           -> FinishHandler
//! running/log        -> StreamHandler([stdlog])
//! running/stdout     -> StreamHandler([stdout] + stdout file)
//! running/stderr     -> StreamHandler([stderr] + stderr file)
//! running/whiteboard -> WhiteboardHandler
//! running/output     -> OutputHandler
//! running/file       -> FileHandler
//! ```
//!
//! Unknown statuses and running types are ignored. A handler error or panic
//! is logged with the task and the message summary, and dispatch carries on
//! with the next handler and the next message.

pub mod finish;
pub mod running;
pub mod start;
pub mod sysinfo;

pub use finish::FinishHandler;
pub use running::{FileHandler, OutputHandler, StreamHandler, WhiteboardHandler};
pub use start::StartHandler;
pub use sysinfo::SysInfoHandler;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::config::EarlyMessagePolicy;
use crate::identifier::IdentifierError;
use crate::layout::{JobLayout, LayoutError};
use crate::message::{Message, MessageError, RunningKind};
use crate::result::{EventContext, ResultEventDispatcher, ResultState};
use crate::task::Task;

/// Result type for message handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Errors raised while handling one message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("task {task} has no {field}")]
    MissingMetadata { task: String, field: &'static str },

    #[error(transparent)]
    Decode(#[from] MessageError),
}

impl HandlerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HandlerError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn missing(task: &str, field: &'static str) -> Self {
        HandlerError::MissingMetadata {
            task: task.to_string(),
            field,
        }
    }
}

/// Job-level state every handler may read.
pub struct HandlerContext<'a> {
    pub layout: &'a JobLayout,
    pub job_id: &'a str,
    pub results: &'a ResultState,
    pub listeners: &'a ResultEventDispatcher,
    pub early_messages: EarlyMessagePolicy,
}

impl HandlerContext<'_> {
    pub fn event_context(&self) -> EventContext {
        EventContext {
            job_id: self.job_id.to_string(),
            logdir: self.layout.logdir().to_path_buf(),
        }
    }
}

/// One side effect of a message.
#[async_trait]
pub trait MessageHandler: Send {
    fn name(&self) -> &'static str;

    async fn handle(
        &mut self,
        ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()>;

    /// Releases whatever the handler keeps for `key` once the task is done.
    async fn finish_task(
        &mut self,
        _ctx: &HandlerContext<'_>,
        _key: &str,
        _task: &mut dyn Task,
    ) -> HandlerResult<()> {
        Ok(())
    }
}

/// Dispatch table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchKey {
    Started,
    Running(RunningKind),
    Finished,
}

impl DispatchKey {
    /// `None` for messages the pipeline does not know.
    pub fn of(message: &Message) -> Option<Self> {
        match message {
            Message::Started { .. } => Some(DispatchKey::Started),
            Message::Running { event, .. } => event.kind().map(DispatchKey::Running),
            Message::Finished(_) => Some(DispatchKey::Finished),
            Message::Unknown { .. } => None,
        }
    }
}

/// Ordered lists of handlers per dispatch key.
#[derive(Default)]
pub struct HandlerTree {
    handlers: BTreeMap<DispatchKey, Vec<Box<dyn MessageHandler>>>,
}

impl HandlerTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard tree: start, finish, and one handler per running type.
    pub fn with_defaults() -> Self {
        let mut tree = Self::new();
        tree.register(DispatchKey::Started, Box::new(StartHandler));
        tree.register(DispatchKey::Finished, Box::new(FinishHandler));
        tree.register(
            DispatchKey::Running(RunningKind::Log),
            Box::new(StreamHandler::log()),
        );
        tree.register(
            DispatchKey::Running(RunningKind::Stdout),
            Box::new(StreamHandler::stdout()),
        );
        tree.register(
            DispatchKey::Running(RunningKind::Stderr),
            Box::new(StreamHandler::stderr()),
        );
        tree.register(
            DispatchKey::Running(RunningKind::Whiteboard),
            Box::new(WhiteboardHandler),
        );
        tree.register(
            DispatchKey::Running(RunningKind::Output),
            Box::new(OutputHandler),
        );
        tree.register(DispatchKey::Running(RunningKind::File), Box::new(FileHandler));
        tree
    }

    /// Appends `handler` to the list for `key`.
    pub fn register(&mut self, key: DispatchKey, handler: Box<dyn MessageHandler>) {
        self.handlers.entry(key).or_default().push(handler);
    }

    /// Names of the handlers registered for `key`, in dispatch order.
    pub fn handlers(&self, key: DispatchKey) -> Vec<&'static str> {
        self.handlers
            .get(&key)
            .map(|list| list.iter().map(|h| h.name()).collect())
            .unwrap_or_default()
    }

    /// Runs every handler for `message`. Returns the number that failed.
    pub async fn dispatch(
        &mut self,
        ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> usize {
        let Some(dispatch_key) = DispatchKey::of(message) else {
            debug!("Ignoring {} message for task {}", message.summary(), key);
            return 0;
        };

        if dispatch_key != DispatchKey::Started && !task.metadata().is_started() {
            match ctx.early_messages {
                EarlyMessagePolicy::Drop => {
                    warn!(
                        "Dropping {} message for task {} received before 'started'",
                        message.summary(),
                        key
                    );
                    return 0;
                }
                EarlyMessagePolicy::Create => {
                    warn!(
                        "Task {} sent {} before 'started', creating its directory",
                        key,
                        message.summary()
                    );
                    if let Err(e) = start::provision(ctx, key, task, None).await {
                        error!("Could not provision task {}: {}", key, e);
                        return 1;
                    }
                }
            }
        }

        let mut failures = 0;
        if let Some(handlers) = self.handlers.get_mut(&dispatch_key) {
            for handler in handlers.iter_mut() {
                let name = handler.name();
                let outcome = AssertUnwindSafe(handler.handle(ctx, key, &mut *task, message))
                    .catch_unwind()
                    .await;
                failures += report(name, key, &message.summary(), outcome);
            }
        }

        if dispatch_key == DispatchKey::Finished {
            failures += self.finish_task(ctx, key, task).await;
        }
        failures
    }

    /// Runs every handler's [`MessageHandler::finish_task`] for `key`.
    pub async fn finish_task(
        &mut self,
        ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
    ) -> usize {
        let mut failures = 0;
        for handler in self.handlers.values_mut().flatten() {
            let name = handler.name();
            let outcome = AssertUnwindSafe(handler.finish_task(ctx, key, &mut *task))
                .catch_unwind()
                .await;
            failures += report(name, key, "finish", outcome);
        }
        failures
    }
}

fn report(
    handler: &str,
    key: &str,
    summary: &str,
    outcome: std::thread::Result<HandlerResult<()>>,
) -> usize {
    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("{} failed on {} for task {}: {}", handler, summary, key, e);
            1
        }
        Err(_) => {
            error!("{} panicked on {} for task {}", handler, summary, key);
            1
        }
    }
}

impl std::fmt::Debug for HandlerTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: BTreeMap<&DispatchKey, Vec<&str>> = self
            .handlers
            .iter()
            .map(|(key, list)| (key, list.iter().map(|h| h.name()).collect()))
            .collect();
        f.debug_struct("HandlerTree").field("handlers", &names).finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Job-level state for driving handlers without a job.
    pub(crate) struct Fixture {
        pub layout: JobLayout,
        pub results: ResultState,
        pub listeners: ResultEventDispatcher,
        pub early_messages: EarlyMessagePolicy,
    }

    impl Fixture {
        pub fn new(logdir: &std::path::Path) -> Self {
            Self {
                layout: JobLayout::new(logdir),
                results: ResultState::new(),
                listeners: ResultEventDispatcher::new(),
                early_messages: EarlyMessagePolicy::Create,
            }
        }

        pub fn ctx(&self) -> HandlerContext<'_> {
            HandlerContext {
                layout: &self.layout,
                job_id: "job",
                results: &self.results,
                listeners: &self.listeners,
                early_messages: self.early_messages,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use crate::identifier::TestId;
    use crate::message::{Payload, RunningEvent, TestStatus};
    use crate::task::{Runnable, RuntimeTask};
    use tempfile::TempDir;

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        fn name(&self) -> &'static str {
            "Failing"
        }

        async fn handle(
            &mut self,
            _ctx: &HandlerContext<'_>,
            key: &str,
            _task: &mut dyn Task,
            _message: &Message,
        ) -> HandlerResult<()> {
            Err(HandlerError::missing(key, "anything"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        fn name(&self) -> &'static str {
            "Panicking"
        }

        async fn handle(
            &mut self,
            _ctx: &HandlerContext<'_>,
            _key: &str,
            _task: &mut dyn Task,
            _message: &Message,
        ) -> HandlerResult<()> {
            panic!("handler bug")
        }
    }

    fn task() -> RuntimeTask {
        RuntimeTask::new(TestId::new(1, "t"), Runnable::default())
    }

    #[test]
    fn test_default_tree_layout() {
        let tree = HandlerTree::with_defaults();
        assert_eq!(tree.handlers(DispatchKey::Started), vec!["StartHandler"]);
        assert_eq!(tree.handlers(DispatchKey::Finished), vec!["FinishHandler"]);
        for kind in RunningKind::ALL {
            assert_eq!(tree.handlers(DispatchKey::Running(kind)).len(), 1);
        }
    }

    #[test]
    fn test_unknown_messages_have_no_key() {
        assert_eq!(
            DispatchKey::of(&Message::Unknown {
                status: "paused".into()
            }),
            None
        );
        let event = RunningEvent::Unknown {
            kind: "video".into(),
        };
        assert_eq!(DispatchKey::of(&Message::running(1.0, event)), None);
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_dispatch() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut tree = HandlerTree::with_defaults();
        tree.register(DispatchKey::Started, Box::new(Failing));
        tree.register(DispatchKey::Started, Box::new(Panicking));
        let mut task = task();

        let failures = tree
            .dispatch(&fixture.ctx(), "1-t", &mut task, &Message::started(1.0))
            .await;
        assert_eq!(failures, 2);
        assert!(task.metadata().is_started());

        let failures = tree
            .dispatch(
                &fixture.ctx(),
                "1-t",
                &mut task,
                &Message::running(1.1, RunningEvent::Stdout(Payload::raw("ok\n"))),
            )
            .await;
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn test_early_message_creates_task() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut tree = HandlerTree::with_defaults();
        let mut task = task();

        let message = Message::running(1.0, RunningEvent::Log(Payload::raw("early\n")));
        assert_eq!(tree.dispatch(&fixture.ctx(), "1-t", &mut task, &message).await, 0);

        let task_path = task.metadata().task_path.clone().unwrap();
        assert_eq!(
            std::fs::read_to_string(task_path.join("debug.log")).unwrap(),
            "[stdlog] early\n"
        );
        assert_eq!(task.metadata().time_start, None);
    }

    #[tokio::test]
    async fn test_early_message_dropped_by_policy() {
        let dir = TempDir::new().unwrap();
        let mut fixture = Fixture::new(dir.path());
        fixture.early_messages = EarlyMessagePolicy::Drop;
        let mut tree = HandlerTree::with_defaults();
        let mut task = task();

        let message = Message::finished(2.0, TestStatus::Pass);
        assert_eq!(tree.dispatch(&fixture.ctx(), "1-t", &mut task, &message).await, 0);
        assert!(!task.metadata().is_started());
        assert_eq!(fixture.results.snapshot().total, 0);
        assert!(!dir.path().join("test-results").exists());
    }
}
