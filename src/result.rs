//! Job-level result aggregation and listener dispatch.
//!
//! [`ResultState`] tracks which tests are in progress and how many ended
//! with each status. It never fails: a test finishing without a recorded
//! start, or without a result, is still counted (the latter as `ERROR`).
//!
//! [`ResultEventDispatcher`] forwards lifecycle events to registered
//! [`ResultListener`]s in registration order. A listener returning an error
//! or panicking is logged and skipped; the remaining listeners still run.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error};

use crate::identifier::TestId;
use crate::message::TestStatus;
use crate::task::TaskMetadata;

/// Result type for listener callbacks.
pub type ListenerResult<T> = Result<T, ListenerError>;

/// Errors raised by result listeners.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener '{listener}' failed: {reason}")]
    Failed { listener: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Snapshot of one test as seen by the aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct TestState {
    pub id: TestId,
    pub status: Option<TestStatus>,
    pub time_start: Option<f64>,
    pub time_end: Option<f64>,
    pub time_elapsed: Option<f64>,
    pub fail_reason: Option<String>,
    pub logdir: Option<PathBuf>,
    pub whiteboard: String,
}

impl TestState {
    /// Builds the state from a task's metadata bag.
    pub fn from_metadata(id: &TestId, metadata: &TaskMetadata) -> Self {
        Self {
            id: metadata.name.clone().unwrap_or_else(|| id.clone()),
            status: metadata.status,
            time_start: metadata.time_start,
            time_end: metadata.time_end,
            time_elapsed: metadata.time_elapsed,
            fail_reason: metadata.fail_reason.clone(),
            logdir: metadata.logdir.clone().or_else(|| metadata.task_path.clone()),
            whiteboard: metadata.whiteboard.clone(),
        }
    }
}

/// Read-only view of the aggregator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSnapshot {
    pub counts: BTreeMap<TestStatus, usize>,
    pub total: usize,
    pub in_progress: Vec<TestId>,
    pub tests: Vec<TestState>,
    /// Sum of the elapsed time of every finished test.
    pub time: f64,
}

impl ResultSnapshot {
    pub fn count(&self, status: TestStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Number of tests that ended with a failing status.
    pub fn failures(&self) -> usize {
        self.counts
            .iter()
            .filter(|(status, _)| status.is_failing())
            .map(|(_, count)| count)
            .sum()
    }

    pub fn passed(&self) -> bool {
        self.failures() == 0
    }
}

#[derive(Debug, Default)]
struct Inner {
    counts: BTreeMap<TestStatus, usize>,
    in_progress: BTreeMap<String, TestState>,
    finished: Vec<TestState>,
}

/// Per-status counters plus the set of tests currently running.
#[derive(Debug, Default)]
pub struct ResultState {
    inner: Mutex<Inner>,
}

impl ResultState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `state` as in progress under `key`.
    pub fn start_test(&self, key: &str, state: TestState) {
        debug!("Test {} started", state.id);
        self.lock().in_progress.insert(key.to_string(), state);
    }

    /// Finalizes the test under `key` and returns the recorded status.
    ///
    /// A missing status is recorded as `ERROR`.
    pub fn check_test(&self, key: &str, mut state: TestState) -> TestStatus {
        let status = *state.status.get_or_insert(TestStatus::Error);
        let mut inner = self.lock();
        inner.in_progress.remove(key);
        *inner.counts.entry(status).or_insert(0) += 1;
        inner.finished.push(state);
        status
    }

    /// Finalizes every in-progress test with `status` and `reason`.
    ///
    /// Returns the states that were finalized.
    pub fn abort_in_progress(&self, status: TestStatus, reason: &str) -> Vec<TestState> {
        let mut inner = self.lock();
        let pending = std::mem::take(&mut inner.in_progress);
        let mut aborted = Vec::with_capacity(pending.len());
        for (_, mut state) in pending {
            state.status = Some(status);
            state.fail_reason.get_or_insert_with(|| reason.to_string());
            *inner.counts.entry(status).or_insert(0) += 1;
            inner.finished.push(state.clone());
            aborted.push(state);
        }
        aborted
    }

    pub fn is_in_progress(&self, key: &str) -> bool {
        self.lock().in_progress.contains_key(key)
    }

    pub fn snapshot(&self) -> ResultSnapshot {
        let inner = self.lock();
        ResultSnapshot {
            counts: inner.counts.clone(),
            total: inner.counts.values().sum(),
            in_progress: inner.in_progress.values().map(|s| s.id.clone()).collect(),
            tests: inner.finished.clone(),
            time: inner.finished.iter().filter_map(|s| s.time_elapsed).sum(),
        }
    }
}

/// Lifecycle events listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResultEvent {
    StartTest,
    EndTest,
}

impl ResultEvent {
    pub const ALL: [ResultEvent; 2] = [ResultEvent::StartTest, ResultEvent::EndTest];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultEvent::StartTest => "start_test",
            ResultEvent::EndTest => "end_test",
        }
    }
}

/// Job-level facts handed to every listener call.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub job_id: String,
    pub logdir: PathBuf,
}

/// Receives test lifecycle events.
#[async_trait]
pub trait ResultListener: Send + Sync {
    fn name(&self) -> &str;

    async fn start_test(&self, _ctx: &EventContext, _state: &TestState) -> ListenerResult<()> {
        Ok(())
    }

    async fn end_test(&self, _ctx: &EventContext, _state: &TestState) -> ListenerResult<()> {
        Ok(())
    }
}

/// Ordered fan-out of lifecycle events to listeners.
#[derive(Default)]
pub struct ResultEventDispatcher {
    listeners: BTreeMap<ResultEvent, Vec<Arc<dyn ResultListener>>>,
}

impl ResultEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to a single event.
    pub fn register(&mut self, event: ResultEvent, listener: Arc<dyn ResultListener>) {
        self.listeners.entry(event).or_default().push(listener);
    }

    /// Subscribes `listener` to every event.
    pub fn register_all(&mut self, listener: Arc<dyn ResultListener>) {
        for event in ResultEvent::ALL {
            self.register(event, listener.clone());
        }
    }

    pub fn listeners(&self, event: ResultEvent) -> usize {
        self.listeners.get(&event).map_or(0, Vec::len)
    }

    /// Invokes `event` on each subscribed listener in order.
    ///
    /// Returns the number of listeners that failed.
    pub async fn map_method(&self, event: ResultEvent, ctx: &EventContext, state: &TestState) -> usize {
        let Some(listeners) = self.listeners.get(&event) else {
            return 0;
        };
        let mut failures = 0;
        for listener in listeners {
            let call = async {
                match event {
                    ResultEvent::StartTest => listener.start_test(ctx, state).await,
                    ResultEvent::EndTest => listener.end_test(ctx, state).await,
                }
            };
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(
                        "Listener '{}' failed on {} for {}: {}",
                        listener.name(),
                        event.as_str(),
                        state.id,
                        e
                    );
                }
                Err(_) => {
                    failures += 1;
                    error!(
                        "Listener '{}' panicked on {} for {}",
                        listener.name(),
                        event.as_str(),
                        state.id
                    );
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for ResultEventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: BTreeMap<&str, Vec<&str>> = self
            .listeners
            .iter()
            .map(|(event, ls)| (event.as_str(), ls.iter().map(|l| l.name()).collect()))
            .collect();
        f.debug_struct("ResultEventDispatcher")
            .field("listeners", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(uid: u32, status: Option<TestStatus>) -> TestState {
        TestState {
            id: TestId::new(uid, "t"),
            status,
            time_start: Some(1.0),
            time_end: Some(2.5),
            time_elapsed: Some(1.5),
            fail_reason: None,
            logdir: None,
            whiteboard: String::new(),
        }
    }

    fn ctx() -> EventContext {
        EventContext {
            job_id: "job".into(),
            logdir: PathBuf::from("/tmp/job"),
        }
    }

    #[test]
    fn test_counts_follow_finished_tests() {
        let results = ResultState::new();
        results.start_test("1-t", state(1, None));
        results.start_test("2-t", state(2, None));
        assert!(results.is_in_progress("1-t"));

        assert_eq!(results.check_test("1-t", state(1, Some(TestStatus::Pass))), TestStatus::Pass);
        assert_eq!(results.check_test("2-t", state(2, None)), TestStatus::Error);

        let snapshot = results.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.count(TestStatus::Pass), 1);
        assert_eq!(snapshot.count(TestStatus::Error), 1);
        assert!(snapshot.in_progress.is_empty());
        assert_eq!(snapshot.failures(), 1);
        assert!((snapshot.time - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_check_without_start_still_counts() {
        let results = ResultState::new();
        results.check_test("9-t", state(9, Some(TestStatus::Skip)));
        let snapshot = results.snapshot();
        assert_eq!(snapshot.total, 1);
        assert!(snapshot.passed());
    }

    #[test]
    fn test_abort_in_progress() {
        let results = ResultState::new();
        results.start_test("1-t", state(1, None));
        let aborted = results.abort_in_progress(TestStatus::Error, "never finished");
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].fail_reason.as_deref(), Some("never finished"));
        assert_eq!(results.snapshot().count(TestStatus::Error), 1);
    }

    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResultListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn end_test(&self, _ctx: &EventContext, state: &TestState) -> ListenerResult<()> {
            self.seen.lock().unwrap().push(state.id.to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ResultListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn end_test(&self, _ctx: &EventContext, _state: &TestState) -> ListenerResult<()> {
            Err(ListenerError::Failed {
                listener: "failing".into(),
                reason: "boom".into(),
            })
        }
    }

    struct Panicking;

    #[async_trait]
    impl ResultListener for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn end_test(&self, _ctx: &EventContext, _state: &TestState) -> ListenerResult<()> {
            panic!("listener bug")
        }
    }

    #[tokio::test]
    async fn test_dispatcher_isolates_failing_listeners() {
        let recorder = Arc::new(Recorder {
            name: "recorder".into(),
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = ResultEventDispatcher::new();
        dispatcher.register(ResultEvent::EndTest, Arc::new(Failing));
        dispatcher.register(ResultEvent::EndTest, Arc::new(Panicking));
        dispatcher.register_all(recorder.clone());

        let failures = dispatcher
            .map_method(ResultEvent::EndTest, &ctx(), &state(1, Some(TestStatus::Pass)))
            .await;
        assert_eq!(failures, 2);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["1-t".to_string()]);

        assert_eq!(dispatcher.listeners(ResultEvent::StartTest), 1);
        let failures = dispatcher
            .map_method(ResultEvent::StartTest, &ctx(), &state(2, None))
            .await;
        assert_eq!(failures, 0);
    }
}
