//! The `finished` handler.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::{HandlerContext, HandlerResult, MessageHandler};
use crate::message::Message;
use crate::result::{ResultEvent, TestState};
use crate::task::Task;

/// Completes the task metadata and reports the outcome.
///
/// The elapsed time comes from the task-origin clock only: the `finished`
/// time minus the `started` time. A task started lazily has no start time
/// and therefore no elapsed time.
#[derive(Debug, Default)]
pub struct FinishHandler;

#[async_trait]
impl MessageHandler for FinishHandler {
    fn name(&self) -> &'static str {
        "FinishHandler"
    }

    async fn handle(
        &mut self,
        ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()> {
        let Message::Finished(finished) = message else {
            return Ok(());
        };

        let metadata = task.metadata_mut();
        metadata.time_end = Some(finished.time);
        metadata.actual_time_end = Some(Utc::now());
        metadata.time_elapsed = metadata.time_start.map(|start| finished.time - start);
        metadata.logdir = metadata.task_path.clone();
        metadata.status = finished.result;
        metadata.fail_reason = finished.fail_reason.clone();
        metadata
            .extra
            .extend(finished.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(elapsed) = metadata.time_elapsed.filter(|e| *e < 0.0) {
            warn!("Task {} finished {:.3}s before it started", key, -elapsed);
        }

        if !task.is_test() {
            return Ok(());
        }
        let id = task.identifier().clone();
        let mut state = TestState::from_metadata(&id, task.metadata());
        let status = ctx.results.check_test(key, state.clone());
        state.status = Some(status);
        task.metadata_mut().status = Some(status);
        debug!("Test {} ended with {}", id, status);

        ctx.listeners
            .map_method(ResultEvent::EndTest, &ctx.event_context(), &state)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::StartHandler;
    use super::super::testing::Fixture;
    use super::*;
    use crate::identifier::TestId;
    use crate::message::{Finished, TestStatus};
    use crate::result::{EventContext, ListenerResult, ResultListener};
    use crate::task::{Runnable, RuntimeTask};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        ended: Mutex<Vec<(String, Option<TestStatus>)>>,
    }

    #[async_trait]
    impl ResultListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn end_test(&self, _ctx: &EventContext, state: &TestState) -> ListenerResult<()> {
            self.ended
                .lock()
                .unwrap()
                .push((state.id.to_string(), state.status));
            Ok(())
        }
    }

    async fn started(fixture: &Fixture, time: f64) -> RuntimeTask {
        let mut task = RuntimeTask::new(TestId::new(1, "t"), Runnable::default());
        StartHandler
            .handle(&fixture.ctx(), "1-t", &mut task, &Message::started(time))
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn test_finish_computes_elapsed_and_counts() {
        let dir = TempDir::new().unwrap();
        let mut fixture = Fixture::new(dir.path());
        let recorder = Arc::new(Recorder::default());
        fixture.listeners.register(ResultEvent::EndTest, recorder.clone());
        let mut task = started(&fixture, 100.0).await;

        let message = Message::Finished(Finished {
            time: 100.5,
            result: Some(TestStatus::Fail),
            fail_reason: Some("assertion".into()),
            extra: [("returncode".to_string(), json!(1))].into_iter().collect(),
        });
        FinishHandler
            .handle(&fixture.ctx(), "1-t", &mut task, &message)
            .await
            .unwrap();

        let metadata = task.metadata();
        assert_eq!(metadata.time_elapsed, Some(0.5));
        assert_eq!(metadata.status, Some(TestStatus::Fail));
        assert_eq!(metadata.logdir, metadata.task_path);
        assert_eq!(metadata.extra["returncode"], json!(1));

        let snapshot = fixture.results.snapshot();
        assert_eq!(snapshot.count(TestStatus::Fail), 1);
        assert!(snapshot.in_progress.is_empty());
        assert_eq!(snapshot.tests[0].fail_reason.as_deref(), Some("assertion"));
        assert_eq!(
            *recorder.ended.lock().unwrap(),
            vec![("1-t".to_string(), Some(TestStatus::Fail))]
        );
    }

    #[tokio::test]
    async fn test_missing_result_is_recorded_as_error() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture, 1.0).await;

        let message = Message::Finished(Finished {
            time: 2.0,
            ..Default::default()
        });
        FinishHandler
            .handle(&fixture.ctx(), "1-t", &mut task, &message)
            .await
            .unwrap();
        assert_eq!(task.metadata().status, Some(TestStatus::Error));
        assert_eq!(fixture.results.snapshot().count(TestStatus::Error), 1);
    }

    #[tokio::test]
    async fn test_lazy_task_has_no_elapsed_time() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = RuntimeTask::new(TestId::new(3, "late"), Runnable::default());

        FinishHandler
            .handle(
                &fixture.ctx(),
                "3-late",
                &mut task,
                &Message::finished(5.0, TestStatus::Pass),
            )
            .await
            .unwrap();
        assert_eq!(task.metadata().time_elapsed, None);
        assert_eq!(fixture.results.snapshot().count(TestStatus::Pass), 1);
    }
}
