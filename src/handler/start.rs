//! The `started` handler.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::layout::DEBUG_LOG;
use crate::message::Message;
use crate::result::{ResultEvent, TestState};
use crate::sink;
use crate::task::Task;

/// Provisions the task directory and seeds the task metadata.
#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl MessageHandler for StartHandler {
    fn name(&self) -> &'static str {
        "StartHandler"
    }

    async fn handle(
        &mut self,
        ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()> {
        let Message::Started { time } = message else {
            return Ok(());
        };
        provision(ctx, key, task, Some(*time)).await
    }
}

/// Creates the task directory and fills in the start-time metadata.
///
/// With a `started` time the default log is truncated; without one (a task
/// provisioned lazily by a later message) an existing log is kept and the
/// elapsed time stays unknown. Test tasks are reported to the aggregator
/// and to the `start_test` listeners.
pub(crate) async fn provision(
    ctx: &HandlerContext<'_>,
    key: &str,
    task: &mut dyn Task,
    time: Option<f64>,
) -> HandlerResult<()> {
    let id = task.identifier().clone();
    let task_path = ctx.layout.task_path(&id)?;
    tokio::fs::create_dir_all(&task_path)
        .await
        .map_err(|e| HandlerError::io(&task_path, e))?;

    let logfile = task_path.join(DEBUG_LOG);
    if time.is_some() {
        sink::truncate(&logfile)
            .await
            .map_err(|e| HandlerError::io(&logfile, e))?;
    } else {
        sink::append(&logfile, b"")
            .await
            .map_err(|e| HandlerError::io(&logfile, e))?;
    }

    let params = task.variant().map(|v| v.params()).unwrap_or_default();
    let metadata = task.metadata_mut();
    metadata.job_logdir = Some(ctx.layout.logdir().to_path_buf());
    metadata.job_unique_id = Some(ctx.job_id.to_string());
    metadata.base_path = Some(ctx.layout.test_results_path());
    metadata.task_path = Some(task_path.clone());
    metadata.logfile = Some(logfile);
    metadata.time_start = time;
    metadata.actual_time_start = Some(Utc::now());
    metadata.name = Some(id.clone());
    metadata.params = params;
    debug!("Task {} provisioned at {}", key, task_path.display());

    if task.is_test() {
        let state = TestState::from_metadata(&id, task.metadata());
        ctx.results.start_test(key, state.clone());
        ctx.listeners
            .map_method(ResultEvent::StartTest, &ctx.event_context(), &state)
            .await;
    }
    Ok(())
}
