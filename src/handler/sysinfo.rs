//! Per-test sysinfo collection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::config::SysInfoCollectConfig;
use crate::layout::task_sysinfo_dirs;
use crate::message::{Message, TestStatus};
use crate::sysinfo::{CollectibleLists, Host, SysInfo};
use crate::task::Task;

/// Runs a [`SysInfo`] inside each test's directory.
///
/// Collection starts when the test's `started` message is handled (after
/// the task directory exists) and ends once the task is finished, with the
/// test's status deciding whether the fail-only set is collected. Register
/// it after [`StartHandler`](super::StartHandler).
pub struct SysInfoHandler {
    options: SysInfoCollectConfig,
    lists: Arc<CollectibleLists>,
    host: Host,
    running: HashMap<String, SysInfo>,
}

impl SysInfoHandler {
    pub fn new(options: SysInfoCollectConfig, lists: Arc<CollectibleLists>, host: Host) -> Self {
        Self {
            options,
            lists,
            host,
            running: HashMap::new(),
        }
    }

    /// Number of tests whose collection has started but not ended.
    pub fn active(&self) -> usize {
        self.running.len()
    }
}

impl std::fmt::Debug for SysInfoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysInfoHandler")
            .field("options", &self.options)
            .field("running", &self.running.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageHandler for SysInfoHandler {
    fn name(&self) -> &'static str {
        "SysInfoHandler"
    }

    async fn handle(
        &mut self,
        _ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()> {
        if !matches!(message, Message::Started { .. }) || !task.is_test() {
            return Ok(());
        }
        let task_path = task
            .metadata()
            .task_path
            .clone()
            .ok_or_else(|| HandlerError::missing(key, "task directory"))?;

        let mut sysinfo = SysInfo::new(
            task_sysinfo_dirs(&task_path),
            self.options.clone(),
            &self.lists,
            self.host.clone(),
        )
        .await;
        let failures = sysinfo.start().await;
        debug!("Per-test sysinfo started for {} ({} failures)", key, failures);
        if let Some(mut previous) = self.running.insert(key.to_string(), sysinfo) {
            warn!("Task {} started twice, ending its previous sysinfo", key);
            previous.end(None).await;
        }
        Ok(())
    }

    async fn finish_task(
        &mut self,
        _ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
    ) -> HandlerResult<()> {
        let Some(mut sysinfo) = self.running.remove(key) else {
            return Ok(());
        };
        let status = task.metadata().status.or(Some(TestStatus::Error));
        let failures = sysinfo.end(status).await;
        debug!("Per-test sysinfo ended for {} ({} failures)", key, failures);
        Ok(())
    }
}
