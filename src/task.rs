//! Tasks and their per-task metadata.
//!
//! The pipeline never schedules tasks; it only observes them. A task is
//! anything implementing [`Task`]: it exposes an identity, a category, the
//! runnable it executes, and a mutable [`TaskMetadata`] bag. The `started`
//! handler seeds the bag, later handlers read it, and the `finished` handler
//! completes it.
//!
//! [`TaskStore`] keeps the tasks of a job keyed by their identifier string,
//! creating a default test task for identifiers it has not seen yet.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifier::TestId;
use crate::message::TestStatus;

/// Category of tasks that take part in result aggregation.
pub const TEST_CATEGORY: &str = "test";

/// One `(path, key, value)` test parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub path: String,
    pub key: String,
    pub value: Value,
}

/// Parameters of one node of a variant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VariantNode {
    pub path: String,
    #[serde(default)]
    pub params: Vec<Param>,
}

/// The variant a runnable executes under.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Variant {
    pub variant_id: Option<String>,
    #[serde(default)]
    pub variant: Vec<VariantNode>,
}

impl Variant {
    /// Flattens every node's parameters into one list, in node order.
    pub fn params(&self) -> Vec<Param> {
        self.variant
            .iter()
            .flat_map(|node| node.params.iter().cloned())
            .collect()
    }
}

/// What a task executes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Runnable {
    pub kind: String,
    pub uri: Option<String>,
    pub variant: Option<Variant>,
}

/// Mutable per-task bag shared by the handlers of one task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMetadata {
    pub job_logdir: Option<PathBuf>,
    pub job_unique_id: Option<String>,
    pub base_path: Option<PathBuf>,
    pub task_path: Option<PathBuf>,
    /// The task's default log, `debug.log`.
    pub logfile: Option<PathBuf>,
    /// Task-origin monotonic time of the `started` message.
    pub time_start: Option<f64>,
    pub actual_time_start: Option<DateTime<Utc>>,
    pub name: Option<TestId>,
    pub params: Vec<Param>,
    pub whiteboard: String,
    pub time_end: Option<f64>,
    pub actual_time_end: Option<DateTime<Utc>>,
    pub time_elapsed: Option<f64>,
    pub logdir: Option<PathBuf>,
    pub status: Option<TestStatus>,
    pub fail_reason: Option<String>,
    /// Keys contributed by runners or plugins that the pipeline does not know.
    pub extra: BTreeMap<String, Value>,
}

impl TaskMetadata {
    /// Whether the `started` handler (or a lazy stand-in) has run.
    pub fn is_started(&self) -> bool {
        self.task_path.is_some()
    }

    /// Whether the `finished` handler has run.
    pub fn is_finished(&self) -> bool {
        self.time_end.is_some()
    }
}

/// Capabilities the handler tree needs from a task.
pub trait Task: Send {
    fn identifier(&self) -> &TestId;
    fn category(&self) -> &str;
    fn runnable(&self) -> &Runnable;
    fn metadata(&self) -> &TaskMetadata;
    fn metadata_mut(&mut self) -> &mut TaskMetadata;

    fn variant(&self) -> Option<&Variant> {
        self.runnable().variant.as_ref()
    }

    fn is_test(&self) -> bool {
        self.category() == TEST_CATEGORY
    }
}

/// The default [`Task`] implementation.
#[derive(Debug, Clone)]
pub struct RuntimeTask {
    identifier: TestId,
    category: String,
    runnable: Runnable,
    metadata: TaskMetadata,
}

impl RuntimeTask {
    /// Creates a test-category task with empty metadata.
    pub fn new(identifier: TestId, runnable: Runnable) -> Self {
        Self {
            identifier,
            category: TEST_CATEGORY.to_string(),
            runnable,
            metadata: TaskMetadata::default(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

impl Task for RuntimeTask {
    fn identifier(&self) -> &TestId {
        &self.identifier
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn runnable(&self) -> &Runnable {
        &self.runnable
    }

    fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut TaskMetadata {
        &mut self.metadata
    }
}

/// Tasks of one job keyed by their identifier string.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: BTreeMap<String, RuntimeTask>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task under its identifier's display form, replacing any
    /// previous task with the same key.
    pub fn insert(&mut self, task: RuntimeTask) -> String {
        let key = task.identifier().to_string();
        self.tasks.insert(key.clone(), task);
        key
    }

    pub fn get(&self, key: &str) -> Option<&RuntimeTask> {
        self.tasks.get(key)
    }

    /// Returns the task for `key`, creating an opaque test task if unknown.
    pub fn get_or_create(&mut self, key: &str) -> &mut RuntimeTask {
        self.tasks.entry(key.to_string()).or_insert_with(|| {
            RuntimeTask::new(TestId::from_identifier(key), Runnable::default())
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, RuntimeTask> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, RuntimeTask> {
        self.tasks.iter_mut()
    }
}
