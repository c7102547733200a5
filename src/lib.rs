//! avocado-pipeline: the runner message pipeline of a test job.
//!
//! Test runners report each task's lifecycle as a stream of messages
//! (`started`, `running`, `finished`). This crate routes those messages into
//! per-task artifacts on disk, aggregates results, and collects system
//! information before and after the job (and optionally around each test).
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Identifier / Layout**: stable test identities and the on-disk tree
//! - **Message**: the wire contract runners speak
//! - **Handler**: the dispatch tree turning messages into side effects
//! - **Sink**: line-aware writers behind the default log and stream files
//! - **Result**: per-status counters and listener dispatch
//! - **SysInfo**: before/after collection of commands, files and daemons
//! - **Callback**: LIFO cleanup registers, including a process-wide one
//! - **Job**: the driver owning all of the above
//!
//! # Example
//!
//! ```no_run
//! use avocado_pipeline::config::load_config;
//! use avocado_pipeline::job::Job;
//! use avocado_pipeline::message::{Message, TestStatus};
//! use avocado_pipeline::sysinfo::Host;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("pipeline.toml"))?;
//!     let mut job = Job::new(config, Host::local()).await?;
//!     job.pre_tests().await;
//!     job.process_message("1-passtest", &Message::started(0.0)).await;
//!     job.process_message("1-passtest", &Message::finished(0.5, TestStatus::Pass)).await;
//!     let snapshot = job.post_tests().await?;
//!     assert!(snapshot.passed());
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod config;
pub mod handler;
pub mod identifier;
pub mod job;
pub mod layout;
pub mod message;
pub mod report;
pub mod result;
pub mod sink;
pub mod sysinfo;
pub mod task;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use handler::{HandlerTree, MessageHandler};
pub use identifier::TestId;
pub use job::Job;
pub use message::{Envelope, Message, TestStatus};
pub use result::{ResultListener, ResultSnapshot};
pub use sysinfo::{Host, SysInfo};
pub use task::{RuntimeTask, Task};
