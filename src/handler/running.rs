//! Handlers for `running` messages.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{HandlerContext, HandlerError, HandlerResult, MessageHandler};
use crate::layout::{DEBUG_LOG, STDERR_FILE, STDOUT_FILE, WHITEBOARD_FILE, safe_relative_path};
use crate::message::{Message, RunningEvent};
use crate::sink::{self, StreamTag, TaggedSink};
use crate::task::Task;

/// Tracing target of test output relayed to the user.
pub const UI_TARGET: &str = "avocado.test";

fn task_path(key: &str, task: &dyn Task) -> HandlerResult<PathBuf> {
    task.metadata()
        .task_path
        .clone()
        .ok_or_else(|| HandlerError::missing(key, "task directory"))
}

/// The task's default log, filled in from the task directory if unset.
fn logfile(key: &str, task: &mut dyn Task) -> HandlerResult<PathBuf> {
    if let Some(logfile) = &task.metadata().logfile {
        return Ok(logfile.clone());
    }
    let logfile = task_path(key, task)?.join(DEBUG_LOG);
    task.metadata_mut().logfile = Some(logfile.clone());
    Ok(logfile)
}

/// `log`, `stdout` and `stderr`: tagged lines in the default log, plus the
/// untagged per-stream file for `stdout` and `stderr`.
#[derive(Debug)]
pub struct StreamHandler {
    name: &'static str,
    sink: TaggedSink,
    file: Option<&'static str>,
}

impl StreamHandler {
    pub fn log() -> Self {
        Self {
            name: "LogHandler",
            sink: TaggedSink::new(StreamTag::Stdlog),
            file: None,
        }
    }

    pub fn stdout() -> Self {
        Self {
            name: "StdoutHandler",
            sink: TaggedSink::new(StreamTag::Stdout),
            file: Some(STDOUT_FILE),
        }
    }

    pub fn stderr() -> Self {
        Self {
            name: "StderrHandler",
            sink: TaggedSink::new(StreamTag::Stderr),
            file: Some(STDERR_FILE),
        }
    }

    /// Bytes held back for `key` until their line ends.
    pub fn pending(&self, key: &str) -> &[u8] {
        self.sink.pending(key)
    }
}

#[async_trait]
impl MessageHandler for StreamHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(
        &mut self,
        _ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()> {
        let Message::Running { event, .. } = message else {
            return Ok(());
        };
        let Some(payload) = event.payload() else {
            return Ok(());
        };

        let logfile = logfile(key, task)?;
        self.sink
            .write(key, &logfile, payload)
            .await
            .map_err(|e| HandlerError::io(&logfile, e))?;

        if let Some(name) = self.file {
            let path = task_path(key, task)?.join(name);
            sink::write_untagged(&path, payload)
                .await
                .map_err(|e| HandlerError::io(&path, e))?;
        }
        Ok(())
    }

    async fn finish_task(
        &mut self,
        _ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
    ) -> HandlerResult<()> {
        if self.sink.pending(key).is_empty() {
            self.sink.forget(key);
            return Ok(());
        }
        let logfile = logfile(key, task)?;
        self.sink
            .flush(key, &logfile)
            .await
            .map_err(|e| HandlerError::io(&logfile, e))
    }
}

/// `whiteboard`: decoded text accumulated in the metadata and the
/// `whiteboard` file.
#[derive(Debug, Default)]
pub struct WhiteboardHandler;

#[async_trait]
impl MessageHandler for WhiteboardHandler {
    fn name(&self) -> &'static str {
        "WhiteboardHandler"
    }

    async fn handle(
        &mut self,
        _ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()> {
        let Message::Running {
            event: RunningEvent::Whiteboard(payload),
            ..
        } = message
        else {
            return Ok(());
        };
        let text = sink::payload_text(payload);
        let path = task_path(key, task)?.join(WHITEBOARD_FILE);
        task.metadata_mut().whiteboard.push_str(&text);
        sink::append(&path, text.as_bytes())
            .await
            .map_err(|e| HandlerError::io(&path, e))
    }
}

/// `output`: relayed to the user through the [`UI_TARGET`] tracing target.
#[derive(Debug, Default)]
pub struct OutputHandler;

#[async_trait]
impl MessageHandler for OutputHandler {
    fn name(&self) -> &'static str {
        "OutputHandler"
    }

    async fn handle(
        &mut self,
        _ctx: &HandlerContext<'_>,
        _key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()> {
        let Message::Running {
            event: RunningEvent::Output(payload),
            ..
        } = message
        else {
            return Ok(());
        };
        let id = task.identifier();
        for line in sink::payload_text(payload).lines() {
            info!(target: UI_TARGET, "{}: {}", id, line);
        }
        Ok(())
    }
}

/// `file`: bytes appended to a path relative to the task directory.
#[derive(Debug, Default)]
pub struct FileHandler;

#[async_trait]
impl MessageHandler for FileHandler {
    fn name(&self) -> &'static str {
        "FileHandler"
    }

    async fn handle(
        &mut self,
        _ctx: &HandlerContext<'_>,
        key: &str,
        task: &mut dyn Task,
        message: &Message,
    ) -> HandlerResult<()> {
        let Message::Running {
            event: RunningEvent::File { path, payload },
            ..
        } = message
        else {
            return Ok(());
        };
        let target = safe_relative_path(&task_path(key, task)?, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HandlerError::io(parent, e))?;
        }
        sink::append(&target, &payload.data)
            .await
            .map_err(|e| HandlerError::io(&target, e))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::super::{MessageHandler, StartHandler};
    use super::*;
    use crate::identifier::TestId;
    use crate::layout::LayoutError;
    use crate::message::Payload;
    use crate::task::{Runnable, RuntimeTask};
    use tempfile::TempDir;

    async fn started(fixture: &Fixture) -> RuntimeTask {
        let mut task = RuntimeTask::new(TestId::new(1, "t"), Runnable::default());
        StartHandler
            .handle(&fixture.ctx(), "1-t", &mut task, &Message::started(1.0))
            .await
            .unwrap();
        task
    }

    fn running(event: RunningEvent) -> Message {
        Message::running(1.5, event)
    }

    fn read(task: &RuntimeTask, name: &str) -> String {
        let path = task.metadata().task_path.as_ref().unwrap().join(name);
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_share_the_default_log() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let mut stdout = StreamHandler::stdout();
        let mut stderr = StreamHandler::stderr();
        let ctx = fixture.ctx();

        let out = running(RunningEvent::Stdout(Payload::raw("hello\n")));
        stdout.handle(&ctx, "1-t", &mut task, &out).await.unwrap();
        let err = running(RunningEvent::Stderr(Payload::raw("oops\n")));
        stderr.handle(&ctx, "1-t", &mut task, &err).await.unwrap();

        assert_eq!(read(&task, "stdout"), "hello\n");
        assert_eq!(read(&task, "stderr"), "oops\n");
        assert_eq!(read(&task, "debug.log"), "[stdout] hello\n[stderr] oops\n");
    }

    #[tokio::test]
    async fn test_partial_lines_are_held_until_finish() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let mut stdout = StreamHandler::stdout();
        let ctx = fixture.ctx();

        for chunk in ["abc", "def\n", "ghi"] {
            let message = running(RunningEvent::Stdout(Payload::raw(chunk)));
            stdout.handle(&ctx, "1-t", &mut task, &message).await.unwrap();
        }
        assert_eq!(read(&task, "stdout"), "abcdef\nghi");
        assert_eq!(read(&task, "debug.log"), "[stdout] abcdef\n");
        assert_eq!(stdout.pending("1-t"), b"ghi");

        stdout.finish_task(&ctx, "1-t", &mut task).await.unwrap();
        assert_eq!(read(&task, "debug.log"), "[stdout] abcdef\n[stdout] ghi");
        assert!(stdout.pending("1-t").is_empty());
    }

    #[tokio::test]
    async fn test_finish_releases_buffers_without_pending_bytes() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let mut stdout = StreamHandler::stdout();
        let ctx = fixture.ctx();

        let message = running(RunningEvent::Stdout(Payload::raw("whole line\n")));
        stdout.handle(&ctx, "1-t", &mut task, &message).await.unwrap();
        assert_eq!(stdout.sink.tracked(), 1);

        stdout.finish_task(&ctx, "1-t", &mut task).await.unwrap();
        assert_eq!(stdout.sink.tracked(), 0);
        assert_eq!(read(&task, "debug.log"), "[stdout] whole line\n");
    }

    #[tokio::test]
    async fn test_log_is_tagged_and_text_gets_newline() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let mut log = StreamHandler::log();
        let ctx = fixture.ctx();

        let payload = Payload {
            data: b"caf\xe9".to_vec(),
            encoding: Some("latin-1".into()),
        };
        log.handle(&ctx, "1-t", &mut task, &running(RunningEvent::Log(payload)))
            .await
            .unwrap();
        assert_eq!(read(&task, "debug.log"), "[stdlog] café\n");
        let dir_entries: Vec<_> = std::fs::read_dir(task.metadata().task_path.as_ref().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(dir_entries, vec!["debug.log"]);
    }

    #[tokio::test]
    async fn test_whiteboard_accumulates() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let ctx = fixture.ctx();

        for text in ["first ", "second"] {
            let message = running(RunningEvent::Whiteboard(Payload::raw(text)));
            WhiteboardHandler
                .handle(&ctx, "1-t", &mut task, &message)
                .await
                .unwrap();
        }
        assert_eq!(task.metadata().whiteboard, "first second");
        assert_eq!(read(&task, "whiteboard"), "first second");
    }

    #[tokio::test]
    async fn test_file_creates_nested_paths() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let ctx = fixture.ctx();

        for chunk in ["a", "b"] {
            let message = running(RunningEvent::File {
                path: "/data/out.bin".into(),
                payload: Payload::raw(chunk),
            });
            FileHandler.handle(&ctx, "1-t", &mut task, &message).await.unwrap();
        }
        assert_eq!(read(&task, "data/out.bin"), "ab");
    }

    #[tokio::test]
    async fn test_file_keeps_encoded_payloads_verbatim() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let ctx = fixture.ctx();

        for chunk in ["first", "second"] {
            let message = running(RunningEvent::File {
                path: "notes.txt".into(),
                payload: Payload::text(chunk),
            });
            FileHandler.handle(&ctx, "1-t", &mut task, &message).await.unwrap();
        }
        assert_eq!(read(&task, "notes.txt"), "firstsecond");
    }

    #[tokio::test]
    async fn test_file_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = started(&fixture).await;
        let ctx = fixture.ctx();

        let message = running(RunningEvent::File {
            path: "../../etc/shadow".into(),
            payload: Payload::raw("x"),
        });
        let err = FileHandler
            .handle(&ctx, "1-t", &mut task, &message)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Layout(LayoutError::Traversal(_))));
        assert!(!dir.path().join("etc").exists());
        assert!(!dir.path().join("test-results").join("etc").exists());

        let message = running(RunningEvent::File {
            path: "ok.txt".into(),
            payload: Payload::raw("fine"),
        });
        FileHandler.handle(&ctx, "1-t", &mut task, &message).await.unwrap();
        assert_eq!(read(&task, "ok.txt"), "fine");
    }

    #[tokio::test]
    async fn test_unstarted_task_reports_missing_directory() {
        let dir = TempDir::new().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut task = RuntimeTask::new(TestId::new(2, "t"), Runnable::default());

        let message = running(RunningEvent::Stdout(Payload::raw("lost\n")));
        let err = StreamHandler::stdout()
            .handle(&fixture.ctx(), "2-t", &mut task, &message)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::MissingMetadata { .. }));
    }
}
