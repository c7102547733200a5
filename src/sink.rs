//! Line-aware, append-only output writers.
//!
//! Runners stream output in arbitrary chunks. Per-stream files (`stdout`,
//! `stderr`, `whiteboard`, files written through `type=file`) receive those
//! chunks untouched, while the task's default log interleaves every stream
//! with a tag in front of each line:
//!
//! ```text
//! [stdout] hello
//! [stderr] oops
//! [stdlog] 2024-01-01 12:00:00 INFO | message
//! ```
//!
//! Tagging needs whole lines, so a [`TaggedSink`] keeps the unterminated tail
//! of every task's stream in a [`LineBuffer`] until the terminator arrives,
//! or until [`TaggedSink::flush`] is called when the task finishes.

use std::collections::HashMap;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::message::Payload;

/// Tag written in front of every default-log line of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    Stdlog,
    Stdout,
    Stderr,
}

impl StreamTag {
    pub fn prefix(&self) -> &'static str {
        match self {
            StreamTag::Stdlog => "[stdlog] ",
            StreamTag::Stdout => "[stdout] ",
            StreamTag::Stderr => "[stderr] ",
        }
    }
}

/// Splits a byte stream into `\n`-terminated lines, keeping the tail.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` and returns every line it completes, terminator included.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut line = std::mem::take(&mut self.pending);
            line.extend_from_slice(&rest[..=pos]);
            lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Bytes received after the last terminator.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Removes and returns the unterminated tail, if any.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Decodes `data` as text in `encoding`.
///
/// Unsupported encodings fall back to lossy UTF-8 with a warning; invalid
/// sequences are replaced rather than rejected.
pub fn decode_text(data: &[u8], encoding: &str) -> String {
    match encoding.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "utf-8" | "utf8" => String::from_utf8_lossy(data).into_owned(),
        "ascii" | "us-ascii" => data
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
            .collect(),
        // Every byte maps to the code point of the same value.
        "latin-1" | "latin1" | "iso-8859-1" => data.iter().map(|&b| b as char).collect(),
        other => {
            warn!("Unsupported encoding '{}', decoding as UTF-8", other);
            String::from_utf8_lossy(data).into_owned()
        }
    }
}

/// Decodes a payload, defaulting to UTF-8 when it carries no encoding.
pub fn payload_text(payload: &Payload) -> String {
    decode_text(&payload.data, payload.encoding.as_deref().unwrap_or("utf-8"))
}

/// Appends `text` followed by a newline unless it already ends with one.
pub fn with_trailing_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Appends `data` to `path`, creating the file if needed.
pub async fn append(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await
}

/// Truncates `path` to zero length, creating it if absent.
pub async fn truncate(path: &Path) -> std::io::Result<()> {
    tokio::fs::File::create(path).await.map(|_| ())
}

/// Writes a payload to a per-stream file without tagging.
///
/// Raw payloads are appended verbatim; text payloads are decoded and written
/// with a trailing newline.
pub async fn write_untagged(path: &Path, payload: &Payload) -> std::io::Result<()> {
    match &payload.encoding {
        None => append(path, &payload.data).await,
        Some(encoding) => {
            let text = with_trailing_newline(decode_text(&payload.data, encoding));
            append(path, text.as_bytes()).await
        }
    }
}

/// Tagged writer into a task's default log.
///
/// One instance serves one stream for all tasks; partial lines are kept per
/// task key so concurrent tasks never mix their fragments.
#[derive(Debug)]
pub struct TaggedSink {
    tag: StreamTag,
    buffers: HashMap<String, LineBuffer>,
}

impl TaggedSink {
    pub fn new(tag: StreamTag) -> Self {
        Self {
            tag,
            buffers: HashMap::new(),
        }
    }

    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    /// Unterminated bytes currently held for `task`.
    pub fn pending(&self, task: &str) -> &[u8] {
        self.buffers.get(task).map(LineBuffer::pending).unwrap_or(&[])
    }

    /// Writes `payload` for `task` into the default log at `path`.
    ///
    /// Raw bytes are split at `\n` and only terminated lines are written.
    /// Text payloads are decoded and written whole, after any held fragment
    /// is completed by their first line.
    pub async fn write(&mut self, task: &str, path: &Path, payload: &Payload) -> std::io::Result<()> {
        let buffer = self.buffers.entry(task.to_string()).or_default();
        let lines = match &payload.encoding {
            None => buffer.push(&payload.data),
            Some(encoding) => {
                let text = with_trailing_newline(decode_text(&payload.data, encoding));
                buffer.push(text.as_bytes())
            }
        };
        if lines.is_empty() {
            return Ok(());
        }
        append(path, &self.render(&lines)).await
    }

    /// Writes out whatever fragment is held for `task` and drops its buffer.
    ///
    /// The fragment is tagged but left unterminated.
    pub async fn flush(&mut self, task: &str, path: &Path) -> std::io::Result<()> {
        let Some(residual) = self.buffers.remove(task).and_then(|mut b| b.take()) else {
            return Ok(());
        };
        append(path, &self.render(&[residual])).await
    }

    /// Drops the buffer of `task` without writing it.
    pub fn forget(&mut self, task: &str) {
        self.buffers.remove(task);
    }

    /// Number of tasks holding a buffer, pending bytes or not.
    pub fn tracked(&self) -> usize {
        self.buffers.len()
    }

    /// Task keys that still hold a fragment.
    pub fn tasks_with_pending(&self) -> Vec<String> {
        self.buffers
            .iter()
            .filter(|(_, b)| !b.pending().is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn render(&self, lines: &[Vec<u8>]) -> Vec<u8> {
        let prefix = self.tag.prefix().as_bytes();
        let mut out = Vec::with_capacity(lines.iter().map(|l| l.len() + prefix.len()).sum());
        for line in lines {
            out.extend_from_slice(prefix);
            out.extend_from_slice(line);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_line_buffer_keeps_tail() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"abc").is_empty());
        assert_eq!(buffer.push(b"def\nghi"), vec![b"abcdef\n".to_vec()]);
        assert_eq!(buffer.pending(), b"ghi");
        assert_eq!(buffer.push(b"\n\n"), vec![b"ghi\n".to_vec(), b"\n".to_vec()]);
        assert_eq!(buffer.take(), None);
    }

    #[test]
    fn test_decode_text_encodings() {
        assert_eq!(decode_text("héllo".as_bytes(), "UTF-8"), "héllo");
        assert_eq!(decode_text(&[0x68, 0xe9], "latin-1"), "hé");
        assert_eq!(decode_text(&[0x68, 0xe9], "iso_8859_1"), "hé");
        assert_eq!(decode_text(&[0x68, 0xe9], "ascii"), "h\u{FFFD}");
        assert_eq!(decode_text(b"plain", "klingon"), "plain");
    }

    #[tokio::test]
    async fn test_untagged_raw_and_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stdout");

        write_untagged(&path, &Payload::raw(b"abc".to_vec())).await.unwrap();
        write_untagged(&path, &Payload::raw(b"def\n".to_vec())).await.unwrap();
        write_untagged(&path, &Payload::text("text")).await.unwrap();
        write_untagged(&path, &Payload::raw(b"ghi".to_vec())).await.unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content, b"abcdef\ntext\nghi");
    }

    #[tokio::test]
    async fn test_tagged_sink_buffers_partial_lines() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("debug.log");
        let mut sink = TaggedSink::new(StreamTag::Stdout);

        sink.write("t1", &log, &Payload::raw(b"abc".to_vec())).await.unwrap();
        assert!(!log.exists());
        sink.write("t1", &log, &Payload::raw(b"def\n".to_vec())).await.unwrap();
        sink.write("t1", &log, &Payload::raw(b"ghi".to_vec())).await.unwrap();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), "[stdout] abcdef\n");
        assert_eq!(sink.pending("t1"), b"ghi");
        assert_eq!(sink.tasks_with_pending(), vec!["t1".to_string()]);

        sink.flush("t1", &log).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "[stdout] abcdef\n[stdout] ghi"
        );
        assert!(sink.pending("t1").is_empty());
        assert_eq!(sink.tracked(), 0);
    }

    #[tokio::test]
    async fn test_tagged_sink_drops_buffers_of_finished_tasks() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("debug.log");
        let mut sink = TaggedSink::new(StreamTag::Stdout);

        for task in ["a", "b", "c"] {
            sink.write(task, &log, &Payload::raw(b"line\n".to_vec())).await.unwrap();
        }
        assert_eq!(sink.tracked(), 3);

        sink.flush("a", &log).await.unwrap();
        sink.forget("b");
        sink.forget("never-seen");
        assert_eq!(sink.tracked(), 1);
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "[stdout] line\n[stdout] line\n[stdout] line\n"
        );
    }

    #[tokio::test]
    async fn test_tagged_sink_separates_tasks() {
        let dir = TempDir::new().unwrap();
        let log_a = dir.path().join("a.log");
        let log_b = dir.path().join("b.log");
        let mut sink = TaggedSink::new(StreamTag::Stderr);

        sink.write("a", &log_a, &Payload::raw(b"from ".to_vec())).await.unwrap();
        sink.write("b", &log_b, &Payload::raw(b"other\n".to_vec())).await.unwrap();
        sink.write("a", &log_a, &Payload::raw(b"a\n".to_vec())).await.unwrap();

        assert_eq!(std::fs::read_to_string(&log_a).unwrap(), "[stderr] from a\n");
        assert_eq!(std::fs::read_to_string(&log_b).unwrap(), "[stderr] other\n");
    }

    #[tokio::test]
    async fn test_tagged_sink_text_mode_tags_every_line() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("debug.log");
        let mut sink = TaggedSink::new(StreamTag::Stdlog);

        sink.write("t", &log, &Payload::text("one\ntwo")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "[stdlog] one\n[stdlog] two\n"
        );
    }
}
