//! Runner message contract.
//!
//! Runners report task lifecycle events as small JSON objects:
//!
//! ```json
//! {"task": "1-test.py:T.test", "status": "started", "time": 16444.8}
//! {"task": "1-test.py:T.test", "status": "running", "type": "stdout", "log": "hello\n", "time": 16444.9}
//! {"task": "1-test.py:T.test", "status": "finished", "result": "pass", "time": 16445.3}
//! ```
//!
//! Decoding turns them into the [`Message`] sum type so the handler tree can
//! dispatch with an exhaustive match. Unknown `status` or `type` values
//! decode successfully into `Unknown` variants and are ignored downstream,
//! which keeps older pipelines working with newer runners.
//!
//! # Payload bytes
//!
//! `log` is a JSON string. A `base64:` prefix marks raw bytes; any other
//! string contributes its UTF-8 bytes. When `encoding` is present the bytes
//! are text in that encoding, otherwise they are written verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix marking a base64-encoded `log` payload.
pub const BASE64_PREFIX: &str = "base64:";

/// Result type for message decoding.
pub type MessageResult<T> = Result<T, MessageError>;

/// Errors produced while decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unknown test result '{0}'")]
    UnknownResult(String),
}

/// Final outcome of a test.
///
/// Lowercase on the wire (`"pass"`), uppercase everywhere else (`"PASS"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skip,
    Warn,
    Interrupted,
    Cancel,
}

impl TestStatus {
    pub const ALL: [TestStatus; 7] = [
        TestStatus::Pass,
        TestStatus::Fail,
        TestStatus::Error,
        TestStatus::Skip,
        TestStatus::Warn,
        TestStatus::Interrupted,
        TestStatus::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Error => "ERROR",
            TestStatus::Skip => "SKIP",
            TestStatus::Warn => "WARN",
            TestStatus::Interrupted => "INTERRUPTED",
            TestStatus::Cancel => "CANCEL",
        }
    }

    /// Whether this outcome should trigger fail-only sysinfo collection and
    /// a non-zero job exit code.
    pub fn is_failing(&self) -> bool {
        matches!(
            self,
            TestStatus::Fail | TestStatus::Error | TestStatus::Interrupted
        )
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.to_ascii_lowercase().as_str() {
            "pass" => TestStatus::Pass,
            "fail" => TestStatus::Fail,
            "error" => TestStatus::Error,
            "skip" => TestStatus::Skip,
            "warn" => TestStatus::Warn,
            "interrupted" => TestStatus::Interrupted,
            "cancel" => TestStatus::Cancel,
            _ => return Err(MessageError::UnknownResult(s.to_string())),
        };
        Ok(status)
    }
}

impl TryFrom<String> for TestStatus {
    type Error = MessageError;

    fn try_from(value: String) -> Result<Self, MessageError> {
        value.parse()
    }
}

impl From<TestStatus> for String {
    fn from(status: TestStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Bytes carried by an output-bearing `running` message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub data: Vec<u8>,
    /// Text encoding of `data`; `None` means raw bytes.
    pub encoding: Option<String>,
}

impl Payload {
    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            encoding: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: text.into().into_bytes(),
            encoding: Some("utf-8".to_string()),
        }
    }
}

/// The sub-kind of a `running` message.
#[derive(Debug, Clone, PartialEq)]
pub enum RunningEvent {
    Log(Payload),
    Stdout(Payload),
    Stderr(Payload),
    Whiteboard(Payload),
    Output(Payload),
    File { path: String, payload: Payload },
    Unknown { kind: String },
}

/// Dispatch key of a `running` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunningKind {
    Log,
    Stdout,
    Stderr,
    Whiteboard,
    Output,
    File,
}

impl RunningKind {
    pub const ALL: [RunningKind; 6] = [
        RunningKind::Log,
        RunningKind::Stdout,
        RunningKind::Stderr,
        RunningKind::Whiteboard,
        RunningKind::Output,
        RunningKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunningKind::Log => "log",
            RunningKind::Stdout => "stdout",
            RunningKind::Stderr => "stderr",
            RunningKind::Whiteboard => "whiteboard",
            RunningKind::Output => "output",
            RunningKind::File => "file",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        RunningKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl RunningEvent {
    pub fn kind(&self) -> Option<RunningKind> {
        match self {
            RunningEvent::Log(_) => Some(RunningKind::Log),
            RunningEvent::Stdout(_) => Some(RunningKind::Stdout),
            RunningEvent::Stderr(_) => Some(RunningKind::Stderr),
            RunningEvent::Whiteboard(_) => Some(RunningKind::Whiteboard),
            RunningEvent::Output(_) => Some(RunningKind::Output),
            RunningEvent::File { .. } => Some(RunningKind::File),
            RunningEvent::Unknown { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            RunningEvent::Log(p)
            | RunningEvent::Stdout(p)
            | RunningEvent::Stderr(p)
            | RunningEvent::Whiteboard(p)
            | RunningEvent::Output(p)
            | RunningEvent::File { payload: p, .. } => Some(p),
            RunningEvent::Unknown { .. } => None,
        }
    }
}

/// Body of a `finished` message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Finished {
    pub time: f64,
    /// `None` when the runner did not report a result.
    pub result: Option<TestStatus>,
    pub fail_reason: Option<String>,
    /// Any other keys the runner sent (`returncode`, `class_name`, ...).
    pub extra: BTreeMap<String, Value>,
}

/// A decoded runner message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Started { time: f64 },
    Running { time: f64, event: RunningEvent },
    Finished(Finished),
    Unknown { status: String },
}

impl Message {
    pub fn started(time: f64) -> Self {
        Message::Started { time }
    }

    pub fn running(time: f64, event: RunningEvent) -> Self {
        Message::Running { time, event }
    }

    pub fn finished(time: f64, result: TestStatus) -> Self {
        Message::Finished(Finished {
            time,
            result: Some(result),
            ..Default::default()
        })
    }

    /// Short form for logs: `status` or `status/type`.
    pub fn summary(&self) -> String {
        match self {
            Message::Started { .. } => "started".to_string(),
            Message::Running { event, .. } => match event {
                RunningEvent::Unknown { kind } => format!("running/{kind}"),
                other => format!(
                    "running/{}",
                    other.kind().map(|k| k.as_str()).unwrap_or("unknown")
                ),
            },
            Message::Finished(_) => "finished".to_string(),
            Message::Unknown { status } => status.clone(),
        }
    }

    /// Decodes a message object.
    pub fn from_value(value: Value) -> MessageResult<Self> {
        Ok(Envelope::from_value(value)?.message)
    }
}

/// A message together with the task it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub task: Option<String>,
    pub message: Message,
}

#[derive(Deserialize)]
struct WireMessage {
    task: Option<String>,
    status: Option<String>,
    time: Option<f64>,
    #[serde(rename = "type")]
    kind: Option<String>,
    log: Option<String>,
    encoding: Option<String>,
    path: Option<String>,
    result: Option<String>,
    fail_reason: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl Envelope {
    /// Decodes one JSON line.
    pub fn decode_line(line: &str) -> MessageResult<Self> {
        let wire: WireMessage = serde_json::from_str(line)?;
        wire.into_envelope()
    }

    pub fn from_value(value: Value) -> MessageResult<Self> {
        let wire: WireMessage = serde_json::from_value(value)?;
        wire.into_envelope()
    }
}

impl WireMessage {
    fn into_envelope(self) -> MessageResult<Envelope> {
        let status = self.status.ok_or(MessageError::MissingField("status"))?;
        let message = match status.as_str() {
            "started" => Message::Started {
                time: self.time.ok_or(MessageError::MissingField("time"))?,
            },
            "finished" => Message::Finished(Finished {
                time: self.time.ok_or(MessageError::MissingField("time"))?,
                result: self
                    .result
                    .as_deref()
                    .map(str::parse::<TestStatus>)
                    .transpose()?,
                fail_reason: self.fail_reason,
                extra: self.extra,
            }),
            "running" => {
                let time = self.time.ok_or(MessageError::MissingField("time"))?;
                let kind = self.kind.ok_or(MessageError::MissingField("type"))?;
                let event = match RunningKind::from_wire(&kind) {
                    None => RunningEvent::Unknown { kind },
                    Some(kind) => {
                        let log = self.log.ok_or(MessageError::MissingField("log"))?;
                        let payload = Payload {
                            data: decode_log(&log)?,
                            encoding: self.encoding,
                        };
                        match kind {
                            RunningKind::Log => RunningEvent::Log(payload),
                            RunningKind::Stdout => RunningEvent::Stdout(payload),
                            RunningKind::Stderr => RunningEvent::Stderr(payload),
                            RunningKind::Whiteboard => RunningEvent::Whiteboard(payload),
                            RunningKind::Output => RunningEvent::Output(payload),
                            RunningKind::File => RunningEvent::File {
                                path: self.path.ok_or(MessageError::MissingField("path"))?,
                                payload,
                            },
                        }
                    }
                };
                Message::Running { time, event }
            }
            _ => Message::Unknown { status },
        };
        Ok(Envelope {
            task: self.task,
            message,
        })
    }
}

fn decode_log(log: &str) -> MessageResult<Vec<u8>> {
    match log.strip_prefix(BASE64_PREFIX) {
        Some(encoded) => Ok(STANDARD.decode(encoded.trim())?),
        None => Ok(log.as_bytes().to_vec()),
    }
}

/// Encodes raw bytes for the `log` field.
pub fn encode_log(data: &[u8]) -> String {
    format!("{BASE64_PREFIX}{}", STANDARD.encode(data))
}
