//! xUnit (JUnit XML) results.
//!
//! [`JUnitReport`] is a [`ResultListener`]: it records every test that ends
//! and renders them as one test suite named after the job:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuite name="job-id" tests="3" failures="1" errors="0" skipped="1" time="1.500">
//!   <testcase classname="tests.passtest" name="PassTest.test" time="0.500"/>
//!   <testcase classname="tests.failtest" name="FailTest.test" time="1.000">
//!     <failure type="FAIL" message="assertion failed"/>
//!   </testcase>
//!   <testcase classname="tests.skiptest" name="SkipTest.test" time="0.000">
//!     <skipped/>
//!   </testcase>
//! </testsuite>
//! ```

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::message::TestStatus;
use crate::result::{EventContext, ListenerResult, ResultListener, TestState};

/// Collects ended tests and writes them as JUnit XML.
#[derive(Debug, Default)]
pub struct JUnitReport {
    tests: Mutex<Vec<TestState>>,
}

impl JUnitReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the recorded tests as a suite named `suite`.
    pub fn generate_xml(&self, suite: &str) -> anyhow::Result<String> {
        let tests = self.tests.lock().unwrap_or_else(PoisonError::into_inner);
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let count = |wanted: &[TestStatus]| {
            tests
                .iter()
                .filter(|t| t.status.is_some_and(|s| wanted.contains(&s)))
                .count()
        };
        let failures = count(&[TestStatus::Fail]);
        let errors = count(&[TestStatus::Error, TestStatus::Interrupted]);
        let skipped = count(&[TestStatus::Skip, TestStatus::Cancel]);
        let time: f64 = tests.iter().filter_map(|t| t.time_elapsed).sum();

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", xml_safe(suite).as_str()));
        testsuite.push_attribute(("tests", tests.len().to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("errors", errors.to_string().as_str()));
        testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for test in tests.iter() {
            write_testcase(&mut writer, test)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        Ok(String::from_utf8(writer.into_inner())?)
    }

    /// Writes the XML to `path`.
    pub fn write(&self, path: &Path, suite: &str) -> anyhow::Result<()> {
        let xml = self.generate_xml(suite)?;
        std::fs::write(path, xml)?;
        tracing::info!("xUnit results written to: {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ResultListener for JUnitReport {
    fn name(&self) -> &str {
        "xunit"
    }

    async fn end_test(&self, _ctx: &EventContext, state: &TestState) -> ListenerResult<()> {
        self.tests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        Ok(())
    }
}

fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, test: &TestState) -> anyhow::Result<()> {
    let (classname, name) = split_test_name(test.id.name());
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", xml_safe(&classname).as_str()));
    testcase.push_attribute(("name", xml_safe(&name).as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", test.time_elapsed.unwrap_or(0.0)).as_str(),
    ));

    let element = match test.status {
        Some(TestStatus::Pass) | Some(TestStatus::Warn) => None,
        Some(TestStatus::Fail) => Some("failure"),
        Some(TestStatus::Skip) | Some(TestStatus::Cancel) => Some("skipped"),
        Some(TestStatus::Error) | Some(TestStatus::Interrupted) | None => Some("error"),
    };
    let Some(element) = element else {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    };

    writer.write_event(Event::Start(testcase))?;
    let mut child = BytesStart::new(element);
    if element != "skipped" {
        let kind = test.status.map_or("ERROR", |s| s.as_str());
        child.push_attribute(("type", kind));
        if let Some(reason) = &test.fail_reason {
            child.push_attribute(("message", xml_safe(reason).as_str()));
        }
    }
    writer.write_event(Event::Empty(child))?;

    if !test.whiteboard.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&xml_safe(&test.whiteboard))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Splits `path/to/file.py:Class.test` into `("path.to.file", "Class.test")`.
fn split_test_name(name: &str) -> (String, String) {
    match name.rsplit_once(':') {
        Some((file, test)) if !file.is_empty() && !test.is_empty() => {
            let classname = file
                .trim_end_matches(".py")
                .trim_start_matches("./")
                .replace('/', ".");
            (classname, test.to_string())
        }
        _ => ("avocado".to_string(), name.to_string()),
    }
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn xml_safe(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::TestId;
    use std::path::PathBuf;

    fn state(uid: u32, name: &str, status: Option<TestStatus>) -> TestState {
        TestState {
            id: TestId::new(uid, name),
            status,
            time_start: Some(0.0),
            time_end: Some(0.5),
            time_elapsed: Some(0.5),
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
    fn test_split_test_name() {
        assert_eq!(
            split_test_name("tests/passtest.py:PassTest.test"),
            ("tests.passtest".to_string(), "PassTest.test".to_string())
        );
        assert_eq!(
            split_test_name("/bin/true"),
            ("avocado".to_string(), "/bin/true".to_string())
        );
    }

    #[test]
    fn test_xml_safe_strips_control_chars() {
        assert_eq!(xml_safe("a\u{1}b\tc"), "ab\tc");
    }

    #[tokio::test]
    async fn test_generate_xml_counts_and_elements() {
        let report = JUnitReport::new();
        report
            .end_test(&ctx(), &state(1, "t.py:A.pass", Some(TestStatus::Pass)))
            .await
            .unwrap();
        let mut failed = state(2, "t.py:A.fail", Some(TestStatus::Fail));
        failed.fail_reason = Some("1 < 2".into());
        report.end_test(&ctx(), &failed).await.unwrap();
        report
            .end_test(&ctx(), &state(3, "t.py:A.skip", Some(TestStatus::Skip)))
            .await
            .unwrap();
        report
            .end_test(&ctx(), &state(4, "t.py:A.lost", None))
            .await
            .unwrap();

        let xml = report.generate_xml("job").unwrap();
        assert!(xml.contains(r#"<testsuite name="job" tests="4" failures="1" errors="1" skipped="1" time="2.000">"#));
        assert!(xml.contains(r#"<testcase classname="t" name="A.pass" time="0.500"/>"#));
        assert!(xml.contains(r#"<failure type="FAIL" message="1 &lt; 2"/>"#));
        assert!(xml.contains("<skipped/>"));
        assert!(xml.contains(r#"<error type="ERROR"/>"#));
    }
}
