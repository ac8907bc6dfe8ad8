//! The reporter contract, the broadcast facade, and the built-in console
//! and JSON reporters.

use std::path::PathBuf;

use anyhow::{bail, Context as _};
use colored::Colorize as _;
#[allow(unused_imports)]
use log::{debug, error};
use serde::Deserialize;
use serde_json::Value;

use crate::repo::{TaskSchema, TestEntry, TestSetEntry, ValidationIssue};
use crate::report::{CompleteReport, TaskReport, TestReport, TestSetReport};
use crate::util::ResultExt as _;

/// Lifecycle listener. Every operation is required, so providing a complete
/// implementation is checked at compile time rather than at registration.
pub trait Reporter: Send + Sync {
    fn log_validation_errors(&self, issues: &[ValidationIssue]);
    fn log_test_set_begin(&self, set: &TestSetEntry);
    fn log_test_set_complete(&self, set: &TestSetEntry, report: &TestSetReport);
    fn log_test_set_skip(&self, set: &TestSetEntry);
    fn log_test_begin(&self, set: &TestSetEntry, test: &TestEntry);
    fn log_test_complete(&self, set: &TestSetEntry, test: &TestEntry, report: &TestReport);
    fn log_test_skip(&self, set: &TestSetEntry, test: &TestEntry);
    fn log_task_begin(&self, set: &TestSetEntry, test: Option<&TestEntry>, task: &TaskSchema);
    fn log_task_complete(
        &self,
        set: &TestSetEntry,
        test: Option<&TestEntry>,
        task: &TaskSchema,
        report: &TaskReport,
    );
    fn generate_report(&self, complete: &CompleteReport);
}

/// Forwards every event to each registered reporter, in registration order.
#[derive(Default)]
pub struct ReporterBroadcast {
    reporters: Vec<Box<dyn Reporter>>,
}

impl ReporterBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reporter: Box<dyn Reporter>) {
        self.reporters.push(reporter);
    }
}

impl Reporter for ReporterBroadcast {
    fn log_validation_errors(&self, issues: &[ValidationIssue]) {
        for reporter in &self.reporters {
            reporter.log_validation_errors(issues);
        }
    }

    fn log_test_set_begin(&self, set: &TestSetEntry) {
        for reporter in &self.reporters {
            reporter.log_test_set_begin(set);
        }
    }

    fn log_test_set_complete(&self, set: &TestSetEntry, report: &TestSetReport) {
        for reporter in &self.reporters {
            reporter.log_test_set_complete(set, report);
        }
    }

    fn log_test_set_skip(&self, set: &TestSetEntry) {
        for reporter in &self.reporters {
            reporter.log_test_set_skip(set);
        }
    }

    fn log_test_begin(&self, set: &TestSetEntry, test: &TestEntry) {
        for reporter in &self.reporters {
            reporter.log_test_begin(set, test);
        }
    }

    fn log_test_complete(&self, set: &TestSetEntry, test: &TestEntry, report: &TestReport) {
        for reporter in &self.reporters {
            reporter.log_test_complete(set, test, report);
        }
    }

    fn log_test_skip(&self, set: &TestSetEntry, test: &TestEntry) {
        for reporter in &self.reporters {
            reporter.log_test_skip(set, test);
        }
    }

    fn log_task_begin(&self, set: &TestSetEntry, test: Option<&TestEntry>, task: &TaskSchema) {
        for reporter in &self.reporters {
            reporter.log_task_begin(set, test, task);
        }
    }

    fn log_task_complete(
        &self,
        set: &TestSetEntry,
        test: Option<&TestEntry>,
        task: &TaskSchema,
        report: &TaskReport,
    ) {
        for reporter in &self.reporters {
            reporter.log_task_complete(set, test, task, report);
        }
    }

    fn generate_report(&self, complete: &CompleteReport) {
        for reporter in &self.reporters {
            reporter.generate_report(complete);
        }
    }
}

/// Build a reporter by name with its configuration mapping.
pub fn create_reporter(name: &str, options: &Value) -> anyhow::Result<Box<dyn Reporter>> {
    match name {
        "console" => Ok(Box::new(ConsoleReporter::from_options(options)?)),
        "json" => Ok(Box::new(JsonReporter::from_options(options)?)),
        other => bail!("unknown reporter {:?}", other),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConsoleOptions {
    #[serde(default)]
    show_tasks: bool,
}

pub struct ConsoleReporter {
    show_tasks: bool,
}

impl ConsoleReporter {
    pub fn from_options(options: &Value) -> anyhow::Result<Self> {
        let options: ConsoleOptions = if options.is_null() {
            ConsoleOptions::default()
        } else {
            serde_json::from_value(options.clone()).context("parsing console reporter options")?
        };
        Ok(Self {
            show_tasks: options.show_tasks,
        })
    }

    fn indent(set: &TestSetEntry) -> String {
        "  ".repeat(set.path.len())
    }

    fn print_task_errors(indent: &str, report: &TaskReport) {
        if report.errors.is_empty() {
            return;
        }
        println!("{indent}  {} {}", "✗".red(), report.label);
        for error in &report.errors {
            println!("{indent}    {}", error.to_string().red());
        }
    }
}

impl Reporter for ConsoleReporter {
    fn log_validation_errors(&self, issues: &[ValidationIssue]) {
        eprintln!("{}", "Invalid test documents:".red().bold());
        for issue in issues {
            eprintln!("  {}", issue);
        }
    }

    fn log_test_set_begin(&self, set: &TestSetEntry) {
        if set.schema.is_some() {
            println!("{}{}", Self::indent(set), set.id.bold());
        }
    }

    fn log_test_set_complete(&self, set: &TestSetEntry, report: &TestSetReport) {
        let hooks = report.before_all.iter().chain(report.after_all.iter());
        for task_report in hooks {
            Self::print_task_errors(&Self::indent(set), task_report);
        }
    }

    fn log_test_set_skip(&self, set: &TestSetEntry) {
        println!(
            "{}{} {} {}",
            Self::indent(set),
            "-".yellow(),
            set.id,
            "(skipped)".yellow()
        );
    }

    fn log_test_begin(&self, _set: &TestSetEntry, _test: &TestEntry) {}

    fn log_test_complete(&self, set: &TestSetEntry, test: &TestEntry, report: &TestReport) {
        let indent = Self::indent(set);
        if report.error_count == 0 {
            println!("{indent}  {} {}", "✓".green(), test.schema.description);
        } else {
            println!("{indent}  {} {}", "✗".red(), test.schema.description.red());
            let task_reports = report
                .before_each
                .iter()
                .chain(report.tasks.iter())
                .chain(report.after_each.iter());
            for task_report in task_reports {
                Self::print_task_errors(&indent, task_report);
            }
        }
    }

    fn log_test_skip(&self, set: &TestSetEntry, test: &TestEntry) {
        println!(
            "{}  {} {} {}",
            Self::indent(set),
            "-".yellow(),
            test.schema.description,
            "(skipped)".yellow()
        );
    }

    fn log_task_begin(&self, set: &TestSetEntry, _test: Option<&TestEntry>, task: &TaskSchema) {
        if self.show_tasks {
            println!("{}    {} {}", Self::indent(set), "▸".dimmed(), task.r#do.dimmed());
        }
    }

    fn log_task_complete(
        &self,
        set: &TestSetEntry,
        _test: Option<&TestEntry>,
        _task: &TaskSchema,
        report: &TaskReport,
    ) {
        if self.show_tasks {
            let mark = if report.errors.is_empty() {
                "✓".green()
            } else {
                "✗".red()
            };
            println!("{}    {} {}", Self::indent(set), mark, report.label.dimmed());
        }
    }

    fn generate_report(&self, complete: &CompleteReport) {
        let failed = complete.failed_test_count();
        let summary = format!(
            "{} test(s), {} failed, {} skipped, {} error(s) in {:.3}s",
            complete.test_count,
            failed,
            complete.skipped_count,
            complete.error_count,
            complete.duration_secs
        );
        if complete.error_count == 0 {
            println!("{}", summary.green().bold());
        } else {
            println!("{}", summary.red().bold());
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JsonOptions {
    path: Option<PathBuf>,
}

/// Serializes the complete report once the run is over. The lifecycle
/// events carry nothing this reporter needs, so they are no-ops.
pub struct JsonReporter {
    path: Option<PathBuf>,
}

impl JsonReporter {
    pub fn from_options(options: &Value) -> anyhow::Result<Self> {
        let options: JsonOptions = if options.is_null() {
            JsonOptions::default()
        } else {
            serde_json::from_value(options.clone()).context("parsing json reporter options")?
        };
        Ok(Self { path: options.path })
    }
}

impl Reporter for JsonReporter {
    fn log_validation_errors(&self, _issues: &[ValidationIssue]) {}
    fn log_test_set_begin(&self, _set: &TestSetEntry) {}
    fn log_test_set_complete(&self, _set: &TestSetEntry, _report: &TestSetReport) {}
    fn log_test_set_skip(&self, _set: &TestSetEntry) {}
    fn log_test_begin(&self, _set: &TestSetEntry, _test: &TestEntry) {}
    fn log_test_complete(&self, _set: &TestSetEntry, _test: &TestEntry, _report: &TestReport) {}
    fn log_test_skip(&self, _set: &TestSetEntry, _test: &TestEntry) {}
    fn log_task_begin(&self, _set: &TestSetEntry, _test: Option<&TestEntry>, _task: &TaskSchema) {}
    fn log_task_complete(
        &self,
        _set: &TestSetEntry,
        _test: Option<&TestEntry>,
        _task: &TaskSchema,
        _report: &TaskReport,
    ) {
    }

    fn generate_report(&self, complete: &CompleteReport) {
        match serde_json::to_string_pretty(complete) {
            Err(err) => error!("serializing the run report - {err}"),
            Ok(rendered) => match &self.path {
                Some(path) => {
                    std::fs::write(path, rendered)
                        .or_log_error(&format!("writing report to {}", path.display()));
                }
                None => println!("{rendered}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use googletest::{assert_that, expect_that, prelude::*};

    use super::*;

    struct RecordingReporter {
        tag: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Reporter for RecordingReporter {
        fn log_validation_errors(&self, issues: &[ValidationIssue]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:validation({})", self.tag, issues.len()));
        }
        fn log_test_set_begin(&self, _set: &TestSetEntry) {}
        fn log_test_set_complete(&self, _set: &TestSetEntry, _report: &TestSetReport) {}
        fn log_test_set_skip(&self, _set: &TestSetEntry) {}
        fn log_test_begin(&self, _set: &TestSetEntry, _test: &TestEntry) {}
        fn log_test_complete(&self, _set: &TestSetEntry, _test: &TestEntry, _report: &TestReport) {}
        fn log_test_skip(&self, _set: &TestSetEntry, _test: &TestEntry) {}
        fn log_task_begin(
            &self,
            _set: &TestSetEntry,
            _test: Option<&TestEntry>,
            _task: &TaskSchema,
        ) {
        }
        fn log_task_complete(
            &self,
            _set: &TestSetEntry,
            _test: Option<&TestEntry>,
            _task: &TaskSchema,
            _report: &TaskReport,
        ) {
        }
        fn generate_report(&self, _complete: &CompleteReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:complete", self.tag));
        }
    }

    #[googletest::test]
    fn test_broadcast_forwards_in_registration_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut broadcast = ReporterBroadcast::new();
        broadcast.register(Box::new(RecordingReporter {
            tag: "first",
            events: events.clone(),
        }));
        broadcast.register(Box::new(RecordingReporter {
            tag: "second",
            events: events.clone(),
        }));

        broadcast.log_validation_errors(&[]);
        broadcast.generate_report(&CompleteReport::default());

        assert_that!(
            events.lock().unwrap().clone(),
            eq(&vec![
                "first:validation(0)".to_owned(),
                "second:validation(0)".to_owned(),
                "first:complete".to_owned(),
                "second:complete".to_owned(),
            ])
        );
    }

    #[googletest::test]
    fn test_create_reporter_by_name() {
        expect_that!(create_reporter("console", &Value::Null), ok(anything()));
        expect_that!(create_reporter("json", &Value::Null), ok(anything()));
        expect_that!(create_reporter("xml", &Value::Null), err(anything()));
    }

    #[googletest::test]
    fn test_json_reporter_writes_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let reporter =
            JsonReporter::from_options(&serde_json::json!({"path": path})).unwrap();
        reporter.generate_report(&CompleteReport {
            test_count: 2,
            ..Default::default()
        });
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_that!(written["testCount"], eq(&serde_json::json!(2)));
    }
}
