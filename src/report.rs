//! The report tree produced by a run, parallel to the test-set tree.

use serde::Serialize;
use serde_json::Value;

use crate::module::AssertionError;
use crate::repo::TaskSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Validation,
    Run,
    Expect,
    Set,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task: TaskSchema,
    pub label: String,
    pub run_args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_args: Option<Value>,
    /// Last phase the task entered.
    pub phase: TaskPhase,
    pub errors: Vec<AssertionError>,
}

impl TaskReport {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub description: String,
    pub before_each: Vec<TaskReport>,
    pub tasks: Vec<TaskReport>,
    pub after_each: Vec<TaskReport>,
    pub error_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSetReport {
    pub id: String,
    pub name: String,
    pub before_all: Vec<TaskReport>,
    pub after_all: Vec<TaskReport>,
    pub tests: Vec<TestReport>,
    pub children: Vec<TestSetReport>,
    pub test_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteReport {
    pub test_sets: Vec<TestSetReport>,
    pub test_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub duration_secs: f64,
}

impl CompleteReport {
    /// Number of executed tests whose report carries at least one error.
    pub fn failed_test_count(&self) -> usize {
        fn count(set: &TestSetReport) -> usize {
            set.tests.iter().filter(|t| t.error_count > 0).count()
                + set.children.iter().map(count).sum::<usize>()
        }
        self.test_sets.iter().map(count).sum()
    }
}
