//! The repository: validates test documents against the composed grammar,
//! places them in a namespaced tree of test sets, checks task references,
//! and derives the effective tree after inheritance.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use anyhow::anyhow;
use itertools::Itertools as _;
#[allow(unused_imports)]
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::loader::TestDocument;
use crate::module::ModuleRegistry;
use crate::schema::{compose_document_schema, format_schema_error};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub r#do: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_before_async: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub skip: bool,
    pub tasks: Vec<TaskSchema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    #[default]
    Async,
    Sync,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestSetSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub before_all: Vec<TaskSchema>,
    #[serde(default)]
    pub after_all: Vec<TaskSchema>,
    #[serde(default)]
    pub before_each: Vec<TaskSchema>,
    #[serde(default)]
    pub after_each: Vec<TaskSchema>,
    #[serde(default)]
    pub execution_order: ExecutionOrder,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub tests: Vec<TestSchema>,
}

/// A test with its effective tag list and skip flag after inheritance.
#[derive(Debug, Clone)]
pub struct TestEntry {
    pub schema: TestSchema,
    pub tags: Vec<String>,
    pub skip: bool,
}

static EMPTY_VALUES: LazyLock<Map<String, Value>> = LazyLock::new(Map::new);

/// A node of the namespace tree. Placeholder nodes (created for the
/// intermediate segments of a dotted name) have no schema until a document
/// claims them.
#[derive(Debug)]
pub struct TestSetEntry {
    pub id: String,
    pub name: String,
    pub path: Vec<String>,
    pub schema: Option<TestSetSchema>,
    pub tags: Vec<String>,
    pub before_each: Vec<TaskSchema>,
    pub after_each: Vec<TaskSchema>,
    pub skip: bool,
    pub tests: Vec<TestEntry>,
    pub children: BTreeMap<String, TestSetEntry>,
    pub test_count: usize,
}

impl TestSetEntry {
    fn new(id: String, name: String, path: Vec<String>) -> Self {
        Self {
            id,
            name,
            path,
            schema: None,
            tags: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
            skip: false,
            tests: Vec::new(),
            children: BTreeMap::new(),
            test_count: 0,
        }
    }

    pub fn before_all(&self) -> &[TaskSchema] {
        self.schema.as_ref().map(|s| s.before_all.as_slice()).unwrap_or(&[])
    }

    pub fn after_all(&self) -> &[TaskSchema] {
        self.schema.as_ref().map(|s| s.after_all.as_slice()).unwrap_or(&[])
    }

    pub fn defaults(&self) -> &Map<String, Value> {
        self.schema.as_ref().map(|s| &s.defaults).unwrap_or(&EMPTY_VALUES)
    }

    pub fn params(&self) -> &Map<String, Value> {
        self.schema.as_ref().map(|s| &s.params).unwrap_or(&EMPTY_VALUES)
    }

    pub fn execution_order(&self) -> ExecutionOrder {
        self.schema.as_ref().map(|s| s.execution_order).unwrap_or_default()
    }

    /// Walk the chain of path segments below this node, creating
    /// placeholders as needed, and return the final node.
    fn walk_create(&mut self, segments: &[&str]) -> &mut TestSetEntry {
        let mut node = self;
        let mut path = Vec::new();
        for segment in segments {
            path.push(segment.to_string());
            let id = format!("$.{}", path.join("."));
            let name = segment.to_string();
            let child_path = path.clone();
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(|| TestSetEntry::new(id, name, child_path));
        }
        node
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Path of the offending entity, or none when the document failed
    /// grammar validation before a name could be resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub messages: Vec<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = match (&self.id, &self.source) {
            (Some(id), Some(source)) => format!("{} ({})", id, source.display()),
            (Some(id), None) => id.clone(),
            (None, Some(source)) => source.display().to_string(),
            (None, None) => "<unknown document>".to_owned(),
        };
        write!(f, "{}: {}", subject, self.messages.iter().join("; "))
    }
}

#[derive(Debug, Error)]
#[error("{} test document(s) failed validation", .issues.len())]
pub struct ValidationFailure {
    pub issues: Vec<ValidationIssue>,
}

pub struct Repository {
    registry: Arc<ModuleRegistry>,
    validator: jsonschema::Validator,
    ignore_invalid: bool,
    root: TestSetEntry,
}

impl Repository {
    pub fn new(registry: Arc<ModuleRegistry>, ignore_invalid: bool) -> anyhow::Result<Self> {
        let schema = compose_document_schema(&registry);
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("compiling the composed document schema: {err}"))?;
        Ok(Self {
            registry,
            validator,
            ignore_invalid,
            root: TestSetEntry::new("$".to_owned(), String::new(), Vec::new()),
        })
    }

    /// Ingest documents, accumulating their validation issues. When
    /// `ignoreInvalid` is off, any issue fails the whole load; otherwise
    /// invalid documents are dropped and the issues are returned for
    /// reporting.
    pub fn load_documents(
        &mut self,
        documents: Vec<TestDocument>,
    ) -> Result<Vec<ValidationIssue>, ValidationFailure> {
        let mut issues = Vec::new();
        for document in &documents {
            self.load_test_set(document, &mut issues);
        }
        if !issues.is_empty() && !self.ignore_invalid {
            return Err(ValidationFailure { issues });
        }
        Ok(issues)
    }

    fn load_test_set(&mut self, document: &TestDocument, issues: &mut Vec<ValidationIssue>) {
        let grammar_errors: Vec<String> = self
            .validator
            .iter_errors(&document.content)
            .map(|error| format_schema_error(&error))
            .collect();
        if !grammar_errors.is_empty() {
            issues.push(ValidationIssue {
                id: None,
                source: Some(document.path.clone()),
                messages: grammar_errors,
            });
            return;
        }
        let schema: TestSetSchema = match serde_json::from_value(document.content.clone()) {
            Ok(schema) => schema,
            Err(err) => {
                issues.push(ValidationIssue {
                    id: None,
                    source: Some(document.path.clone()),
                    messages: vec![format!("malformed test set: {err}")],
                });
                return;
            }
        };
        let set_id = format!("$.{}", schema.name);

        let mut document_issues = Vec::new();
        let hook_lists = [
            ("beforeAll", &schema.before_all),
            ("afterAll", &schema.after_all),
            ("beforeEach", &schema.before_each),
            ("afterEach", &schema.after_each),
        ];
        for (list_name, tasks) in hook_lists {
            self.validate_task_list(
                &format!("{set_id}.{list_name}"),
                tasks,
                document,
                &mut document_issues,
            );
        }
        for (index, test) in schema.tests.iter().enumerate() {
            self.validate_task_list(
                &format!("{set_id}.tests[{index}].tasks"),
                &test.tasks,
                document,
                &mut document_issues,
            );
        }

        let segments: Vec<&str> = schema.name.split('.').collect();
        let node = self.root.walk_create(&segments);
        if node.schema.is_some() {
            issues.push(ValidationIssue {
                id: Some(set_id),
                source: Some(document.path.clone()),
                messages: vec![format!("duplicate test set name {:?}", schema.name)],
            });
            issues.append(&mut document_issues);
            return;
        }
        if !document_issues.is_empty() {
            issues.append(&mut document_issues);
            return;
        }
        node.tests = schema
            .tests
            .iter()
            .map(|test| TestEntry {
                schema: test.clone(),
                tags: Vec::new(),
                skip: false,
            })
            .collect();
        node.schema = Some(schema);
        debug!("loaded test set {:?} from {:?}", node.id, document.filename);
    }

    fn validate_task_list(
        &self,
        id_prefix: &str,
        tasks: &[TaskSchema],
        document: &TestDocument,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let mut ids = HashSet::new();
        let mut duplicate_ids = HashSet::new();
        for task in tasks {
            if let Some(id) = &task.id {
                if !ids.insert(id.as_str()) {
                    duplicate_ids.insert(id.as_str());
                }
            }
        }
        for (index, task) in tasks.iter().enumerate() {
            let mut messages = Vec::new();
            match self.registry.get_command(&task.r#do) {
                None => messages.push(format!("unknown command {:?}", task.r#do)),
                Some(command) => {
                    let args = task.args.clone().unwrap_or_else(|| Value::Object(Map::new()));
                    messages.extend(
                        command
                            .check_args(&args)
                            .into_iter()
                            .map(|error| format!("invalid args: {error}")),
                    );
                    if let Some(expect) = &task.expect {
                        messages.extend(
                            command
                                .check_expect(expect)
                                .into_iter()
                                .map(|error| format!("invalid expect: {error}")),
                        );
                    }
                }
            }
            if let Some(id) = &task.id {
                if duplicate_ids.contains(id.as_str()) {
                    messages.push(format!("task id {:?} is not unique within its list", id));
                }
            }
            if let Some(target) = &task.run_before_async {
                if !ids.contains(target.as_str()) {
                    messages.push(format!(
                        "runBeforeAsync target {:?} not found in the same task list",
                        target
                    ));
                }
            }
            if !messages.is_empty() {
                issues.push(ValidationIssue {
                    id: Some(format!("{id_prefix}[{index}]")),
                    source: Some(document.path.clone()),
                    messages,
                });
            }
        }
    }

    /// Propagate inheritance top-down and compute test counts bottom-up.
    pub fn build(&mut self) {
        let empty_tags: Vec<String> = Vec::new();
        let empty_tasks: Vec<TaskSchema> = Vec::new();
        for child in self.root.children.values_mut() {
            Self::build_node(child, &empty_tags, &empty_tasks, &empty_tasks, false);
        }
        self.root.test_count = self.root.children.values().map(|c| c.test_count).sum();
    }

    fn build_node(
        node: &mut TestSetEntry,
        parent_tags: &[String],
        parent_before_each: &[TaskSchema],
        parent_after_each: &[TaskSchema],
        parent_skip: bool,
    ) {
        let (own_tags, own_before, own_after, own_skip) = match &node.schema {
            Some(schema) => (
                schema.tags.clone(),
                schema.before_each.clone(),
                schema.after_each.clone(),
                schema.skip,
            ),
            None => (Vec::new(), Vec::new(), Vec::new(), false),
        };
        node.tags = parent_tags.iter().cloned().chain(own_tags).collect();
        node.before_each = parent_before_each.iter().cloned().chain(own_before).collect();
        node.after_each = parent_after_each.iter().cloned().chain(own_after).collect();
        node.skip = parent_skip || own_skip;
        for test in &mut node.tests {
            test.tags = node
                .tags
                .iter()
                .cloned()
                .chain(test.schema.tags.iter().cloned())
                .collect();
            test.skip = node.skip || test.schema.skip;
        }

        let mut test_count = node.tests.len();
        let TestSetEntry {
            children,
            tags,
            before_each,
            after_each,
            skip,
            ..
        } = node;
        for child in children.values_mut() {
            Self::build_node(child, tags, before_each, after_each, *skip);
            test_count += child.test_count;
        }
        node.test_count = test_count;
    }

    pub fn tests(&self) -> &BTreeMap<String, TestSetEntry> {
        &self.root.children
    }
}
