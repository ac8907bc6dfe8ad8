//! Execution of the resolved test-set tree.
//!
//! Sibling test sets and the tests of an `async` set run concurrently, but
//! each task list is driven by a single coordinator: it starts a task,
//! waits for its ready latch, and only records completions at the task's
//! wait step. Context mutation (the `set` phase) happens exclusively on the
//! coordinator, between a wait step and the next scheduled step.

use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt as _;
#[allow(unused_imports)]
use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::interpolate;
use crate::module::{ready_latch, AssertionError, ModuleRegistry};
use crate::repo::{ExecutionOrder, Repository, TaskSchema, TestEntry, TestSetEntry};
use crate::report::{CompleteReport, TaskPhase, TaskReport, TestReport, TestSetReport};
use crate::reporter::{Reporter, ReporterBroadcast};
use crate::util::{deep_merge, deep_merge_maps};

/// The `{params, defaults}` value threaded through execution. Copied on
/// descent into each test set and test; only a task's `set` phase mutates
/// the params of the copy it runs under.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub params: Map<String, Value>,
    pub defaults: Map<String, Value>,
}

impl RunContext {
    fn child(&self, defaults: &Map<String, Value>, params: &Map<String, Value>) -> Self {
        Self {
            params: deep_merge_maps(&self.params, params),
            defaults: deep_merge_maps(&self.defaults, defaults),
        }
    }

    fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }
}

pub struct Runner {
    registry: Arc<ModuleRegistry>,
    reporters: Arc<ReporterBroadcast>,
}

impl Runner {
    pub fn new(registry: Arc<ModuleRegistry>, reporters: Arc<ReporterBroadcast>) -> Self {
        Self {
            registry,
            reporters,
        }
    }

    pub async fn run(&self, repo: &Repository) -> CompleteReport {
        let started = Instant::now();
        let ctx = RunContext::default();
        let mut complete = CompleteReport::default();
        let mut pending = Vec::new();
        for set in repo.tests().values() {
            if set.skip {
                self.reporters.log_test_set_skip(set);
                complete.test_count += set.test_count;
                complete.skipped_count += set.test_count;
            } else {
                pending.push(self.run_test_set(set, ctx.clone()));
            }
        }
        for report in join_all(pending).await {
            complete.test_count += report.test_count;
            complete.skipped_count += report.skipped_count;
            complete.error_count += report.error_count;
            complete.test_sets.push(report);
        }
        complete.duration_secs = started.elapsed().as_secs_f64();
        complete
    }

    fn run_test_set<'a>(
        &'a self,
        set: &'a TestSetEntry,
        parent_ctx: RunContext,
    ) -> BoxFuture<'a, TestSetReport> {
        async move {
            let mut ctx = parent_ctx.child(set.defaults(), set.params());
            self.reporters.log_test_set_begin(set);
            let mut report = TestSetReport {
                id: set.id.clone(),
                name: set.name.clone(),
                ..Default::default()
            };

            report.before_all = self.run_task_list(set, None, set.before_all(), &mut ctx).await;
            let before_all_errors: usize =
                report.before_all.iter().map(TaskReport::error_count).sum();

            if before_all_errors == 0 {
                let tests_ctx = ctx.clone();
                let tests_fut = async {
                    let mut reports = Vec::new();
                    let mut skipped = 0usize;
                    match set.execution_order() {
                        ExecutionOrder::Sync => {
                            for test in &set.tests {
                                if test.skip {
                                    self.reporters.log_test_skip(set, test);
                                    skipped += 1;
                                } else {
                                    reports.push(self.run_test(set, test, tests_ctx.clone()).await);
                                }
                            }
                        }
                        ExecutionOrder::Async => {
                            let mut pending = Vec::new();
                            for test in &set.tests {
                                if test.skip {
                                    self.reporters.log_test_skip(set, test);
                                    skipped += 1;
                                } else {
                                    pending.push(self.run_test(set, test, tests_ctx.clone()));
                                }
                            }
                            reports = join_all(pending).await;
                        }
                    }
                    (reports, skipped)
                };
                let children_ctx = ctx.clone();
                let children_fut = async {
                    let mut skipped = 0usize;
                    let mut pending = Vec::new();
                    for child in set.children.values() {
                        if child.skip {
                            self.reporters.log_test_set_skip(child);
                            skipped += child.test_count;
                        } else {
                            pending.push(self.run_test_set(child, children_ctx.clone()));
                        }
                    }
                    (join_all(pending).await, skipped)
                };
                let ((test_reports, skipped_tests), (child_reports, skipped_child_tests)) =
                    futures::join!(tests_fut, children_fut);

                report.test_count = test_reports.len() + skipped_tests + skipped_child_tests;
                report.skipped_count = skipped_tests + skipped_child_tests;
                for test_report in &test_reports {
                    report.error_count += test_report.error_count;
                }
                for child_report in &child_reports {
                    report.test_count += child_report.test_count;
                    report.skipped_count += child_report.skipped_count;
                    report.error_count += child_report.error_count;
                }
                report.tests = test_reports;
                report.children = child_reports;
            }

            report.after_all = self.run_task_list(set, None, set.after_all(), &mut ctx).await;
            report.error_count += before_all_errors;
            report.error_count += report
                .after_all
                .iter()
                .map(TaskReport::error_count)
                .sum::<usize>();
            self.reporters.log_test_set_complete(set, &report);
            report
        }
        .boxed()
    }

    async fn run_test(
        &self,
        set: &TestSetEntry,
        test: &TestEntry,
        parent_ctx: RunContext,
    ) -> TestReport {
        let mut ctx = parent_ctx.child(&test.schema.defaults, &test.schema.params);
        self.reporters.log_test_begin(set, test);

        let before_each = self
            .run_task_list(set, Some(test), &set.before_each, &mut ctx)
            .await;
        let before_errors: usize = before_each.iter().map(TaskReport::error_count).sum();
        let tasks = if before_errors == 0 {
            self.run_task_list(set, Some(test), &test.schema.tasks, &mut ctx)
                .await
        } else {
            Vec::new()
        };
        let after_each = self
            .run_task_list(set, Some(test), &set.after_each, &mut ctx)
            .await;

        let error_count = before_errors
            + tasks.iter().map(TaskReport::error_count).sum::<usize>()
            + after_each.iter().map(TaskReport::error_count).sum::<usize>();
        let report = TestReport {
            name: test.schema.name.clone(),
            description: test.schema.description.clone(),
            before_each,
            tasks,
            after_each,
            error_count,
        };
        self.reporters.log_test_complete(set, test, &report);
        report
    }

    /// Execute one task list on a single coordinator, following the planned
    /// run/wait steps. Reports come back in wait-step order.
    async fn run_task_list(
        &self,
        set: &TestSetEntry,
        test: Option<&TestEntry>,
        tasks: &[TaskSchema],
        ctx: &mut RunContext,
    ) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        if tasks.is_empty() {
            return reports;
        }
        let steps = plan_task_list(tasks);
        let mut started: Vec<Option<StartedTask>> = tasks.iter().map(|_| None).collect();
        let mut terminate = false;
        for step in steps {
            let task = &tasks[step.task];
            match step.kind {
                StepKind::Run => {
                    // No new work once a task has failed the list, but tasks
                    // that are already in flight still get their wait step.
                    if terminate {
                        continue;
                    }
                    let mut in_flight = self.start_task(set, test, task, ctx);
                    if let Some(pending) = &mut in_flight.pending {
                        pending.await_ready().await;
                    }
                    started[step.task] = Some(in_flight);
                }
                StepKind::Wait => {
                    let Some(in_flight) = started[step.task].take() else {
                        continue;
                    };
                    let report = self.finish_task(set, test, task, in_flight, ctx).await;
                    let failed = report.error_count() > 0;
                    reports.push(report);
                    if failed && !task.continue_on_error {
                        terminate = true;
                    }
                }
            }
        }
        reports
    }

    fn start_task(
        &self,
        set: &TestSetEntry,
        test: Option<&TestEntry>,
        task: &TaskSchema,
        ctx: &RunContext,
    ) -> StartedTask {
        self.reporters.log_task_begin(set, test, task);
        let params = ctx.params_value();
        let raw_args = task.args.clone().unwrap_or_else(|| Value::Object(Map::new()));
        let interpolated = interpolate::resolve(&params, &raw_args);
        let expect_args = task
            .expect
            .as_ref()
            .map(|expect| interpolate::resolve(&params, expect));

        let Some(command) = self.registry.get_command(&task.r#do) else {
            // The repository refuses documents with unresolved commands, so
            // this only fires for hand-built trees.
            return StartedTask {
                report: TaskReport {
                    task: task.clone(),
                    label: task.r#do.clone(),
                    run_args: interpolated,
                    expect_args,
                    result: None,
                    set_args: None,
                    phase: TaskPhase::Validation,
                    errors: vec![AssertionError::new(format!(
                        "unknown command {:?}",
                        task.r#do
                    ))],
                },
                pending: None,
            };
        };

        let module_defaults = match ctx.defaults.get(&command.module) {
            Some(defaults) => defaults.clone(),
            None => Value::Object(Map::new()),
        };
        let run_args = deep_merge(&module_defaults, &interpolated);
        let label_expect = expect_args.clone().unwrap_or(Value::Null);
        let label = task
            .description
            .clone()
            .or_else(|| command.handler.label(&run_args, &label_expect))
            .unwrap_or_else(|| task.r#do.clone());
        let mut report = TaskReport {
            task: task.clone(),
            label,
            run_args: run_args.clone(),
            expect_args: expect_args.clone(),
            result: None,
            set_args: None,
            phase: TaskPhase::Validation,
            errors: Vec::new(),
        };

        // Interpolation and defaults can change the shape of the raw args
        // the repository validated, so the compiled validators run again on
        // the effective values, then the command's own hooks.
        let mut validation_errors = Vec::new();
        let schema_errors = command.check_args(&run_args);
        if !schema_errors.is_empty() {
            validation_errors.push(AssertionError::schema_errors(schema_errors));
        }
        validation_errors.extend(command.handler.validate_args(&run_args));
        if let Some(expect) = &expect_args {
            let schema_errors = command.check_expect(expect);
            if !schema_errors.is_empty() {
                validation_errors.push(AssertionError::schema_errors(schema_errors));
            }
            validation_errors.extend(command.handler.validate_expect(expect));
        }
        if !validation_errors.is_empty() {
            report.errors = validation_errors;
            return StartedTask {
                report,
                pending: None,
            };
        }
        report.phase = TaskPhase::Run;

        let handler = command.handler.clone();
        let (ready, ready_rx) = ready_latch();
        let handle = tokio::spawn(async move {
            match handler.run(run_args, ready).await {
                Err(err) => (
                    None,
                    TaskPhase::Run,
                    vec![AssertionError::new(format!(
                        "Failed to execute task run: {err:#}"
                    ))],
                ),
                Ok(result) => {
                    let mut phase = TaskPhase::Run;
                    let mut errors = Vec::new();
                    if let Some(expect) = &expect_args {
                        phase = TaskPhase::Expect;
                        match handler.expect(expect, &result) {
                            Ok(mut assertion_errors) => errors.append(&mut assertion_errors),
                            Err(err) => errors.push(AssertionError::new(format!(
                                "Failed to execute task expect: {err:#}"
                            ))),
                        }
                    }
                    (Some(result), phase, errors)
                }
            }
        });
        StartedTask {
            report,
            pending: Some(Pending {
                handle,
                ready: Some(ready_rx),
            }),
        }
    }

    async fn finish_task(
        &self,
        set: &TestSetEntry,
        test: Option<&TestEntry>,
        task: &TaskSchema,
        in_flight: StartedTask,
        ctx: &mut RunContext,
    ) -> TaskReport {
        let mut report = in_flight.report;
        if let Some(pending) = in_flight.pending {
            match pending.handle.await {
                Ok((result, phase, mut errors)) => {
                    report.result = result;
                    report.phase = phase;
                    report.errors.append(&mut errors);
                }
                Err(err) => {
                    report.errors.push(AssertionError::new(format!(
                        "Failed to execute task run: {err}"
                    )));
                }
            }
            if let (Some(set_mapping), Some(result)) = (&task.set, &report.result) {
                report.phase = TaskPhase::Set;
                let set_args = deep_merge(
                    &Value::Object(Map::new()),
                    &interpolate::resolve(result, set_mapping),
                );
                if let Value::Object(map) = &set_args {
                    ctx.params = deep_merge_maps(&ctx.params, map);
                }
                report.set_args = Some(set_args);
            }
        }
        self.reporters.log_task_complete(set, test, task, &report);
        report
    }

}

struct Pending {
    handle: JoinHandle<(Option<Value>, TaskPhase, Vec<AssertionError>)>,
    ready: Option<tokio::sync::oneshot::Receiver<()>>,
}

impl Pending {
    /// Suspend until the ready latch fires. The latch also resolves when
    /// the command finishes (or drops it) without signalling, so this never
    /// outlives the task itself.
    async fn await_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.await;
        }
    }
}

struct StartedTask {
    report: TaskReport,
    pending: Option<Pending>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Run,
    Wait,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    kind: StepKind,
    task: usize,
    priority: i64,
}

/// Derive the execution plan: a run and a wait step per task, reordered so
/// a task naming a `runBeforeAsync` target starts just before its target
/// while keeping its own wait position.
fn plan_task_list(tasks: &[TaskSchema]) -> Vec<Step> {
    let ids: Vec<String> = tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            task.id
                .clone()
                .unwrap_or_else(|| format!("$_{index}_#"))
        })
        .collect();
    let mut run_orders: Vec<i64> = (0..tasks.len() as i64).map(|i| i * 1000).collect();
    let wait_orders: Vec<i64> = (0..tasks.len() as i64).map(|i| i * 1000 + 1).collect();
    for (index, task) in tasks.iter().enumerate() {
        if let Some(target) = &task.run_before_async {
            if let Some(target_index) = ids.iter().position(|id| id == target) {
                run_orders[index] = run_orders[target_index] - 1;
            }
        }
    }
    let mut steps = Vec::with_capacity(tasks.len() * 2);
    for index in 0..tasks.len() {
        steps.push(Step {
            kind: StepKind::Run,
            task: index,
            priority: run_orders[index],
        });
        steps.push(Step {
            kind: StepKind::Wait,
            task: index,
            priority: wait_orders[index],
        });
    }
    steps.sort_by_key(|step| step.priority);
    steps
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use googletest::{assert_that, expect_that, prelude::*};
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::loader::parse_documents;
    use crate::module::{Command, Module, Ready};

    #[derive(Clone, Default)]
    struct InvocationLog(Arc<Mutex<Vec<String>>>);

    impl InvocationLog {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn runs(&self) -> Vec<String> {
            self.entries()
                .into_iter()
                .filter_map(|entry| entry.strip_prefix("run:").map(str::to_owned))
                .collect()
        }
    }

    /// Behavior is scripted by args: `tag` labels log entries, `notify:
    /// early` signals the ready latch before any delay, `delayMs` sleeps,
    /// `fail` errors out, `result` becomes the task result and
    /// `resultEquals` in the expect args is compared against it.
    struct ScriptedCommand {
        log: InvocationLog,
    }

    #[async_trait::async_trait]
    impl Command for ScriptedCommand {
        fn description(&self) -> &str {
            "scripted by its args"
        }

        fn args_schema(&self) -> Option<Value> {
            Some(json!({"type": "object"}))
        }

        async fn run(&self, args: Value, ready: Ready) -> anyhow::Result<Value> {
            let tag = args.get("tag").and_then(Value::as_str).unwrap_or("?").to_owned();
            self.log.push(format!("run:{tag}"));
            if args.get("notify").and_then(Value::as_str) == Some("early") {
                ready.notify();
            }
            if let Some(ms) = args.get("delayMs").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if args.get("fail").and_then(Value::as_bool) == Some(true) {
                anyhow::bail!("scripted failure");
            }
            self.log.push(format!("end:{tag}"));
            Ok(args.get("result").cloned().unwrap_or(Value::Null))
        }

        fn expect(&self, expect: &Value, result: &Value) -> anyhow::Result<Vec<AssertionError>> {
            let mut errors = Vec::new();
            if let Some(want) = expect.get("resultEquals") {
                if want != result {
                    errors.push(AssertionError::with_values(
                        "unexpected result",
                        want.clone(),
                        result.clone(),
                    ));
                }
            }
            Ok(errors)
        }
    }

    struct CheckedCommand {
        log: InvocationLog,
    }

    #[async_trait::async_trait]
    impl Command for CheckedCommand {
        fn description(&self) -> &str {
            "rejects bad args"
        }

        fn args_schema(&self) -> Option<Value> {
            Some(json!({"type": "object"}))
        }

        fn validate_args(&self, args: &Value) -> Vec<AssertionError> {
            if args.get("bad").and_then(Value::as_bool) == Some(true) {
                vec![AssertionError::new("bad argument")]
            } else {
                Vec::new()
            }
        }

        async fn run(&self, args: Value, _ready: Ready) -> anyhow::Result<Value> {
            let tag = args.get("tag").and_then(Value::as_str).unwrap_or("?");
            self.log.push(format!("run:{tag}"));
            Ok(Value::Null)
        }
    }

    fn fixture(yaml: &str) -> (InvocationLog, Repository, Runner) {
        let log = InvocationLog::default();
        let mut registry = ModuleRegistry::new();
        registry
            .register(Module {
                name: "mock".to_owned(),
                description: None,
                defaults_schema: None,
                commands: BTreeMap::from([
                    (
                        "run".to_owned(),
                        Arc::new(ScriptedCommand { log: log.clone() }) as Arc<dyn Command>,
                    ),
                    (
                        "checked".to_owned(),
                        Arc::new(CheckedCommand { log: log.clone() }) as Arc<dyn Command>,
                    ),
                ]),
            })
            .unwrap();
        let registry = Arc::new(registry);
        let mut repo = Repository::new(registry.clone(), false).unwrap();
        repo.load_documents(parse_documents(Path::new("inline.yaml"), yaml).unwrap())
            .unwrap();
        repo.build();
        let runner = Runner::new(registry, Arc::new(ReporterBroadcast::new()));
        (log, repo, runner)
    }

    fn task_tags(reports: &[TaskReport]) -> Vec<String> {
        reports
            .iter()
            .map(|r| r.run_args["tag"].as_str().unwrap_or("?").to_owned())
            .collect()
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_run_before_async_starts_the_dependent_first() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: pub
            tests:
              - description: publish then consume
                tasks:
                  - id: a
                    do: mock.run
                    args: {tag: a}
                  - do: mock.run
                    args: {tag: b, notify: early, delayMs: 100}
                    runBeforeAsync: a
        "#});
        let complete = runner.run(&repo).await;
        // The dependent task starts (and reaches its ready point) first...
        assert_that!(log.runs(), eq(&vec!["b".to_owned(), "a".to_owned()]));
        // ...but completions are recorded in wait order.
        let tasks = &complete.test_sets[0].tests[0].tasks;
        assert_that!(task_tags(tasks), eq(&vec!["a".to_owned(), "b".to_owned()]));
        expect_that!(log.entries().last().unwrap().clone(), eq(&"end:b".to_owned()));
        expect_that!(complete.error_count, eq(0));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_set_values_propagate_to_later_tasks() {
        let (_log, repo, runner) = fixture(indoc! {r#"
            name: chain
            tests:
              - description: forwards a token
                tasks:
                  - do: mock.run
                    args: {tag: p1, result: {body: {token: xyz}}}
                    set: {token: "$.body.token"}
                  - do: mock.run
                    args: {tag: p2, auth: "${token}"}
        "#});
        let complete = runner.run(&repo).await;
        let tasks = &complete.test_sets[0].tests[0].tasks;
        expect_that!(tasks[0].set_args, some(eq(&json!({"token": "xyz"}))));
        expect_that!(tasks[1].run_args["auth"], eq(&json!("xyz")));
        expect_that!(complete.error_count, eq(0));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_failing_task_stops_the_list() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: halts
            tests:
              - description: stops after the first failure
                tasks:
                  - do: mock.run
                    args: {tag: a, fail: true}
                  - do: mock.run
                    args: {tag: b}
                  - do: mock.run
                    args: {tag: c}
        "#});
        let complete = runner.run(&repo).await;
        assert_that!(log.runs(), eq(&vec!["a".to_owned()]));
        let test = &complete.test_sets[0].tests[0];
        assert_that!(test.tasks, len(eq(1)));
        expect_that!(test.tasks[0].errors[0].to_string(), contains_substring("run"));
        expect_that!(complete.error_count, eq(1));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_continue_on_error_keeps_the_list_going() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: tolerant
            tests:
              - description: keeps going
                tasks:
                  - do: mock.run
                    args: {tag: a, fail: true}
                    continueOnError: true
                  - do: mock.run
                    args: {tag: b}
        "#});
        let complete = runner.run(&repo).await;
        assert_that!(log.runs(), eq(&vec!["a".to_owned(), "b".to_owned()]));
        expect_that!(complete.test_sets[0].tests[0].tasks, len(eq(2)));
        expect_that!(complete.error_count, eq(1));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_before_each_failure_skips_the_body_but_not_after_each() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: hooks
            beforeEach:
              - do: mock.run
                args: {tag: be, fail: true}
            afterEach:
              - do: mock.run
                args: {tag: ae}
            tests:
              - description: never runs its body
                tasks:
                  - do: mock.run
                    args: {tag: body}
        "#});
        let complete = runner.run(&repo).await;
        assert_that!(log.runs(), eq(&vec!["be".to_owned(), "ae".to_owned()]));
        let test = &complete.test_sets[0].tests[0];
        expect_that!(test.tasks, empty());
        expect_that!(test.before_each, len(eq(1)));
        expect_that!(test.after_each, len(eq(1)));
        expect_that!(test.error_count, eq(1));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_sync_sets_run_tests_sequentially() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: ordered
            executionOrder: sync
            tests:
              - description: first
                tasks:
                  - do: mock.run
                    args: {tag: t1, delayMs: 50}
              - description: second
                tasks:
                  - do: mock.run
                    args: {tag: t2}
        "#});
        runner.run(&repo).await;
        assert_that!(
            log.entries(),
            eq(&vec![
                "run:t1".to_owned(),
                "end:t1".to_owned(),
                "run:t2".to_owned(),
                "end:t2".to_owned(),
            ])
        );
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_skipped_sets_contribute_their_transitive_test_count() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: p
            tests:
              - description: runs
                tasks:
                  - do: mock.run
                    args: {tag: p}
            ---
            name: p.c
            skip: true
            tests:
              - description: never one
                tasks: [{do: mock.run, args: {tag: c1}}]
              - description: never two
                tasks: [{do: mock.run, args: {tag: c2}}]
        "#});
        let complete = runner.run(&repo).await;
        assert_that!(log.runs(), eq(&vec!["p".to_owned()]));
        expect_that!(complete.test_count, eq(3));
        expect_that!(complete.skipped_count, eq(2));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_fully_skipped_root_set_runs_nothing() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: off
            skip: true
            tests:
              - description: never
                tasks: [{do: mock.run, args: {tag: x}}]
        "#});
        let complete = runner.run(&repo).await;
        expect_that!(log.entries(), empty());
        expect_that!(complete.test_sets, empty());
        expect_that!(complete.test_count, eq(1));
        expect_that!(complete.skipped_count, eq(1));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_hooks_run_in_accumulated_order() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: api
            beforeEach:
              - do: mock.run
                args: {tag: be-parent}
            ---
            name: api.auth
            beforeEach:
              - do: mock.run
                args: {tag: be-child}
            tests:
              - description: t
                tasks:
                  - do: mock.run
                    args: {tag: body}
        "#});
        runner.run(&repo).await;
        assert_that!(
            log.runs(),
            eq(&vec![
                "be-parent".to_owned(),
                "be-child".to_owned(),
                "body".to_owned(),
            ])
        );
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_validation_hook_errors_stop_the_task_before_run() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: v
            tests:
              - description: t
                tasks:
                  - do: mock.checked
                    args: {bad: true, tag: v1}
        "#});
        let complete = runner.run(&repo).await;
        expect_that!(log.entries(), empty());
        let task = &complete.test_sets[0].tests[0].tasks[0];
        expect_that!(task.phase, eq(TaskPhase::Validation));
        expect_that!(task.errors, len(eq(1)));
        expect_that!(task.result, none());
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_module_defaults_merge_into_run_args() {
        let (_log, repo, runner) = fixture(indoc! {r#"
            name: d
            defaults:
              mock:
                base: 1
            tests:
              - description: t
                tasks:
                  - do: mock.run
                    args: {tag: dt}
        "#});
        let complete = runner.run(&repo).await;
        let task = &complete.test_sets[0].tests[0].tasks[0];
        assert_that!(task.run_args, eq(&json!({"base": 1, "tag": "dt"})));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_expectations_append_assertion_errors() {
        let (_log, repo, runner) = fixture(indoc! {r#"
            name: e
            tests:
              - description: t
                tasks:
                  - do: mock.run
                    args: {tag: ok, result: {n: 1}}
                    expect: {resultEquals: {n: 1}}
                  - do: mock.run
                    args: {tag: nope, result: {n: 1}}
                    expect: {resultEquals: {n: 2}}
        "#});
        let complete = runner.run(&repo).await;
        let tasks = &complete.test_sets[0].tests[0].tasks;
        expect_that!(tasks[0].errors, empty());
        expect_that!(tasks[1].phase, eq(TaskPhase::Expect));
        expect_that!(tasks[1].errors, len(eq(1)));
        expect_that!(complete.error_count, eq(1));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_before_all_failure_skips_tests_but_not_after_all() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: ba
            beforeAll:
              - do: mock.run
                args: {tag: ba, fail: true}
            afterAll:
              - do: mock.run
                args: {tag: aa}
            tests:
              - description: never
                tasks: [{do: mock.run, args: {tag: body}}]
        "#});
        let complete = runner.run(&repo).await;
        assert_that!(log.runs(), eq(&vec!["ba".to_owned(), "aa".to_owned()]));
        let set = &complete.test_sets[0];
        expect_that!(set.tests, empty());
        expect_that!(set.test_count, eq(0));
        expect_that!(set.error_count, eq(1));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_counts_satisfy_the_aggregate_invariant() {
        let (_log, repo, runner) = fixture(indoc! {r#"
            name: counts
            tests:
              - description: runs
                tasks: [{do: mock.run, args: {tag: r}}]
              - description: skipped
                skip: true
                tasks: [{do: mock.run, args: {tag: s}}]
              - description: empty
                tasks: []
        "#});
        let complete = runner.run(&repo).await;
        let executed: usize = complete.test_sets.iter().map(|s| s.tests.len()).sum();
        expect_that!(complete.test_count, eq(executed + complete.skipped_count));
        expect_that!(complete.test_count, eq(3));
        expect_that!(complete.skipped_count, eq(1));
        // An empty task list yields zero reports and zero errors.
        expect_that!(complete.test_sets[0].tests[1].tasks, empty());
        expect_that!(complete.error_count, eq(0));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn test_self_referential_run_before_async_still_completes() {
        let (log, repo, runner) = fixture(indoc! {r#"
            name: selfref
            tests:
              - description: t
                tasks:
                  - id: me
                    do: mock.run
                    args: {tag: me}
                    runBeforeAsync: me
        "#});
        let complete = runner.run(&repo).await;
        assert_that!(log.runs(), eq(&vec!["me".to_owned()]));
        expect_that!(complete.test_sets[0].tests[0].tasks, len(eq(1)));
        expect_that!(complete.error_count, eq(0));
    }
}

