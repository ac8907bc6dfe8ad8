//! Built-in modules. `exec` runs a process and checks its outcome, `vars`
//! resolves to its own arguments so documents can seed and forward
//! parameters.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
#[allow(unused_imports)]
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command as ProcessCommand;

use crate::module::{AssertionError, Command, Module, ModuleFactory, ModuleRegistry, Ready};

pub fn factories() -> BTreeMap<&'static str, ModuleFactory> {
    BTreeMap::from([
        ("exec", exec_module as ModuleFactory),
        ("vars", vars_module as ModuleFactory),
    ])
}

pub fn register_builtins(registry: &mut ModuleRegistry) -> anyhow::Result<()> {
    registry.register(exec_module(&Value::Null)?)?;
    registry.register(vars_module(&Value::Null)?)
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ExecOptions {
    shell: Option<String>,
}

fn exec_module(options: &Value) -> anyhow::Result<Module> {
    let options: ExecOptions = if options.is_null() {
        ExecOptions::default()
    } else {
        serde_json::from_value(options.clone()).context("parsing exec module options")?
    };
    let run = RunProcess {
        shell: options.shell.unwrap_or_else(|| "bash".to_owned()),
    };
    Ok(Module {
        name: "exec".to_owned(),
        description: Some("Runs local processes and checks their outcome.".to_owned()),
        defaults_schema: Some(json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "env": {"type": "object", "additionalProperties": {"type": "string"}},
                "cwd": {"type": "string"},
            },
        })),
        commands: BTreeMap::from([("run".to_owned(), Arc::new(run) as Arc<dyn Command>)]),
    })
}

fn vars_module(_options: &Value) -> anyhow::Result<Module> {
    Ok(Module {
        name: "vars".to_owned(),
        description: Some("Echoes its arguments, for seeding and forwarding parameters.".to_owned()),
        defaults_schema: None,
        commands: BTreeMap::from([("echo".to_owned(), Arc::new(Echo) as Arc<dyn Command>)]),
    })
}

/// Either a shell one-liner or an argv list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Shell(String),
    Raw(Vec<String>),
}

impl CommandLine {
    fn program(&self, shell: &str) -> anyhow::Result<String> {
        match self {
            Self::Shell(_) => Ok(shell.to_owned()),
            Self::Raw(argv) => match argv.first() {
                Some(program) => Ok(program.clone()),
                None => bail!("command list must not be empty"),
            },
        }
    }

    fn args(&self) -> Vec<String> {
        match self {
            Self::Shell(line) => vec!["-c".to_owned(), line.clone()],
            Self::Raw(argv) => argv.iter().skip(1).cloned().collect(),
        }
    }

    fn display(&self) -> String {
        match self {
            Self::Shell(line) => line.clone(),
            Self::Raw(argv) => argv.join(" "),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RunProcessArgs {
    command: CommandLine,
    #[serde(default)]
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    ready_when_started: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RunProcessExpect {
    code: Option<i64>,
    stdout_contains: Option<String>,
    stderr_contains: Option<String>,
}

struct RunProcess {
    shell: String,
}

#[async_trait]
impl Command for RunProcess {
    fn description(&self) -> &str {
        "Runs a program and captures its exit code and output."
    }

    fn args_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["command"],
            "additionalProperties": false,
            "properties": {
                "command": {
                    "anyOf": [
                        {"type": "string"},
                        {"type": "array", "items": {"type": "string"}, "minItems": 1},
                    ],
                },
                "env": {"type": "object", "additionalProperties": {"type": "string"}},
                "cwd": {"type": "string"},
                "readyWhenStarted": {"type": "boolean", "default": false},
            },
        }))
    }

    fn expect_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "code": {"type": "integer"},
                "stdoutContains": {"type": "string"},
                "stderrContains": {"type": "string"},
            },
        }))
    }

    async fn run(&self, args: Value, ready: Ready) -> anyhow::Result<Value> {
        let args: RunProcessArgs = serde_json::from_value(args).context("parsing exec.run args")?;
        let mut command = ProcessCommand::new(args.command.program(&self.shell)?);
        command
            .args(args.command.args())
            .envs(&args.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }
        let child = command.spawn().context("spawning exec.run command")?;
        if args.ready_when_started {
            ready.notify();
        }
        let output = child
            .wait_with_output()
            .await
            .context("waiting for exec.run command")?;
        Ok(json!({
            "code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }

    fn expect(&self, expect: &Value, result: &Value) -> anyhow::Result<Vec<AssertionError>> {
        let expect: RunProcessExpect =
            serde_json::from_value(expect.clone()).context("parsing exec.run expect")?;
        let mut errors = Vec::new();
        if let Some(code) = expect.code {
            let actual = result.get("code").cloned().unwrap_or(Value::Null);
            if actual != json!(code) {
                errors.push(AssertionError::with_values(
                    "process exited with an unexpected code",
                    json!(code),
                    actual,
                ));
            }
        }
        let contains = [
            ("stdout", &expect.stdout_contains),
            ("stderr", &expect.stderr_contains),
        ];
        for (stream, needle) in contains {
            if let Some(needle) = needle {
                let actual = result.get(stream).and_then(Value::as_str).unwrap_or("");
                if !actual.contains(needle.as_str()) {
                    errors.push(AssertionError::with_values(
                        format!("{} does not contain the expected text", stream),
                        json!(needle),
                        json!(actual),
                    ));
                }
            }
        }
        Ok(errors)
    }

    fn label(&self, run_args: &Value, _expect_args: &Value) -> Option<String> {
        let command: CommandLine =
            serde_json::from_value(run_args.get("command")?.clone()).ok()?;
        Some(format!("exec {}", command.display()))
    }
}

struct Echo;

#[async_trait]
impl Command for Echo {
    fn description(&self) -> &str {
        "Resolves to its own arguments."
    }

    fn args_schema(&self) -> Option<Value> {
        Some(json!({"type": "object"}))
    }

    async fn run(&self, args: Value, _ready: Ready) -> anyhow::Result<Value> {
        Ok(args)
    }
}
