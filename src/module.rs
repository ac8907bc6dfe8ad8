//! The module contract and the registry resolving `module.command`
//! identifiers to handlers with pre-compiled schema validators.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use itertools::Itertools as _;
#[allow(unused_imports)]
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::schema::format_schema_error;

/// An error reported by an expectation or a validation hook. Carried on the
/// task report, never thrown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionError {
    pub message: AssertionMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AssertionMessage {
    Text(String),
    SchemaErrors(Vec<String>),
}

impl AssertionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: AssertionMessage::Text(message.into()),
            expected: None,
            actual: None,
        }
    }

    pub fn with_values(message: impl Into<String>, expected: Value, actual: Value) -> Self {
        Self {
            message: AssertionMessage::Text(message.into()),
            expected: Some(expected),
            actual: Some(actual),
        }
    }

    pub fn schema_errors(errors: Vec<String>) -> Self {
        Self {
            message: AssertionMessage::SchemaErrors(errors),
            expected: None,
            actual: None,
        }
    }
}

impl fmt::Display for AssertionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{}", text),
            Self::SchemaErrors(errors) => write!(f, "{}", errors.iter().join("; ")),
        }
    }
}

impl fmt::Display for AssertionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let (Some(expected), Some(actual)) = (&self.expected, &self.actual) {
            write!(f, " (expected {}, got {})", expected, actual)?;
        }
        Ok(())
    }
}

/// Single-shot latch a command signals once subsequent tasks in the list may
/// start, typically after it has bound or subscribed but before it waits for
/// a response. Dropping it unsignalled releases the waiter too, so a command
/// that completes without calling [`Ready::notify`] cannot stall the list.
pub struct Ready(Option<oneshot::Sender<()>>);

impl Ready {
    pub fn notify(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

pub(crate) fn ready_latch() -> (Ready, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (Ready(Some(tx)), rx)
}

/// A single operation a module exposes. `run` is the only mandatory piece;
/// the schema and hook methods default to "no opinion".
#[async_trait]
pub trait Command: Send + Sync {
    fn description(&self) -> &str;

    fn args_schema(&self) -> Option<Value> {
        None
    }

    fn expect_schema(&self) -> Option<Value> {
        None
    }

    fn validate_args(&self, _args: &Value) -> Vec<AssertionError> {
        Vec::new()
    }

    fn validate_expect(&self, _expect: &Value) -> Vec<AssertionError> {
        Vec::new()
    }

    async fn run(&self, args: Value, ready: Ready) -> anyhow::Result<Value>;

    fn expect(&self, _expect: &Value, _result: &Value) -> anyhow::Result<Vec<AssertionError>> {
        Ok(Vec::new())
    }

    fn label(&self, _run_args: &Value, _expect_args: &Value) -> Option<String> {
        None
    }
}

pub struct Module {
    pub name: String,
    pub description: Option<String>,
    pub defaults_schema: Option<Value>,
    pub commands: BTreeMap<String, Arc<dyn Command>>,
}

/// A command after registration, with its schemas compiled once.
pub struct RegisteredCommand {
    pub id: String,
    pub module: String,
    pub handler: Arc<dyn Command>,
    pub args_schema: Option<Value>,
    pub expect_schema: Option<Value>,
    args_validator: Option<jsonschema::Validator>,
    expect_validator: Option<jsonschema::Validator>,
}

impl std::fmt::Debug for RegisteredCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCommand")
            .field("id", &self.id)
            .field("module", &self.module)
            .field("args_schema", &self.args_schema)
            .field("expect_schema", &self.expect_schema)
            .finish()
    }
}

impl RegisteredCommand {
    pub fn check_args(&self, args: &Value) -> Vec<String> {
        Self::check(&self.args_validator, args)
    }

    pub fn check_expect(&self, expect: &Value) -> Vec<String> {
        Self::check(&self.expect_validator, expect)
    }

    fn check(validator: &Option<jsonschema::Validator>, instance: &Value) -> Vec<String> {
        match validator {
            None => Vec::new(),
            Some(validator) => validator
                .iter_errors(instance)
                .map(|error| format_schema_error(&error))
                .collect(),
        }
    }
}

pub struct RegisteredModule {
    pub name: String,
    pub defaults_schema: Option<Value>,
    pub commands: BTreeMap<String, RegisteredCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandId<'a> {
    pub module: &'a str,
    pub command: &'a str,
}

/// Split a `module.command` identifier at the first dot. The command part
/// may itself contain dots.
pub fn parse_command(id: &str) -> Option<CommandId<'_>> {
    let (module, command) = id.split_once('.')?;
    if module.is_empty() || command.is_empty() {
        return None;
    }
    Some(CommandId { module, command })
}

/// Constructor for a module shipped as an installable package. The value is
/// the `options` table from the package manifest.
pub type ModuleFactory = fn(&Value) -> anyhow::Result<Module>;

pub const MODULE_MANIFEST: &str = "dexit-module.toml";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ModuleManifest {
    #[serde(default)]
    dexit_module: bool,
    module: Option<String>,
    options: Option<toml::Value>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, RegisteredModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, compiling every command's schemas. Names starting
    /// with `_` are reserved for internal identifiers and rejected.
    pub fn register(&mut self, module: Module) -> anyhow::Result<()> {
        if module.name.starts_with('_') {
            bail!("module name {:?} uses the reserved '_' prefix", module.name);
        }
        if self.modules.contains_key(&module.name) {
            bail!("module {:?} is already registered", module.name);
        }
        let mut commands = BTreeMap::new();
        for (name, handler) in module.commands {
            if name.starts_with('_') {
                bail!(
                    "command name {:?} in module {:?} uses the reserved '_' prefix",
                    name,
                    module.name
                );
            }
            let id = format!("{}.{}", module.name, name);
            let args_schema = handler.args_schema();
            let expect_schema = handler.expect_schema();
            let args_validator = compile_validator(args_schema.as_ref())
                .with_context(|| format!("compiling args schema of {:?}", id))?;
            let expect_validator = compile_validator(expect_schema.as_ref())
                .with_context(|| format!("compiling expect schema of {:?}", id))?;
            commands.insert(
                name,
                RegisteredCommand {
                    id,
                    module: module.name.clone(),
                    handler,
                    args_schema,
                    expect_schema,
                    args_validator,
                    expect_validator,
                },
            );
        }
        debug!(
            "registered module {:?} ({}) with {} command(s)",
            module.name,
            module.description.as_deref().unwrap_or("no description"),
            commands.len()
        );
        self.modules.insert(
            module.name.clone(),
            RegisteredModule {
                name: module.name,
                defaults_schema: module.defaults_schema,
                commands,
            },
        );
        Ok(())
    }

    /// Scan `path` for module packages and register every package whose
    /// manifest carries the `dexitModule` marker. A package is either the
    /// directory itself or one of its immediate children. Any failure to
    /// load a marked package is fatal.
    pub fn load_from_path(
        &mut self,
        path: &Path,
        factories: &BTreeMap<&'static str, ModuleFactory>,
    ) -> anyhow::Result<()> {
        if !path.is_dir() {
            debug!("modules path {:?} does not exist, nothing to autoload", path);
            return Ok(());
        }
        for dir in package_dirs(path)? {
            let manifest_path = dir.join(MODULE_MANIFEST);
            let raw = std::fs::read_to_string(&manifest_path)
                .with_context(|| format!("reading {}", manifest_path.display()))?;
            let manifest: ModuleManifest = toml::from_str(&raw)
                .with_context(|| format!("parsing {}", manifest_path.display()))?;
            if !manifest.dexit_module {
                debug!("skipping {:?}: not marked as a dexit module", dir);
                continue;
            }
            let entry = manifest.module.ok_or_else(|| {
                anyhow!("{} does not name a module entry point", manifest_path.display())
            })?;
            let factory = factories.get(entry.as_str()).ok_or_else(|| {
                anyhow!(
                    "unknown module entry point {:?} in {}",
                    entry,
                    manifest_path.display()
                )
            })?;
            let options = match manifest.options {
                Some(options) => serde_json::to_value(options)
                    .with_context(|| format!("converting options in {}", manifest_path.display()))?,
                None => Value::Null,
            };
            let module = factory(&options)
                .with_context(|| format!("loading module package {}", dir.display()))?;
            self.register(module)
                .with_context(|| format!("registering module package {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn get_command(&self, id: &str) -> Option<&RegisteredCommand> {
        let CommandId { module, command } = parse_command(id)?;
        self.modules.get(module)?.commands.get(command)
    }

    pub fn all_modules(&self) -> impl Iterator<Item = &RegisteredModule> {
        self.modules.values()
    }
}

fn compile_validator(schema: Option<&Value>) -> anyhow::Result<Option<jsonschema::Validator>> {
    match schema {
        None => Ok(None),
        Some(schema) => jsonschema::validator_for(schema)
            .map(Some)
            .map_err(|err| anyhow!("{err}")),
    }
}

fn package_dirs(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if path.join(MODULE_MANIFEST).is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("reading modules path {}", path.display()))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|entry| entry.is_dir() && entry.join(MODULE_MANIFEST).is_file())
        .collect();
    dirs.sort();
    Ok(dirs)
}
