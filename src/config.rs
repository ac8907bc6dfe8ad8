//! Project configuration: a `dexit.toml` file merged with command-line
//! options, the command line winning on collisions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
#[allow(unused_imports)]
use log::debug;
use serde::Deserialize;
use serde_json::{Map, Value};

pub const CONFIG_FILENAME: &str = "dexit.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub reporters: Option<BTreeMap<String, toml::Value>>,
    pub ignore_invalid_tests: Option<bool>,
    pub load_built_in_modules: Option<bool>,
    pub autoload_modules: Option<bool>,
    pub tests_path: Option<PathBuf>,
    pub modules_path: Option<PathBuf>,
    pub base_path: Option<PathBuf>,
}

impl FileConfig {
    pub fn load_if_present(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(CONFIG_FILENAME);
        if !path.is_file() {
            debug!("no {} in {:?}, using defaults", CONFIG_FILENAME, dir);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub tests_path: Option<PathBuf>,
    pub base_path: Option<PathBuf>,
    pub modules_path: Option<PathBuf>,
    pub no_autoload: bool,
    pub no_builtin: bool,
    pub ignore_invalid: bool,
    pub reporters: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tests_path: PathBuf,
    pub modules_path: PathBuf,
    pub ignore_invalid_tests: bool,
    pub load_built_in_modules: bool,
    pub autoload_modules: bool,
    /// Reporter name to reporter options, in deterministic order.
    pub reporters: BTreeMap<String, Value>,
}

impl Config {
    pub fn resolve(file: FileConfig, cli: Overrides) -> anyhow::Result<Self> {
        let base_path = cli
            .base_path
            .or(file.base_path)
            .unwrap_or_else(|| PathBuf::from("."));
        let tests_path = rebase(
            &base_path,
            cli.tests_path
                .or(file.tests_path)
                .unwrap_or_else(|| PathBuf::from("tests")),
        );
        let modules_path = rebase(
            &base_path,
            cli.modules_path
                .or(file.modules_path)
                .unwrap_or_else(|| PathBuf::from("dexit_modules")),
        );

        let mut reporters: BTreeMap<String, Value> = BTreeMap::new();
        if !cli.reporters.is_empty() {
            for name in cli.reporters {
                reporters.insert(name, Value::Object(Map::new()));
            }
        } else if let Some(configured) = file.reporters {
            for (name, options) in configured {
                let options = serde_json::to_value(options)
                    .with_context(|| format!("converting options of reporter {:?}", name))?;
                reporters.insert(name, options);
            }
        }
        if reporters.is_empty() {
            reporters.insert("console".to_owned(), Value::Object(Map::new()));
        }

        Ok(Self {
            tests_path,
            modules_path,
            ignore_invalid_tests: cli.ignore_invalid || file.ignore_invalid_tests.unwrap_or(false),
            load_built_in_modules: !cli.no_builtin && file.load_built_in_modules.unwrap_or(true),
            autoload_modules: !cli.no_autoload && file.autoload_modules.unwrap_or(true),
            reporters,
        })
    }
}

// Relative paths from the file or the command line are anchored at the base
// directory, not at whatever the process working directory happens to be.
fn rebase(base_path: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        base_path.join(path)
    } else {
        path
    }
}
