mod config;
mod interpolate;
mod loader;
mod module;
mod modules;
mod repo;
mod report;
mod reporter;
mod runner;
mod schema;
mod util;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use colored::Colorize as _;
#[allow(unused_imports)]
use log::{debug, info};

use crate::config::{Config, FileConfig, Overrides};
use crate::module::ModuleRegistry;
use crate::reporter::{Reporter as _, ReporterBroadcast};
use crate::runner::Runner;

#[derive(Debug, Parser)]
#[command(version, about = "Declarative integration testing driven by YAML test trees.")]
struct Args {
    /// Directory containing the YAML test documents.
    tests_path: Option<PathBuf>,

    /// Base directory for configuration and module resolution.
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Directory scanned for installable module packages.
    #[arg(long)]
    modules_path: Option<PathBuf>,

    /// Don't scan the modules directory for module packages.
    #[arg(long)]
    no_autoload: bool,

    /// Don't register the built-in modules.
    #[arg(long)]
    no_builtin: bool,

    /// Drop invalid test documents instead of refusing to run.
    #[arg(long)]
    ignore_invalid: bool,

    /// Reporter to enable (repeatable), overriding the configuration file.
    #[arg(long = "reporter", value_name = "NAME")]
    reporters: Vec<String>,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,

    /// Write the composed test-document JSON schema to a file and exit.
    #[arg(long, value_name = "FILE")]
    generate_schema: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let logger = flexi_logger::Logger::try_with_env_or_str(if args.debug { "debug" } else { "info" })
        .and_then(|logger| logger.start());
    let _logger = match logger {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::from(2);
        }
    };
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", format!("error: {err:#}").red());
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config_dir = args
        .base_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let file = FileConfig::load_if_present(&config_dir)?;
    let config = Config::resolve(
        file,
        Overrides {
            tests_path: args.tests_path,
            base_path: args.base_path,
            modules_path: args.modules_path,
            no_autoload: args.no_autoload,
            no_builtin: args.no_builtin,
            ignore_invalid: args.ignore_invalid,
            reporters: args.reporters,
        },
    )?;
    debug!("resolved configuration: {:?}", config);

    let registry = build_registry(&config)?;

    if let Some(path) = &args.generate_schema {
        return generate_schema(&registry, path);
    }

    let mut reporters = ReporterBroadcast::new();
    for (name, options) in &config.reporters {
        reporters.register(
            reporter::create_reporter(name, options)
                .with_context(|| format!("setting up reporter {:?}", name))?,
        );
    }
    let reporters = Arc::new(reporters);

    let documents = loader::load_documents(&config.tests_path)?;
    let mut repo = repo::Repository::new(registry.clone(), config.ignore_invalid_tests)?;
    match repo.load_documents(documents) {
        Ok(issues) => {
            if !issues.is_empty() {
                reporters.log_validation_errors(&issues);
            }
        }
        Err(failure) => {
            reporters.log_validation_errors(&failure.issues);
            return Err(failure.into());
        }
    }
    repo.build();

    let runner = Runner::new(registry, reporters.clone());
    let complete = runner.run(&repo).await;
    reporters.generate_report(&complete);

    Ok(if complete.error_count == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn build_registry(config: &Config) -> anyhow::Result<Arc<ModuleRegistry>> {
    let mut registry = ModuleRegistry::new();
    if config.load_built_in_modules {
        modules::register_builtins(&mut registry)?;
    }
    if config.autoload_modules {
        registry.load_from_path(&config.modules_path, &modules::factories())?;
    }
    Ok(Arc::new(registry))
}

fn generate_schema(registry: &ModuleRegistry, path: &Path) -> anyhow::Result<ExitCode> {
    let schema = schema::compose_document_schema(registry);
    let rendered = serde_json::to_string_pretty(&schema).context("rendering the schema")?;
    std::fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))?;
    info!("wrote the test document schema to {}", path.display());
    Ok(ExitCode::SUCCESS)
}
