//! Explain how a runtime would be found and configured.
//!
//! `doctor` resolves `hostscript.toml`, applies the environment overrides
//! and prints the home-directory information together with the diagnosis a
//! failed session creation would carry. Nothing is instantiated.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use hostscript_core::{
    Config, RuntimeConfiguration, RuntimeDescriptor, config::home_override_var,
    diagnostics,
};
use hostscript_runtime::SessionKind;
use serde::Serialize;
use tracing::debug;

/// Runtimes the doctor knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Runtime {
    Python,
    Javascript,
}

impl Runtime {
    /// Name of the runtime's `[runtimes.<name>]` table.
    fn key(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
        }
    }

    fn descriptor(self) -> RuntimeDescriptor {
        match self {
            Self::Python => RuntimeDescriptor::python(),
            Self::Javascript => RuntimeDescriptor::javascript(),
        }
    }
}

#[derive(Args)]
pub struct DoctorArgs {
    /// Runtime to inspect
    #[arg(short, long, value_enum, default_value_t = Runtime::Python)]
    pub runtime: Runtime,

    /// Configuration file to use instead of the resolved `hostscript.toml`
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Everything the doctor found out about one runtime.
#[derive(Debug, Serialize)]
pub struct Report {
    pub runtime: String,
    pub config_path: Option<PathBuf>,
    pub kind: SessionKind,
    pub configuration: RuntimeConfiguration,
    pub home: Option<PathBuf>,
    pub home_configured: bool,
    pub home_exists: bool,
    pub environment_disabled: bool,
    pub startup_code: Vec<String>,
    pub diagnosis: String,
}

impl Report {
    /// Builds the report for `runtime` from an already loaded `config`,
    /// reading environment variables through `lookup`.
    ///
    /// A table without `kind` describes shared sessions. Sessions of the
    /// local kind never apply the configuration to the runtime, so for them
    /// the home always comes from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime's table names an unknown kind.
    pub fn build(
        runtime: Runtime,
        config_path: Option<PathBuf>,
        config: &Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let descriptor = runtime.descriptor();
        let section = config.runtime(runtime.key()).cloned().unwrap_or_default();
        let kind = match section.kind.as_deref() {
            Some(name) => name
                .parse::<SessionKind>()
                .with_context(|| format!("invalid kind in [runtimes.{}]", runtime.key()))?,
            None => SessionKind::default(),
        };
        let configuration = section
            .configuration
            .with_env_overrides(&descriptor, &lookup);
        let home = configuration.home_info(&descriptor, kind != SessionKind::Local, &lookup);
        debug!(runtime = runtime.key(), kind = %kind, home = ?home, "Resolved home directory");

        Ok(Self {
            runtime: descriptor.runtime_name.clone(),
            config_path,
            kind,
            home_exists: home.exists(),
            diagnosis: diagnostics::diagnose_creation_failure(&descriptor, &home),
            home: home.home.clone(),
            home_configured: home.configured,
            environment_disabled: home.environment_disabled,
            configuration,
            startup_code: section.startup_code,
        })
    }

    fn home_line(&self, descriptor: &RuntimeDescriptor) -> String {
        let Some(home) = &self.home else {
            return "not set".to_string();
        };
        let origin = if self.home_configured {
            format!("configuration or {}", home_override_var(descriptor))
        } else {
            descriptor.home_env_var.clone()
        };
        let state = if self.home_exists { "exists" } else { "missing" };
        format!("{} (from {origin}, {state})", home.display())
    }

    fn print(&self, descriptor: &RuntimeDescriptor) {
        let config_path = self
            .config_path
            .as_ref()
            .map_or_else(|| "none found".to_string(), |path| path.display().to_string());
        println!("Runtime:        {}", self.runtime);
        println!("Config file:    {config_path}");
        println!("Session kind:   {} ({})", self.kind, self.kind.pretty_name());
        println!("Home directory: {}", self.home_line(descriptor));
        if self.environment_disabled {
            println!("Environment:    disabled by configuration");
        }
        println!("Startup code:   {} snippet(s)", self.startup_code.len());
        for snippet in &self.startup_code {
            println!("  {}", snippet.trim());
        }
        println!();
        println!(
            "If the {} runtime cannot be loaded, session creation will report:",
            self.runtime
        );
        for line in self.diagnosis.lines() {
            println!("  {line}");
        }
    }
}

/// Executes the doctor command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or is invalid.
pub fn run(args: &DoctorArgs) -> Result<()> {
    let (config_path, config) = match &args.config {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            (Some(path.clone()), config)
        }
        None => match Config::resolve().context("failed to resolve hostscript.toml")? {
            Some(resolved) => (Some(resolved.path), resolved.config),
            None => (None, Config::default()),
        },
    };

    let report = Report::build(args.runtime, config_path, &config, |key| {
        std::env::var(key).ok()
    })?;
    if args.json {
        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{json}");
    } else {
        report.print(&args.runtime.descriptor());
    }
    Ok(())
}
