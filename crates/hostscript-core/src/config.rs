//! Runtime configuration and the `hostscript.toml` file.
//!
//! # Resolution Algorithm
//!
//! [`Config::resolve`] looks for the configuration file in this order:
//!
//! 1. The path named by the `HOSTSCRIPT_CONFIG` environment variable
//! 2. Current directory
//! 3. Parent directories (walk up to filesystem root)
//! 4. User config directory (`~/.config/hostscript/`)
//!
//! A missing file is not an error; the defaults apply.
//!
//! # Example
//!
//! ```toml
//! [runtimes.python]
//! kind = "shared"
//! home = "/opt/python3.12"
//! use_environment = false
//! startup_code = ["import numpy"]
//! ```

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    diagnostics::{HomeInfo, RuntimeDescriptor},
    startup::StartupConfig,
};

/// File name searched for by [`Config::resolve`].
pub const CONFIG_FILE_NAME: &str = "hostscript.toml";

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "HOSTSCRIPT_CONFIG";

/// Prefix of the environment variables read by
/// [`RuntimeConfiguration::with_env_overrides`].
pub const CONFIG_ENV_PREFIX: &str = "HOSTSCRIPT_CONFIG_";

/// Errors that can occur while locating or loading configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error when reading a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error when a config file is malformed.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// An explicitly requested config file does not exist.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
}

/// Process-wide initialization parameters of an embedded runtime.
///
/// Every field is optional; `None` leaves the runtime's own default in
/// place. For the shared runtime these can only take effect before its
/// first instantiation, see
/// [`ConfigurationLatch`](crate::latch::ConfigurationLatch).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfiguration {
    /// Home directory of the runtime installation.
    pub home: Option<PathBuf>,
    pub optimization_level: Option<i32>,
    /// Whether the runtime imports its site module on startup.
    pub site_import: Option<bool>,
    /// Whether the runtime honours its own environment variables. `false`
    /// also stops home-directory detection through the environment.
    pub use_environment: Option<bool>,
    pub user_site_directory: Option<bool>,
    pub verbose: Option<i32>,
    pub write_bytecode: Option<bool>,
}

impl RuntimeConfiguration {
    /// Configuration built from the process environment only.
    pub fn from_env(descriptor: &RuntimeDescriptor) -> Self {
        Self::default().with_env_overrides(descriptor, |key| std::env::var(key).ok())
    }

    /// Overrides fields from `HOSTSCRIPT_CONFIG_<FIELD>` variables and the
    /// home directory from `HOSTSCRIPT_<RUNTIME>_HOME`, reading variables
    /// through `lookup`.
    ///
    /// Unset variables and unparsable numbers leave the current value in
    /// place. Booleans are `true` only for a case-insensitive `true`. An
    /// empty home variable keeps the current home.
    #[must_use]
    pub fn with_env_overrides(
        mut self,
        descriptor: &RuntimeDescriptor,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let var = |field: &str| lookup(&format!("{CONFIG_ENV_PREFIX}{field}"));
        let int = |field: &str| var(field).and_then(|value| value.trim().parse::<i32>().ok());
        let flag = |field: &str| var(field).map(|value| value.trim().eq_ignore_ascii_case("true"));

        if let Some(level) = int("OPTIMIZATION_LEVEL") {
            self.optimization_level = Some(level);
        }
        if let Some(value) = flag("SITE_IMPORT") {
            self.site_import = Some(value);
        }
        if let Some(value) = flag("USE_ENVIRONMENT") {
            self.use_environment = Some(value);
        }
        if let Some(value) = flag("USER_SITE_DIRECTORY") {
            self.user_site_directory = Some(value);
        }
        if let Some(level) = int("VERBOSE") {
            self.verbose = Some(level);
        }
        if let Some(value) = flag("WRITE_BYTECODE") {
            self.write_bytecode = Some(value);
        }
        if let Some(home) = lookup(&home_override_var(descriptor)).filter(|home| !home.is_empty()) {
            self.home = Some(PathBuf::from(home));
        }
        self
    }

    /// Whether this configuration forbids reading the runtime's environment.
    pub fn environment_disabled(&self) -> bool {
        self.use_environment == Some(false)
    }

    /// Home directory information for diagnostics.
    ///
    /// When this configuration was `applied` to the runtime and either names
    /// a home or disables the environment, the configured home is
    /// authoritative. Otherwise the runtime falls back to its home
    /// environment variable, read through `lookup`.
    pub fn home_info(
        &self,
        descriptor: &RuntimeDescriptor,
        applied: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> HomeInfo {
        if applied && (self.home.is_some() || self.environment_disabled()) {
            return HomeInfo::from_configuration(self.home.clone(), self.environment_disabled());
        }
        HomeInfo::from_environment(lookup(&descriptor.home_env_var).map(PathBuf::from))
    }
}

/// Environment variable overriding the home directory of `descriptor`'s
/// runtime, e.g. `HOSTSCRIPT_PYTHON_HOME`.
pub fn home_override_var(descriptor: &RuntimeDescriptor) -> String {
    format!(
        "HOSTSCRIPT_{}_HOME",
        descriptor.runtime_name.to_ascii_uppercase()
    )
}

/// Settings of one runtime in `hostscript.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Machine name of the session kind, e.g. `shared`.
    #[serde(default)]
    pub kind: Option<String>,

    /// Snippets run once in every new session.
    #[serde(default)]
    pub startup_code: Vec<String>,

    /// Module search paths handed to the engine.
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,

    #[serde(flatten)]
    pub configuration: RuntimeConfiguration,
}

impl RuntimeSection {
    /// Startup configuration described by this section, without a verifier.
    pub fn startup_config(&self) -> StartupConfig {
        StartupConfig::new()
            .with_startup_code(self.startup_code.iter().cloned())
            .with_include_paths(self.include_paths.iter().cloned())
    }
}

/// Contents of `hostscript.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Per-runtime settings, keyed by runtime name (`python`, `javascript`).
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeSection>,
}

/// A configuration together with the file it came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub path: PathBuf,
    pub config: Config,
}

impl Config {
    /// Loads and parses a config file.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if:
    /// - The file does not exist (`NotFound`)
    /// - The file cannot be read
    /// - The file cannot be parsed as TOML
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Finds and loads `hostscript.toml` using the resolution algorithm
    /// described in the [module documentation](self).
    ///
    /// Returns `Ok(None)` if no file was found.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if:
    /// - `HOSTSCRIPT_CONFIG` names a file that does not exist
    /// - The current directory cannot be determined
    /// - A found config file cannot be read or parsed
    pub fn resolve() -> Result<Option<ResolvedConfig>, ConfigError> {
        let env_override = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let current = std::env::current_dir()?;
        let user_dir = dirs::config_dir().map(|dir| dir.join("hostscript"));
        resolve_from(env_override, &current, user_dir.as_deref())
    }

    /// Settings of `runtime`, if the file has a section for it.
    pub fn runtime(&self, runtime: &str) -> Option<&RuntimeSection> {
        self.runtimes.get(runtime)
    }
}

fn resolve_from(
    env_override: Option<PathBuf>,
    start: &Path,
    user_dir: Option<&Path>,
) -> Result<Option<ResolvedConfig>, ConfigError> {
    // Step 1: Environment variable override
    if let Some(path) = env_override {
        let config = Config::load(&path)?;
        return Ok(Some(ResolvedConfig { path, config }));
    }

    // Steps 2 and 3: current directory, then its parents
    for dir in start.ancestors() {
        if let Some(found) = check_directory(dir)? {
            return Ok(Some(found));
        }
    }

    // Step 4: user config directory
    match user_dir {
        Some(dir) => check_directory(dir),
        None => Ok(None),
    }
}

fn check_directory(dir: &Path) -> Result<Option<ResolvedConfig>, ConfigError> {
    let path = dir.join(CONFIG_FILE_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let config = Config::load(&path)?;
    Ok(Some(ResolvedConfig { path, config }))
}
