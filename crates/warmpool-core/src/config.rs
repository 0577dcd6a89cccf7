//! warmpool.toml and process.toml configuration.
//!
//! The daemon reads a single `warmpool.toml`:
//!
//! ```toml
//! configurations_dir = "configurations"
//!
//! [pool]
//! minimum_available = 5
//! maximum_available = 100
//! startup_limit = 10
//!
//! [pool.configurations."5.41.0"]
//! command_line = "maxima-optimised"
//! auto_start = true
//! ```
//!
//! `configurations_dir` holds one subdirectory per configuration, each with a
//! `process.toml` in the same shape as an inline configuration table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};

/// File name looked up inside each configuration subdirectory.
pub const PROCESS_CONFIG_FILE: &str = "process.toml";

/// Default completion sentinel.
pub const DEFAULT_KILL_STRING: &str = "--COMPLETED--kill--PROCESS--";

/// Everything needed to start and talk to one flavour of worker process.
///
/// Equality is structural and is used to detect a running pool whose
/// configuration has since changed on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfiguration {
    /// Start a pool for this configuration when the daemon starts.
    pub auto_start: bool,
    pub working_directory: PathBuf,
    /// Program and arguments. A plain string is split on whitespace.
    #[serde(deserialize_with = "deserialize_command_line")]
    pub command_line: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// Output that shows the worker is ready for the `load` command.
    /// Only used when `extra_file_to_load` is set.
    pub process_has_started_output: String,
    pub extra_file_to_load: Option<PathBuf>,
    /// Output that shows the worker is ready for use.
    pub process_is_ready_output: String,
    /// Printed after every command so completion can be detected.
    pub kill_string: String,
    pub file_handling: bool,
    /// Sent before each command when file handling is on. Recognised
    /// placeholders: `%OUTPUT-DIR%`, `%WORK-DIR%` (backslashes escaped),
    /// `%OUTPUT-DIR-NE%`, `%WORK-DIR-NE%` (unescaped) and `%PLOT-URL-BASE%`.
    pub path_command_template: String,
    pub startup_timeout_ms: u64,
    /// How long a ready process may sit idle before it is replaced.
    pub maximum_lifetime_ms: u64,
    /// Extra lifetime granted when a process is checked out.
    pub execution_timeout_ms: u64,
    pub startup_time_initial_estimate_ms: u64,
    pub demand_initial_estimate_hz: f64,
}

impl Default for ProcessConfiguration {
    fn default() -> Self {
        Self {
            auto_start: false,
            working_directory: PathBuf::from("."),
            command_line: vec!["maxima-optimised".to_string()],
            environment: BTreeMap::new(),
            process_has_started_output: "(%i1)".to_string(),
            extra_file_to_load: None,
            process_is_ready_output: "(%i1)".to_string(),
            kill_string: DEFAULT_KILL_STRING.to_string(),
            file_handling: false,
            path_command_template: "TMP_IMG_DIR: \"%WORK-DIR%\"; IMG_DIR: \"%OUTPUT-DIR%\";"
                .to_string(),
            startup_timeout_ms: 10_000,
            maximum_lifetime_ms: 60_000_000,
            execution_timeout_ms: 30_000,
            startup_time_initial_estimate_ms: 2000,
            demand_initial_estimate_hz: 0.001,
        }
    }
}

impl ProcessConfiguration {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn maximum_lifetime(&self) -> Duration {
        Duration::from_millis(self.maximum_lifetime_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// The marker awaited right after spawning.
    pub fn first_marker(&self) -> &str {
        if self.extra_file_to_load.is_some() {
            &self.process_has_started_output
        } else {
            &self.process_is_ready_output
        }
    }

    /// Check the values the runtime depends on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.command_line.is_empty() {
            return Err(ConfigError::Invalid("command_line is empty".into()));
        }
        if self.process_is_ready_output.is_empty() || self.process_has_started_output.is_empty() {
            return Err(ConfigError::Invalid("readiness markers must not be empty".into()));
        }
        if self.kill_string.chars().count() < 2 {
            return Err(ConfigError::Invalid(
                "kill_string needs at least two characters".into(),
            ));
        }
        Ok(())
    }

    /// Human-readable name/value pairs for status pages.
    pub fn describe(&self) -> Vec<(String, String)> {
        let mut values = vec![("Command line".to_string(), self.command_line.join(" "))];
        if let Some(extra) = &self.extra_file_to_load {
            values.push(("File to load".into(), extra.display().to_string()));
        }
        values.extend([
            ("Started test string".into(), self.process_has_started_output.clone()),
            ("Loaded test string".into(), self.process_is_ready_output.clone()),
            (
                "File handling".into(),
                if self.file_handling { "On" } else { "Off" }.into(),
            ),
            ("File paths template".into(), self.path_command_template.clone()),
            ("Startup time limit".into(), format!("{} ms", self.startup_timeout_ms)),
            (
                "Execution extra time limit".into(),
                format!("{} ms", self.execution_timeout_ms),
            ),
            ("Process life time limit".into(), format!("{} ms", self.maximum_lifetime_ms)),
            (
                "Initial estimate for the process startup time".into(),
                format!("{} ms", self.startup_time_initial_estimate_ms),
            ),
            (
                "Initial estimate for demand".into(),
                format!("{} Hz", self.demand_initial_estimate_hz),
            ),
        ]);
        values
    }
}

/// Settings shared by every pool under one coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfiguration {
    /// Lower bound on idle processes, shared across configurations.
    pub minimum_available: usize,
    /// Upper bound on idle processes per configuration.
    pub maximum_available: usize,
    /// Processes allowed to be starting at any one time.
    pub startup_limit: usize,
    pub maintenance_interval_ms: u64,
    /// Data points kept for the moving averages.
    pub moving_average_points: usize,
    /// Keep this many times the estimated need.
    pub safety_multiplier: f64,
    pub configurations: BTreeMap<String, ProcessConfiguration>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            minimum_available: 5,
            maximum_available: 100,
            startup_limit: 100,
            maintenance_interval_ms: 500,
            moving_average_points: 5,
            safety_multiplier: 3.0,
            configurations: BTreeMap::new(),
        }
    }
}

impl PoolConfiguration {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.minimum_available > self.maximum_available {
            return Err(ConfigError::Invalid(format!(
                "minimum_available ({}) exceeds maximum_available ({})",
                self.minimum_available, self.maximum_available
            )));
        }
        if self.startup_limit == 0 {
            return Err(ConfigError::Invalid("startup_limit must be positive".into()));
        }
        if self.moving_average_points == 0 {
            return Err(ConfigError::Invalid(
                "moving_average_points must be positive".into(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "maintenance_interval_ms must be positive".into(),
            ));
        }
        for (name, config) in &self.configurations {
            config
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
        }
        Ok(())
    }

    /// Human-readable name/value pairs for status pages.
    pub fn describe(&self) -> Vec<(String, String)> {
        vec![
            ("Min pool size".into(), self.minimum_available.to_string()),
            ("Max pool size".into(), self.maximum_available.to_string()),
            (
                "Limit on number of processes starting up".into(),
                self.startup_limit.to_string(),
            ),
            (
                "Maintenance cycle time".into(),
                format!("{} ms", self.maintenance_interval_ms),
            ),
            (
                "Number of data points for averages".into(),
                self.moving_average_points.to_string(),
            ),
            (
                "Pool size safety multiplier".into(),
                self.safety_multiplier.to_string(),
            ),
        ]
    }
}

/// Top-level shape of `warmpool.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmpoolConfig {
    /// Directory scanned for `<name>/process.toml` files.
    pub configurations_dir: Option<PathBuf>,
    #[serde(default)]
    pub pool: PoolConfiguration,
}

impl WarmpoolConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: WarmpoolConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        // Relative directories are resolved against the file's location.
        if let Some(dir) = config.configurations_dir.take() {
            let resolved = match path.parent() {
                Some(parent) if dir.is_relative() => parent.join(dir),
                _ => dir,
            };
            config.configurations_dir = Some(resolved);
        }
        Ok(config)
    }

    /// Merge scanned configurations into the pool configuration and validate.
    ///
    /// Inline `[pool.configurations.*]` tables win over scanned ones.
    pub fn resolve(self) -> ConfigResult<PoolConfiguration> {
        let mut pool = self.pool;
        if let Some(dir) = &self.configurations_dir {
            for (name, config) in scan_process_configurations(dir)? {
                pool.configurations.entry(name).or_insert(config);
            }
        }
        pool.validate()?;
        Ok(pool)
    }

    /// Re-read the configurations directory, keeping inline configurations.
    pub fn rescan(&self) -> ConfigResult<BTreeMap<String, ProcessConfiguration>> {
        let mut configurations = self.pool.configurations.clone();
        if let Some(dir) = &self.configurations_dir {
            for (name, config) in scan_process_configurations(dir)? {
                configurations.entry(name).or_insert(config);
            }
        }
        Ok(configurations)
    }
}

#[derive(Deserialize)]
struct NameProbe {
    name: Option<String>,
}

/// Find every `<root>/<name>/process.toml` and parse it.
///
/// Entries that cannot be read, do not parse, fail validation, or declare a
/// `name` different from their directory are skipped. The complete map is
/// built before being returned so callers can swap it in as one value.
pub fn scan_process_configurations(
    root: &Path,
) -> ConfigResult<BTreeMap<String, ProcessConfiguration>> {
    let entries = std::fs::read_dir(root).map_err(|source| ConfigError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut configurations = BTreeMap::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(dir_name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string)
        else {
            continue;
        };
        let file = dir.join(PROCESS_CONFIG_FILE);
        if !file.is_file() {
            continue;
        }

        match read_process_configuration(&file) {
            Ok((declared, config)) => {
                if declared.as_deref().is_some_and(|n| n != dir_name) {
                    warn!(path = %file.display(), "declared name does not match directory, skipping");
                    continue;
                }
                if let Err(e) = config.validate() {
                    warn!(path = %file.display(), error = %e, "invalid process configuration, skipping");
                    continue;
                }
                debug!(configuration = %dir_name, "found process configuration");
                configurations.insert(dir_name, config);
            }
            Err(e) => {
                warn!(error = %e, "unreadable process configuration, skipping");
            }
        }
    }
    Ok(configurations)
}

fn read_process_configuration(
    path: &Path,
) -> ConfigResult<(Option<String>, ProcessConfiguration)> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let probe: NameProbe = toml::from_str(&content).map_err(parse_err)?;
    let config: ProcessConfiguration = toml::from_str(&content).map_err(parse_err)?;
    Ok((probe.name, config))
}

fn deserialize_command_line<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CommandLine {
        Line(String),
        Argv(Vec<String>),
    }

    Ok(match CommandLine::deserialize(deserializer)? {
        CommandLine::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        CommandLine::Argv(argv) => argv,
    })
}
