//! clusterd configuration types and loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::supervisor::SupervisorConfig;

/// Environment variable that selects the runtime environment
pub const ENVIRONMENT_VAR: &str = "CLUSTERD_ENV";

/// Main clusterd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker count: `true` for one per CPU core, or an explicit number
    pub cluster: ClusterSetting,

    /// Detach from the terminal and write the pid file
    pub daemon: bool,

    /// Runtime environment; anything but `development` runs silent
    pub environment: String,

    /// Install directory holding the pid file, logs and worker sockets
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Quiet period after which the crash counter resets
    #[serde(rename = "crash-window-secs")]
    pub crash_window_secs: u64,

    /// Grace period for workers to exit after SIGTERM on shutdown
    #[serde(rename = "shutdown-grace-secs")]
    pub shutdown_grace_secs: u64,

    /// Worker process definition
    pub worker: WorkerConfig,

    /// Output log rotation
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterSetting::default(),
            daemon: true,
            environment: default_environment(),
            base_dir: PathBuf::from("."),
            log_level: None,
            crash_window_secs: 10,
            shutdown_grace_secs: 5,
            worker: WorkerConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

fn default_environment() -> String {
    std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "production".to_string())
}

/// `cluster` accepts either a boolean or a worker count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterSetting {
    /// `true` means one worker per available core, `false` means one
    Auto(bool),
    Count(usize),
}

impl Default for ClusterSetting {
    fn default() -> Self {
        Self::Count(1)
    }
}

impl std::str::FromStr for ClusterSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "true" | "auto" => Ok(Self::Auto(true)),
            "false" => Ok(Self::Auto(false)),
            other => other
                .parse::<usize>()
                .map(Self::Count)
                .map_err(|_| format!("Invalid cluster value: {}. Use a number, auto, true or false", s)),
        }
    }
}

impl std::fmt::Display for ClusterSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto(true) => write!(f, "auto"),
            Self::Auto(false) => write!(f, "false"),
            Self::Count(n) => write!(f, "{}", n),
        }
    }
}

impl ClusterSetting {
    /// Resolve to a concrete worker count, never less than one
    pub fn resolve(&self) -> usize {
        let count = match self {
            Self::Auto(true) => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            Self::Auto(false) => 1,
            Self::Count(n) => *n,
        };
        debug!(?self, count, "ClusterSetting::resolve: resolved");
        count.max(1)
    }
}

/// Worker process definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program to run for each worker
    pub program: String,

    /// Arguments passed to the program
    pub args: Vec<String>,

    /// Extra environment for every worker
    pub env: BTreeMap<String, String>,

    /// Working directory; defaults to `base-dir`
    #[serde(rename = "working-dir")]
    pub working_dir: Option<PathBuf>,
}

/// Output log rotation settings, passed through to the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Rotate once the file would exceed this many bytes
    #[serde(rename = "max-size")]
    pub max_size: u64,

    /// Number of rotated backups to keep
    pub keep: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_size: 1024 * 1024,
            keep: 3,
        }
    }
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.worker.program.trim().is_empty() {
            return Err(eyre::eyre!(
                "No worker program configured. Set worker.program in clusterd.yml."
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./clusterd.yml
        let local_config = PathBuf::from("clusterd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/clusterd/clusterd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("clusterd").join("clusterd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Desired number of workers
    pub fn num_procs(&self) -> usize {
        self.cluster.resolve()
    }

    /// Worker output and logs go to the sink unless running in development
    pub fn silent(&self) -> bool {
        self.environment != "development"
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("pidfile")
    }

    pub fn log_file(&self) -> PathBuf {
        self.base_dir.join("logs").join("output.log")
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.base_dir.join("run")
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            num_procs: self.num_procs(),
            crash_window_secs: self.crash_window_secs,
            shutdown_grace_secs: self.shutdown_grace_secs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cluster, ClusterSetting::Count(1));
        assert!(config.daemon);
        assert_eq!(config.crash_window_secs, 10);
        assert_eq!(config.output.max_size, 1024 * 1024);
        assert_eq!(config.output.keep, 3);
        assert_eq!(config.num_procs(), 1);
    }

    #[test]
    fn test_parse_yaml_with_explicit_count() {
        let yaml = r#"
cluster: 4
daemon: false
environment: development
base-dir: /srv/forum
crash-window-secs: 30
shutdown-grace-secs: 2
worker:
  program: node
  args: ["app.js"]
  env:
    PORT: "4567"
output:
  max-size: 2048
  keep: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.num_procs(), 4);
        assert!(!config.daemon);
        assert!(!config.silent());
        assert_eq!(config.pid_file(), PathBuf::from("/srv/forum/pidfile"));
        assert_eq!(config.log_file(), PathBuf::from("/srv/forum/logs/output.log"));
        assert_eq!(config.socket_dir(), PathBuf::from("/srv/forum/run"));
        assert_eq!(config.worker.program, "node");
        assert_eq!(config.worker.args, vec!["app.js".to_string()]);
        assert_eq!(config.worker.env.get("PORT").map(String::as_str), Some("4567"));
        assert_eq!(config.output.max_size, 2048);
        assert_eq!(config.output.keep, 5);
        assert_eq!(config.supervisor_config().crash_window_secs, 30);
        assert_eq!(config.supervisor_config().shutdown_grace_secs, 2);
    }

    #[test]
    fn test_cluster_true_uses_all_cores() {
        let config: Config = serde_yaml::from_str("cluster: true").unwrap();
        assert_eq!(config.cluster, ClusterSetting::Auto(true));
        assert!(config.num_procs() >= 1);
    }

    #[test]
    fn test_cluster_false_or_zero_means_one() {
        let config: Config = serde_yaml::from_str("cluster: false").unwrap();
        assert_eq!(config.num_procs(), 1);
        let config: Config = serde_yaml::from_str("cluster: 0").unwrap();
        assert_eq!(config.num_procs(), 1);
    }

    #[test]
    fn test_cluster_setting_from_str() {
        assert_eq!("3".parse::<ClusterSetting>(), Ok(ClusterSetting::Count(3)));
        assert_eq!("auto".parse::<ClusterSetting>(), Ok(ClusterSetting::Auto(true)));
        assert_eq!("TRUE".parse::<ClusterSetting>(), Ok(ClusterSetting::Auto(true)));
        assert_eq!("false".parse::<ClusterSetting>(), Ok(ClusterSetting::Auto(false)));
        assert!("many".parse::<ClusterSetting>().is_err());
    }

    #[test]
    fn test_silent_unless_development() {
        let config = Config {
            environment: "production".to_string(),
            ..Default::default()
        };
        assert!(config.silent());
        let config = Config {
            environment: "development".to_string(),
            ..Default::default()
        };
        assert!(!config.silent());
    }

    #[test]
    fn test_validate_requires_program() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.worker.program = "/usr/bin/node".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_explicit_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("clusterd.yml");
        fs::write(&path, "cluster: 2\nworker:\n  program: /bin/true\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.num_procs(), 2);
        assert_eq!(config.worker.program, "/bin/true");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
