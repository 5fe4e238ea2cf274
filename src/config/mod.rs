use crate::error::{Result, VigilError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of worker instances to run, either a fixed count or "max"
/// (all available CPU parallelism, resolved once at startup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceCount {
    Fixed(usize),
    Named(String),
}

impl InstanceCount {
    pub fn is_max(&self) -> bool {
        matches!(self, InstanceCount::Named(s) if s.eq_ignore_ascii_case("max"))
    }
}

/// Resolve a requested instance count against the host's available
/// parallelism. Pure: evaluated once at startup, never re-evaluated.
pub fn resolve_instance_count(requested: &InstanceCount, available_parallelism: usize) -> usize {
    match requested {
        InstanceCount::Fixed(n) => *n,
        InstanceCount::Named(_) => available_parallelism.max(1),
    }
}

/// Execution mode for the managed application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// One instance, one process
    Fork,
    /// N load-shared instances
    Cluster,
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Fork
    }
}

/// Supervisor configuration with all settings for the managed application.
/// Immutable once loaded; shared read-only by all instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Application name (used in log lines and diagnostics)
    pub name: String,

    /// Path to the script to run
    pub script: PathBuf,

    /// Interpreter to run the script under (e.g. a venv python).
    /// When absent the script is executed directly.
    #[serde(default)]
    pub interpreter: Option<PathBuf>,

    /// Command-line arguments passed to the script
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for every instance
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Number of instances, or "max" for available parallelism
    #[serde(default = "default_instances")]
    pub instances: InstanceCount,

    /// fork (single process) or cluster (N instances)
    #[serde(default)]
    pub exec_mode: ExecMode,

    /// Maximum restarts before an instance is retired permanently
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// Flat delay before each restart (milliseconds)
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Uptime below which an exit counts against the restart budget
    /// (milliseconds); a longer run forgives past failures
    #[serde(default = "default_min_uptime_ms")]
    pub min_uptime_ms: u64,

    /// Memory ceiling triggering a forced restart, as a human size
    /// string ("2G", "512M", "1024K") or plain bytes
    #[serde(default)]
    pub max_memory_restart: Option<String>,

    /// Environment variables merged into each instance
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Overrides applied on top of `env` in production mode
    #[serde(default)]
    pub env_production: HashMap<String, String>,

    /// Name of the env var carrying the instance id
    #[serde(default = "default_instance_var")]
    pub instance_var: String,

    /// Stderr log file, shared by all instances
    #[serde(default = "default_error_file")]
    pub error_file: PathBuf,

    /// Stdout log file, shared by all instances
    #[serde(default = "default_out_file")]
    pub out_file: PathBuf,

    /// Combined log file: the merge of stdout and stderr across all instances
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Grace period for cooperative exit during shutdown (milliseconds)
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Upper bound on the total shutdown wait, including reaping
    /// force-killed instances (milliseconds)
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,

    /// Signal sent as the termination request (default: SIGTERM)
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
}

// Default value functions for serde
fn default_instances() -> InstanceCount {
    InstanceCount::Fixed(1)
}

fn default_max_restarts() -> usize {
    15
}

fn default_restart_delay_ms() -> u64 {
    4000
}

fn default_min_uptime_ms() -> u64 {
    10_000
}

fn default_instance_var() -> String {
    "INSTANCE_ID".to_string()
}

fn default_error_file() -> PathBuf {
    PathBuf::from("./logs/err.log")
}

fn default_out_file() -> PathBuf {
    PathBuf::from("./logs/out.log")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("./logs/combined.log")
}

fn default_kill_timeout_ms() -> u64 {
    5000
}

fn default_listen_timeout_ms() -> u64 {
    8000
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

impl SupervisorConfig {
    /// Load a supervisor configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<SupervisorConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VigilError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config: SupervisorConfig = match extension {
            "toml" => toml::from_str(&contents)
                .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?,
            _ => {
                return Err(VigilError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VigilError::MissingConfigField("name".to_string()));
        }

        if self.script.as_os_str().is_empty() {
            return Err(VigilError::MissingConfigField("script".to_string()));
        }

        match &self.instances {
            InstanceCount::Fixed(0) => {
                return Err(VigilError::ConfigValidationError(
                    "instances must be at least 1".to_string(),
                ));
            }
            InstanceCount::Fixed(n) if *n > 100 => {
                return Err(VigilError::ConfigValidationError(
                    "instances cannot exceed 100".to_string(),
                ));
            }
            InstanceCount::Named(s) if !s.eq_ignore_ascii_case("max") => {
                return Err(VigilError::ConfigValidationError(format!(
                    "instances must be a number or \"max\", got \"{}\"",
                    s
                )));
            }
            _ => {}
        }

        if self.exec_mode == ExecMode::Fork {
            if let InstanceCount::Fixed(n) = self.instances {
                if n > 1 {
                    return Err(VigilError::ConfigValidationError(
                        "fork mode runs exactly one instance; use cluster mode for more"
                            .to_string(),
                    ));
                }
            }
        }

        if self.max_restarts == 0 {
            return Err(VigilError::ConfigValidationError(
                "max_restarts must be at least 1".to_string(),
            ));
        }

        let valid_signals = [
            "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
        ];
        if !valid_signals.contains(&self.stop_signal.as_str()) {
            return Err(VigilError::ConfigValidationError(format!(
                "Invalid stop_signal: {}. Must be one of: {}",
                self.stop_signal,
                valid_signals.join(", ")
            )));
        }

        if let Some(ref size) = self.max_memory_restart {
            parse_memory_size(size)?;
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.exists() {
                return Err(VigilError::ConfigValidationError(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                )));
            }
            if !cwd.is_dir() {
                return Err(VigilError::ConfigValidationError(format!(
                    "Working directory is not a directory: {}",
                    cwd.display()
                )));
            }
        }

        Ok(())
    }

    /// Resolve the effective instance count for this configuration.
    /// Fork mode always runs a single instance; "max" resolves against
    /// the host's available parallelism.
    pub fn resolved_instances(&self) -> usize {
        if self.exec_mode == ExecMode::Fork {
            return 1;
        }

        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        resolve_instance_count(&self.instances, available)
    }

    /// Build the environment for one instance: base env, overlaid with
    /// production overrides when selected, plus the instance id variable.
    pub fn merged_env(&self, production: bool, instance_id: u32) -> HashMap<String, String> {
        let mut merged = self.env.clone();
        if production {
            for (k, v) in &self.env_production {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged.insert(self.instance_var.clone(), instance_id.to_string());
        merged
    }

    /// Expand environment variables in configuration fields
    fn expand_env_vars(&mut self) {
        self.script = Self::expand_env_in_path(&self.script);

        if let Some(ref interpreter) = self.interpreter {
            self.interpreter = Some(Self::expand_env_in_path(interpreter));
        }

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(Self::expand_env_in_path(cwd));
        }

        self.args = self
            .args
            .iter()
            .map(|arg| Self::expand_env_in_string(arg))
            .collect();

        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Self::expand_env_in_string(v)))
            .collect();

        self.env_production = self
            .env_production
            .iter()
            .map(|(k, v)| (k.clone(), Self::expand_env_in_string(v)))
            .collect();
    }

    /// Expand `${VAR}` and `$VAR` references in a string. Tokens are
    /// matched left-to-right and looked up by their full name, so
    /// `$FOOBAR` never resolves through a variable named `FOO`; unset
    /// variables are left as written.
    fn expand_env_in_string(s: &str) -> String {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(pos) = rest.find('$') {
            result.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(braced) = after.strip_prefix('{') {
                if let Some(end) = braced.find('}') {
                    let name = &braced[..end];
                    match std::env::var(name) {
                        Ok(value) => result.push_str(&value),
                        Err(_) => {
                            result.push_str("${");
                            result.push_str(name);
                            result.push('}');
                        }
                    }
                    rest = &braced[end + 1..];
                } else {
                    // Unterminated brace: keep the dollar sign literal
                    result.push('$');
                    rest = after;
                }
                continue;
            }

            let end = after
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after.len());
            if end == 0 {
                result.push('$');
                rest = after;
                continue;
            }

            let name = &after[..end];
            match std::env::var(name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push('$');
                    result.push_str(name);
                }
            }
            rest = &after[end..];
        }

        result.push_str(rest);
        result
    }

    fn expand_env_in_path(path: &Path) -> PathBuf {
        let path_str = path.to_string_lossy();
        let expanded = Self::expand_env_in_string(&path_str);
        PathBuf::from(expanded)
    }

    /// Get restart delay as Duration
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Get the minimum stable uptime as Duration
    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    /// Grace period for cooperative exit during shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Time allowed for reaping force-killed instances after the grace
    /// period has elapsed
    pub fn reap_timeout(&self) -> Duration {
        let extra = self.listen_timeout_ms.saturating_sub(self.kill_timeout_ms);
        Duration::from_millis(extra.max(250))
    }
}

/// Parse a human memory size string into bytes.
///
/// Accepts plain byte counts ("1048576") and K/M/G suffixes, optionally
/// followed by "B" ("512M", "2G", "100KB").
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(VigilError::ConfigValidationError(
            "empty memory size".to_string(),
        ));
    }

    let upper = trimmed.to_ascii_uppercase();
    let (number, multiplier) = if let Some(n) = upper.strip_suffix("KB").or(upper.strip_suffix("K"))
    {
        (n, 1024u64)
    } else if let Some(n) = upper.strip_suffix("MB").or(upper.strip_suffix("M")) {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("GB").or(upper.strip_suffix("G")) {
        (n, 1024 * 1024 * 1024)
    } else {
        (upper.as_str(), 1)
    };

    let value: u64 = number.trim().parse().map_err(|_| {
        VigilError::ConfigValidationError(format!("Invalid memory size: {}", s))
    })?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| VigilError::ConfigValidationError(format!("Memory size overflows: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn minimal_config() -> SupervisorConfig {
        SupervisorConfig {
            name: "test".to_string(),
            script: PathBuf::from("/bin/echo"),
            interpreter: None,
            args: vec![],
            cwd: None,
            instances: default_instances(),
            exec_mode: ExecMode::default(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            min_uptime_ms: default_min_uptime_ms(),
            max_memory_restart: None,
            env: HashMap::new(),
            env_production: HashMap::new(),
            instance_var: default_instance_var(),
            error_file: default_error_file(),
            out_file: default_out_file(),
            log_file: default_log_file(),
            kill_timeout_ms: default_kill_timeout_ms(),
            listen_timeout_ms: default_listen_timeout_ms(),
            stop_signal: default_stop_signal(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = minimal_config();
        assert_eq!(config.instances, InstanceCount::Fixed(1));
        assert_eq!(config.exec_mode, ExecMode::Fork);
        assert_eq!(config.max_restarts, 15);
        assert_eq!(config.restart_delay_ms, 4000);
        assert_eq!(config.min_uptime_ms, 10_000);
        assert_eq!(config.kill_timeout_ms, 5000);
        assert_eq!(config.listen_timeout_ms, 8000);
        assert_eq!(config.stop_signal, "SIGTERM");
        assert_eq!(config.instance_var, "INSTANCE_ID");
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name() {
        let mut config = minimal_config();
        config.name = String::new();
        assert!(matches!(
            config.validate(),
            Err(VigilError::MissingConfigField(_))
        ));
    }

    #[test]
    fn test_validate_zero_instances() {
        let mut config = minimal_config();
        config.instances = InstanceCount::Fixed(0);
        assert!(matches!(
            config.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_validate_fork_with_multiple_instances() {
        let mut config = minimal_config();
        config.exec_mode = ExecMode::Fork;
        config.instances = InstanceCount::Fixed(4);
        assert!(matches!(
            config.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_validate_bad_instances_keyword() {
        let mut config = minimal_config();
        config.exec_mode = ExecMode::Cluster;
        config.instances = InstanceCount::Named("auto".to_string());
        assert!(matches!(
            config.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_validate_invalid_signal() {
        let mut config = minimal_config();
        config.stop_signal = "INVALID".to_string();
        assert!(matches!(
            config.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_resolve_instance_count_fixed() {
        assert_eq!(resolve_instance_count(&InstanceCount::Fixed(3), 8), 3);
        assert_eq!(resolve_instance_count(&InstanceCount::Fixed(16), 8), 16);
    }

    #[test]
    fn test_resolve_instance_count_max() {
        let max = InstanceCount::Named("max".to_string());
        assert_eq!(resolve_instance_count(&max, 8), 8);
        assert_eq!(resolve_instance_count(&max, 1), 1);
        // Degenerate parallelism still yields at least one instance
        assert_eq!(resolve_instance_count(&max, 0), 1);
    }

    #[test]
    fn test_resolved_instances_fork_is_one() {
        let mut config = minimal_config();
        config.exec_mode = ExecMode::Fork;
        config.instances = InstanceCount::Named("max".to_string());
        assert_eq!(config.resolved_instances(), 1);
    }

    #[test]
    fn test_parse_memory_size() {
        assert_eq!(parse_memory_size("1024").unwrap(), 1024);
        assert_eq!(parse_memory_size("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_memory_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("100KB").unwrap(), 100 * 1024);
        assert_eq!(parse_memory_size(" 1G ").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("abc").is_err());
        assert!(parse_memory_size("1T").is_err());
        assert!(parse_memory_size("G").is_err());
    }

    #[test]
    fn test_merged_env_production_overlay() {
        let mut config = minimal_config();
        config.env.insert("APP_ENV".to_string(), "dev".to_string());
        config.env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        config
            .env_production
            .insert("APP_ENV".to_string(), "production".to_string());

        let dev = config.merged_env(false, 0);
        assert_eq!(dev.get("APP_ENV"), Some(&"dev".to_string()));
        assert_eq!(dev.get("INSTANCE_ID"), Some(&"0".to_string()));

        let prod = config.merged_env(true, 3);
        assert_eq!(prod.get("APP_ENV"), Some(&"production".to_string()));
        assert_eq!(prod.get("PYTHONUNBUFFERED"), Some(&"1".to_string()));
        assert_eq!(prod.get("INSTANCE_ID"), Some(&"3".to_string()));
    }

    #[test]
    fn test_merged_env_custom_instance_var() {
        let mut config = minimal_config();
        config.instance_var = "WORKER_SLOT".to_string();
        let env = config.merged_env(false, 7);
        assert_eq!(env.get("WORKER_SLOT"), Some(&"7".to_string()));
        assert!(env.get("INSTANCE_ID").is_none());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("VIGIL_TEST_PATH", "/tmp");
        std::env::set_var("VIGIL_TEST_VAR", "test_value");

        let mut config = minimal_config();
        config.script = PathBuf::from("$VIGIL_TEST_PATH/script.py");
        config.args = vec!["--flag=${VIGIL_TEST_VAR}".to_string()];
        config
            .env
            .insert("KEY".to_string(), "$VIGIL_TEST_VAR".to_string());

        config.expand_env_vars();

        assert_eq!(config.script, PathBuf::from("/tmp/script.py"));
        assert_eq!(config.args[0], "--flag=test_value");
        assert_eq!(config.env.get("KEY"), Some(&"test_value".to_string()));
    }

    #[test]
    fn test_expand_env_var_name_boundaries() {
        std::env::set_var("VIGIL_PREFIX", "/opt");

        assert_eq!(
            SupervisorConfig::expand_env_in_string("${VIGIL_PREFIX}/app"),
            "/opt/app"
        );
        // $VIGIL_PREFIXED names a different (unset) variable; it must not
        // match VIGIL_PREFIX by prefix
        assert_eq!(
            SupervisorConfig::expand_env_in_string("$VIGIL_PREFIXED/app"),
            "$VIGIL_PREFIXED/app"
        );
        // Unset and degenerate references pass through unchanged
        assert_eq!(
            SupervisorConfig::expand_env_in_string("$VIGIL_UNSET_VAR_42"),
            "$VIGIL_UNSET_VAR_42"
        );
        assert_eq!(SupervisorConfig::expand_env_in_string("cost: $"), "cost: $");
        assert_eq!(
            SupervisorConfig::expand_env_in_string("${VIGIL_PREFIX"),
            "${VIGIL_PREFIX"
        );
    }

    #[test]
    fn test_from_file_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("app.toml");

        let toml_content = r#"
            name = "videobot"
            script = "/bin/echo"
            instances = "max"
            exec_mode = "cluster"
            max_restarts = 15
            restart_delay_ms = 4000
            max_memory_restart = "2G"

            [env]
            PYTHONUNBUFFERED = "1"

            [env_production]
            APP_ENV = "production"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = SupervisorConfig::from_file(&config_path).unwrap();
        assert_eq!(config.name, "videobot");
        assert!(config.instances.is_max());
        assert_eq!(config.exec_mode, ExecMode::Cluster);
        assert_eq!(config.max_memory_restart.as_deref(), Some("2G"));
        assert_eq!(config.env.get("PYTHONUNBUFFERED"), Some(&"1".to_string()));
    }

    #[test]
    fn test_from_file_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("app.json");

        let json_content = r#"
            {
                "name": "videobot",
                "script": "/bin/echo",
                "interpreter": "/usr/bin/python3",
                "instances": 4,
                "exec_mode": "cluster",
                "kill_timeout_ms": 5000,
                "listen_timeout_ms": 8000
            }
        "#;

        fs::write(&config_path, json_content).unwrap();

        let config = SupervisorConfig::from_file(&config_path).unwrap();
        assert_eq!(config.name, "videobot");
        assert_eq!(config.instances, InstanceCount::Fixed(4));
        assert_eq!(config.interpreter, Some(PathBuf::from("/usr/bin/python3")));
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("app.yaml");

        fs::write(&config_path, "name: test").unwrap();

        let result = SupervisorConfig::from_file(&config_path);
        assert!(matches!(result, Err(VigilError::InvalidConfig(_))));
    }

    #[test]
    fn test_timeout_accessors() {
        let config = minimal_config();
        assert_eq!(config.restart_delay(), Duration::from_millis(4000));
        assert_eq!(config.min_uptime(), Duration::from_secs(10));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.reap_timeout(), Duration::from_secs(3));
    }
}
