//! Process configuration.
//!
//! Resolved once at startup from, in increasing precedence: built-in
//! defaults, an optional TOML file, environment variables, CLI flags. The
//! result is immutable and handed to each component at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::Args;
use crate::error::BridgeError;
use crate::gateway::Secret;

pub const ENV_COLLECTOR_URL: &str = "COLLECTOR_URL";
pub const ENV_TOKEN: &str = "BRIDGE_TOKEN";
pub const ENV_HOST: &str = "BRIDGE_HOST";
pub const ENV_PORT: &str = "BRIDGE_PORT";
pub const ENV_TELEMETRY_PATH: &str = "TELEMETRY_PATH";
pub const ENV_BLACKBOARD_PATH: &str = "BLACKBOARD_PATH";
pub const ENV_VALIDATION_COMMAND: &str = "VALIDATION_COMMAND";
pub const ENV_VALIDATION_DIR: &str = "VALIDATION_DIR";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;

/// How the `run_tests` command is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".into(), "pytest".into(), "-q".into()],
            workdir: None,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Collector base URL; `None` disables the push daemon.
    pub collector_url: Option<String>,
    /// Shared bearer secret; `None` rejects every `/execute`.
    pub secret: Option<Secret>,
    pub snapshot_path: PathBuf,
    pub document_path: PathBuf,
    pub push_interval: Duration,
    pub push_timeout: Duration,
    pub stream_interval: Duration,
    pub push_enabled: bool,
    pub validation: ValidationConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            collector_url: None,
            secret: None,
            snapshot_path: PathBuf::from("telemetry.json"),
            document_path: PathBuf::from("blackboard.md"),
            push_interval: Duration::from_secs(5),
            push_timeout: Duration::from_secs(5),
            stream_interval: Duration::from_secs(1),
            push_enabled: true,
            validation: ValidationConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// TOML file shape
// ---------------------------------------------------------------------------

/// Every field is optional; absent fields keep the lower layer's value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub collector_url: Option<String>,
    pub token: Option<String>,
    pub snapshot_path: Option<PathBuf>,
    pub document_path: Option<PathBuf>,
    pub push_interval_secs: Option<u64>,
    pub push_timeout_secs: Option<u64>,
    pub stream_interval_ms: Option<u64>,
    pub validation: Option<FileValidation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileValidation {
    /// Program followed by its arguments.
    pub command: Option<Vec<String>>,
    pub workdir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn read(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path).map_err(|e| BridgeError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text).map_err(|e| BridgeError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_zero(key: &str, secs: Duration) -> Result<Duration, BridgeError> {
    if secs.is_zero() {
        return Err(BridgeError::Config {
            key: key.to_string(),
            detail: "must be greater than zero".to_string(),
        });
    }
    Ok(secs)
}

fn split_command(key: &str, words: Vec<String>) -> Result<(String, Vec<String>), BridgeError> {
    let mut iter = words.into_iter();
    let program = iter.next().filter(|p| !p.is_empty()).ok_or_else(|| BridgeError::Config {
        key: key.to_string(),
        detail: "command is empty".to_string(),
    })?;
    Ok((program, iter.collect()))
}

impl BridgeConfig {
    /// Resolve the full configuration for this process.
    pub fn load(args: &Args) -> Result<Self, BridgeError> {
        Self::from_lookup(args, |key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load) with an injectable environment.
    pub fn from_lookup<F>(args: &Args, lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = BridgeConfig::default();
        if let Some(path) = &args.config {
            cfg.apply_file(FileConfig::read(path)?)?;
        }
        cfg.apply_env(lookup)?;
        cfg.apply_args(args);
        Ok(cfg)
    }

    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), BridgeError> {
        if let Some(host) = non_empty(file.host) {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(url) = non_empty(file.collector_url) {
            self.collector_url = Some(url);
        }
        if let Some(secret) = file.token.and_then(Secret::new) {
            self.secret = Some(secret);
        }
        if let Some(p) = file.snapshot_path {
            self.snapshot_path = p;
        }
        if let Some(p) = file.document_path {
            self.document_path = p;
        }
        if let Some(s) = file.push_interval_secs {
            self.push_interval = non_zero("push_interval_secs", Duration::from_secs(s))?;
        }
        if let Some(s) = file.push_timeout_secs {
            self.push_timeout = non_zero("push_timeout_secs", Duration::from_secs(s))?;
        }
        if let Some(ms) = file.stream_interval_ms {
            self.stream_interval = non_zero("stream_interval_ms", Duration::from_millis(ms))?;
        }
        if let Some(v) = file.validation {
            if let Some(words) = v.command {
                let (program, args) = split_command("validation.command", words)?;
                self.validation.program = program;
                self.validation.args = args;
            }
            if let Some(dir) = v.workdir {
                self.validation.workdir = Some(dir);
            }
            if let Some(s) = v.timeout_secs {
                self.validation.timeout = non_zero("validation.timeout_secs", Duration::from_secs(s))?;
            }
        }
        Ok(())
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(url) = get(ENV_COLLECTOR_URL) {
            self.collector_url = Some(url);
        }
        if let Some(token) = get(ENV_TOKEN) {
            self.secret = Secret::new(token);
        }
        if let Some(host) = get(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = get(ENV_PORT) {
            self.port = port.trim().parse().map_err(|e: std::num::ParseIntError| BridgeError::Config {
                key: ENV_PORT.to_string(),
                detail: e.to_string(),
            })?;
        }
        if let Some(p) = get(ENV_TELEMETRY_PATH) {
            self.snapshot_path = PathBuf::from(p);
        }
        if let Some(p) = get(ENV_BLACKBOARD_PATH) {
            self.document_path = PathBuf::from(p);
        }
        if let Some(cmd) = get(ENV_VALIDATION_COMMAND) {
            let words = cmd.split_whitespace().map(str::to_string).collect();
            let (program, args) = split_command(ENV_VALIDATION_COMMAND, words)?;
            self.validation.program = program;
            self.validation.args = args;
        }
        if let Some(dir) = get(ENV_VALIDATION_DIR) {
            self.validation.workdir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = non_empty(args.host.clone()) {
            self.host = host;
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(url) = non_empty(args.collector_url.clone()) {
            self.collector_url = Some(url);
        }
        if let Some(p) = &args.snapshot_path {
            self.snapshot_path = p.clone();
        }
        if let Some(p) = &args.document_path {
            self.document_path = p.clone();
        }
        if args.no_push {
            self.push_enabled = false;
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Collector URL the push daemon should use, honoring `--no-push`.
    pub fn effective_collector_url(&self) -> Option<String> {
        if self.push_enabled {
            self.collector_url.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_any_source() {
        let cfg = BridgeConfig::from_lookup(&Args::default(), env(&[])).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8765);
        assert!(cfg.collector_url.is_none());
        assert!(cfg.secret.is_none());
        assert_eq!(cfg.push_interval, Duration::from_secs(5));
        assert_eq!(cfg.push_timeout, Duration::from_secs(5));
        assert_eq!(cfg.stream_interval, Duration::from_secs(1));
        assert_eq!(cfg.validation.program, "python3");
    }

    #[test]
    fn env_sets_collector_and_secret() {
        let cfg = BridgeConfig::from_lookup(
            &Args::default(),
            env(&[(ENV_COLLECTOR_URL, "http://c:1"), (ENV_TOKEN, "tok")]),
        )
        .unwrap();
        assert_eq!(cfg.collector_url.as_deref(), Some("http://c:1"));
        assert!(cfg.secret.unwrap().matches("tok"));
    }

    #[test]
    fn env_secret_with_trailing_newline_still_matches() {
        let cfg = BridgeConfig::from_lookup(&Args::default(), env(&[(ENV_TOKEN, " tok\n")])).unwrap();
        let secret = cfg.secret.unwrap();
        assert_eq!(secret.expose(), "tok");
        assert!(secret.matches("tok"));
    }

    #[test]
    fn empty_env_values_count_as_unset() {
        let cfg = BridgeConfig::from_lookup(
            &Args::default(),
            env(&[(ENV_COLLECTOR_URL, ""), (ENV_TOKEN, "  ")]),
        )
        .unwrap();
        assert!(cfg.collector_url.is_none());
        assert!(cfg.secret.is_none());
    }

    #[test]
    fn bad_port_is_config_error() {
        let err = BridgeConfig::from_lookup(&Args::default(), env(&[(ENV_PORT, "eighty")])).unwrap_err();
        assert!(matches!(err, BridgeError::Config { ref key, .. } if key == ENV_PORT));
    }

    #[test]
    fn validation_command_is_split_on_whitespace() {
        let cfg = BridgeConfig::from_lookup(
            &Args::default(),
            env(&[(ENV_VALIDATION_COMMAND, "cargo test --quiet")]),
        )
        .unwrap();
        assert_eq!(cfg.validation.program, "cargo");
        assert_eq!(cfg.validation.args, vec!["test", "--quiet"]);
    }

    #[test]
    fn args_override_env() {
        let args = Args {
            host: Some("0.0.0.0".into()),
            port: Some(9001),
            collector_url: Some("http://flag".into()),
            ..Args::default()
        };
        let cfg = BridgeConfig::from_lookup(
            &args,
            env(&[(ENV_HOST, "10.0.0.1"), (ENV_PORT, "7000"), (ENV_COLLECTOR_URL, "http://env")]),
        )
        .unwrap();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9001");
        assert_eq!(cfg.collector_url.as_deref(), Some("http://flag"));
    }

    #[test]
    fn no_push_disables_collector() {
        let args = Args {
            no_push: true,
            ..Args::default()
        };
        let cfg = BridgeConfig::from_lookup(&args, env(&[(ENV_COLLECTOR_URL, "http://c")])).unwrap();
        assert!(cfg.effective_collector_url().is_none());
    }

    #[test]
    fn toml_file_layer_applies() {
        let file = FileConfig::parse(
            r#"
            host = "0.0.0.0"
            port = 9100
            collector_url = "http://collector"
            token = "from-file"
            push_interval_secs = 10
            stream_interval_ms = 250

            [validation]
            command = ["make", "check"]
            timeout_secs = 60
            "#,
        )
        .unwrap();
        let mut cfg = BridgeConfig::default();
        cfg.apply_file(file).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.push_interval, Duration::from_secs(10));
        assert_eq!(cfg.stream_interval, Duration::from_millis(250));
        assert_eq!(cfg.validation.program, "make");
        assert_eq!(cfg.validation.args, vec!["check"]);
        assert_eq!(cfg.validation.timeout, Duration::from_secs(60));
        assert!(cfg.secret.unwrap().matches("from-file"));
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "port = 9100\ntoken = \"file\"\n").unwrap();
        let args = Args {
            config: Some(path),
            ..Args::default()
        };
        let cfg = BridgeConfig::from_lookup(&args, env(&[(ENV_TOKEN, "env")])).unwrap();
        assert_eq!(cfg.port, 9100);
        let secret = cfg.secret.unwrap();
        assert!(secret.matches("env"));
        assert!(!secret.matches("file"));
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        assert!(FileConfig::parse("prot = 1").is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut cfg = BridgeConfig::default();
        let file = FileConfig::parse("push_interval_secs = 0").unwrap();
        assert!(cfg.apply_file(file).is_err());
    }

    #[test]
    fn missing_config_file_is_read_error() {
        let args = Args {
            config: Some(PathBuf::from("/definitely/not/here.toml")),
            ..Args::default()
        };
        let err = BridgeConfig::from_lookup(&args, env(&[])).unwrap_err();
        assert!(matches!(err, BridgeError::ConfigRead { .. }));
    }
}
