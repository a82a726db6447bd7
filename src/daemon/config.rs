use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, fs, io};

use log::{error, info, LevelFilter};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::api::{CsrParams, EndpointConfig, IpEntry, Subject};
use crate::commons::util::ext_serde;
use crate::constants::*;
use crate::machine::retry::RetryPolicy;
use crate::machine::{Settings, Thresholds};
use crate::remote::hub::HubConfig;
use crate::remote::vault::VaultConfig;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(MCM_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {}", MCM_ENV_LOG_LEVEL);
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(MCM_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(e) => {
                    eprintln!("{} in env var {}", e, MCM_ENV_LOG_TYPE);
                    ::std::process::exit(1);
                }
            },
            _ => LogType::Stderr,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./mcm-client.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn refresh_interval_seconds() -> u64 {
        DEFAULT_REFRESH_INTERVAL_SECS
    }

    fn report_states_status_interval_seconds() -> u64 {
        DEFAULT_REPORT_INTERVAL_SECS
    }

    fn server_cert_threshold_days() -> i64 {
        DEFAULT_DFSP_SERVER_CERT_THRESHOLD_DAYS
    }

    fn cert_threshold_days() -> i64 {
        DEFAULT_CERT_THRESHOLD_DAYS
    }

    fn retry_interval_ms() -> u64 {
        DEFAULT_RETRY_INTERVAL_MS
    }

    fn retry_max_attempts() -> u32 {
        DEFAULT_RETRY_MAX_ATTEMPTS
    }

    fn retry_multiplier() -> f64 {
        DEFAULT_RETRY_MULTIPLIER
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the connection manager.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The id of this participant at the hub.
    pub dfsp_id: String,

    pub hub: HubConfig,

    pub vault: VaultConfig,

    #[serde(default = "ConfigDefaults::refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,

    #[serde(default = "ConfigDefaults::report_states_status_interval_seconds")]
    pub report_states_status_interval_seconds: u64,

    #[serde(default)]
    pub cert_expiry_threshold_days: ThresholdDays,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dfsp_server_csr: Option<CsrParams>,

    #[serde(default)]
    pub dfsp_client_csr: Option<CsrParams>,

    #[serde(default)]
    pub dfsp_ca_subject: Option<Subject>,

    /// The URL the hub should call back on.
    #[serde(default)]
    pub callback_url: Option<String>,

    /// Egress addresses the hub should allow.
    #[serde(default)]
    pub whitelist_ip: Vec<IpEntry>,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ThresholdDays {
    #[serde(default = "ConfigDefaults::server_cert_threshold_days")]
    pub dfsp_server_cert: i64,

    #[serde(default = "ConfigDefaults::cert_threshold_days")]
    pub dfsp_client_cert: i64,

    #[serde(default = "ConfigDefaults::cert_threshold_days")]
    pub hub_ca: i64,

    #[serde(default = "ConfigDefaults::cert_threshold_days")]
    pub dfsp_ca: i64,

    #[serde(default = "ConfigDefaults::cert_threshold_days")]
    pub hub_cert: i64,
}

impl Default for ThresholdDays {
    fn default() -> Self {
        ThresholdDays {
            dfsp_server_cert: ConfigDefaults::server_cert_threshold_days(),
            dfsp_client_cert: ConfigDefaults::cert_threshold_days(),
            hub_ca: ConfigDefaults::cert_threshold_days(),
            dfsp_ca: ConfigDefaults::cert_threshold_days(),
            hub_cert: ConfigDefaults::cert_threshold_days(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "ConfigDefaults::retry_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "ConfigDefaults::retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "ConfigDefaults::retry_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            interval_ms: ConfigDefaults::retry_interval_ms(),
            max_attempts: ConfigDefaults::retry_max_attempts(),
            multiplier: ConfigDefaults::retry_multiplier(),
        }
    }
}

//------------ Command line --------------------------------------------------

#[derive(clap::Parser)]
#[command(version, about = MCM_CLIENT_APP)]
struct Options {
    /// Override the path to the config file
    #[arg(short, long, value_name = "FILE", env = MCM_ENV_CONFIG, default_value = MCM_DEFAULT_CONFIG_FILE)]
    config: String,
}

/// # Accessors
impl Config {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_states_status_interval_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.retry.interval_ms),
            multiplier: self.retry.multiplier,
            max_attempts: self.retry.max_attempts,
        }
    }

    /// The static inputs of the state machine.
    pub fn settings(&self) -> Settings {
        let days = |days: i64| chrono::Duration::days(days);
        let thresholds = &self.cert_expiry_threshold_days;

        let mut settings = Settings::new(self.dfsp_id.clone());
        settings.refresh_interval = self.refresh_interval();
        settings.thresholds = Thresholds {
            hub_ca: days(thresholds.hub_ca),
            dfsp_ca: days(thresholds.dfsp_ca),
            dfsp_server_cert: days(thresholds.dfsp_server_cert),
            dfsp_client_cert: days(thresholds.dfsp_client_cert),
            hub_cert: days(thresholds.hub_cert),
        };
        if let Some(csr) = &self.dfsp_server_csr {
            settings.dfsp_server_csr = csr.clone();
        }
        if let Some(csr) = &self.dfsp_client_csr {
            settings.dfsp_client_csr = csr.clone();
        }
        if let Some(subject) = &self.dfsp_ca_subject {
            settings.dfsp_ca_subject = subject.clone();
        }
        settings.endpoint_config = EndpointConfig {
            ips: self.whitelist_ip.clone(),
            callback_url: self.callback_url.clone(),
        };
        settings
    }
}

/// # Create
impl Config {
    /// Creates the config at startup, from the file named on the command
    /// line, and initializes logging.
    pub fn create() -> Result<Self, ConfigError> {
        let options = <Options as clap::Parser>::parse();
        let config_file = options.config;

        let config = match Self::read_config(&config_file) {
            Err(e) => {
                if config_file == MCM_DEFAULT_CONFIG_FILE {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to specify its location.",
                    ))
                } else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {}, error: {}",
                        config_file, e
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!("{} uses configuration file: {}", MCM_CLIENT_APP, config_file);
                Ok(config)
            }
        }?;
        config
            .verify()
            .map_err(|e| ConfigError::Other(format!("Error parsing config file: {}, error: {}", config_file, e)))?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.dfsp_id.trim().is_empty() {
            return Err(ConfigError::other("dfsp_id must not be empty"));
        }

        if self.refresh_interval_seconds == 0 {
            return Err(ConfigError::other("refresh_interval_seconds must be at least 1"));
        }

        if self.report_states_status_interval_seconds == 0 {
            return Err(ConfigError::other(
                "report_states_status_interval_seconds must be at least 1",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::other("retry.max_attempts must be at least 1"));
        }

        if self.retry.interval_ms == 0 {
            return Err(ConfigError::other("retry.interval_ms must be at least 1"));
        }

        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::other("retry.multiplier must not be smaller than 1"));
        }

        url::Url::parse(&self.hub.endpoint)
            .map_err(|e| ConfigError::Other(format!("Invalid hub endpoint '{}': {}", self.hub.endpoint, e)))?;
        url::Url::parse(&self.vault.endpoint)
            .map_err(|e| ConfigError::Other(format!("Invalid vault endpoint '{}': {}", self.vault.endpoint, e)))?;

        Ok(())
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(file)?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("syslog is only supported on unix")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("mcm-client"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {}", err);
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("rustls", framework_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("mio", framework_level)
            .level_for("reqwest", framework_level)
            .level_for("want", framework_level)
            .level_for("h2", framework_level)
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        dfsp_id = "dfsp1"
        log_type = "stderr"

        [hub]
        endpoint = "https://mcm.example.com/api"
        env_id = "1"

        [vault]
        endpoint = "http://vault:8233"
        pki_server_role = "dfsp-server"
        pki_client_role = "dfsp-client"
        common_name = "dfsp1.example.com"

        [vault.auth]
        method = "app_role"
        role_id = "role"
        secret_id = "secret"
    "#;

    #[test]
    fn should_parse_minimal_config() {
        let config = Config::parse(MINIMAL).unwrap();
        config.verify().unwrap();

        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.report_interval(), Duration::from_secs(60));
        assert_eq!(config.cert_expiry_threshold_days, ThresholdDays::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.log_type, LogType::Stderr);
    }

    #[test]
    fn settings_follow_config() {
        let toml = format!(
            r#"
            refresh_interval_seconds = 30
            callback_url = "https://dfsp1.example.com/callback"
            whitelist_ip = [{{ address = "10.0.0.1", ports = ["443"] }}]
            {}
            [cert_expiry_threshold_days]
            dfsp_server_cert = 3

            [dfsp_ca_subject]
            CN = "DFSP1 Root"
            O = "Example Bank"
            "#,
            MINIMAL
        );
        let config = Config::parse(&toml).unwrap();
        let settings = config.settings();

        assert_eq!(settings.dfsp_id, "dfsp1");
        assert_eq!(settings.refresh_interval, Duration::from_secs(30));
        assert_eq!(settings.thresholds.dfsp_server_cert, chrono::Duration::days(3));
        assert_eq!(settings.thresholds.hub_ca, chrono::Duration::days(7));
        assert_eq!(settings.dfsp_ca_subject.common_name, "DFSP1 Root");
        assert_eq!(settings.dfsp_ca_subject.organization.as_deref(), Some("Example Bank"));
        assert_eq!(
            settings.endpoint_config.callback_url.as_deref(),
            Some("https://dfsp1.example.com/callback")
        );
        assert_eq!(settings.endpoint_config.ips[0].ports, vec!["443".to_string()]);
    }

    #[test]
    fn verify_rejects_bad_values() {
        let mut config = Config::parse(MINIMAL).unwrap();
        config.refresh_interval_seconds = 0;
        assert!(config.verify().is_err());

        let mut config = Config::parse(MINIMAL).unwrap();
        config.retry.max_attempts = 0;
        assert!(config.verify().is_err());

        let mut config = Config::parse(MINIMAL).unwrap();
        config.dfsp_id = " ".to_string();
        assert!(config.verify().is_err());
    }

    #[test]
    fn should_read_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcm-client.conf");
        fs::write(&path, MINIMAL).unwrap();

        let config = Config::read_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.dfsp_id, "dfsp1");

        let missing = dir.path().join("missing.conf");
        assert!(matches!(
            Config::read_config(missing.to_str().unwrap()),
            Err(ConfigError::IoError(_))
        ));

        fs::write(&path, "dfsp_id = ").unwrap();
        assert!(matches!(
            Config::read_config(path.to_str().unwrap()),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn log_type_names() {
        assert_eq!(LogType::from_str("syslog"), Ok(LogType::Syslog));
        assert!(LogType::from_str("journald").is_err());
    }
}
