//! Various crate-wide constants.

//------------ Binary Names -------------------------------------------------

/// The friendly name of the daemon binary.
pub const MCM_CLIENT_APP: &str = "MCM Client";

/// The version of this crate as reported in logs and user agents.
pub const MCM_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const MCM_DEFAULT_CONFIG_FILE: &str = "/etc/mcm-client.conf";

//------------ Environment Variables ----------------------------------------

/// The environment variable with the path to the config file.
///
/// A `--config` argument on the command line takes precedence.
pub const MCM_ENV_CONFIG: &str = "MCM_CONFIG";

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const MCM_ENV_LOG_LEVEL: &str = "MCM_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::daemon::config::LogType]. The default is “stderr.”
pub const MCM_ENV_LOG_TYPE: &str = "MCM_LOG_TYPE";

//------------ State Machine ------------------------------------------------

/// The version of the persisted snapshot layout.
///
/// Bump this whenever the event vocabulary, the context layout, or the
/// meaning of a state changes. A snapshot with a different version is
/// discarded at start up.
pub const STATE_VERSION: u32 = 3;

/// The upper bound on eventless transitions taken in one step of a region.
///
/// A chart where `always` transitions form a cycle would otherwise never
/// settle.
pub const MAX_EVENTLESS_STEPS: usize = 32;

//------------ Timing Defaults ----------------------------------------------

/// The default interval between periodic checks, in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

/// The default interval between reports of the progress table to the hub.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 60;

/// The default number of attempts for an external call before giving up.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 10;

/// The default initial delay between attempts of an external call.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 2_000;

/// The default factor applied to the delay after each failed attempt.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 1.5;

/// The cap on the delay between two attempts of an external call.
pub const RETRY_MAX_INTERVAL_SECS: u64 = 300;

/// The default expiry threshold of the participant's server certificate.
pub const DEFAULT_DFSP_SERVER_CERT_THRESHOLD_DAYS: i64 = 2;

/// The default expiry threshold of all other certificates.
pub const DEFAULT_CERT_THRESHOLD_DAYS: i64 = 7;

//------------ HTTP ---------------------------------------------------------

/// Timeout for calls to the hub and to Vault.
pub const HTTP_CLIENT_TIMEOUT_SECS: u64 = 120;

/// Seconds before the lease of a Vault token ends at which it is renewed.
pub const VAULT_TOKEN_RENEW_MARGIN_SECS: u64 = 10;
