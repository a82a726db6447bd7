//! Static inputs the chart needs besides its context.

use std::time::Duration;

use crate::api::{CsrParams, EndpointConfig, Subject};
use crate::constants::{
    DEFAULT_CERT_THRESHOLD_DAYS, DEFAULT_DFSP_SERVER_CERT_THRESHOLD_DAYS, DEFAULT_REFRESH_INTERVAL_SECS,
};

//------------ Thresholds ----------------------------------------------------

/// How long before the end of its validity a certificate is renewed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Thresholds {
    pub hub_ca: chrono::Duration,
    pub dfsp_ca: chrono::Duration,
    pub dfsp_server_cert: chrono::Duration,
    pub dfsp_client_cert: chrono::Duration,
    pub hub_cert: chrono::Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        let days = chrono::Duration::days(DEFAULT_CERT_THRESHOLD_DAYS);
        Thresholds {
            hub_ca: days,
            dfsp_ca: days,
            dfsp_server_cert: chrono::Duration::days(DEFAULT_DFSP_SERVER_CERT_THRESHOLD_DAYS),
            dfsp_client_cert: days,
            hub_cert: days,
        }
    }
}

//------------ Settings ------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Settings {
    pub dfsp_id: String,

    /// Delay of every timed recheck.
    pub refresh_interval: Duration,

    pub thresholds: Thresholds,

    pub dfsp_server_csr: CsrParams,

    pub dfsp_client_csr: CsrParams,

    pub dfsp_ca_subject: Subject,

    /// The endpoints that should be registered with the hub.
    pub endpoint_config: EndpointConfig,

    /// Whether an external certificate manager owns the server certificate.
    pub cert_manager: bool,
}

impl Settings {
    pub fn new(dfsp_id: impl Into<String>) -> Self {
        let dfsp_id = dfsp_id.into();
        Settings {
            dfsp_server_csr: CsrParams {
                subject: Subject::with_common_name(dfsp_id.clone()),
                ..Default::default()
            },
            dfsp_client_csr: CsrParams {
                subject: Subject::with_common_name(dfsp_id.clone()),
                ..Default::default()
            },
            dfsp_ca_subject: Subject::with_common_name(format!("{} CA", dfsp_id)),
            dfsp_id,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            thresholds: Thresholds::default(),
            endpoint_config: EndpointConfig::default(),
            cert_manager: false,
        }
    }
}
