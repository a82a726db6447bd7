//! Progress reporting.

use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

//------------ Domain --------------------------------------------------------

/// A unit of trust material or configuration whose progress is tracked.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Domain {
    PeerJws,
    DfspJws,
    DfspCa,
    DfspServerCert,
    DfspClientCert,
    HubCa,
    HubCert,
    EndpointConfig,
    UploadPeerJws,
}

impl Domain {
    pub const ALL: [Domain; 9] = [
        Domain::PeerJws,
        Domain::DfspJws,
        Domain::DfspCa,
        Domain::DfspServerCert,
        Domain::DfspClientCert,
        Domain::HubCa,
        Domain::HubCert,
        Domain::EndpointConfig,
        Domain::UploadPeerJws,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::PeerJws => "PEER_JWS",
            Domain::DfspJws => "DFSP_JWS",
            Domain::DfspCa => "DFSP_CA",
            Domain::DfspServerCert => "DFSP_SERVER_CERT",
            Domain::DfspClientCert => "DFSP_CLIENT_CERT",
            Domain::HubCa => "HUB_CA",
            Domain::HubCert => "HUB_CERT",
            Domain::EndpointConfig => "ENDPOINT_CONFIG",
            Domain::UploadPeerJws => "UPLOAD_PEER_JWS",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|domain| domain.as_str() == s)
            .ok_or_else(|| UnknownDomain(s.to_string()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownDomain(pub String);

impl fmt::Display for UnknownDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown progress domain '{}'", self.0)
    }
}

//------------ ProgressState -------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressState {
    Pending,
    InProgress,
    Completed,
    InError,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ProgressState::Pending => "pending",
            ProgressState::InProgress => "inProgress",
            ProgressState::Completed => "completed",
            ProgressState::InError => "inError",
        })
    }
}

//------------ ProgressEntry -------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub status: ProgressState,

    pub state_description: String,

    /// Unset in entries that were never touched.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl ProgressEntry {
    pub fn pending(now: DateTime<Utc>) -> Self {
        ProgressEntry {
            status: ProgressState::Pending,
            state_description: "Initialized".to_string(),
            last_updated: Some(now),
            error: None,
            retries: None,
        }
    }
}

//------------ ProgressTable -------------------------------------------------

/// The health of every [`Domain`], keyed by domain.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProgressTable(BTreeMap<Domain, ProgressEntry>);

impl ProgressTable {
    /// A table with every domain pending.
    pub fn initial(now: DateTime<Utc>) -> Self {
        ProgressTable(Domain::ALL.into_iter().map(|domain| (domain, ProgressEntry::pending(now))).collect())
    }

    pub fn get(&self, domain: Domain) -> Option<&ProgressEntry> {
        self.0.get(&domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Domain, &ProgressEntry)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn completed(&mut self, domain: Domain, state_description: &str, now: DateTime<Utc>) {
        self.0.insert(
            domain,
            ProgressEntry {
                status: ProgressState::Completed,
                state_description: state_description.to_string(),
                last_updated: Some(now),
                error: None,
                retries: None,
            },
        );
    }

    pub fn failed(&mut self, domain: Domain, state: &str, error: &str, retries: u32, now: DateTime<Utc>) {
        self.0.insert(
            domain,
            ProgressEntry {
                status: ProgressState::InError,
                state_description: format!("Error in state {}", state),
                last_updated: Some(now),
                error: Some(error.to_string()),
                retries: Some(retries),
            },
        );
    }

    /// True only when every tracked domain reports completion.
    pub fn all_completed(&self) -> bool {
        !self.0.is_empty() && self.0.values().all(|entry| entry.status == ProgressState::Completed)
    }

    pub fn any_in_error(&self) -> bool {
        self.0.values().any(|entry| entry.status == ProgressState::InError)
    }

    /// The table as reported to the hub.
    pub fn formatted(&self) -> StatesStatus {
        StatesStatus(
            self.0
                .iter()
                .map(|(domain, entry)| {
                    (
                        *domain,
                        FormattedEntry {
                            status: entry.status.to_string(),
                            state_description: entry.state_description.clone(),
                            last_updated: entry
                                .last_updated
                                .unwrap_or_default()
                                .to_rfc3339_opts(SecondsFormat::Millis, true),
                            error_description: entry.error.clone().filter(|error| !error.is_empty()),
                        },
                    )
                })
                .collect(),
        )
    }
}

//------------ StatesStatus --------------------------------------------------

/// The formatted progress table, as uploaded to the hub.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatesStatus(pub BTreeMap<Domain, FormattedEntry>);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedEntry {
    pub status: String,
    pub state_description: String,
    pub last_updated: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

//------------ StatesReport --------------------------------------------------

/// The answer to a state query, raw or formatted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatesReport {
    Raw(ProgressTable),
    Formatted(StatesStatus),
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn domain_names_round_trip() {
        for domain in Domain::ALL {
            assert_eq!(Domain::from_str(domain.as_str()), Ok(domain));
            assert_eq!(serde_json::to_value(domain).unwrap(), serde_json::json!(domain.as_str()));
        }
        assert!(Domain::from_str("PROGRESS_MONITOR").is_err());
    }

    #[test]
    fn all_completed_needs_every_domain() {
        let mut table = ProgressTable::initial(now());
        assert!(!table.all_completed());

        for domain in Domain::ALL {
            table.completed(domain, "done", now());
        }
        assert!(table.all_completed());

        table.failed(Domain::HubCa, "fetchingHubCA", "boom", 3, now());
        assert!(!table.all_completed());
        assert!(table.any_in_error());
    }

    #[test]
    fn formatted_report() {
        let mut table = ProgressTable::initial(now());
        table.failed(Domain::HubCert, "signingHubCSRs", "vault down", 2, now());

        let formatted = table.formatted();
        let entry = &formatted.0[&Domain::HubCert];
        assert_eq!(entry.status, "inError");
        assert_eq!(entry.state_description, "Error in state signingHubCSRs");
        assert_eq!(entry.last_updated, "2024-03-01T12:00:00.000Z");
        assert_eq!(entry.error_description.as_deref(), Some("vault down"));

        let pending = &formatted.0[&Domain::PeerJws];
        assert_eq!(pending.status, "pending");
        assert_eq!(pending.error_description, None);
    }

    #[test]
    fn error_description_only_reported_on_error() {
        let mut table = ProgressTable::initial(now());
        table.failed(Domain::HubCa, "fetchingHubCA", "hub down", 1, now());
        table.completed(Domain::DfspCa, "done", now());

        let raw = serde_json::to_value(&table).unwrap();
        assert_eq!(raw["HUB_CA"]["error"], "hub down");
        assert!(raw["DFSP_CA"].get("error").is_none());

        let formatted = serde_json::to_value(table.formatted()).unwrap();
        assert_eq!(formatted["HUB_CA"]["errorDescription"], "hub down");
        assert!(formatted["DFSP_CA"].get("errorDescription").is_none());
        assert!(formatted["PEER_JWS"].get("errorDescription").is_none());
    }

    #[test]
    fn untouched_entry_has_no_last_update() {
        let entry: ProgressEntry = serde_json::from_value(serde_json::json!({
            "status": "pending",
            "stateDescription": "Initialized",
            "lastUpdated": null,
        }))
        .unwrap();
        assert_eq!(entry.last_updated, None);

        let mut table = ProgressTable::initial(now());
        table.0.insert(Domain::HubCa, entry);
        assert_eq!(table.formatted().0[&Domain::HubCa].last_updated, "1970-01-01T00:00:00.000Z");
    }
}
