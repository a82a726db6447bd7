//! The extended state shared by all regions.
//!
//! Each field is written by exactly one region. Other regions may read it,
//! but only the owner assigns it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::status::ProgressTable;
use crate::api::{DfspCa, DfspClientCert, DfspJws, DfspServerCert, EndpointConfig, HubCa, HubClientCert, Jws};

//------------ Context -------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Context {
    /// Owned by HubCA.
    pub hub_ca: Option<HubCa>,

    /// Owned by DfspCA.
    pub dfsp_ca: Option<DfspCa>,

    /// Owned by DfspServerCert.
    pub dfsp_server_cert: Option<DfspServerCert>,

    /// Owned by DfspClientCert.
    pub dfsp_client_cert: Option<DfspClientCert>,

    /// Owned by HubCert.
    pub hub_client_certs: Vec<HubClientCert>,

    /// Owned by PeerJWS. `None` until the first successful comparison.
    #[serde(rename = "peerJWS")]
    pub peer_jws: Option<Vec<Jws>>,

    /// Owned by UploadPeerJWS.
    #[serde(rename = "uploadedPeerJWS")]
    pub uploaded_peer_jws: Vec<Jws>,

    /// Owned by DfspJWS.
    #[serde(rename = "dfspJWS")]
    pub dfsp_jws: Option<DfspJws>,

    /// Owned by EndpointConfig. The configuration last propagated.
    pub endpoint_config: Option<EndpointConfig>,

    /// Owned by ConnectorConfig. The accumulated connector configuration.
    pub connector_config: Value,

    /// Owned by ProgressMonitor.
    pub progress_monitor: ProgressContext,
}

impl Context {
    pub fn new(now: DateTime<Utc>) -> Self {
        Context {
            progress_monitor: ProgressContext::new(now),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressContext {
    pub progress: ProgressTable,

    /// Set on entering `notifyingCompleted`, cleared when a domain fails.
    pub completion_notified: bool,
}

impl ProgressContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        ProgressContext {
            progress: ProgressTable::initial(now),
            completion_notified: false,
        }
    }
}

//------------ JWS comparison ------------------------------------------------

/// Keeps only the newest key per participant, ordered by participant id.
///
/// Of two keys with the same `createdAt` the first one listed wins.
pub fn latest_per_dfsp(keys: &[Jws]) -> Vec<Jws> {
    let mut latest: BTreeMap<&str, &Jws> = BTreeMap::new();
    for key in keys {
        match latest.get(key.dfsp_id.as_str()) {
            Some(known) if known.created_at >= key.created_at => {}
            _ => {
                latest.insert(key.dfsp_id.as_str(), key);
            }
        }
    }
    latest.into_values().cloned().collect()
}

/// The keys in `fetched` that are newer than what `held` has for the same
/// participant. A key is identified by `dfspId` and `createdAt` alone.
pub fn changed_keys(fetched: &[Jws], held: &[Jws]) -> Vec<Jws> {
    fetched
        .iter()
        .filter(|key| {
            !held
                .iter()
                .any(|known| known.dfsp_id == key.dfsp_id && known.created_at >= key.created_at)
        })
        .cloned()
        .collect()
}

/// Replaces the held keys of every participant in `changes`.
pub fn merge_keys(held: &[Jws], changes: &[Jws]) -> Vec<Jws> {
    let mut merged: BTreeMap<&str, &Jws> = held.iter().map(|key| (key.dfsp_id.as_str(), key)).collect();
    for key in changes {
        merged.insert(key.dfsp_id.as_str(), key);
    }
    merged.into_values().cloned().collect()
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn jws(dfsp_id: &str, public_key: &str, created_at: i64) -> Jws {
        Jws {
            dfsp_id: dfsp_id.to_string(),
            public_key: public_key.to_string(),
            created_at,
        }
    }

    #[test]
    fn latest_key_wins_per_dfsp() {
        let keys = vec![jws("a", "pk1", 1), jws("b", "pk2", 1), jws("a", "pk3", 2)];
        assert_eq!(latest_per_dfsp(&keys), vec![jws("a", "pk3", 2), jws("b", "pk2", 1)]);
    }

    #[test]
    fn equal_timestamps_keep_first_listed() {
        let keys = vec![jws("a", "first", 5), jws("a", "second", 5)];
        assert_eq!(latest_per_dfsp(&keys), vec![jws("a", "first", 5)]);
    }

    #[test]
    fn older_or_same_age_keys_are_no_change() {
        let held = vec![jws("a", "new", 5)];

        assert!(changed_keys(&[jws("a", "old", 3)], &held).is_empty());
        assert!(changed_keys(&[jws("a", "other", 5)], &held).is_empty());
        assert_eq!(changed_keys(&[jws("a", "newer", 6)], &held), vec![jws("a", "newer", 6)]);
    }

    #[test]
    fn changes_are_newer_or_unknown_keys() {
        let held = vec![jws("a", "pk1", 1), jws("b", "pk2", 1)];

        assert!(changed_keys(&held, &held).is_empty());

        let fetched = vec![jws("a", "pk1", 1), jws("b", "pk2-rotated", 4), jws("c", "pk5", 1)];
        assert_eq!(
            changed_keys(&fetched, &held),
            vec![jws("b", "pk2-rotated", 4), jws("c", "pk5", 1)]
        );
    }

    #[test]
    fn merge_replaces_per_dfsp() {
        let held = vec![jws("a", "pk1", 1), jws("b", "pk2", 1)];
        let merged = merge_keys(&held, &[jws("b", "pk9", 9)]);
        assert_eq!(merged, vec![jws("a", "pk1", 1), jws("b", "pk9", 9)]);
    }

    #[test]
    fn context_survives_json() {
        let mut ctx = Context::new(Utc::now());
        ctx.peer_jws = Some(vec![jws("a", "pk1", 1)]);
        ctx.connector_config = serde_json::json!({ "peerJWSKeys": { "a": "pk1" } });

        let json = serde_json::to_string(&ctx).unwrap();
        let back: Context = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
