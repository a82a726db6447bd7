//! Data structures exchanged with the hub, Vault, and the control plane.
//!
//! The wire names follow the hub's JSON conventions, hence the
//! `camelCase` renames throughout.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod status;

//------------ Subject -------------------------------------------------------

/// The distinguished name used for CSRs and CA certificates.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    #[serde(rename = "CN")]
    pub common_name: String,

    #[serde(rename = "O", default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    #[serde(rename = "OU", default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,

    #[serde(rename = "L", default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,

    #[serde(rename = "ST", default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,

    #[serde(rename = "C", default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
}

impl Subject {
    pub fn with_common_name(common_name: impl Into<String>) -> Self {
        Subject {
            common_name: common_name.into(),
            ..Default::default()
        }
    }
}

//------------ CsrParams -----------------------------------------------------

/// Everything needed to generate a certificate signing request.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrParams {
    pub subject: Subject,

    #[serde(default)]
    pub extensions: CsrExtensions,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrExtensions {
    #[serde(default)]
    pub subject_alt_name: SubjectAltName,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAltName {
    #[serde(default)]
    pub dns: Vec<String>,

    #[serde(default)]
    pub ips: Vec<String>,
}

//------------ Csr -----------------------------------------------------------

/// A PEM encoded CSR together with the private key it was made for.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Csr {
    pub csr: String,
    pub private_key: String,
}

impl fmt::Debug for Csr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Csr").field("csr", &self.csr).finish_non_exhaustive()
    }
}

//------------ Expiry --------------------------------------------------------

/// Where a certificate stands relative to its renewal threshold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expiry {
    Valid,
    Expiring,
    Expired,
}

impl Expiry {
    /// A certificate is expired when `not_after` has passed, and expiring
    /// when it ends within `threshold` from `now`.
    pub fn of(not_after: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> Self {
        if not_after <= now {
            Expiry::Expired
        } else if not_after <= now + threshold {
            Expiry::Expiring
        } else {
            Expiry::Valid
        }
    }

    /// Like [`Expiry::of`], but an unknown end of validity is never
    /// considered in need of renewal.
    pub fn of_opt(not_after: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> Self {
        not_after
            .map(|not_after| Self::of(not_after, now, threshold))
            .unwrap_or(Expiry::Valid)
    }
}

//------------ CertStatus ----------------------------------------------------

/// A certificate as currently known to the hub, if any.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertStatus {
    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

//------------ HubCa ---------------------------------------------------------

/// The hub's CA, trusted for outbound TLS.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubCa {
    pub root_certificate: String,

    #[serde(default)]
    pub intermediate_chain: Option<String>,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

impl HubCa {
    /// Whether this is the same trust material, ignoring metadata.
    pub fn same_material(&self, other: &HubCa) -> bool {
        self.root_certificate == other.root_certificate && self.intermediate_chain == other.intermediate_chain
    }
}

//------------ DfspCa --------------------------------------------------------

/// The participant's own CA. The private key is only present for an
/// externally supplied CA; an internal CA keeps its key in Vault.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfspCa {
    pub root_certificate: String,

    #[serde(default)]
    pub intermediate_chain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

impl fmt::Debug for DfspCa {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DfspCa")
            .field("root_certificate", &self.root_certificate)
            .field("intermediate_chain", &self.intermediate_chain)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

//------------ DfspServerCert ------------------------------------------------

/// A server certificate issued by the participant's CA for inbound TLS.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfspServerCert {
    pub root_certificate: String,

    #[serde(default)]
    pub intermediate_chain: Option<String>,

    pub server_certificate: String,

    pub private_key: String,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

impl fmt::Debug for DfspServerCert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DfspServerCert")
            .field("server_certificate", &self.server_certificate)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

//------------ Enrollments ---------------------------------------------------

pub type EnrollmentId = u64;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentState {
    CsrLoaded,
    CertSigned,
    #[serde(other)]
    Unknown,
}

/// The hub's view of the participant's client certificate enrollment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCertStatus {
    pub state: EnrollmentState,

    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

impl ClientCertStatus {
    pub fn signed_certificate(&self) -> Option<&str> {
        match self.state {
            EnrollmentState::CertSigned => self.certificate.as_deref(),
            _ => None,
        }
    }
}

/// The participant's client certificate, in whatever stage it is.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfspClientCert {
    pub csr: String,

    pub private_key: String,

    #[serde(default)]
    pub enrollment_id: Option<EnrollmentId>,

    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

impl DfspClientCert {
    pub fn from_csr(csr: Csr) -> Self {
        DfspClientCert {
            csr: csr.csr,
            private_key: csr.private_key,
            enrollment_id: None,
            certificate: None,
            not_after: None,
        }
    }
}

impl fmt::Debug for DfspClientCert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DfspClientCert")
            .field("enrollment_id", &self.enrollment_id)
            .field("certificate", &self.certificate)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// An outbound enrollment: a CSR the hub asks the participant to sign.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubCsr {
    pub id: EnrollmentId,

    pub csr: String,

    pub state: EnrollmentState,

    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

/// A certificate issued by the participant's CA.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedCert {
    pub certificate: String,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

/// A hub client certificate signed by the participant's CA.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubClientCert {
    pub id: EnrollmentId,

    pub certificate: String,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

//------------ Jws -----------------------------------------------------------

/// A participant's JWS verification key as published by the hub.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Jws {
    pub dfsp_id: String,

    pub public_key: String,

    /// Seconds since the epoch.
    pub created_at: i64,
}

/// The participant's own JWS signing key pair.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfspJws {
    pub public_key: String,

    pub private_key: String,

    pub created_at: i64,
}

impl DfspJws {
    pub fn as_published(&self, dfsp_id: &str) -> Jws {
        Jws {
            dfsp_id: dfsp_id.to_string(),
            public_key: self.public_key.clone(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for DfspJws {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DfspJws")
            .field("public_key", &self.public_key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

//------------ EndpointConfig ------------------------------------------------

/// The participant's endpoints as registered with the hub.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(default)]
    pub ips: Vec<IpEntry>,

    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpEntry {
    pub address: String,

    #[serde(default)]
    pub ports: Vec<String>,
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
    fn expiry_boundary_is_inclusive() {
        let threshold = Duration::days(2);

        assert_eq!(Expiry::of(now() + threshold, now(), threshold), Expiry::Expiring);
        assert_eq!(
            Expiry::of(now() + threshold + Duration::seconds(1), now(), threshold),
            Expiry::Valid
        );
        assert_eq!(Expiry::of(now(), now(), threshold), Expiry::Expired);
        assert_eq!(Expiry::of(now() - Duration::days(1), now(), threshold), Expiry::Expired);
    }

    #[test]
    fn unknown_validity_is_never_renewed() {
        assert_eq!(Expiry::of_opt(None, now(), Duration::days(7)), Expiry::Valid);
    }

    #[test]
    fn enrollment_state_tolerates_unknown_values() {
        let status: ClientCertStatus =
            serde_json::from_str(r#"{ "state": "CSR_LOADED" }"#).unwrap();
        assert_eq!(status.signed_certificate(), None);

        let status: ClientCertStatus =
            serde_json::from_str(r#"{ "state": "REVOKED", "certificate": "pem" }"#).unwrap();
        assert_eq!(status.state, EnrollmentState::Unknown);
        assert_eq!(status.signed_certificate(), None);

        let status: ClientCertStatus =
            serde_json::from_str(r#"{ "state": "CERT_SIGNED", "certificate": "pem" }"#).unwrap();
        assert_eq!(status.signed_certificate(), Some("pem"));
    }

    #[test]
    fn jws_uses_hub_field_names() {
        let jws: Jws =
            serde_json::from_str(r#"{ "dfspId": "dfsp1", "publicKey": "pk", "createdAt": 10 }"#).unwrap();
        assert_eq!(
            jws,
            Jws {
                dfsp_id: "dfsp1".to_string(),
                public_key: "pk".to_string(),
                created_at: 10
            }
        );
    }
}
