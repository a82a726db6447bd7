//! The event vocabulary shared by all regions.
//!
//! Events come in three flavours: triggers sent from outside (or raised by
//! a region) that carry a payload, notices that only announce that a region
//! reached a point of interest, and `FAILED`, which the retry helper raises
//! for every failed attempt of an external call.
//!
//! On the wire an event is a JSON object with a `type` member holding the
//! SCREAMING_SNAKE_CASE name, the payload fields live next to it.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::api::status::Domain;
use crate::api::{CsrParams, DfspCa, Jws, Subject};
use crate::commons::error::Error;

//------------ Notice --------------------------------------------------------

macro_rules! notices {
    ( $( $variant:ident => $name:literal, )* ) => {
        /// Payload-free events announcing a state of interest.
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub enum Notice {
            $( $variant, )*
        }

        impl Notice {
            pub const ALL: &'static [Notice] = &[ $( Notice::$variant, )* ];

            pub fn as_str(self) -> &'static str {
                match self {
                    $( Notice::$variant => $name, )*
                }
            }
        }
    };
}

notices! {
    // HubCA
    FetchingHubCa => "FETCHING_HUB_CA",
    NewHubCaFetched => "NEW_HUB_CA_FETCHED",
    HubCaExpiring => "HUB_CA_EXPIRING",

    // DfspCA
    CheckingDfspCa => "CHECKING_DFSP_CA",
    DfspCaExpiring => "DFSP_CA_EXPIRING",
    DfspCaExpired => "DFSP_CA_EXPIRED",
    CreatingIntCa => "CREATING_INT_CA",
    CreatingExtCa => "CREATING_EXT_CA",
    UploadingDfspCaToHub => "UPLOADING_DFSP_CA_TO_HUB",
    DfspCaPropagated => "DFSP_CA_PROPAGATED",

    // DfspClientCert
    CreatingDfspCsr => "CREATING_DFSP_CSR",
    UploadingDfspCsr => "UPLOADING_DFSP_CSR",
    FetchingDfspClientCert => "FETCHING_DFSP_CLIENT_CERT",
    DfspClientCertExpiring => "DFSP_CLIENT_CERT_EXPIRING",
    DfspClientCertExpired => "DFSP_CLIENT_CERT_EXPIRED",
    DfspClientCertConfigured => "DFSP_CLIENT_CERT_CONFIGURED",

    // DfspServerCert
    CheckingDfspServerCert => "CHECKING_DFSP_SERVER_CERT",
    DfspServerCertExpiring => "DFSP_SERVER_CERT_EXPIRING",
    DfspServerCertExpired => "DFSP_SERVER_CERT_EXPIRED",
    RequestingNewDfspServerCert => "REQUESTING_NEW_DFSP_SERVER_CERT",
    RenewingManagedDfspServerCert => "RENEWING_MANAGED_DFSP_SERVER_CERT",
    CreatingDfspServerCert => "CREATING_DFSP_SERVER_CERT",
    UploadingDfspServerCertToHub => "UPLOADING_DFSP_SERVER_CERT_TO_HUB",
    DfspServerCertConfigured => "DFSP_SERVER_CERT_CONFIGURED",

    // HubCert
    FetchingHubCsrs => "FETCHING_HUB_CSRS",
    SigningHubCsrs => "SIGNING_HUB_CSRS",
    HubClientCertSigned => "HUB_CLIENT_CERT_SIGNED",

    // PeerJWS
    FetchingPeerJws => "FETCHING_PEER_JWS",
    ComparingPeerJws => "COMPARING_PEER_JWS",
    NotifyingPeerJws => "NOTIFYING_PEER_JWS",
    CompletingPeerJws => "COMPLETING_PEER_JWS",
    NoPeerJwsChanges => "NO_PEER_JWS_CHANGES",
    PeerJwsConfigured => "PEER_JWS_CONFIGURED",

    // UploadPeerJWS
    UploadPeerJwsIdle => "UPLOAD_PEER_JWS_IDLE",
    ComparingUploadPeerJws => "COMPARING_UPLOAD_PEER_JWS",
    UploadingPeerJws => "UPLOADING_PEER_JWS",
    UploadPeerJwsCompleted => "UPLOAD_PEER_JWS_COMPLETED",

    // DfspJWS
    CreatingDfspJws => "CREATING_DFSP_JWS",
    UploadingDfspJws => "UPLOADING_DFSP_JWS",
    VerifyingDfspJws => "VERIFYING_DFSP_JWS",
    DfspJwsIdle => "DFSP_JWS_IDLE",
    DfspJwsPropagated => "DFSP_JWS_PROPAGATED",

    // EndpointConfig
    CheckingEndpointConfig => "CHECKING_ENDPOINT_CONFIG",
    PropagatingEndpointConfig => "PROPAGATING_ENDPOINT_CONFIG",
    EndpointConfigPropagated => "ENDPOINT_CONFIG_PROPAGATED",
}

impl Notice {
    /// The domain a notice completes, with the description the progress
    /// table shows for it.
    pub fn completes(self) -> Option<(Domain, &'static str)> {
        match self {
            Notice::PeerJwsConfigured => Some((Domain::PeerJws, "Fetched and notified peer JWS")),
            Notice::DfspJwsPropagated => Some((Domain::DfspJws, "JWS key propagated to the hub")),
            Notice::DfspCaPropagated => Some((Domain::DfspCa, "DFSP CA propagated to the hub")),
            Notice::DfspServerCertConfigured => Some((Domain::DfspServerCert, "Server certificate configured")),
            Notice::DfspClientCertConfigured => Some((Domain::DfspClientCert, "Client certificate configured")),
            Notice::NewHubCaFetched => Some((Domain::HubCa, "Hub CA fetched and configured")),
            Notice::HubClientCertSigned => Some((Domain::HubCert, "Hub client certificate signed")),
            Notice::EndpointConfigPropagated => Some((Domain::EndpointConfig, "Endpoint configuration propagated")),
            Notice::UploadPeerJwsCompleted => Some((Domain::UploadPeerJws, "Peer JWS uploaded to the hub")),
            _ => None,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Notice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl FromStr for Notice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Notice::ALL
            .iter()
            .copied()
            .find(|notice| notice.as_str() == s)
            .ok_or_else(|| Error::UnsupportedEvent(s.to_string()))
    }
}

//------------ Failure -------------------------------------------------------

/// One failed attempt of an external call.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Failure {
    /// The name of the failing machine, a [`Domain`] name for the tracked
    /// regions.
    pub machine: String,

    pub state: String,

    pub error: String,

    /// The attempt that failed, starting at 1.
    pub retries: u32,
}

impl Failure {
    pub fn domain(&self) -> Option<Domain> {
        Domain::from_str(&self.machine).ok()
    }
}

//------------ Event ---------------------------------------------------------

/// An event as delivered to every region.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    CreateDfspServerCert { csr: Option<CsrParams> },
    CreateDfspClientCert,
    CreateIntCa { subject: Option<Subject> },
    CreateExtCa(DfspCa),
    CreateHubClientCert,
    CreateJws,
    RequestPeerJws,
    UploadPeerJws { peer_jws: Vec<Jws> },
    UpdateConnectorConfig { config: Value },
    Failed(Failure),
    Notice(Notice),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::CreateDfspServerCert { .. } => EventKind::CreateDfspServerCert,
            Event::CreateDfspClientCert => EventKind::CreateDfspClientCert,
            Event::CreateIntCa { .. } => EventKind::CreateIntCa,
            Event::CreateExtCa(_) => EventKind::CreateExtCa,
            Event::CreateHubClientCert => EventKind::CreateHubClientCert,
            Event::CreateJws => EventKind::CreateJws,
            Event::RequestPeerJws => EventKind::RequestPeerJws,
            Event::UploadPeerJws { .. } => EventKind::UploadPeerJws,
            Event::UpdateConnectorConfig { .. } => EventKind::UpdateConnectorConfig,
            Event::Failed(_) => EventKind::Failed,
            Event::Notice(notice) => EventKind::Notice(*notice),
        }
    }

    /// Parses an event from its JSON wire form.
    pub fn from_json(value: Value) -> Result<Self, Error> {
        let Value::Object(mut fields) = value else {
            return Err(Error::UnsupportedEvent("event must be a JSON object".to_string()));
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(Error::UnsupportedEvent("event lacks a 'type' member".to_string())),
        };
        let payload = Value::Object(fields);

        fn field<T: de::DeserializeOwned>(payload: &Value, name: &str) -> Result<Option<T>, Error> {
            match payload.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(value) => T::deserialize(value)
                    .map(Some)
                    .map_err(|e| Error::UnsupportedEvent(format!("invalid '{}': {}", name, e))),
            }
        }

        Ok(match EventKind::from_str(&kind)? {
            EventKind::CreateDfspServerCert => Event::CreateDfspServerCert {
                csr: field(&payload, "csr")?,
            },
            EventKind::CreateDfspClientCert => Event::CreateDfspClientCert,
            EventKind::CreateIntCa => Event::CreateIntCa {
                subject: field(&payload, "subject")?,
            },
            EventKind::CreateExtCa => {
                let ca = ExternalCa::deserialize(&payload)
                    .map_err(|e| Error::UnsupportedEvent(format!("invalid CREATE_EXT_CA: {}", e)))?;
                Event::CreateExtCa(ca.into())
            }
            EventKind::CreateHubClientCert => Event::CreateHubClientCert,
            EventKind::CreateJws => Event::CreateJws,
            EventKind::RequestPeerJws => Event::RequestPeerJws,
            EventKind::UploadPeerJws => Event::UploadPeerJws {
                peer_jws: field(&payload, "peerJWS")?.unwrap_or_default(),
            },
            EventKind::UpdateConnectorConfig => Event::UpdateConnectorConfig {
                config: field(&payload, "config")?.unwrap_or(Value::Null),
            },
            EventKind::Failed => Event::Failed(
                Failure::deserialize(&payload)
                    .map_err(|e| Error::UnsupportedEvent(format!("invalid FAILED: {}", e)))?,
            ),
            EventKind::Notice(notice) => Event::Notice(notice),
        })
    }

    /// The JSON wire form of this event.
    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String(self.kind().as_str().to_string()));

        let mut put = |name: &str, value: Value| {
            fields.insert(name.to_string(), value);
        };
        match self {
            Event::CreateDfspServerCert { csr: Some(csr) } => put("csr", json_of(csr)),
            Event::CreateIntCa { subject: Some(subject) } => put("subject", json_of(subject)),
            Event::CreateExtCa(ca) => {
                put("rootCert", Value::String(ca.root_certificate.clone()));
                if let Some(chain) = &ca.intermediate_chain {
                    put("intermediateChain", Value::String(chain.clone()));
                }
                if let Some(key) = &ca.private_key {
                    put("privateKey", Value::String(key.clone()));
                }
            }
            Event::UploadPeerJws { peer_jws } => put("peerJWS", json_of(peer_jws)),
            Event::UpdateConnectorConfig { config } => put("config", config.clone()),
            Event::Failed(failure) => {
                if let Value::Object(failure) = json_of(failure) {
                    for (name, value) in failure {
                        put(&name, value);
                    }
                }
            }
            _ => {}
        }
        Value::Object(fields)
    }
}

fn json_of(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl From<Notice> for Event {
    fn from(notice: Notice) -> Self {
        Event::Notice(notice)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Event::from_json(value).map_err(de::Error::custom)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalCa {
    root_cert: String,
    #[serde(default)]
    intermediate_chain: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
}

impl From<ExternalCa> for DfspCa {
    fn from(ca: ExternalCa) -> Self {
        DfspCa {
            root_certificate: ca.root_cert,
            intermediate_chain: ca.intermediate_chain,
            private_key: ca.private_key,
            not_after: None,
        }
    }
}

//------------ EventKind -----------------------------------------------------

/// The type of an event, without its payload. Transitions match on this.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    CreateDfspServerCert,
    CreateDfspClientCert,
    CreateIntCa,
    CreateExtCa,
    CreateHubClientCert,
    CreateJws,
    RequestPeerJws,
    UploadPeerJws,
    UpdateConnectorConfig,
    Failed,
    Notice(Notice),
}

impl EventKind {
    const TRIGGERS: [EventKind; 10] = [
        EventKind::CreateDfspServerCert,
        EventKind::CreateDfspClientCert,
        EventKind::CreateIntCa,
        EventKind::CreateExtCa,
        EventKind::CreateHubClientCert,
        EventKind::CreateJws,
        EventKind::RequestPeerJws,
        EventKind::UploadPeerJws,
        EventKind::UpdateConnectorConfig,
        EventKind::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CreateDfspServerCert => "CREATE_DFSP_SERVER_CERT",
            EventKind::CreateDfspClientCert => "CREATE_DFSP_CLIENT_CERT",
            EventKind::CreateIntCa => "CREATE_INT_CA",
            EventKind::CreateExtCa => "CREATE_EXT_CA",
            EventKind::CreateHubClientCert => "CREATE_HUB_CLIENT_CERT",
            EventKind::CreateJws => "CREATE_JWS",
            EventKind::RequestPeerJws => "REQUEST_PEER_JWS",
            EventKind::UploadPeerJws => "UPLOAD_PEER_JWS",
            EventKind::UpdateConnectorConfig => "UPDATE_CONNECTOR_CONFIG",
            EventKind::Failed => "FAILED",
            EventKind::Notice(notice) => notice.as_str(),
        }
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match EventKind::TRIGGERS.into_iter().find(|kind| kind.as_str() == s) {
            Some(kind) => Ok(kind),
            None => Notice::from_str(s).map(EventKind::Notice),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

//------------ Tests ---------------------------------------------------------
