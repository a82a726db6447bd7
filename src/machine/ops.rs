//! Invocations: calls to collaborators started by states.
//!
//! [`OpKind`] names a call in the chart. On entering a state it is
//! prepared into an [`Operation`] that carries all inputs, so the call can
//! be persisted and issued again after a restart. Running an operation
//! yields an [`Output`] that the `on_done` transitions inspect.

use futures_util::future::try_join_all;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::{latest_per_dfsp, Context};
use super::event::Event;
use super::guards::{csrs_to_sign, upload_changes, Scope};
use crate::api::status::StatesStatus;
use crate::api::{
    CertStatus, ClientCertStatus, Csr, CsrParams, DfspCa, DfspJws, DfspServerCert, EnrollmentId, HubCa,
    HubClientCert, HubCsr, IpEntry, Jws, Subject,
};
use crate::commons::error::Error;
use crate::remote::{pki, Collaborators};

//------------ OpKind --------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum OpKind {
    FetchHubCa,

    CreateIntCa,
    SetExtCa,
    UploadDfspCa,

    FetchDfspServerCert,
    RenewManagedServerCert,
    CreateDfspServerCert,
    UploadDfspServerCert,

    CreateDfspCsr,
    UploadDfspCsr,
    FetchDfspClientCert,

    FetchHubCsrs,
    SignHubCsrs,

    FetchPeerJws,
    NotifyPeerJws,

    UploadPeerJws,

    CreateJws,
    UploadDfspJws,
    FetchDfspJws,

    UploadIpWhitelist,
    UploadCallbackUrl,

    PushConnectorConfig,

    NotifyCompleted,
}

impl OpKind {
    /// Gathers the inputs of the call from the context and the cause of
    /// entering the state.
    pub fn prepare(self, ctx: &Context, scope: &Scope) -> Result<Operation, Error> {
        let settings = scope.settings;
        let event = scope.cause.event();

        Ok(match self {
            OpKind::FetchHubCa => Operation::FetchHubCa,

            OpKind::CreateIntCa => Operation::CreateIntCa {
                subject: match event {
                    Some(Event::CreateIntCa { subject: Some(subject) }) => subject.clone(),
                    _ => settings.dfsp_ca_subject.clone(),
                },
            },
            OpKind::SetExtCa => match event {
                Some(Event::CreateExtCa(ca)) => Operation::SetExtCa { ca: ca.clone() },
                _ => return Err(Error::missing("external CA in CREATE_EXT_CA")),
            },
            OpKind::UploadDfspCa => {
                let ca = ctx.dfsp_ca.as_ref().ok_or_else(|| Error::missing("DFSP CA"))?;
                Operation::UploadDfspCa {
                    ca: DfspCa {
                        private_key: None,
                        ..ca.clone()
                    },
                }
            }

            OpKind::FetchDfspServerCert => Operation::FetchDfspServerCert,
            OpKind::RenewManagedServerCert => Operation::RenewManagedServerCert,
            OpKind::CreateDfspServerCert => Operation::CreateDfspServerCert {
                csr: match event {
                    Some(Event::CreateDfspServerCert { csr: Some(csr) }) => csr.clone(),
                    _ => settings.dfsp_server_csr.clone(),
                },
            },
            OpKind::UploadDfspServerCert => Operation::UploadDfspServerCert {
                cert: ctx
                    .dfsp_server_cert
                    .clone()
                    .ok_or_else(|| Error::missing("DFSP server certificate"))?,
            },

            OpKind::CreateDfspCsr => Operation::CreateDfspCsr {
                params: settings.dfsp_client_csr.clone(),
            },
            OpKind::UploadDfspCsr => Operation::UploadDfspCsr {
                csr: ctx
                    .dfsp_client_cert
                    .as_ref()
                    .map(|cert| cert.csr.clone())
                    .ok_or_else(|| Error::missing("DFSP client CSR"))?,
            },
            OpKind::FetchDfspClientCert => Operation::FetchDfspClientCert {
                enrollment_id: ctx
                    .dfsp_client_cert
                    .as_ref()
                    .and_then(|cert| cert.enrollment_id)
                    .ok_or_else(|| Error::missing("DFSP client enrollment id"))?,
            },

            OpKind::FetchHubCsrs => Operation::FetchHubCsrs,
            OpKind::SignHubCsrs => match scope.cause.output() {
                Some(Output::HubCsrs(csrs)) => Operation::SignHubCsrs {
                    csrs: csrs_to_sign(csrs, scope.now, settings.thresholds.hub_cert),
                },
                _ => return Err(Error::missing("hub CSRs to sign")),
            },

            OpKind::FetchPeerJws => Operation::FetchPeerJws,
            OpKind::NotifyPeerJws => Operation::NotifyPeerJws {
                keys: ctx.peer_jws.clone().unwrap_or_default(),
            },

            OpKind::UploadPeerJws => match event {
                Some(Event::UploadPeerJws { peer_jws }) => Operation::UploadPeerJws {
                    changes: upload_changes(peer_jws, &ctx.uploaded_peer_jws),
                },
                _ => return Err(Error::missing("peer JWS in UPLOAD_PEER_JWS")),
            },

            OpKind::CreateJws => Operation::CreateJws,
            OpKind::UploadDfspJws => Operation::UploadDfspJws {
                jws: ctx
                    .dfsp_jws
                    .as_ref()
                    .map(|jws| jws.as_published(&settings.dfsp_id))
                    .ok_or_else(|| Error::missing("DFSP JWS"))?,
            },
            OpKind::FetchDfspJws => Operation::FetchDfspJws,

            OpKind::UploadIpWhitelist => Operation::UploadIpWhitelist {
                ips: settings.endpoint_config.ips.clone(),
            },
            OpKind::UploadCallbackUrl => Operation::UploadCallbackUrl {
                url: settings.endpoint_config.callback_url.clone(),
            },

            OpKind::PushConnectorConfig => Operation::PushConnectorConfig {
                config: ctx.connector_config.clone(),
            },

            OpKind::NotifyCompleted => Operation::NotifyCompleted {
                status: ctx.progress_monitor.progress.formatted(),
            },
        })
    }
}

//------------ Operation -----------------------------------------------------

/// A prepared call with all of its inputs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    FetchHubCa,

    CreateIntCa { subject: Subject },
    SetExtCa { ca: DfspCa },
    UploadDfspCa { ca: DfspCa },

    FetchDfspServerCert,
    RenewManagedServerCert,
    CreateDfspServerCert { csr: CsrParams },
    UploadDfspServerCert { cert: DfspServerCert },

    CreateDfspCsr { params: CsrParams },
    UploadDfspCsr { csr: String },
    FetchDfspClientCert { enrollment_id: EnrollmentId },

    FetchHubCsrs,
    SignHubCsrs { csrs: Vec<HubCsr> },

    FetchPeerJws,
    NotifyPeerJws { keys: Vec<Jws> },

    UploadPeerJws { changes: Vec<Jws> },

    CreateJws,
    UploadDfspJws { jws: Jws },
    FetchDfspJws,

    UploadIpWhitelist { ips: Vec<IpEntry> },
    UploadCallbackUrl { url: Option<String> },

    PushConnectorConfig { config: Value },

    NotifyCompleted { status: StatesStatus },
}

impl Operation {
    /// The name used in logs and failure reports.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::FetchHubCa => "getHubCA",
            Operation::CreateIntCa { .. } => "createCA",
            Operation::SetExtCa { .. } => "setDFSPCaCertChain",
            Operation::UploadDfspCa { .. } => "uploadDFSPCA",
            Operation::FetchDfspServerCert => "getDFSPServerCertificates",
            Operation::RenewManagedServerCert => "renewServerCert",
            Operation::CreateDfspServerCert { .. } => "createDFSPServerCert",
            Operation::UploadDfspServerCert { .. } => "uploadServerCertificates",
            Operation::CreateDfspCsr { .. } => "createCSR",
            Operation::UploadDfspCsr { .. } => "uploadCSR",
            Operation::FetchDfspClientCert { .. } => "getClientCertificate",
            Operation::FetchHubCsrs => "getHubCSRs",
            Operation::SignHubCsrs { .. } => "signHubCSR",
            Operation::FetchPeerJws => "getAllJWSCertificates",
            Operation::NotifyPeerJws { .. } => "notifyPeerJWS",
            Operation::UploadPeerJws { .. } => "uploadExternalDfspJWS",
            Operation::CreateJws => "createJWS",
            Operation::UploadDfspJws { .. } => "uploadJWS",
            Operation::FetchDfspJws => "getDFSPJWSCertificates",
            Operation::UploadIpWhitelist { .. } => "uploadIPWhitelist",
            Operation::UploadCallbackUrl { .. } => "uploadCallbackURL",
            Operation::PushConnectorConfig { .. } => "updateConnectorConfig",
            Operation::NotifyCompleted { .. } => "notifyCompleted",
        }
    }

    /// Performs one attempt of the call.
    pub async fn run(&self, deps: &Collaborators) -> Result<Output, Error> {
        let vault = &deps.vault;
        let hub = &deps.hub;
        let control = &deps.control;

        Ok(match self {
            Operation::FetchHubCa => Output::HubCa(hub.get_hub_ca().await?),

            Operation::CreateIntCa { subject } => Output::DfspCa(vault.create_ca(subject).await?),
            Operation::SetExtCa { ca } => {
                vault.set_dfsp_ca_cert_chain(ca).await?;
                Output::DfspCa(DfspCa {
                    private_key: None,
                    not_after: ca.not_after.or_else(|| pki::not_after(&ca.root_certificate).ok()),
                    ..ca.clone()
                })
            }
            Operation::UploadDfspCa { ca } => {
                hub.upload_dfsp_ca(ca).await?;
                Output::Unit
            }

            Operation::FetchDfspServerCert => Output::CertStatus(hub.get_dfsp_server_certificates().await?),
            Operation::RenewManagedServerCert => {
                let manager = deps
                    .cert_manager
                    .as_ref()
                    .ok_or_else(|| Error::missing("certificate manager"))?;
                manager.renew_server_cert().await?;
                Output::Unit
            }
            Operation::CreateDfspServerCert { csr } => Output::ServerCert(vault.create_dfsp_server_cert(csr).await?),
            Operation::UploadDfspServerCert { cert } => {
                hub.upload_server_certificates(cert).await?;
                Output::Unit
            }

            Operation::CreateDfspCsr { params } => Output::Csr(vault.create_csr(params).await?),
            Operation::UploadDfspCsr { csr } => Output::Enrollment(hub.upload_csr(csr).await?),
            Operation::FetchDfspClientCert { enrollment_id } => {
                Output::ClientCert(hub.get_client_certificate(*enrollment_id).await?)
            }

            Operation::FetchHubCsrs => Output::HubCsrs(hub.get_hub_csrs().await?),
            Operation::SignHubCsrs { csrs } => {
                let signed = try_join_all(csrs.iter().map(|csr| async move {
                    let signed = vault.sign_hub_csr(csr).await?;
                    hub.upload_hub_client_certificate(csr.id, &signed).await?;
                    Ok::<_, Error>(HubClientCert {
                        id: csr.id,
                        certificate: signed.certificate,
                        not_after: signed.not_after,
                    })
                }))
                .await?;
                Output::HubCerts(signed)
            }

            Operation::FetchPeerJws => {
                let keys = hub.get_all_jws_certificates().await?;
                Output::PeerJws(keys.into_iter().filter(|key| key.dfsp_id != deps.dfsp_id).collect())
            }
            Operation::NotifyPeerJws { keys } => {
                control.notify_peer_jws(keys).await?;
                Output::Unit
            }

            Operation::UploadPeerJws { changes } => {
                hub.upload_external_dfsp_jws(changes).await?;
                Output::UploadedPeerJws(changes.clone())
            }

            Operation::CreateJws => Output::DfspJws(vault.create_jws().await?),
            Operation::UploadDfspJws { jws } => {
                hub.upload_jws(jws).await?;
                Output::Unit
            }
            Operation::FetchDfspJws => {
                let own: Vec<Jws> = hub
                    .get_all_jws_certificates()
                    .await?
                    .into_iter()
                    .filter(|key| key.dfsp_id == deps.dfsp_id)
                    .collect();
                Output::RemoteDfspJws(latest_per_dfsp(&own).pop())
            }

            Operation::UploadIpWhitelist { ips } => {
                if !ips.is_empty() {
                    hub.upload_ip_whitelist(ips).await?;
                }
                Output::Unit
            }
            Operation::UploadCallbackUrl { url } => {
                if let Some(url) = url {
                    hub.upload_callback_url(url).await?;
                }
                Output::Unit
            }

            Operation::PushConnectorConfig { config } => {
                control.push_connector_config(config).await?;
                Output::Unit
            }

            Operation::NotifyCompleted { status } => {
                info!("All connection states are completed");
                hub.upload_dfsp_states_status(status).await?;
                Output::Unit
            }
        })
    }
}

//------------ Output --------------------------------------------------------

/// The result of a successful call.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    Unit,
    HubCa(HubCa),
    DfspCa(DfspCa),
    CertStatus(CertStatus),
    ServerCert(DfspServerCert),
    Csr(Csr),
    Enrollment(EnrollmentId),
    ClientCert(ClientCertStatus),
    HubCsrs(Vec<HubCsr>),
    HubCerts(Vec<HubClientCert>),
    PeerJws(Vec<Jws>),
    UploadedPeerJws(Vec<Jws>),
    DfspJws(DfspJws),
    RemoteDfspJws(Option<Jws>),
}

//------------ Tests ---------------------------------------------------------
