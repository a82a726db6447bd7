//! The services the state machine talks to.
//!
//! Each service is a trait, so the daemon can run against the real vault,
//! hub and connector, and tests against in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::status::StatesStatus;
use crate::api::{
    CertStatus, ClientCertStatus, Csr, CsrParams, DfspCa, DfspJws, DfspServerCert, EnrollmentId, HubCa, HubCsr,
    IpEntry, Jws, SignedCert, Subject,
};
use crate::commons::error::Error;

pub mod control;
pub mod hub;
pub mod pki;
pub mod vault;

//------------ Vault ---------------------------------------------------------

/// The secret store: issues keys and certificates and keeps the persisted
/// machine state.
#[async_trait]
pub trait Vault: Send + Sync + 'static {
    async fn create_csr(&self, params: &CsrParams) -> Result<Csr, Error>;

    /// Replaces the DFSP CA with a newly generated root.
    async fn create_ca(&self, subject: &Subject) -> Result<DfspCa, Error>;

    /// Installs an externally provided CA.
    async fn set_dfsp_ca_cert_chain(&self, ca: &DfspCa) -> Result<(), Error>;

    async fn create_dfsp_server_cert(&self, params: &CsrParams) -> Result<DfspServerCert, Error>;

    async fn sign_hub_csr(&self, csr: &HubCsr) -> Result<SignedCert, Error>;

    async fn create_jws(&self) -> Result<DfspJws, Error>;

    async fn get_state_machine_state(&self) -> Result<Option<Value>, Error>;

    async fn set_state_machine_state(&self, state: &Value) -> Result<(), Error>;

    async fn delete_state_machine_state(&self) -> Result<(), Error>;
}

//------------ HubApi --------------------------------------------------------

/// The hub's connection management API, scoped to this DFSP.
#[async_trait]
pub trait HubApi: Send + Sync + 'static {
    async fn get_hub_ca(&self) -> Result<HubCa, Error>;

    async fn upload_dfsp_ca(&self, ca: &DfspCa) -> Result<(), Error>;

    async fn get_dfsp_server_certificates(&self) -> Result<CertStatus, Error>;

    async fn upload_server_certificates(&self, cert: &DfspServerCert) -> Result<(), Error>;

    async fn upload_csr(&self, csr: &str) -> Result<EnrollmentId, Error>;

    async fn get_client_certificate(&self, enrollment_id: EnrollmentId) -> Result<ClientCertStatus, Error>;

    async fn get_hub_csrs(&self) -> Result<Vec<HubCsr>, Error>;

    async fn upload_hub_client_certificate(&self, enrollment_id: EnrollmentId, cert: &SignedCert)
        -> Result<(), Error>;

    /// The JWS keys of all participants, this DFSP included.
    async fn get_all_jws_certificates(&self) -> Result<Vec<Jws>, Error>;

    async fn upload_jws(&self, jws: &Jws) -> Result<(), Error>;

    async fn upload_external_dfsp_jws(&self, keys: &[Jws]) -> Result<(), Error>;

    async fn upload_ip_whitelist(&self, ips: &[IpEntry]) -> Result<(), Error>;

    async fn upload_callback_url(&self, url: &str) -> Result<(), Error>;

    async fn upload_dfsp_states_status(&self, status: &StatesStatus) -> Result<(), Error>;
}

//------------ ControlPlane --------------------------------------------------

/// The channel to the connector that uses the managed material.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn notify_peer_jws(&self, keys: &[Jws]) -> Result<(), Error>;

    async fn push_connector_config(&self, config: &Value) -> Result<(), Error>;
}

//------------ CertManager ---------------------------------------------------

/// An external owner of the DFSP server certificate.
#[async_trait]
pub trait CertManager: Send + Sync + 'static {
    async fn renew_server_cert(&self) -> Result<(), Error>;
}

//------------ Collaborators -------------------------------------------------

/// Everything an operation may call.
#[derive(Clone)]
pub struct Collaborators {
    pub vault: Arc<dyn Vault>,
    pub hub: Arc<dyn HubApi>,
    pub control: Arc<dyn ControlPlane>,
    pub cert_manager: Option<Arc<dyn CertManager>>,
    pub dfsp_id: String,
}
