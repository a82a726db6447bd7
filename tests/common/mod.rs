#![allow(dead_code)] // Different tests use different parts.

use std::collections::HashSet;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::time::sleep;

use mcm_client::api::status::{Domain, ProgressState, ProgressTable, StatesReport, StatesStatus};
use mcm_client::api::{
    CertStatus, ClientCertStatus, Csr, CsrParams, DfspCa, DfspJws, DfspServerCert, EnrollmentId, EnrollmentState,
    HubCa, HubCsr, IpEntry, Jws, SignedCert, Subject,
};
use mcm_client::commons::error::Error;
use mcm_client::daemon::orchestrator::{Orchestrator, OrchestratorConfig};
use mcm_client::machine::retry::RetryPolicy;
use mcm_client::machine::{MachineState, Settings};
use mcm_client::remote::{CertManager, Collaborators, ControlPlane, HubApi, Vault};

pub const DFSP_ID: &str = "dfsp1";

pub fn init_logging() {
    if env::var("MCM_TEST_LOG").is_ok() {
        let _ = stderrlog::new().verbosity(4).init();
    }
}

pub fn jws(dfsp_id: &str, public_key: &str, created_at: i64) -> Jws {
    Jws {
        dfsp_id: dfsp_id.to_string(),
        public_key: public_key.to_string(),
        created_at,
    }
}

fn in_a_year() -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::days(365)
}

//------------ FakeVault -----------------------------------------------------

#[derive(Default)]
pub struct VaultState {
    pub snapshot: Option<Value>,
    pub snapshot_writes: usize,
    pub fail_writes: bool,
    pub fail_deletes: bool,
    /// Deletes succeed but the snapshot still reads back.
    pub keep_after_delete: bool,
    pub cas_created: usize,
    pub csrs_created: usize,
    pub server_certs_created: usize,
    pub hub_csrs_signed: usize,
    pub jws_created: usize,
}

/// Keeps everything in memory and issues predictable material.
#[derive(Default)]
pub struct FakeVault {
    pub state: Mutex<VaultState>,
}

impl FakeVault {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeVault::default())
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut VaultState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl Vault for FakeVault {
    async fn create_csr(&self, params: &CsrParams) -> Result<Csr, Error> {
        let n = self.with(|s| {
            s.csrs_created += 1;
            s.csrs_created
        });
        Ok(Csr {
            csr: format!("csr-{}-{}", params.subject.common_name, n),
            private_key: format!("csr-key-{}", n),
        })
    }

    async fn create_ca(&self, subject: &Subject) -> Result<DfspCa, Error> {
        let n = self.with(|s| {
            s.cas_created += 1;
            s.cas_created
        });
        Ok(DfspCa {
            root_certificate: format!("root-{}-{}", subject.common_name, n),
            intermediate_chain: None,
            private_key: None,
            not_after: Some(in_a_year()),
        })
    }

    async fn set_dfsp_ca_cert_chain(&self, _ca: &DfspCa) -> Result<(), Error> {
        Ok(())
    }

    async fn create_dfsp_server_cert(&self, params: &CsrParams) -> Result<DfspServerCert, Error> {
        let n = self.with(|s| {
            s.server_certs_created += 1;
            s.server_certs_created
        });
        Ok(DfspServerCert {
            root_certificate: "root".to_string(),
            intermediate_chain: None,
            server_certificate: format!("server-{}-{}", params.subject.common_name, n),
            private_key: format!("server-key-{}", n),
            not_after: Some(in_a_year()),
        })
    }

    async fn sign_hub_csr(&self, csr: &HubCsr) -> Result<SignedCert, Error> {
        self.with(|s| s.hub_csrs_signed += 1);
        Ok(SignedCert {
            certificate: format!("signed-{}", csr.csr),
            not_after: Some(in_a_year()),
        })
    }

    async fn create_jws(&self) -> Result<DfspJws, Error> {
        let n = self.with(|s| {
            s.jws_created += 1;
            s.jws_created
        });
        Ok(DfspJws {
            public_key: format!("jws-pk-{}", n),
            private_key: format!("jws-key-{}", n),
            created_at: Utc::now().timestamp() + i64::try_from(n).unwrap_or_default(),
        })
    }

    async fn get_state_machine_state(&self) -> Result<Option<Value>, Error> {
        Ok(self.with(|s| s.snapshot.clone()))
    }

    async fn set_state_machine_state(&self, state: &Value) -> Result<(), Error> {
        self.with(|s| {
            if s.fail_writes {
                Err(Error::vault("storage unavailable"))
            } else {
                s.snapshot = Some(state.clone());
                s.snapshot_writes += 1;
                Ok(())
            }
        })
    }

    async fn delete_state_machine_state(&self) -> Result<(), Error> {
        self.with(|s| {
            if s.fail_deletes {
                Err(Error::vault("permission denied"))
            } else {
                if !s.keep_after_delete {
                    s.snapshot = None;
                }
                Ok(())
            }
        })
    }
}

//------------ FakeHub -------------------------------------------------------

#[derive(Default)]
pub struct HubState {
    pub hub_ca: Option<HubCa>,
    pub peer_jws: Vec<Jws>,
    pub own_jws: Option<Jws>,
    pub hub_csrs: Vec<HubCsr>,
    pub server_cert: Option<DfspServerCert>,
    pub dfsp_ca: Option<DfspCa>,
    pub next_enrollment: EnrollmentId,
    pub external_uploads: Vec<Vec<Jws>>,
    pub states_status: Vec<StatesStatus>,
    pub ips: Vec<IpEntry>,
    pub callback_url: Option<String>,

    /// Names of the calls that fail.
    pub failing: HashSet<&'static str>,

    pub calls: Vec<&'static str>,
}

/// A hub that answers from memory and records what it was sent.
pub struct FakeHub {
    pub state: Mutex<HubState>,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeHub {
            state: Mutex::new(HubState {
                hub_ca: Some(HubCa {
                    root_certificate: "hub-root".to_string(),
                    intermediate_chain: None,
                    not_after: Some(in_a_year()),
                }),
                next_enrollment: 1,
                ..Default::default()
            }),
        })
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut HubState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|call| **call == name).count())
    }

    fn call(&self, name: &'static str) -> Result<(), Error> {
        self.with(|s| {
            s.calls.push(name);
            if s.failing.contains(name) {
                Err(Error::remote(name, "503 Service Unavailable"))
            } else {
                Ok(())
            }
        })
    }
}

#[async_trait]
impl HubApi for FakeHub {
    async fn get_hub_ca(&self) -> Result<HubCa, Error> {
        self.call("getHubCA")?;
        self.with(|s| s.hub_ca.clone()).ok_or_else(|| Error::remote("getHubCA", "404"))
    }

    async fn upload_dfsp_ca(&self, ca: &DfspCa) -> Result<(), Error> {
        self.call("uploadDFSPCA")?;
        self.with(|s| s.dfsp_ca = Some(ca.clone()));
        Ok(())
    }

    async fn get_dfsp_server_certificates(&self) -> Result<CertStatus, Error> {
        self.call("getDFSPServerCertificates")?;
        Ok(self.with(|s| match &s.server_cert {
            Some(cert) => CertStatus {
                certificate: Some(cert.server_certificate.clone()),
                not_after: cert.not_after,
            },
            None => CertStatus::default(),
        }))
    }

    async fn upload_server_certificates(&self, cert: &DfspServerCert) -> Result<(), Error> {
        self.call("uploadServerCertificates")?;
        self.with(|s| s.server_cert = Some(cert.clone()));
        Ok(())
    }

    async fn upload_csr(&self, _csr: &str) -> Result<EnrollmentId, Error> {
        self.call("uploadCSR")?;
        Ok(self.with(|s| {
            let id = s.next_enrollment;
            s.next_enrollment += 1;
            id
        }))
    }

    async fn get_client_certificate(&self, enrollment_id: EnrollmentId) -> Result<ClientCertStatus, Error> {
        self.call("getClientCertificate")?;
        Ok(ClientCertStatus {
            state: EnrollmentState::CertSigned,
            certificate: Some(format!("client-cert-{}", enrollment_id)),
            not_after: Some(in_a_year()),
        })
    }

    async fn get_hub_csrs(&self) -> Result<Vec<HubCsr>, Error> {
        self.call("getHubCSRs")?;
        Ok(self.with(|s| s.hub_csrs.clone()))
    }

    async fn upload_hub_client_certificate(&self, enrollment_id: EnrollmentId, cert: &SignedCert) -> Result<(), Error> {
        self.call("uploadHubClientCertificate")?;
        self.with(|s| {
            if let Some(csr) = s.hub_csrs.iter_mut().find(|csr| csr.id == enrollment_id) {
                csr.state = EnrollmentState::CertSigned;
                csr.certificate = Some(cert.certificate.clone());
                csr.not_after = cert.not_after;
            }
        });
        Ok(())
    }

    async fn get_all_jws_certificates(&self) -> Result<Vec<Jws>, Error> {
        self.call("getAllJWSCertificates")?;
        Ok(self.with(|s| s.peer_jws.iter().cloned().chain(s.own_jws.clone()).collect()))
    }

    async fn upload_jws(&self, jws: &Jws) -> Result<(), Error> {
        self.call("uploadJWS")?;
        self.with(|s| s.own_jws = Some(jws.clone()));
        Ok(())
    }

    async fn upload_external_dfsp_jws(&self, keys: &[Jws]) -> Result<(), Error> {
        self.call("uploadExternalDfspJWS")?;
        self.with(|s| s.external_uploads.push(keys.to_vec()));
        Ok(())
    }

    async fn upload_ip_whitelist(&self, ips: &[IpEntry]) -> Result<(), Error> {
        self.call("uploadIPWhitelist")?;
        self.with(|s| s.ips = ips.to_vec());
        Ok(())
    }

    async fn upload_callback_url(&self, url: &str) -> Result<(), Error> {
        self.call("uploadCallbackURL")?;
        self.with(|s| s.callback_url = Some(url.to_string()));
        Ok(())
    }

    async fn upload_dfsp_states_status(&self, status: &StatesStatus) -> Result<(), Error> {
        self.call("uploadDfspStatesStatus")?;
        self.with(|s| s.states_status.push(status.clone()));
        Ok(())
    }
}

//------------ RecordingControl ----------------------------------------------

#[derive(Default)]
pub struct RecordingControl {
    pub peer_jws: Mutex<Vec<Vec<Jws>>>,
    pub configs: Mutex<Vec<Value>>,
}

impl RecordingControl {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingControl::default())
    }

    pub fn notifications(&self) -> Vec<Vec<Jws>> {
        self.peer_jws.lock().unwrap().clone()
    }

    pub fn last_config(&self) -> Option<Value> {
        self.configs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ControlPlane for RecordingControl {
    async fn notify_peer_jws(&self, keys: &[Jws]) -> Result<(), Error> {
        self.peer_jws.lock().unwrap().push(keys.to_vec());
        Ok(())
    }

    async fn push_connector_config(&self, config: &Value) -> Result<(), Error> {
        self.configs.lock().unwrap().push(config.clone());
        Ok(())
    }
}

//------------ FakeCertManager -----------------------------------------------

#[derive(Default)]
pub struct FakeCertManager {
    pub renewals: Mutex<usize>,
}

#[async_trait]
impl CertManager for FakeCertManager {
    async fn renew_server_cert(&self) -> Result<(), Error> {
        *self.renewals.lock().unwrap() += 1;
        Ok(())
    }
}

//------------ TestSetup -----------------------------------------------------

/// The collaborators of one test, kept around for inspection.
pub struct TestSetup {
    pub vault: Arc<FakeVault>,
    pub hub: Arc<FakeHub>,
    pub control: Arc<RecordingControl>,
    pub cert_manager: Option<Arc<FakeCertManager>>,
    pub settings: Settings,
    pub retry: RetryPolicy,
    pub report_interval: Duration,
}

impl TestSetup {
    pub fn new() -> Self {
        init_logging();

        let mut settings = Settings::new(DFSP_ID);
        settings.refresh_interval = Duration::from_secs(3600);

        TestSetup {
            vault: FakeVault::new(),
            hub: FakeHub::new(),
            control: RecordingControl::new(),
            cert_manager: None,
            settings,
            retry: RetryPolicy {
                interval: Duration::from_millis(5),
                multiplier: 1.0,
                max_attempts: 2,
            },
            report_interval: Duration::from_secs(3600),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let cert_manager = self
            .cert_manager
            .clone()
            .map(|manager| manager as Arc<dyn CertManager>);

        Orchestrator::new(OrchestratorConfig {
            settings: self.settings.clone(),
            retry: self.retry.clone(),
            report_interval: self.report_interval,
            collaborators: Collaborators {
                vault: self.vault.clone(),
                hub: self.hub.clone(),
                control: self.control.clone(),
                cert_manager,
                dfsp_id: DFSP_ID.to_string(),
            },
        })
        .unwrap()
    }
}

//------------ Waiting -------------------------------------------------------

/// Polls the machine until `done` holds, panics after five seconds.
pub async fn wait_for(orchestrator: &Orchestrator, what: &str, done: impl Fn(&MachineState) -> bool) {
    for _ in 0..500 {
        if let Some(state) = orchestrator.machine_state() {
            if done(&state) {
                return;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}: {:?}", what, orchestrator.machine_state());
}

/// Waits until no region has a call in flight.
pub async fn settle(orchestrator: &Orchestrator) {
    // Give raised events and retries a moment to get going.
    sleep(Duration::from_millis(50)).await;
    wait_for(orchestrator, "all calls to finish", |state| {
        state.regions.iter().all(|region| region.invocations.is_empty())
    })
    .await;
    sleep(Duration::from_millis(20)).await;
}

pub fn progress(orchestrator: &Orchestrator) -> ProgressTable {
    match orchestrator.get_state(false) {
        StatesReport::Raw(table) => table,
        StatesReport::Formatted(_) => panic!("asked for the raw table"),
    }
}

pub fn status(orchestrator: &Orchestrator, domain: Domain) -> ProgressState {
    progress(orchestrator)
        .get(domain)
        .map(|entry| entry.status)
        .unwrap_or(ProgressState::Pending)
}

/// Waits until `domain` reports `wanted`.
pub async fn wait_for_status(orchestrator: &Orchestrator, domain: Domain, wanted: ProgressState) {
    let what = format!("{} to become {}", domain, wanted);
    wait_for(orchestrator, &what, |state| {
        state
            .context
            .progress_monitor
            .progress
            .get(domain)
            .is_some_and(|entry| entry.status == wanted)
    })
    .await;
}

/// Waits until the steady state of a cold start without hub CSRs or
/// uploaded peer keys is reached.
pub async fn wait_for_cold_start(orchestrator: &Orchestrator) {
    for domain in [
        Domain::PeerJws,
        Domain::DfspJws,
        Domain::DfspCa,
        Domain::DfspServerCert,
        Domain::DfspClientCert,
        Domain::HubCa,
        Domain::EndpointConfig,
    ] {
        wait_for_status(orchestrator, domain, ProgressState::Completed).await;
    }
    settle(orchestrator).await;
}
