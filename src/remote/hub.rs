//! A [`HubApi`] talking to the hub's connection management server.

use std::future::Future;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{pki, HubApi};
use crate::api::status::StatesStatus;
use crate::api::{
    CertStatus, ClientCertStatus, DfspCa, DfspServerCert, EnrollmentId, HubCa, HubCsr, IpEntry, Jws, SignedCert,
};
use crate::commons::error::Error;
use crate::commons::util::httpclient::{self, Auth};

//------------ HubConfig -----------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct HubConfig {
    /// Base URI of the connection management API.
    pub endpoint: String,

    /// The hub environment this participant belongs to.
    pub env_id: String,

    #[serde(default)]
    pub auth: Option<HubAuth>,
}

/// OAuth2 client credentials for the hub.
#[derive(Clone, Debug, Deserialize)]
pub struct HubAuth {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    #[serde(default)]
    pub scope: Option<String>,
}

//------------ Wire types ----------------------------------------------------

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct EnrollmentCreated {
    id: EnrollmentId,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerCertsResponse {
    #[serde(default)]
    server_certificate: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CaUpload<'a> {
    root_certificate: &'a str,
    intermediate_chain: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerCertsUpload<'a> {
    root_certificate: &'a str,
    intermediate_chain: Option<&'a str>,
    server_certificate: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JwsUpload<'a> {
    public_key: &'a str,
    created_at: i64,
}

/// Fills in the end of validity from the certificate if the hub left it
/// out.
/// Fills in the end of validity of a signed client certificate.
fn with_client_not_after(mut status: ClientCertStatus) -> ClientCertStatus {
    let signed = status.signed_certificate().map(str::to_string);
    with_not_after(signed.as_deref(), &mut status.not_after);
    status
}

fn with_not_after(certificate: Option<&str>, not_after: &mut Option<chrono::DateTime<chrono::Utc>>) {
    if not_after.is_none() {
        if let Some(certificate) = certificate {
            match pki::not_after(certificate) {
                Ok(parsed) => *not_after = Some(parsed),
                Err(e) => debug!("Cannot read notAfter of certificate from hub: {}", e),
            }
        }
    }
}

//------------ HubClient -----------------------------------------------------

pub struct HubClient {
    config: HubConfig,
    dfsp_id: String,
    token: RwLock<Option<String>>,
}

impl HubClient {
    pub fn new(config: HubConfig, dfsp_id: impl Into<String>) -> Self {
        HubClient {
            config,
            dfsp_id: dfsp_id.into(),
            token: RwLock::new(None),
        }
    }

    fn uri(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn env_path(&self, path: &str) -> String {
        format!("/environments/{}/dfsps/{}{}", self.config.env_id, self.dfsp_id, path)
    }

    fn dfsp_path(&self, path: &str) -> String {
        format!("/dfsps/{}{}", self.dfsp_id, path)
    }

    async fn login(&self) -> Result<(), Error> {
        let Some(auth) = &self.config.auth else {
            return Ok(());
        };
        info!("Logging in to the hub at {}", auth.token_url);

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", auth.client_id.as_str()),
            ("client_secret", auth.client_secret.expose_secret().as_str()),
        ];
        if let Some(scope) = &auth.scope {
            form.push(("scope", scope.as_str()));
        }

        let res: TokenResponse = httpclient::post_form_with_response(&auth.token_url, &form).await?;
        *self.token.write().await = Some(res.access_token);
        Ok(())
    }

    async fn auth(&self) -> Result<Option<Auth>, Error> {
        if self.config.auth.is_none() {
            return Ok(None);
        }
        if self.token.read().await.is_none() {
            self.login().await?;
        }
        Ok(self.token.read().await.clone().map(Auth::Bearer))
    }

    /// Runs a call, logging in again and retrying once if the hub rejects
    /// the token.
    async fn authorized<T, F, Fut>(&self, call: F) -> Result<T, Error>
    where
        F: Fn(Option<Auth>) -> Fut,
        Fut: Future<Output = Result<T, httpclient::Error>>,
    {
        match call(self.auth().await?).await {
            Err(e)
                if self.config.auth.is_some()
                    && matches!(e.status(), Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)) =>
            {
                warn!("Hub rejected the access token, logging in again");
                self.login().await?;
                Ok(call(self.auth().await?).await?)
            }
            res => Ok(res?),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        self.authorized(|auth| async move { httpclient::get_json(uri, auth.as_ref()).await })
            .await
    }

    async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        self.authorized(|auth| async move { httpclient::get_opt_json(uri, auth.as_ref()).await })
            .await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(), Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        self.authorized(|auth| async move { httpclient::post_json(uri, body, auth.as_ref()).await })
            .await
    }

    async fn post_with_response<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        self.authorized(|auth| async move { httpclient::post_json_with_response(uri, body, auth.as_ref()).await })
            .await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<(), Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        self.authorized(|auth| async move { httpclient::put_json(uri, body, auth.as_ref()).await })
            .await
    }
}

#[async_trait]
impl HubApi for HubClient {
    async fn get_hub_ca(&self) -> Result<HubCa, Error> {
        let mut ca: HubCa = self.get("/hub/ca").await?;
        with_not_after(Some(&ca.root_certificate), &mut ca.not_after);
        Ok(ca)
    }

    async fn upload_dfsp_ca(&self, ca: &DfspCa) -> Result<(), Error> {
        let body = serde_json::to_value(CaUpload {
            root_certificate: &ca.root_certificate,
            intermediate_chain: ca.intermediate_chain.as_deref(),
        })?;
        self.post(&self.env_path("/ca"), &body).await
    }

    async fn get_dfsp_server_certificates(&self) -> Result<CertStatus, Error> {
        let res: ServerCertsResponse = self.get_opt(&self.env_path("/servercerts")).await?.unwrap_or_default();
        let mut status = CertStatus {
            certificate: res.server_certificate,
            not_after: None,
        };
        with_not_after(status.certificate.as_deref(), &mut status.not_after);
        Ok(status)
    }

    async fn upload_server_certificates(&self, cert: &DfspServerCert) -> Result<(), Error> {
        let body = serde_json::to_value(ServerCertsUpload {
            root_certificate: &cert.root_certificate,
            intermediate_chain: cert.intermediate_chain.as_deref(),
            server_certificate: &cert.server_certificate,
        })?;
        self.post(&self.env_path("/servercerts"), &body).await
    }

    async fn upload_csr(&self, csr: &str) -> Result<EnrollmentId, Error> {
        let created: EnrollmentCreated = self
            .post_with_response(&self.env_path("/enrollments/inbound"), &json!({ "clientCSR": csr }))
            .await?;
        debug!("Uploaded client CSR as enrollment {}", created.id);
        Ok(created.id)
    }

    async fn get_client_certificate(&self, enrollment_id: EnrollmentId) -> Result<ClientCertStatus, Error> {
        let status: ClientCertStatus = self
            .get(&self.env_path(&format!("/enrollments/inbound/{}", enrollment_id)))
            .await?;
        Ok(with_client_not_after(status))
    }

    async fn get_hub_csrs(&self) -> Result<Vec<HubCsr>, Error> {
        let mut csrs: Vec<HubCsr> = self.get(&self.dfsp_path("/enrollments/outbound")).await?;
        for csr in &mut csrs {
            with_not_after(csr.certificate.as_deref(), &mut csr.not_after);
        }
        Ok(csrs)
    }

    async fn upload_hub_client_certificate(&self, enrollment_id: EnrollmentId, cert: &SignedCert) -> Result<(), Error> {
        let path = self.dfsp_path(&format!("/enrollments/outbound/{}/certificate", enrollment_id));
        self.post(&path, &json!({ "certificate": cert.certificate })).await
    }

    async fn get_all_jws_certificates(&self) -> Result<Vec<Jws>, Error> {
        let path = format!("/environments/{}/dfsps/jwscerts", self.config.env_id);
        Ok(self.get_opt(&path).await?.unwrap_or_default())
    }

    async fn upload_jws(&self, jws: &Jws) -> Result<(), Error> {
        let body = serde_json::to_value(JwsUpload {
            public_key: &jws.public_key,
            created_at: jws.created_at,
        })?;
        self.post(&self.env_path("/jwscerts"), &body).await
    }

    async fn upload_external_dfsp_jws(&self, keys: &[Jws]) -> Result<(), Error> {
        let path = format!("/environments/{}/external-dfsps/jwscerts", self.config.env_id);
        self.post(&path, &serde_json::to_value(keys)?).await
    }

    async fn upload_ip_whitelist(&self, ips: &[IpEntry]) -> Result<(), Error> {
        let path = self.dfsp_path("/endpoints/egress/ips");
        for entry in ips {
            let body = json!({ "value": { "address": entry.address, "ports": entry.ports } });
            self.post(&path, &body).await?;
        }
        Ok(())
    }

    async fn upload_callback_url(&self, url: &str) -> Result<(), Error> {
        let body = json!({ "value": { "url": url } });
        self.post(&self.dfsp_path("/endpoints/ingress/urls"), &body).await
    }

    async fn upload_dfsp_states_status(&self, status: &StatesStatus) -> Result<(), Error> {
        self.put(&self.dfsp_path("/states-status"), &serde_json::to_value(status)?)
            .await
    }
}

//------------ Tests ---------------------------------------------------------
