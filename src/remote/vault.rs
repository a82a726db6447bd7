//! A [`Vault`] backed by HashiCorp Vault.
//!
//! Certificates are issued by a PKI secrets engine, the persisted machine
//! state lives in a KV engine. Keys for CSRs and JWS are generated locally.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{pki, Vault};
use crate::api::{Csr, CsrParams, DfspCa, DfspJws, DfspServerCert, HubCsr, SignedCert, Subject};
use crate::commons::error::Error;
use crate::commons::util::httpclient::{self, Auth};
use crate::constants::VAULT_TOKEN_RENEW_MARGIN_SECS;

const STATE_MACHINE_STATE_KEY: &str = "state-machine-state";
const RECONNECT_DELAY_SECS: u64 = 30;

//------------ VaultConfig ---------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct VaultConfig {
    /// Base URI, e.g. `https://vault.example.com:8200`.
    pub endpoint: String,

    pub auth: VaultAuth,

    #[serde(default = "VaultConfig::dflt_pki_mount")]
    pub pki_mount: String,

    #[serde(default = "VaultConfig::dflt_kv_mount")]
    pub kv_mount: String,

    /// The PKI role issuing server certificates.
    pub pki_server_role: String,

    /// The PKI role signing client certificates for the hub.
    pub pki_client_role: String,

    /// The common name put on signed hub client certificates.
    pub common_name: String,

    #[serde(default = "VaultConfig::dflt_key_bits")]
    pub key_bits: u32,
}

impl VaultConfig {
    fn dflt_pki_mount() -> String {
        "pki".to_string()
    }

    fn dflt_kv_mount() -> String {
        "secrets".to_string()
    }

    fn dflt_key_bits() -> u32 {
        pki::DEFAULT_KEY_BITS
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum VaultAuth {
    AppRole {
        role_id: String,
        secret_id: SecretString,
    },
    Kubernetes {
        role: String,
        #[serde(default = "VaultAuth::dflt_token_path")]
        token_path: PathBuf,
    },
}

impl VaultAuth {
    fn dflt_token_path() -> PathBuf {
        PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
    }
}

//------------ Responses -----------------------------------------------------

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: u64,
}

#[derive(Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct GeneratedRoot {
    certificate: String,
    private_key: String,
    #[serde(default)]
    expiration: Option<i64>,
}

#[derive(Deserialize)]
struct IssuedCert {
    certificate: String,
    issuing_ca: String,
    #[serde(default)]
    ca_chain: Vec<String>,
    private_key: String,
    #[serde(default)]
    expiration: Option<i64>,
}

#[derive(Deserialize)]
struct SignedResponse {
    certificate: String,
    #[serde(default)]
    expiration: Option<i64>,
}

fn expiry(expiration: Option<i64>, certificate: &str) -> Option<DateTime<Utc>> {
    expiration
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .or_else(|| pki::not_after(certificate).ok())
}

//------------ VaultClient ---------------------------------------------------

pub struct VaultClient {
    config: VaultConfig,
    token: RwLock<Option<String>>,
}

impl VaultClient {
    /// Logs in and keeps the token renewed for as long as the client lives.
    pub async fn connect(config: VaultConfig) -> Result<Arc<Self>, Error> {
        let client = Arc::new(VaultClient {
            config,
            token: RwLock::new(None),
        });
        let renew_after = client.login().await?;
        Self::schedule_renewal(Arc::downgrade(&client), renew_after);
        Ok(client)
    }

    fn schedule_renewal(client: Weak<Self>, first: Duration) {
        tokio::spawn(async move {
            let mut wait = first;
            loop {
                tokio::time::sleep(wait).await;
                let Some(client) = client.upgrade() else {
                    debug!("Vault client dropped, stopping token renewal");
                    break;
                };
                wait = match client.login().await {
                    Ok(renew_after) => renew_after,
                    Err(e) => {
                        warn!("Could not renew Vault token, trying again in {}s: {}", RECONNECT_DELAY_SECS, e);
                        Duration::from_secs(RECONNECT_DELAY_SECS)
                    }
                };
            }
        });
    }

    /// Logs in, returning when the token should be renewed.
    async fn login(&self) -> Result<Duration, Error> {
        info!("Connecting to Vault at {}", self.config.endpoint);

        let (uri, body) = match &self.config.auth {
            VaultAuth::AppRole { role_id, secret_id } => (
                self.uri("auth/approle/login"),
                json!({ "role_id": role_id, "secret_id": secret_id.expose_secret() }),
            ),
            VaultAuth::Kubernetes { role, token_path } => {
                let jwt = std::fs::read_to_string(token_path)?;
                (
                    self.uri("auth/kubernetes/login"),
                    json!({ "role": role, "jwt": jwt.trim() }),
                )
            }
        };

        let res: LoginResponse = httpclient::post_json_with_response(&uri, &body, None).await?;
        *self.token.write().await = Some(res.auth.client_token);

        let renew_after = res.auth.lease_duration.saturating_sub(VAULT_TOKEN_RENEW_MARGIN_SECS).max(1);
        info!("Connected to Vault, renewing token in {}s", renew_after);
        Ok(Duration::from_secs(renew_after))
    }

    fn uri(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn kv_path(&self, key: &str) -> String {
        format!("{}/{}", self.config.kv_mount, key)
    }

    fn pki_path(&self, path: &str) -> String {
        format!("{}/{}", self.config.pki_mount, path)
    }

    async fn auth(&self) -> Result<Auth, Error> {
        self.token
            .read()
            .await
            .clone()
            .map(Auth::VaultToken)
            .ok_or_else(|| Error::vault("not logged in"))
    }

    /// Runs a call, logging in again and retrying once if Vault rejects the
    /// token.
    async fn with_token_refresh<T, F, Fut>(&self, call: F) -> Result<T, Error>
    where
        F: Fn(Auth) -> Fut,
        Fut: Future<Output = Result<T, httpclient::Error>>,
    {
        match call(self.auth().await?).await {
            Err(e) if e.status() == Some(StatusCode::FORBIDDEN) => {
                warn!("Vault token expired or invalid, reconnecting");
                self.login().await?;
                Ok(call(self.auth().await?).await?)
            }
            res => Ok(res?),
        }
    }

    async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        let res: Option<DataResponse<T>> = self
            .with_token_refresh(|auth| async move { httpclient::get_opt_json(uri, Some(&auth)).await })
            .await?;
        Ok(res.map(|res| res.data))
    }

    async fn write(&self, path: &str, body: &Value) -> Result<(), Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        self.with_token_refresh(|auth| async move { httpclient::post_json(uri, body, Some(&auth)).await })
            .await
    }

    async fn write_with_response<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        let res: DataResponse<T> = self
            .with_token_refresh(|auth| async move {
                httpclient::post_json_with_response(uri, body, Some(&auth)).await
            })
            .await?;
        Ok(res.data)
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let uri = self.uri(path);
        let uri = uri.as_str();
        self.with_token_refresh(|auth| async move { httpclient::delete(uri, Some(&auth)).await })
            .await
    }
}

#[async_trait]
impl Vault for VaultClient {
    async fn create_csr(&self, params: &CsrParams) -> Result<Csr, Error> {
        let params = params.clone();
        let key_bits = self.config.key_bits;
        tokio::task::spawn_blocking(move || pki::create_csr(&params, key_bits))
            .await
            .map_err(|e| Error::custom(format!("CSR generation did not finish: {}", e)))?
    }

    async fn create_ca(&self, subject: &Subject) -> Result<DfspCa, Error> {
        self.delete(&self.pki_path("root")).await?;

        let body = json!({
            "common_name": subject.common_name,
            "ou": subject.organizational_unit,
            "organization": subject.organization,
            "locality": subject.locality,
            "country": subject.country,
            "province": subject.province,
            "key_type": "rsa",
            "key_bits": self.config.key_bits,
        });
        let root: GeneratedRoot = self
            .write_with_response(&self.pki_path("root/generate/exported"), &body)
            .await?;

        Ok(DfspCa {
            not_after: expiry(root.expiration, &root.certificate),
            root_certificate: root.certificate,
            intermediate_chain: None,
            private_key: Some(root.private_key),
        })
    }

    async fn set_dfsp_ca_cert_chain(&self, ca: &DfspCa) -> Result<(), Error> {
        let key = ca
            .private_key
            .as_ref()
            .ok_or_else(|| Error::missing("private key of the external CA"))?;
        let mut bundle = format!("{}\n{}", key.trim_end(), ca.root_certificate.trim_end());
        if let Some(chain) = &ca.intermediate_chain {
            bundle = format!("{}\n{}", bundle, chain.trim_end());
        }
        self.write(&self.pki_path("config/ca"), &json!({ "pem_bundle": bundle }))
            .await
    }

    async fn create_dfsp_server_cert(&self, params: &CsrParams) -> Result<DfspServerCert, Error> {
        let alt_names = &params.extensions.subject_alt_name;
        let mut body = json!({ "common_name": params.subject.common_name });
        if !alt_names.dns.is_empty() {
            body["alt_names"] = Value::String(alt_names.dns.join(","));
        }
        if !alt_names.ips.is_empty() {
            body["ip_sans"] = Value::String(alt_names.ips.join(","));
        }

        let path = self.pki_path(&format!("issue/{}", self.config.pki_server_role));
        let issued: IssuedCert = self.write_with_response(&path, &body).await?;

        let chain = issued.ca_chain.join("\n");
        Ok(DfspServerCert {
            not_after: expiry(issued.expiration, &issued.certificate),
            root_certificate: issued.issuing_ca,
            intermediate_chain: if chain.is_empty() { None } else { Some(chain) },
            server_certificate: issued.certificate,
            private_key: issued.private_key,
        })
    }

    async fn sign_hub_csr(&self, csr: &HubCsr) -> Result<SignedCert, Error> {
        let path = self.pki_path(&format!("sign/{}", self.config.pki_client_role));
        let body = json!({ "common_name": self.config.common_name, "csr": csr.csr });
        let signed: SignedResponse = self.write_with_response(&path, &body).await?;

        Ok(SignedCert {
            not_after: expiry(signed.expiration, &signed.certificate),
            certificate: signed.certificate,
        })
    }

    async fn create_jws(&self) -> Result<DfspJws, Error> {
        let key_bits = self.config.key_bits;
        tokio::task::spawn_blocking(move || pki::create_jws(key_bits, Utc::now()))
            .await
            .map_err(|e| Error::custom(format!("JWS key generation did not finish: {}", e)))?
    }

    async fn get_state_machine_state(&self) -> Result<Option<Value>, Error> {
        self.read(&self.kv_path(STATE_MACHINE_STATE_KEY)).await
    }

    async fn set_state_machine_state(&self, state: &Value) -> Result<(), Error> {
        self.write(&self.kv_path(STATE_MACHINE_STATE_KEY), state).await
    }

    async fn delete_state_machine_state(&self) -> Result<(), Error> {
        self.delete(&self.kv_path(STATE_MACHINE_STATE_KEY)).await
    }
}

//------------ Tests ---------------------------------------------------------
