//! Named actions run on transitions and on entering states.

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};

use super::context::{changed_keys, latest_per_dfsp, merge_keys, Context};
use super::event::{Event, Notice};
use super::guards::{signed_hub_certs, Scope};
use super::ops::Output;
use crate::commons::util::merge::deep_merge;

//------------ ConfigFragment ------------------------------------------------

/// A part of the connector configuration owned by one region.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ConfigFragment {
    HubCa,
    ClientCert,
    ServerCert,
    PeerJwsKeys,
    JwsSigningKey,
}

impl ConfigFragment {
    fn render(self, ctx: &Context) -> Option<Value> {
        match self {
            ConfigFragment::HubCa => ctx.hub_ca.as_ref().map(|ca| {
                json!({ "outbound": { "tls": { "creds": {
                    "ca": pem_bundle(&ca.root_certificate, ca.intermediate_chain.as_deref()),
                } } } })
            }),
            ConfigFragment::ClientCert => ctx.dfsp_client_cert.as_ref().and_then(|cert| {
                cert.certificate.as_ref().map(|certificate| {
                    json!({ "outbound": { "tls": { "creds": {
                        "cert": certificate,
                        "key": cert.private_key,
                    } } } })
                })
            }),
            ConfigFragment::ServerCert => ctx.dfsp_server_cert.as_ref().map(|cert| {
                json!({ "inbound": { "tls": { "creds": {
                    "ca": pem_bundle(&cert.root_certificate, cert.intermediate_chain.as_deref()),
                    "cert": cert.server_certificate,
                    "key": cert.private_key,
                } } } })
            }),
            ConfigFragment::PeerJwsKeys => ctx.peer_jws.as_ref().map(|keys| {
                let keys: serde_json::Map<String, Value> = keys
                    .iter()
                    .map(|key| (key.dfsp_id.clone(), Value::String(key.public_key.clone())))
                    .collect();
                json!({ "peerJWSKeys": keys })
            }),
            ConfigFragment::JwsSigningKey => ctx
                .dfsp_jws
                .as_ref()
                .map(|jws| json!({ "jwsSigningKey": jws.private_key })),
        }
    }
}

fn pem_bundle(root: &str, chain: Option<&str>) -> String {
    match chain {
        Some(chain) if !chain.is_empty() => format!("{}\n{}", root.trim_end(), chain),
        _ => root.to_string(),
    }
}

//------------ Action --------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Action {
    /// Raises a notice.
    Emit(Notice),

    /// Raises `UPDATE_CONNECTOR_CONFIG` with a fragment of the context.
    Configure(ConfigFragment),

    AssignHubCa,
    AssignDfspCa,
    AssignDfspServerCert,
    AssignDfspClientCsr,
    AssignDfspClientEnrollment,
    AssignDfspClientCert,
    AssignHubCerts,
    MergeHubCerts,
    MergePeerJws,
    MarkPeerJwsSynced,
    MergeUploadedPeerJws,
    AssignDfspJws,
    AssignEndpointConfig,
    MergeConnectorConfig,

    RecordProgress,
    RecordFailure,
    LatchCompletion,
}

impl Action {
    pub fn run(self, ctx: &mut Context, scope: &Scope, raised: &mut Vec<Event>) {
        let output = scope.cause.output();
        let event = scope.cause.event();

        match (self, output, event) {
            (Action::Emit(notice), _, _) => raised.push(Event::Notice(notice)),
            (Action::Configure(fragment), _, _) => match fragment.render(ctx) {
                Some(config) => raised.push(Event::UpdateConnectorConfig { config }),
                None => debug!("Nothing to configure for {:?}", fragment),
            },

            (Action::AssignHubCa, Some(Output::HubCa(ca)), _) => ctx.hub_ca = Some(ca.clone()),
            (Action::AssignDfspCa, Some(Output::DfspCa(ca)), _) => ctx.dfsp_ca = Some(ca.clone()),
            (Action::AssignDfspServerCert, Some(Output::ServerCert(cert)), _) => {
                ctx.dfsp_server_cert = Some(cert.clone())
            }
            (Action::AssignDfspClientCsr, Some(Output::Csr(csr)), _) => {
                ctx.dfsp_client_cert = Some(crate::api::DfspClientCert::from_csr(csr.clone()))
            }
            (Action::AssignDfspClientEnrollment, Some(Output::Enrollment(id)), _) => {
                if let Some(cert) = ctx.dfsp_client_cert.as_mut() {
                    cert.enrollment_id = Some(*id);
                }
            }
            (Action::AssignDfspClientCert, Some(Output::ClientCert(status)), _) => {
                if let Some(cert) = ctx.dfsp_client_cert.as_mut() {
                    cert.certificate = status.signed_certificate().map(str::to_string);
                    cert.not_after = status.not_after;
                }
            }
            (Action::AssignHubCerts, Some(Output::HubCsrs(csrs)), _) => ctx.hub_client_certs = signed_hub_certs(csrs),
            (Action::MergeHubCerts, Some(Output::HubCerts(signed)), _) => {
                for cert in signed {
                    match ctx.hub_client_certs.iter_mut().find(|held| held.id == cert.id) {
                        Some(held) => *held = cert.clone(),
                        None => ctx.hub_client_certs.push(cert.clone()),
                    }
                }
                ctx.hub_client_certs.sort_by_key(|cert| cert.id);
            }
            (Action::MergePeerJws, Some(Output::PeerJws(fetched)), _) => {
                let held = ctx.peer_jws.take().unwrap_or_default();
                let changes = changed_keys(&latest_per_dfsp(fetched), &held);
                ctx.peer_jws = Some(merge_keys(&held, &changes));
            }
            (Action::MarkPeerJwsSynced, output, _) => {
                if ctx.peer_jws.is_none() {
                    ctx.peer_jws = Some(match output {
                        Some(Output::PeerJws(fetched)) => latest_per_dfsp(fetched),
                        _ => Vec::new(),
                    });
                }
            }
            (Action::MergeUploadedPeerJws, Some(Output::UploadedPeerJws(changes)), _) => {
                ctx.uploaded_peer_jws = merge_keys(&ctx.uploaded_peer_jws, changes)
            }
            (Action::AssignDfspJws, Some(Output::DfspJws(jws)), _) => ctx.dfsp_jws = Some(jws.clone()),
            (Action::AssignEndpointConfig, _, _) => ctx.endpoint_config = Some(scope.settings.endpoint_config.clone()),
            (Action::MergeConnectorConfig, _, Some(Event::UpdateConnectorConfig { config })) => {
                deep_merge(&mut ctx.connector_config, config)
            }

            (Action::RecordProgress, _, Some(Event::Notice(notice))) => {
                if let Some((domain, description)) = notice.completes() {
                    ctx.progress_monitor.progress.completed(domain, description, scope.now);
                }
            }
            (Action::RecordFailure, _, Some(Event::Failed(failure))) => match failure.domain() {
                Some(domain) => {
                    let monitor = &mut ctx.progress_monitor;
                    monitor
                        .progress
                        .failed(domain, &failure.state, &failure.error, failure.retries, scope.now);
                    monitor.completion_notified = false;
                }
                None => debug!("Failure of {} is not tracked", failure.machine),
            },
            (Action::LatchCompletion, _, _) => ctx.progress_monitor.completion_notified = true,

            (action, _, _) => warn!("Action {:?} does not apply to {}", action, scope.cause),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::api::status::{Domain, ProgressState};
    use crate::api::{HubCa, Jws};
    use crate::machine::event::Failure;
    use crate::machine::settings::Settings;
    use crate::machine::Cause;

    fn run(action: Action, ctx: &mut Context, cause: &Cause) -> Vec<Event> {
        let settings = Settings::new("dfsp1");
        let scope = Scope {
            settings: &settings,
            cause,
            now: Utc::now(),
        };
        let mut raised = Vec::new();
        action.run(ctx, &scope, &mut raised);
        raised
    }

    #[test]
    fn configure_hub_ca_raises_fragment() {
        let mut ctx = Context::default();
        ctx.hub_ca = Some(HubCa {
            root_certificate: "ROOT\n".to_string(),
            intermediate_chain: Some("CHAIN".to_string()),
            not_after: None,
        });

        let raised = run(Action::Configure(ConfigFragment::HubCa), &mut ctx, &Cause::Start);
        assert_eq!(
            raised,
            vec![Event::UpdateConnectorConfig {
                config: json!({ "outbound": { "tls": { "creds": { "ca": "ROOT\nCHAIN" } } } })
            }]
        );
    }

    #[test]
    fn configure_without_material_raises_nothing() {
        let mut ctx = Context::default();
        assert!(run(Action::Configure(ConfigFragment::ClientCert), &mut ctx, &Cause::Start).is_empty());
    }

    #[test]
    fn merge_connector_config_accumulates() {
        let mut ctx = Context::default();
        let first = Event::UpdateConnectorConfig {
            config: json!({ "outbound": { "tls": { "creds": { "ca": "ca" } } } }),
        };
        let second = Event::UpdateConnectorConfig {
            config: json!({ "outbound": { "tls": { "creds": { "cert": "cert" } } } }),
        };
        run(Action::MergeConnectorConfig, &mut ctx, &Cause::Event(&first));
        run(Action::MergeConnectorConfig, &mut ctx, &Cause::Event(&second));

        assert_eq!(
            ctx.connector_config,
            json!({ "outbound": { "tls": { "creds": { "ca": "ca", "cert": "cert" } } } })
        );
    }

    #[test]
    fn failure_clears_completion_latch() {
        let mut ctx = Context::new(Utc::now());
        ctx.progress_monitor.completion_notified = true;

        let failed = Event::Failed(Failure {
            machine: "DFSP_CLIENT_CERT".to_string(),
            state: "uploadingDfspCSR".to_string(),
            error: "hub unreachable".to_string(),
            retries: 1,
        });
        run(Action::RecordFailure, &mut ctx, &Cause::Event(&failed));

        let entry = ctx.progress_monitor.progress.get(Domain::DfspClientCert).unwrap();
        assert_eq!(entry.status, ProgressState::InError);
        assert_eq!(entry.retries, Some(1));
        assert!(!ctx.progress_monitor.completion_notified);

        // Other domains are untouched.
        assert_eq!(
            ctx.progress_monitor.progress.get(Domain::HubCa).unwrap().status,
            ProgressState::Pending
        );
    }

    #[test]
    fn untracked_failure_is_ignored() {
        let mut ctx = Context::new(Utc::now());
        let before = ctx.clone();
        let failed = Event::Failed(Failure {
            machine: "CONNECTOR_CONFIG".to_string(),
            state: "updatingConfig".to_string(),
            error: "no listener".to_string(),
            retries: 1,
        });
        run(Action::RecordFailure, &mut ctx, &Cause::Event(&failed));
        assert_eq!(ctx, before);
    }

    #[test]
    fn merge_peer_jws_keeps_latest() {
        let mut ctx = Context::default();
        let fetched = Output::PeerJws(vec![
            Jws {
                dfsp_id: "b".to_string(),
                public_key: "old".to_string(),
                created_at: 1,
            },
            Jws {
                dfsp_id: "b".to_string(),
                public_key: "new".to_string(),
                created_at: 2,
            },
        ]);
        run(Action::MergePeerJws, &mut ctx, &Cause::Done(&fetched));

        let held = ctx.peer_jws.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].public_key, "new");
    }
}
