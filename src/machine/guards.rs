//! Named guard conditions.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::context::{changed_keys, latest_per_dfsp, Context};
use super::event::Event;
use super::ops::Output;
use super::settings::Settings;
use super::Cause;
use crate::api::{EnrollmentState, Expiry, HubClientCert, HubCsr, Jws};

//------------ Scope ---------------------------------------------------------

/// What a guard or action gets to look at.
pub struct Scope<'a> {
    pub settings: &'a Settings,
    pub cause: &'a Cause<'a>,
    pub now: DateTime<Utc>,
}

//------------ Guard ---------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Guard {
    HubCaChanged,
    HubCaExpiring,

    DfspCaMissing,
    DfspCaExpired,
    DfspCaExpiring,

    HasDfspClientEnrollment,
    DfspClientCertExpired,
    DfspClientCertExpiring,
    DfspClientCertChanged,

    ManagedByCertManager,
    NotManagedByCertManager,
    DfspServerCertExpired,
    DfspServerCertExpiring,

    HubCsrsNeedSigning,
    HubCertsChanged,

    PeerJwsChanged,
    PeerJwsNeverSynced,

    UploadPeerJwsChanged,

    NoDfspJws,
    DfspJwsDrifted,

    EndpointConfigChanged,

    TracksProgress,
    AllCompleted,
}

impl Guard {
    pub fn check(self, ctx: &Context, scope: &Scope) -> bool {
        let thresholds = &scope.settings.thresholds;
        let output = scope.cause.output();

        match self {
            Guard::HubCaChanged => match output {
                Some(Output::HubCa(fetched)) => match &ctx.hub_ca {
                    Some(held) => !held.same_material(fetched),
                    None => true,
                },
                _ => false,
            },
            Guard::HubCaExpiring => match output {
                Some(Output::HubCa(fetched)) => {
                    Expiry::of_opt(fetched.not_after, scope.now, thresholds.hub_ca) != Expiry::Valid
                }
                _ => false,
            },

            Guard::DfspCaMissing => ctx.dfsp_ca.is_none(),
            Guard::DfspCaExpired => dfsp_ca_expiry(ctx, scope) == Expiry::Expired,
            Guard::DfspCaExpiring => dfsp_ca_expiry(ctx, scope) == Expiry::Expiring,

            Guard::HasDfspClientEnrollment => ctx
                .dfsp_client_cert
                .as_ref()
                .and_then(|cert| cert.enrollment_id)
                .is_some(),
            Guard::DfspClientCertExpired => client_cert_expiry(scope) == Some(Expiry::Expired),
            Guard::DfspClientCertExpiring => client_cert_expiry(scope) == Some(Expiry::Expiring),
            Guard::DfspClientCertChanged => match output {
                Some(Output::ClientCert(status)) => match status.signed_certificate() {
                    Some(signed) => {
                        ctx.dfsp_client_cert.as_ref().and_then(|cert| cert.certificate.as_deref()) != Some(signed)
                    }
                    None => false,
                },
                _ => false,
            },

            Guard::ManagedByCertManager => scope.settings.cert_manager,
            Guard::NotManagedByCertManager => !scope.settings.cert_manager,
            Guard::DfspServerCertExpired => server_cert_expiry(scope) == Some(Expiry::Expired),
            Guard::DfspServerCertExpiring => server_cert_expiry(scope) == Some(Expiry::Expiring),

            Guard::HubCsrsNeedSigning => match output {
                Some(Output::HubCsrs(csrs)) => !csrs_to_sign(csrs, scope.now, thresholds.hub_cert).is_empty(),
                _ => false,
            },
            Guard::HubCertsChanged => match output {
                Some(Output::HubCsrs(csrs)) => {
                    let fetched = signed_hub_certs(csrs);
                    fetched.len() != ctx.hub_client_certs.len()
                        || fetched
                            .iter()
                            .zip(&ctx.hub_client_certs)
                            .any(|(fetched, held)| fetched.id != held.id || fetched.certificate != held.certificate)
                }
                _ => false,
            },

            Guard::PeerJwsChanged => match output {
                Some(Output::PeerJws(fetched)) => {
                    let held = ctx.peer_jws.as_deref().unwrap_or_default();
                    !changed_keys(&latest_per_dfsp(fetched), held).is_empty()
                }
                _ => false,
            },
            Guard::PeerJwsNeverSynced => ctx.peer_jws.is_none(),

            Guard::UploadPeerJwsChanged => match scope.cause.event() {
                Some(Event::UploadPeerJws { peer_jws }) => {
                    !upload_changes(peer_jws, &ctx.uploaded_peer_jws).is_empty()
                }
                _ => false,
            },

            Guard::NoDfspJws => ctx.dfsp_jws.is_none(),
            Guard::DfspJwsDrifted => match (output, &ctx.dfsp_jws) {
                (Some(Output::RemoteDfspJws(remote)), Some(held)) => {
                    remote.as_ref() != Some(&held.as_published(&scope.settings.dfsp_id))
                }
                _ => false,
            },

            Guard::EndpointConfigChanged => {
                ctx.endpoint_config.clone().unwrap_or_default() != scope.settings.endpoint_config
            }

            Guard::TracksProgress => match scope.cause.event() {
                Some(Event::Notice(notice)) => notice.completes().is_some(),
                _ => false,
            },
            Guard::AllCompleted => {
                let monitor = &ctx.progress_monitor;
                monitor.progress.all_completed() && !monitor.completion_notified
            }
        }
    }
}

fn dfsp_ca_expiry(ctx: &Context, scope: &Scope) -> Expiry {
    let not_after = ctx.dfsp_ca.as_ref().and_then(|ca| ca.not_after);
    Expiry::of_opt(not_after, scope.now, scope.settings.thresholds.dfsp_ca)
}

fn client_cert_expiry(scope: &Scope) -> Option<Expiry> {
    match scope.cause.output() {
        Some(Output::ClientCert(status)) if status.signed_certificate().is_some() => Some(Expiry::of_opt(
            status.not_after,
            scope.now,
            scope.settings.thresholds.dfsp_client_cert,
        )),
        _ => None,
    }
}

fn server_cert_expiry(scope: &Scope) -> Option<Expiry> {
    match scope.cause.output() {
        Some(Output::CertStatus(status)) if status.certificate.is_some() => Some(Expiry::of_opt(
            status.not_after,
            scope.now,
            scope.settings.thresholds.dfsp_server_cert,
        )),
        _ => None,
    }
}

//------------ Helpers shared with operations and actions --------------------

/// The hub CSRs that are unsigned, or signed with a certificate about to
/// expire.
pub fn csrs_to_sign(csrs: &[HubCsr], now: DateTime<Utc>, threshold: Duration) -> Vec<HubCsr> {
    csrs.iter()
        .filter(|csr| match (csr.state, &csr.certificate) {
            (EnrollmentState::CertSigned, Some(_)) => Expiry::of_opt(csr.not_after, now, threshold) != Expiry::Valid,
            (EnrollmentState::CsrLoaded, _) => true,
            _ => false,
        })
        .cloned()
        .collect()
}

/// The signed hub client certificates, ordered by enrollment id.
pub fn signed_hub_certs(csrs: &[HubCsr]) -> Vec<HubClientCert> {
    let mut certs: Vec<HubClientCert> = csrs
        .iter()
        .filter(|csr| csr.state == EnrollmentState::CertSigned)
        .filter_map(|csr| {
            csr.certificate.as_ref().map(|certificate| HubClientCert {
                id: csr.id,
                certificate: certificate.clone(),
                not_after: csr.not_after,
            })
        })
        .collect();
    certs.sort_by_key(|cert| cert.id);
    certs
}

/// The keys offered for upload that differ from what was uploaded before.
pub fn upload_changes(offered: &[Jws], uploaded: &[Jws]) -> Vec<Jws> {
    changed_keys(&latest_per_dfsp(offered), uploaded)
}

//------------ Tests ---------------------------------------------------------
