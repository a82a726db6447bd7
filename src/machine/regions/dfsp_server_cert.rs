//! Issues the DFSP server certificate and publishes it to the hub.
//!
//! When a certificate manager owns the server certificate the region stays
//! idle until it is asked for a new one, and then only asks the manager to
//! renew.

use crate::machine::actions::{Action, ConfigFragment};
use crate::machine::chart::{go, on, state, Delay, Region, RegionId};
use crate::machine::event::{EventKind, Notice};
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::DfspServerCert, "idle")
        .on(on(EventKind::CreateDfspServerCert, go("requestedNewDfspServerCert")))
        .on(on(Notice::DfspCaPropagated, go("requestedNewDfspServerCert")))
        .state(state("idle").always(go("checkingDfspServerCert").when(Guard::NotManagedByCertManager)))
        .state(
            state("checkingDfspServerCert")
                .emit(Notice::CheckingDfspServerCert)
                .invoke(
                    OpKind::FetchDfspServerCert,
                    vec![
                        go("dfspServerCertExpired").when(Guard::DfspServerCertExpired),
                        go("dfspServerCertExpiring").when(Guard::DfspServerCertExpiring),
                        go("scheduled"),
                    ],
                    vec![go("scheduled")],
                ),
        )
        .state(
            state("dfspServerCertExpired")
                .emit(Notice::DfspServerCertExpired)
                .always(go("creatingDfspServerCert")),
        )
        .state(
            state("dfspServerCertExpiring")
                .emit(Notice::DfspServerCertExpiring)
                .always(go("creatingDfspServerCert")),
        )
        .state(
            state("requestedNewDfspServerCert")
                .emit(Notice::RequestingNewDfspServerCert)
                .always(go("renewingManagedDfspServerCert").when(Guard::ManagedByCertManager))
                .always(go("creatingDfspServerCert")),
        )
        .state(
            state("renewingManagedDfspServerCert")
                .emit(Notice::RenewingManagedDfspServerCert)
                .invoke(
                    OpKind::RenewManagedServerCert,
                    vec![go("idle").emit(Notice::DfspServerCertConfigured)],
                    vec![go("idle")],
                ),
        )
        .state(
            state("creatingDfspServerCert")
                .emit(Notice::CreatingDfspServerCert)
                .invoke(
                    OpKind::CreateDfspServerCert,
                    vec![go("uploadingDfspServerCertToHub")
                        .then(Action::AssignDfspServerCert)
                        .then(Action::Configure(ConfigFragment::ServerCert))],
                    vec![go("scheduled")],
                ),
        )
        .state(
            state("uploadingDfspServerCertToHub")
                .emit(Notice::UploadingDfspServerCertToHub)
                .invoke(
                    OpKind::UploadDfspServerCert,
                    vec![go("scheduled").emit(Notice::DfspServerCertConfigured)],
                    vec![go("scheduled")],
                ),
        )
        .state(state("scheduled").after(Delay::Refresh, "checkingDfspServerCert"))
}
