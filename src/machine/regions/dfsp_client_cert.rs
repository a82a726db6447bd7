//! Enrolls the DFSP client certificate the hub uses to trust outbound
//! connections.

use crate::machine::actions::{Action, ConfigFragment};
use crate::machine::chart::{go, on, state, Delay, Region, RegionId};
use crate::machine::event::{EventKind, Notice};
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::DfspClientCert, "checkingDfspClientCert")
        .on(on(EventKind::CreateDfspClientCert, go("creatingDfspCSR")))
        .state(
            state("checkingDfspClientCert")
                .always(go("gettingDfspClientCert").when(Guard::HasDfspClientEnrollment))
                .always(go("creatingDfspCSR")),
        )
        .state(state("creatingDfspCSR").emit(Notice::CreatingDfspCsr).invoke(
            OpKind::CreateDfspCsr,
            vec![go("uploadingDfspCSR").then(Action::AssignDfspClientCsr)],
            vec![go("retry")],
        ))
        .state(state("uploadingDfspCSR").emit(Notice::UploadingDfspCsr).invoke(
            OpKind::UploadDfspCsr,
            vec![go("gettingDfspClientCert").then(Action::AssignDfspClientEnrollment)],
            vec![go("retry")],
        ))
        .state(
            state("gettingDfspClientCert")
                .emit(Notice::FetchingDfspClientCert)
                .invoke(
                    OpKind::FetchDfspClientCert,
                    vec![
                        go("dfspClientCertExpired").when(Guard::DfspClientCertExpired),
                        go("dfspClientCertExpiring").when(Guard::DfspClientCertExpiring),
                        go("retry")
                            .when(Guard::DfspClientCertChanged)
                            .then(Action::AssignDfspClientCert)
                            .then(Action::Configure(ConfigFragment::ClientCert))
                            .emit(Notice::DfspClientCertConfigured),
                        go("retry"),
                    ],
                    vec![go("retry")],
                ),
        )
        .state(
            state("dfspClientCertExpired")
                .emit(Notice::DfspClientCertExpired)
                .always(go("creatingDfspCSR")),
        )
        .state(
            state("dfspClientCertExpiring")
                .emit(Notice::DfspClientCertExpiring)
                .always(go("creatingDfspCSR")),
        )
        .state(state("retry").after(Delay::Refresh, "checkingDfspClientCert"))
}
