//! Creates the DFSP's own JWS key pair, publishes it to the hub and checks
//! that the hub keeps the published key.

use crate::machine::actions::{Action, ConfigFragment};
use crate::machine::chart::{go, on, state, Delay, Region, RegionId};
use crate::machine::event::{EventKind, Notice};
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::DfspJws, "checkingDfspJWS")
        .on(on(EventKind::CreateJws, go("creating")))
        .state(
            state("checkingDfspJWS")
                .always(go("creating").when(Guard::NoDfspJws))
                .always(go("idle")),
        )
        .state(state("creating").emit(Notice::CreatingDfspJws).invoke(
            OpKind::CreateJws,
            vec![go("uploading")
                .then(Action::AssignDfspJws)
                .then(Action::Configure(ConfigFragment::JwsSigningKey))],
            vec![go("idle")],
        ))
        .state(state("uploading").emit(Notice::UploadingDfspJws).invoke(
            OpKind::UploadDfspJws,
            vec![go("idle").emit(Notice::DfspJwsPropagated)],
            vec![go("idle")],
        ))
        .state(
            state("idle")
                .emit(Notice::DfspJwsIdle)
                .after(Delay::Refresh, "verifying"),
        )
        .state(state("verifying").emit(Notice::VerifyingDfspJws).invoke(
            OpKind::FetchDfspJws,
            vec![go("uploading").when(Guard::DfspJwsDrifted), go("idle")],
            vec![go("idle")],
        ))
}
