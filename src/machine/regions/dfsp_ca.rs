//! Creates the DFSP CA, or takes an external one, and publishes it to the
//! hub.

use crate::machine::actions::Action;
use crate::machine::chart::{go, on, state, Delay, Region, RegionId};
use crate::machine::event::{EventKind, Notice};
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::DfspCa, "checkingDfspCA")
        .on(on(EventKind::CreateIntCa, go("creatingIntCA")))
        .on(on(EventKind::CreateExtCa, go("creatingExtCA")))
        .state(
            state("checkingDfspCA")
                .emit(Notice::CheckingDfspCa)
                .always(go("creatingIntCA").when(Guard::DfspCaMissing))
                .always(go("dfspCaExpired").when(Guard::DfspCaExpired))
                .always(go("dfspCaExpiring").when(Guard::DfspCaExpiring))
                .always(go("scheduled")),
        )
        .state(
            state("dfspCaExpired")
                .emit(Notice::DfspCaExpired)
                .always(go("creatingIntCA")),
        )
        .state(
            state("dfspCaExpiring")
                .emit(Notice::DfspCaExpiring)
                .always(go("creatingIntCA")),
        )
        .state(state("creatingIntCA").emit(Notice::CreatingIntCa).invoke(
            OpKind::CreateIntCa,
            vec![go("uploadingDfspCaToHub").then(Action::AssignDfspCa)],
            vec![go("scheduled")],
        ))
        .state(state("creatingExtCA").emit(Notice::CreatingExtCa).invoke(
            OpKind::SetExtCa,
            vec![go("uploadingDfspCaToHub").then(Action::AssignDfspCa)],
            vec![go("scheduled")],
        ))
        .state(
            state("uploadingDfspCaToHub")
                .emit(Notice::UploadingDfspCaToHub)
                .invoke(
                    OpKind::UploadDfspCa,
                    vec![go("scheduled").emit(Notice::DfspCaPropagated)],
                    vec![go("scheduled")],
                ),
        )
        .state(state("scheduled").after(Delay::Refresh, "checkingDfspCA"))
}
