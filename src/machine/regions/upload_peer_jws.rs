//! Uploads peer JWS keys learned outside the hub, such as from other
//! schemes, to the hub.

use crate::machine::actions::Action;
use crate::machine::chart::{go, on, state, Region, RegionId};
use crate::machine::event::{EventKind, Notice};
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::UploadPeerJws, "idle")
        .on(on(EventKind::UploadPeerJws, go("comparing")))
        .state(state("idle").emit(Notice::UploadPeerJwsIdle))
        .state(
            state("comparing")
                .emit(Notice::ComparingUploadPeerJws)
                .always(go("uploadingPeerJWS").when(Guard::UploadPeerJwsChanged))
                .always(go("idle")),
        )
        .state(state("uploadingPeerJWS").emit(Notice::UploadingPeerJws).invoke(
            OpKind::UploadPeerJws,
            vec![go("idle")
                .then(Action::MergeUploadedPeerJws)
                .emit(Notice::UploadPeerJwsCompleted)],
            vec![go("idle")],
        ))
}
