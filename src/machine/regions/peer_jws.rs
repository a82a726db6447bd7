//! Keeps the peer JWS keys in sync with the hub and hands them to the
//! connector.

use crate::machine::actions::{Action, ConfigFragment};
use crate::machine::chart::{go, on, state, Delay, Region, RegionId};
use crate::machine::event::{EventKind, Notice};
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::PeerJws, "fetchingPeerJWS")
        .on(on(EventKind::RequestPeerJws, go("notifyingPeerJWS")))
        .state(state("fetchingPeerJWS").emit(Notice::FetchingPeerJws).invoke(
            OpKind::FetchPeerJws,
            vec![go("comparingPeerJWS")],
            vec![go("retry")],
        ))
        .state(
            state("comparingPeerJWS")
                .emit(Notice::ComparingPeerJws)
                .always(
                    go("notifyingPeerJWS")
                        .when(Guard::PeerJwsChanged)
                        .then(Action::MergePeerJws)
                        .then(Action::Configure(ConfigFragment::PeerJwsKeys)),
                )
                .always(
                    go("completed")
                        .when(Guard::PeerJwsNeverSynced)
                        .then(Action::MarkPeerJwsSynced),
                )
                .always(go("retry").emit(Notice::NoPeerJwsChanges)),
        )
        .state(state("notifyingPeerJWS").emit(Notice::NotifyingPeerJws).invoke(
            OpKind::NotifyPeerJws,
            vec![go("completed")],
            vec![go("completed")],
        ))
        .state(
            state("completed")
                .emit(Notice::CompletingPeerJws)
                .always(go("retry").emit(Notice::PeerJwsConfigured)),
        )
        .state(state("retry").after(Delay::Refresh, "fetchingPeerJWS"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_changes_goes_straight_to_retry() {
        let region = region();
        let comparing = region.node("comparingPeerJWS").unwrap();
        let fallback = comparing.always.last().unwrap();
        assert!(fallback.guard.is_none());
        assert_eq!(fallback.target, Some("retry"));
        assert_eq!(fallback.actions, vec![Action::Emit(Notice::NoPeerJwsChanges)]);
    }
}
