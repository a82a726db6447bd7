//! Tracks which domains completed and reports once all of them have.
//!
//! The completion report is latched: it is sent once, and only again after
//! a failure was recorded and everything completed anew.

use crate::machine::actions::Action;
use crate::machine::chart::{go, on, state, Matcher, Region, RegionId};
use crate::machine::event::EventKind;
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::ProgressMonitor, "init")
        .on(on(EventKind::Failed, go("handlingChange").then(Action::RecordFailure)))
        .on(on(
            Matcher::Any,
            go("handlingChange")
                .when(Guard::TracksProgress)
                .then(Action::RecordProgress),
        ))
        .state(state("init").always(go("idle")))
        .state(state("idle"))
        .state(
            state("handlingChange")
                .always(go("notifyingCompleted").when(Guard::AllCompleted))
                .always(go("idle")),
        )
        .state(
            state("notifyingCompleted")
                .entry(Action::LatchCompletion)
                .invoke(OpKind::NotifyCompleted, vec![go("idle")], vec![go("idle")]),
        )
}
