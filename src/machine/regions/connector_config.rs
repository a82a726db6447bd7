//! Accumulates connector configuration fragments and pushes the merged
//! result to the connector.

use crate::machine::actions::Action;
use crate::machine::chart::{go, on, state, Region, RegionId};
use crate::machine::event::EventKind;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::ConnectorConfig, "idle")
        .on(on(
            EventKind::UpdateConnectorConfig,
            go("updatingConfig").then(Action::MergeConnectorConfig),
        ))
        .state(state("idle"))
        .state(state("updatingConfig").invoke(
            OpKind::PushConnectorConfig,
            vec![go("idle")],
            vec![go("idle")],
        ))
}
