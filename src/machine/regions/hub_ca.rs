//! Keeps the hub CA current.

use crate::machine::actions::{Action, ConfigFragment};
use crate::machine::chart::{go, state, Delay, Region, RegionId};
use crate::machine::event::Notice;
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::HubCa, "fetchingHubCA")
        .state(state("fetchingHubCA").emit(Notice::FetchingHubCa).invoke(
            OpKind::FetchHubCa,
            vec![
                go("retry")
                    .when(Guard::HubCaChanged)
                    .then(Action::AssignHubCa)
                    .then(Action::Configure(ConfigFragment::HubCa))
                    .emit(Notice::NewHubCaFetched),
                go("retry").when(Guard::HubCaExpiring).emit(Notice::HubCaExpiring),
                go("retry"),
            ],
            vec![go("retry")],
        ))
        .state(state("retry").after(Delay::Refresh, "fetchingHubCA"))
}
