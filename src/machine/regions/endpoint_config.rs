//! Publishes the configured egress IPs and callback URL to the hub.

use crate::machine::actions::Action;
use crate::machine::chart::{go, state, Delay, Region, RegionId};
use crate::machine::event::Notice;
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::EndpointConfig, "checkingChanges")
        .state(
            state("checkingChanges")
                .emit(Notice::CheckingEndpointConfig)
                .always(go("propagating").when(Guard::EndpointConfigChanged))
                .always(go("completed")),
        )
        .state(state("propagating").emit(Notice::PropagatingEndpointConfig).join(
            vec![
                ("uploadingWhitelistIP", OpKind::UploadIpWhitelist),
                ("uploadingCallbackURL", OpKind::UploadCallbackUrl),
            ],
            vec![go("completed").then(Action::AssignEndpointConfig)],
            vec![go("retry")],
        ))
        .state(state("completed").always(go("retry").emit(Notice::EndpointConfigPropagated)))
        .state(state("retry").after(Delay::Refresh, "checkingChanges"))
}
