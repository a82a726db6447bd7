//! Signs the client certificates the hub requests from this DFSP.

use crate::machine::actions::Action;
use crate::machine::chart::{go, on, state, Delay, Region, RegionId};
use crate::machine::event::{EventKind, Notice};
use crate::machine::guards::Guard;
use crate::machine::ops::OpKind;

pub fn region() -> Region {
    Region::new(RegionId::HubCert, "fetchingHubCSRs")
        .on(on(EventKind::CreateHubClientCert, go("fetchingHubCSRs")))
        .state(state("fetchingHubCSRs").emit(Notice::FetchingHubCsrs).invoke(
            OpKind::FetchHubCsrs,
            vec![
                go("signingHubCSRs").when(Guard::HubCsrsNeedSigning),
                go("retry")
                    .when(Guard::HubCertsChanged)
                    .then(Action::AssignHubCerts)
                    .emit(Notice::HubClientCertSigned),
                go("retry"),
            ],
            vec![go("retry")],
        ))
        .state(state("signingHubCSRs").emit(Notice::SigningHubCsrs).invoke(
            OpKind::SignHubCsrs,
            vec![go("retry")
                .then(Action::MergeHubCerts)
                .emit(Notice::HubClientCertSigned)],
            vec![go("retry")],
        ))
        .state(state("retry").after(Delay::Refresh, "fetchingHubCSRs"))
}
