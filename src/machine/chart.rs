//! The statechart definition.
//!
//! A chart is plain data: a list of regions running in parallel, each a
//! flat list of states. Guards, actions and invocations are referred to by
//! closed enums, so a chart can be serialized and hashed. The hash decides
//! whether a persisted snapshot still fits the running code.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::actions::Action;
use super::event::{EventKind, Notice};
use super::guards::Guard;
use super::ops::OpKind;
use super::regions;
use crate::api::status::Domain;
use crate::commons::error::Error;

//------------ RegionId ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionId {
    HubCa,
    DfspCa,
    DfspClientCert,
    DfspServerCert,
    HubCert,
    PeerJws,
    UploadPeerJws,
    DfspJws,
    EndpointConfig,
    ConnectorConfig,
    ProgressMonitor,
}

impl RegionId {
    /// The name reported in `FAILED` events.
    pub fn machine_name(self) -> &'static str {
        match self.domain() {
            Some(domain) => domain.as_str(),
            None => match self {
                RegionId::ConnectorConfig => "CONNECTOR_CONFIG",
                _ => "PROGRESS_MONITOR",
            },
        }
    }

    pub fn domain(self) -> Option<Domain> {
        match self {
            RegionId::HubCa => Some(Domain::HubCa),
            RegionId::DfspCa => Some(Domain::DfspCa),
            RegionId::DfspClientCert => Some(Domain::DfspClientCert),
            RegionId::DfspServerCert => Some(Domain::DfspServerCert),
            RegionId::HubCert => Some(Domain::HubCert),
            RegionId::PeerJws => Some(Domain::PeerJws),
            RegionId::UploadPeerJws => Some(Domain::UploadPeerJws),
            RegionId::DfspJws => Some(Domain::DfspJws),
            RegionId::EndpointConfig => Some(Domain::EndpointConfig),
            RegionId::ConnectorConfig | RegionId::ProgressMonitor => None,
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.machine_name())
    }
}

//------------ Matcher -------------------------------------------------------

/// What an `on` handler listens to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Matcher {
    Kind(EventKind),
    Any,
}

impl Matcher {
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            Matcher::Kind(expected) => expected == kind,
            Matcher::Any => true,
        }
    }
}

impl From<EventKind> for Matcher {
    fn from(kind: EventKind) -> Self {
        Matcher::Kind(kind)
    }
}

impl From<Notice> for Matcher {
    fn from(notice: Notice) -> Self {
        Matcher::Kind(EventKind::Notice(notice))
    }
}

//------------ Transition ----------------------------------------------------

/// A guarded move to `target`, running `actions` on the way.
///
/// Without a target the actions run and the region stays where it is.
#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<&'static str>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// A transition to `target`.
pub fn go(target: &'static str) -> Transition {
    Transition {
        guard: None,
        target: Some(target),
        actions: Vec::new(),
    }
}

/// A transition that only runs actions.
pub fn stay() -> Transition {
    Transition {
        guard: None,
        target: None,
        actions: Vec::new(),
    }
}

impl Transition {
    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn emit(self, notice: Notice) -> Self {
        self.then(Action::Emit(notice))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct On {
    pub event: Matcher,
    pub transition: Transition,
}

pub fn on(event: impl Into<Matcher>, transition: Transition) -> On {
    On {
        event: event.into(),
        transition,
    }
}

//------------ Invoke --------------------------------------------------------

/// A call to a collaborator, started on entering the state.
#[derive(Clone, Debug, Serialize)]
pub struct Invoke {
    pub op: OpKind,
    pub on_done: Vec<Transition>,
    pub on_error: Vec<Transition>,
}

/// Several calls run side by side. The state is done when all of them are,
/// and fails as soon as one of them does.
#[derive(Clone, Debug, Serialize)]
pub struct Join {
    pub branches: Vec<(&'static str, OpKind)>,
    pub on_done: Vec<Transition>,
    pub on_error: Vec<Transition>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Delay {
    Refresh,
}

#[derive(Clone, Debug, Serialize)]
pub struct After {
    pub delay: Delay,
    pub target: &'static str,
}

//------------ StateNode -----------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct StateNode {
    pub id: &'static str,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<Action>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<Transition>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<On>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoke: Option<Invoke>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<After>,
}

pub fn state(id: &'static str) -> StateNode {
    StateNode {
        id,
        entry: Vec::new(),
        always: Vec::new(),
        on: Vec::new(),
        invoke: None,
        join: None,
        after: None,
    }
}

impl StateNode {
    pub fn entry(mut self, action: Action) -> Self {
        self.entry.push(action);
        self
    }

    pub fn emit(self, notice: Notice) -> Self {
        self.entry(Action::Emit(notice))
    }

    pub fn always(mut self, transition: Transition) -> Self {
        self.always.push(transition);
        self
    }

    pub fn on(mut self, handler: On) -> Self {
        self.on.push(handler);
        self
    }

    pub fn invoke(mut self, op: OpKind, on_done: Vec<Transition>, on_error: Vec<Transition>) -> Self {
        self.invoke = Some(Invoke { op, on_done, on_error });
        self
    }

    pub fn join(
        mut self,
        branches: Vec<(&'static str, OpKind)>,
        on_done: Vec<Transition>,
        on_error: Vec<Transition>,
    ) -> Self {
        self.join = Some(Join {
            branches,
            on_done,
            on_error,
        });
        self
    }

    pub fn after(mut self, delay: Delay, target: &'static str) -> Self {
        self.after = Some(After { delay, target });
        self
    }
}

//------------ Region --------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct Region {
    pub id: RegionId,
    pub initial: &'static str,

    /// Handlers active in every state of the region.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<On>,

    pub states: Vec<StateNode>,
}

impl Region {
    pub fn new(id: RegionId, initial: &'static str) -> Self {
        Region {
            id,
            initial,
            on: Vec::new(),
            states: Vec::new(),
        }
    }

    pub fn on(mut self, handler: On) -> Self {
        self.on.push(handler);
        self
    }

    pub fn state(mut self, node: StateNode) -> Self {
        self.states.push(node);
        self
    }

    pub fn node(&self, id: &str) -> Option<&StateNode> {
        self.states.iter().find(|node| node.id == id)
    }

    fn targets(&self) -> impl Iterator<Item = &'static str> + '_ {
        let handlers = self
            .on
            .iter()
            .chain(self.states.iter().flat_map(|node| node.on.iter()))
            .map(|handler| &handler.transition);
        let others = self.states.iter().flat_map(|node| {
            let invoke = node
                .invoke
                .iter()
                .flat_map(|invoke| invoke.on_done.iter().chain(invoke.on_error.iter()));
            let join = node
                .join
                .iter()
                .flat_map(|join| join.on_done.iter().chain(join.on_error.iter()));
            node.always.iter().chain(invoke).chain(join)
        });
        let after = self.states.iter().filter_map(|node| node.after.as_ref().map(|after| after.target));

        handlers
            .chain(others)
            .filter_map(|transition| transition.target)
            .chain(after)
            .chain(std::iter::once(self.initial))
    }
}

//------------ Chart ---------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct Chart {
    pub regions: Vec<Region>,
}

impl Chart {
    /// The connection manager's chart.
    pub fn build() -> Result<Self, Error> {
        let chart = Chart {
            regions: vec![
                regions::peer_jws::region(),
                regions::upload_peer_jws::region(),
                regions::dfsp_jws::region(),
                regions::hub_ca::region(),
                regions::dfsp_ca::region(),
                regions::dfsp_client_cert::region(),
                regions::dfsp_server_cert::region(),
                regions::hub_cert::region(),
                regions::endpoint_config::region(),
                regions::connector_config::region(),
                regions::progress_monitor::region(),
            ],
        };
        chart.verify()?;
        Ok(chart)
    }

    /// Checks that every target names a state of its own region.
    pub fn verify(&self) -> Result<(), Error> {
        for region in &self.regions {
            for target in region.targets() {
                if region.node(target).is_none() {
                    return Err(Error::custom(format!(
                        "region {} refers to unknown state '{}'",
                        region.id, target
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn region(&self, id: RegionId) -> Option<(usize, &Region)> {
        self.regions.iter().enumerate().find(|(_, region)| region.id == id)
    }

    /// A digest of the serialized definition, base64 encoded.
    pub fn hash(&self) -> Result<String, Error> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(openssl::sha::sha256(&json)))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_is_consistent() {
        let chart = Chart::build().unwrap();
        assert_eq!(chart.regions.len(), 11);

        let mut ids: Vec<RegionId> = chart.regions.iter().map(|r| r.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 11);
    }

    #[test]
    fn hash_is_stable() {
        let first = Chart::build().unwrap().hash().unwrap();
        let second = Chart::build().unwrap().hash().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hash_follows_definition() {
        let chart = Chart::build().unwrap();
        let mut changed = chart.clone();
        changed.regions[0].states.push(state("extra"));
        assert_ne!(chart.hash().unwrap(), changed.hash().unwrap());
    }

    #[test]
    fn verify_rejects_unknown_target() {
        let chart = Chart {
            regions: vec![Region::new(RegionId::HubCa, "idle").state(state("idle").always(go("nowhere")))],
        };
        assert!(chart.verify().is_err());
    }
}
