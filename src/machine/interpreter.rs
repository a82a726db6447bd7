//! Runs a [`Chart`].
//!
//! The interpreter is synchronous and owns no tasks. Feeding it an
//! [`Input`] moves the regions and returns the [`Effect`]s the caller has
//! to carry out: calls to start and timers to start or cancel. Their
//! outcomes come back as further inputs.
//!
//! Every region state entered gets a new generation number. Completions
//! and timers carry the generation they were started in, so anything that
//! arrives after its region moved on is recognised as stale and ignored.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};

use super::actions::Action;
use super::chart::{Chart, Delay, Region, RegionId, Transition};
use super::context::Context;
use super::event::Event;
use super::guards::Scope;
use super::ops::{OpKind, Operation, Output};
use super::settings::Settings;
use super::Cause;
use crate::commons::error::Error;
use crate::constants::MAX_EVENTLESS_STEPS;

/// Raised events handled in one step before the interpreter assumes a
/// feedback loop.
const MAX_RAISED_EVENTS: usize = 1_000;

//------------ TimerId -------------------------------------------------------

pub type TimerId = String;

//------------ MachineState --------------------------------------------------

/// Where every region is, plus the shared context.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MachineState {
    pub regions: Vec<RegionState>,
    pub context: Context,
}

impl MachineState {
    pub fn region(&self, id: RegionId) -> Option<&RegionState> {
        self.regions.iter().find(|region| region.region == id)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionState {
    pub region: RegionId,

    pub state: String,

    pub generation: u64,

    /// Calls started in this state that have not finished yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<Invocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerId>,
}

/// A call started by a region.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub region: RegionId,

    pub generation: u64,

    /// The branch of a join, if the state runs several calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    pub state: String,

    pub operation: Operation,
}

/// A pending delayed transition.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerDescriptor {
    pub region: RegionId,
    pub generation: u64,
    pub target: String,
    pub fire_at: DateTime<Utc>,
}

//------------ Input ---------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Event(Event),
    Done(Completion),
    Timer(TimerId),
}

impl From<Event> for Input {
    fn from(event: Event) -> Self {
        Input::Event(event)
    }
}

/// The outcome of an [`Invocation`].
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub region: RegionId,
    pub generation: u64,
    pub branch: Option<String>,
    pub result: Result<Output, String>,
}

impl Completion {
    pub fn of(invocation: &Invocation, result: Result<Output, String>) -> Self {
        Completion {
            region: invocation.region,
            generation: invocation.generation,
            branch: invocation.branch.clone(),
            result,
        }
    }
}

//------------ Effect --------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Invoke(Invocation),
    StartTimer { id: TimerId, delay: Duration },
    CancelTimer(TimerId),
}

//------------ Step ----------------------------------------------------------

struct Step {
    now: DateTime<Utc>,
    effects: Vec<Effect>,
    raised: Vec<Event>,
}

impl Step {
    fn new(now: DateTime<Utc>) -> Self {
        Step {
            now,
            effects: Vec::new(),
            raised: Vec::new(),
        }
    }
}

//------------ Interpreter ---------------------------------------------------

pub struct Interpreter {
    chart: Arc<Chart>,
    settings: Arc<Settings>,
    state: MachineState,
    timers: BTreeMap<TimerId, TimerDescriptor>,
}

impl Interpreter {
    /// Enters the initial state of every region with an empty context.
    pub fn start(chart: Arc<Chart>, settings: Arc<Settings>, now: DateTime<Utc>) -> (Self, Vec<Effect>) {
        let regions = chart
            .regions
            .iter()
            .map(|region| RegionState {
                region: region.id,
                state: String::new(),
                generation: 0,
                invocations: Vec::new(),
                timer: None,
            })
            .collect();

        let mut interpreter = Interpreter {
            chart: chart.clone(),
            settings,
            state: MachineState {
                regions,
                context: Context::new(now),
            },
            timers: BTreeMap::new(),
        };

        let mut step = Step::new(now);
        for (index, region) in chart.regions.iter().enumerate() {
            interpreter.enter(index, region, region.initial, &Cause::Start, &mut step, 0);
        }
        interpreter.drain(&mut step);
        (interpreter, step.effects)
    }

    /// Continues from persisted state.
    ///
    /// Calls that were in flight are issued again and timers are started
    /// with whatever is left of their delay.
    pub fn restore(
        chart: Arc<Chart>,
        settings: Arc<Settings>,
        state: MachineState,
        timers: BTreeMap<TimerId, TimerDescriptor>,
        now: DateTime<Utc>,
    ) -> Result<(Self, Vec<Effect>), Error> {
        if state.regions.len() != chart.regions.len() {
            return Err(Error::snapshot(format!(
                "expected {} regions, found {}",
                chart.regions.len(),
                state.regions.len()
            )));
        }
        for (region, status) in chart.regions.iter().zip(&state.regions) {
            if region.id != status.region {
                return Err(Error::snapshot(format!(
                    "expected region {}, found {}",
                    region.id, status.region
                )));
            }
            if region.node(&status.state).is_none() {
                return Err(Error::snapshot(format!(
                    "region {} has no state '{}'",
                    region.id, status.state
                )));
            }
        }

        let mut effects: Vec<Effect> = state
            .regions
            .iter()
            .flat_map(|status| status.invocations.iter().cloned().map(Effect::Invoke))
            .collect();

        let mut interpreter = Interpreter {
            chart: chart.clone(),
            settings,
            state,
            timers: BTreeMap::new(),
        };

        for (id, timer) in timers {
            let armed = interpreter
                .state
                .region(timer.region)
                .is_some_and(|status| status.timer.as_ref() == Some(&id) && status.generation == timer.generation);
            if armed {
                let delay = (timer.fire_at - now).to_std().unwrap_or(Duration::ZERO);
                effects.push(Effect::StartTimer { id: id.clone(), delay });
                interpreter.timers.insert(id, timer);
            } else {
                debug!("Dropping timer {} of a region that moved on", id);
            }
        }

        // A region waiting on a timer that was not persisted would wait
        // forever, so give it a fresh one.
        for (index, region) in chart.regions.iter().enumerate() {
            let status = &interpreter.state.regions[index];
            let Some(id) = status.timer.clone() else { continue };
            if interpreter.timers.contains_key(&id) {
                continue;
            }
            let Some(after) = region.node(&status.state).and_then(|node| node.after.as_ref()) else {
                interpreter.state.regions[index].timer = None;
                continue;
            };
            warn!("Timer {} of region {} was lost, starting it again", id, region.id);
            let delay = interpreter.delay(after.delay);
            interpreter.timers.insert(
                id.clone(),
                TimerDescriptor {
                    region: region.id,
                    generation: status.generation,
                    target: after.target.to_string(),
                    fire_at: now + to_chrono(delay),
                },
            );
            effects.push(Effect::StartTimer { id, delay });
        }

        Ok((interpreter, effects))
    }

    /// Processes one input, including all events raised while doing so.
    pub fn handle(&mut self, input: Input, now: DateTime<Utc>) -> Vec<Effect> {
        let mut step = Step::new(now);
        match input {
            Input::Event(event) => self.broadcast(&event, &mut step),
            Input::Done(completion) => self.complete(completion, &mut step),
            Input::Timer(id) => self.fire(&id, &mut step),
        }
        self.drain(&mut step);
        step.effects
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn context(&self) -> &Context {
        &self.state.context
    }

    pub fn timers(&self) -> &BTreeMap<TimerId, TimerDescriptor> {
        &self.timers
    }

    /// The current state of a region.
    pub fn region_state(&self, id: RegionId) -> Option<&str> {
        self.state.region(id).map(|status| status.state.as_str())
    }

    fn drain(&mut self, step: &mut Step) {
        let mut queue = VecDeque::new();
        let mut handled = 0;
        loop {
            queue.extend(step.raised.drain(..));
            let Some(event) = queue.pop_front() else { break };
            if handled >= MAX_RAISED_EVENTS {
                error!("Too many raised events in one step, dropping {} and {} more", event, queue.len());
                break;
            }
            handled += 1;
            self.broadcast(&event, step);
        }
    }

    fn broadcast(&mut self, event: &Event, step: &mut Step) {
        trace!("Broadcasting {}", event);
        let chart = self.chart.clone();
        let cause = Cause::Event(event);
        let kind = event.kind();

        for (index, region) in chart.regions.iter().enumerate() {
            let node = region.node(&self.state.regions[index].state);
            let found = node
                .into_iter()
                .flat_map(|node| node.on.iter())
                .chain(region.on.iter())
                .filter(|handler| handler.event.matches(kind))
                .map(|handler| &handler.transition)
                .find(|transition| self.allowed(transition, &cause, step.now));

            if let Some(transition) = found {
                self.take(index, region, transition, &cause, step, 0);
            }
        }
    }

    fn complete(&mut self, completion: Completion, step: &mut Step) {
        let chart = self.chart.clone();
        let Some((index, region)) = chart.region(completion.region) else {
            warn!("Completion for unknown region {}", completion.region);
            return;
        };

        let status = &mut self.state.regions[index];
        if status.generation != completion.generation {
            debug!(
                "Ignoring stale completion for {} (generation {}, now {})",
                region.id, completion.generation, status.generation
            );
            return;
        }
        let Some(position) = status
            .invocations
            .iter()
            .position(|invocation| invocation.branch == completion.branch)
        else {
            debug!("Ignoring completion for {} without a matching call", region.id);
            return;
        };
        status.invocations.remove(position);
        let waiting = !status.invocations.is_empty();

        let Some(node) = region.node(&status.state) else {
            return;
        };

        let (transitions, cause) = match &completion.result {
            Ok(output) => {
                let transitions = match (&node.invoke, &node.join) {
                    (_, Some(_)) if waiting => return,
                    (_, Some(join)) => &join.on_done,
                    (Some(invoke), None) => &invoke.on_done,
                    (None, None) => return,
                };
                (transitions, Cause::Done(output))
            }
            Err(msg) => {
                debug!("Call in {}.{} failed: {}", region.id, node.id, msg);
                let transitions = match (&node.invoke, &node.join) {
                    (_, Some(join)) => &join.on_error,
                    (Some(invoke), None) => &invoke.on_error,
                    (None, None) => return,
                };
                (transitions, Cause::Error(msg))
            }
        };

        match self.select(transitions, &cause, step.now) {
            Some(transition) => self.take(index, region, transition, &cause, step, 0),
            None => warn!("No transition for {} in {}.{}", cause, region.id, node.id),
        }
    }

    fn fire(&mut self, id: &str, step: &mut Step) {
        let Some(timer) = self.timers.remove(id) else {
            debug!("Ignoring cancelled timer {}", id);
            return;
        };
        let chart = self.chart.clone();
        let Some((index, region)) = chart.region(timer.region) else {
            return;
        };

        let status = &mut self.state.regions[index];
        if status.generation != timer.generation || status.timer.as_deref() != Some(id) {
            debug!("Ignoring stale timer {}", id);
            return;
        }
        status.timer = None;

        match region.node(&timer.target) {
            Some(node) => self.enter(index, region, node.id, &Cause::Timer, step, 0),
            None => error!("Timer {} targets unknown state {}", id, timer.target),
        }
    }

    fn allowed(&self, transition: &Transition, cause: &Cause, now: DateTime<Utc>) -> bool {
        match transition.guard {
            None => true,
            Some(guard) => {
                let scope = Scope {
                    settings: &self.settings,
                    cause,
                    now,
                };
                guard.check(&self.state.context, &scope)
            }
        }
    }

    fn select<'t>(&self, transitions: &'t [Transition], cause: &Cause, now: DateTime<Utc>) -> Option<&'t Transition> {
        transitions
            .iter()
            .find(|transition| self.allowed(transition, cause, now))
    }

    fn take(
        &mut self,
        index: usize,
        region: &Region,
        transition: &Transition,
        cause: &Cause,
        step: &mut Step,
        depth: usize,
    ) {
        for action in &transition.actions {
            self.run(*action, cause, step);
        }
        if let Some(target) = transition.target {
            self.enter(index, region, target, cause, step, depth);
        }
    }

    fn run(&mut self, action: Action, cause: &Cause, step: &mut Step) {
        let scope = Scope {
            settings: &self.settings,
            cause,
            now: step.now,
        };
        action.run(&mut self.state.context, &scope, &mut step.raised);
    }

    fn prepare(&self, op: OpKind, cause: &Cause, now: DateTime<Utc>) -> Result<Operation, Error> {
        let scope = Scope {
            settings: &self.settings,
            cause,
            now,
        };
        op.prepare(&self.state.context, &scope)
    }

    fn delay(&self, delay: Delay) -> Duration {
        match delay {
            Delay::Refresh => self.settings.refresh_interval,
        }
    }

    fn enter(
        &mut self,
        index: usize,
        region: &Region,
        target: &'static str,
        cause: &Cause,
        step: &mut Step,
        depth: usize,
    ) {
        let Some(node) = region.node(target) else {
            error!("Region {} has no state '{}'", region.id, target);
            return;
        };

        let status = &mut self.state.regions[index];
        if let Some(timer) = status.timer.take() {
            self.timers.remove(&timer);
            step.effects.push(Effect::CancelTimer(timer));
        }
        status.invocations.clear();
        status.generation += 1;
        status.state = target.to_string();
        let generation = status.generation;
        debug!("{} -> {} ({})", region.id, target, cause);

        for action in &node.entry {
            self.run(*action, cause, step);
        }

        if !node.always.is_empty() {
            if depth >= MAX_EVENTLESS_STEPS {
                error!("Region {} keeps moving without events, stopping in {}", region.id, target);
                return;
            }
            if let Some(transition) = self.select(&node.always, cause, step.now) {
                self.take(index, region, transition, cause, step, depth + 1);
                return;
            }
        }

        if let Some(invoke) = &node.invoke {
            match self.prepare(invoke.op, cause, step.now) {
                Ok(operation) => self.invoke(index, region.id, generation, None, target, operation, step),
                Err(err) => {
                    warn!("Cannot start {:?} in {}.{}: {}", invoke.op, region.id, target, err);
                    self.fail(index, region, &invoke.on_error, &err, step, depth);
                    return;
                }
            }
        }

        if let Some(join) = &node.join {
            let mut prepared = Vec::with_capacity(join.branches.len());
            for (branch, op) in &join.branches {
                match self.prepare(*op, cause, step.now) {
                    Ok(operation) => prepared.push((*branch, operation)),
                    Err(err) => {
                        warn!("Cannot start {} in {}.{}: {}", branch, region.id, target, err);
                        self.fail(index, region, &join.on_error, &err, step, depth);
                        return;
                    }
                }
            }
            for (branch, operation) in prepared {
                self.invoke(index, region.id, generation, Some(branch), target, operation, step);
            }
        }

        if let Some(after) = &node.after {
            let delay = self.delay(after.delay);
            let id = format!("{}.{}#{}", region.id, target, generation);
            self.timers.insert(
                id.clone(),
                TimerDescriptor {
                    region: region.id,
                    generation,
                    target: after.target.to_string(),
                    fire_at: step.now + to_chrono(delay),
                },
            );
            self.state.regions[index].timer = Some(id.clone());
            step.effects.push(Effect::StartTimer { id, delay });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &mut self,
        index: usize,
        region: RegionId,
        generation: u64,
        branch: Option<&str>,
        state: &str,
        operation: Operation,
        step: &mut Step,
    ) {
        let invocation = Invocation {
            region,
            generation,
            branch: branch.map(str::to_string),
            state: state.to_string(),
            operation,
        };
        self.state.regions[index].invocations.push(invocation.clone());
        step.effects.push(Effect::Invoke(invocation));
    }

    fn fail(
        &mut self,
        index: usize,
        region: &Region,
        on_error: &[Transition],
        err: &Error,
        step: &mut Step,
        depth: usize,
    ) {
        let msg = err.to_string();
        let cause = Cause::Error(&msg);
        if depth >= MAX_EVENTLESS_STEPS {
            error!("Region {} keeps failing without events", region.id);
            return;
        }
        if let Some(transition) = self.select(on_error, &cause, step.now) {
            self.take(index, region, transition, &cause, step, depth + 1);
        }
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::status::{Domain, ProgressState};
    use crate::api::{EndpointConfig, HubCa, IpEntry, Jws};
    use crate::machine::event::{Failure, Notice};

    fn chart() -> Arc<Chart> {
        Arc::new(Chart::build().unwrap())
    }

    fn settings() -> Settings {
        Settings::new("dfsp1")
    }

    fn now() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    fn invocations(effects: &[Effect], region: RegionId) -> Vec<Invocation> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Invoke(invocation) if invocation.region == region => Some(invocation.clone()),
                _ => None,
            })
            .collect()
    }

    fn timers(effects: &[Effect]) -> Vec<(TimerId, Duration)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::StartTimer { id, delay } => Some((id.clone(), *delay)),
                _ => None,
            })
            .collect()
    }

    fn hub_ca() -> HubCa {
        HubCa {
            root_certificate: "HUB ROOT".to_string(),
            intermediate_chain: None,
            not_after: Some(now() + chrono::Duration::days(365)),
        }
    }

    fn done(invocation: &Invocation, output: Output) -> Input {
        Input::Done(Completion::of(invocation, Ok(output)))
    }

    #[test]
    fn start_enters_every_region() {
        let (interpreter, effects) = Interpreter::start(chart(), Arc::new(settings()), now());

        assert_eq!(interpreter.region_state(RegionId::HubCa), Some("fetchingHubCA"));
        assert_eq!(interpreter.region_state(RegionId::DfspCa), Some("creatingIntCA"));
        assert_eq!(interpreter.region_state(RegionId::DfspClientCert), Some("creatingDfspCSR"));
        assert_eq!(interpreter.region_state(RegionId::DfspServerCert), Some("checkingDfspServerCert"));
        assert_eq!(interpreter.region_state(RegionId::HubCert), Some("fetchingHubCSRs"));
        assert_eq!(interpreter.region_state(RegionId::PeerJws), Some("fetchingPeerJWS"));
        assert_eq!(interpreter.region_state(RegionId::UploadPeerJws), Some("idle"));
        assert_eq!(interpreter.region_state(RegionId::DfspJws), Some("creating"));
        assert_eq!(interpreter.region_state(RegionId::EndpointConfig), Some("retry"));
        assert_eq!(interpreter.region_state(RegionId::ConnectorConfig), Some("idle"));
        assert_eq!(interpreter.region_state(RegionId::ProgressMonitor), Some("idle"));

        let hub = invocations(&effects, RegionId::HubCa);
        assert_eq!(hub.len(), 1);
        assert_eq!(hub[0].operation, Operation::FetchHubCa);

        // Nothing to propagate, so the endpoint domain completes right away.
        let progress = &interpreter.context().progress_monitor.progress;
        assert_eq!(progress.get(Domain::EndpointConfig).unwrap().status, ProgressState::Completed);
        assert_eq!(progress.get(Domain::HubCa).unwrap().status, ProgressState::Pending);
    }

    #[test]
    fn done_assigns_and_schedules_recheck() {
        let (mut interpreter, effects) = Interpreter::start(chart(), Arc::new(settings()), now());
        let fetch = invocations(&effects, RegionId::HubCa).remove(0);

        let effects = interpreter.handle(done(&fetch, Output::HubCa(hub_ca())), now());

        assert_eq!(interpreter.region_state(RegionId::HubCa), Some("retry"));
        assert_eq!(interpreter.context().hub_ca, Some(hub_ca()));

        let started = timers(&effects);
        assert_eq!(started.len(), 1);
        assert!(started[0].0.starts_with("HUB_CA.retry#"));
        assert_eq!(started[0].1, Duration::from_secs(60));

        // The raised fragment reaches the connector region in the same step.
        assert_eq!(interpreter.region_state(RegionId::ConnectorConfig), Some("updatingConfig"));
        assert_eq!(invocations(&effects, RegionId::ConnectorConfig).len(), 1);
        assert_eq!(
            interpreter.context().progress_monitor.progress.get(Domain::HubCa).unwrap().status,
            ProgressState::Completed
        );

        let effects = interpreter.handle(Input::Timer(started[0].0.clone()), now());
        assert_eq!(interpreter.region_state(RegionId::HubCa), Some("fetchingHubCA"));
        assert_eq!(invocations(&effects, RegionId::HubCa).len(), 1);
    }

    #[test]
    fn unchanged_hub_ca_is_not_configured_again() {
        let (mut interpreter, effects) = Interpreter::start(chart(), Arc::new(settings()), now());
        let fetch = invocations(&effects, RegionId::HubCa).remove(0);
        let effects = interpreter.handle(done(&fetch, Output::HubCa(hub_ca())), now());
        let (timer, _) = timers(&effects).remove(0);

        let effects = interpreter.handle(Input::Timer(timer), now());
        let fetch = invocations(&effects, RegionId::HubCa).remove(0);
        let effects = interpreter.handle(done(&fetch, Output::HubCa(hub_ca())), now());

        assert_eq!(interpreter.region_state(RegionId::HubCa), Some("retry"));
        assert!(invocations(&effects, RegionId::ConnectorConfig).is_empty());
    }

    fn key(dfsp_id: &str, public_key: &str, created_at: i64) -> Jws {
        Jws {
            dfsp_id: dfsp_id.to_string(),
            public_key: public_key.to_string(),
            created_at,
        }
    }

    /// Fires the pending PeerJWS recheck and answers the fetch with `keys`.
    fn refetch_peer_jws(interpreter: &mut Interpreter, effects: &[Effect], keys: Vec<Jws>) -> Vec<Effect> {
        let (timer, _) = timers(effects)
            .into_iter()
            .find(|(id, _)| id.starts_with("PEER_JWS.retry#"))
            .unwrap();
        let effects = interpreter.handle(Input::Timer(timer), now());
        let fetch = invocations(&effects, RegionId::PeerJws).remove(0);
        interpreter.handle(done(&fetch, Output::PeerJws(keys)), now())
    }

    #[test]
    fn peer_jws_older_or_same_age_keys_are_ignored() {
        let (mut interpreter, effects) = Interpreter::start(chart(), Arc::new(settings()), now());
        let fetch = invocations(&effects, RegionId::PeerJws).remove(0);
        let effects = interpreter.handle(done(&fetch, Output::PeerJws(vec![key("a", "new", 5)])), now());
        assert_eq!(interpreter.region_state(RegionId::PeerJws), Some("notifyingPeerJWS"));

        let notify = invocations(&effects, RegionId::PeerJws).remove(0);
        let effects = interpreter.handle(done(&notify, Output::Unit), now());
        assert_eq!(interpreter.region_state(RegionId::PeerJws), Some("retry"));

        let effects = refetch_peer_jws(&mut interpreter, &effects, vec![key("a", "old", 3)]);
        assert_eq!(interpreter.region_state(RegionId::PeerJws), Some("retry"));
        assert!(invocations(&effects, RegionId::PeerJws).is_empty());
        assert_eq!(interpreter.context().peer_jws, Some(vec![key("a", "new", 5)]));

        let effects = refetch_peer_jws(&mut interpreter, &effects, vec![key("a", "other", 5)]);
        assert_eq!(interpreter.region_state(RegionId::PeerJws), Some("retry"));
        assert!(invocations(&effects, RegionId::PeerJws).is_empty());
        assert_eq!(interpreter.context().peer_jws, Some(vec![key("a", "new", 5)]));

        let _ = refetch_peer_jws(&mut interpreter, &effects, vec![key("a", "newer", 6)]);
        assert_eq!(interpreter.region_state(RegionId::PeerJws), Some("notifyingPeerJWS"));
        assert_eq!(interpreter.context().peer_jws, Some(vec![key("a", "newer", 6)]));
    }

    #[test]
    fn stale_completion_is_ignored() {
        let (mut interpreter, effects) = Interpreter::start(chart(), Arc::new(settings()), now());
        let stale = invocations(&effects, RegionId::DfspCa).remove(0);

        let effects = interpreter.handle(Event::CreateIntCa { subject: None }.into(), now());
        let fresh = invocations(&effects, RegionId::DfspCa).remove(0);
        assert!(fresh.generation > stale.generation);

        let before = interpreter.state().clone();
        let effects = interpreter.handle(Input::Done(Completion::of(&stale, Err("late".to_string()))), now());
        assert!(effects.is_empty());
        assert_eq!(interpreter.state(), &before);
    }

    #[test]
    fn stale_timer_is_ignored() {
        let (mut interpreter, effects) = Interpreter::start(chart(), Arc::new(settings()), now());
        let fetch = invocations(&effects, RegionId::HubCert).remove(0);
        let effects = interpreter.handle(done(&fetch, Output::HubCsrs(Vec::new())), now());
        let (timer, _) = timers(&effects).remove(0);

        // Forcing a refetch cancels the pending recheck.
        let effects = interpreter.handle(Event::CreateHubClientCert.into(), now());
        assert!(effects.contains(&Effect::CancelTimer(timer.clone())));
        assert!(!interpreter.timers().contains_key(&timer));

        let before = interpreter.state().clone();
        assert!(interpreter.handle(Input::Timer(timer), now()).is_empty());
        assert_eq!(interpreter.state(), &before);
    }

    #[test]
    fn join_waits_for_all_branches() {
        let mut settings = settings();
        settings.endpoint_config = EndpointConfig {
            ips: vec![IpEntry {
                address: "10.0.0.1/32".to_string(),
                ports: vec!["443".to_string()],
            }],
            callback_url: Some("https://dfsp1.example.com".to_string()),
        };
        let (mut interpreter, effects) = Interpreter::start(chart(), Arc::new(settings.clone()), now());
        assert_eq!(interpreter.region_state(RegionId::EndpointConfig), Some("propagating"));

        let branches = invocations(&effects, RegionId::EndpointConfig);
        assert_eq!(branches.len(), 2);

        interpreter.handle(done(&branches[0], Output::Unit), now());
        assert_eq!(interpreter.region_state(RegionId::EndpointConfig), Some("propagating"));
        assert_eq!(interpreter.context().endpoint_config, None);

        interpreter.handle(done(&branches[1], Output::Unit), now());
        assert_eq!(interpreter.region_state(RegionId::EndpointConfig), Some("retry"));
        assert_eq!(interpreter.context().endpoint_config, Some(settings.endpoint_config));
    }

    #[test]
    fn join_fails_on_first_error() {
        let mut settings = settings();
        settings.endpoint_config.callback_url = Some("https://dfsp1.example.com".to_string());
        let (mut interpreter, effects) = Interpreter::start(chart(), Arc::new(settings), now());

        let branches = invocations(&effects, RegionId::EndpointConfig);
        interpreter.handle(Input::Done(Completion::of(&branches[1], Err("hub down".to_string()))), now());
        assert_eq!(interpreter.region_state(RegionId::EndpointConfig), Some("retry"));

        // The surviving branch completes into a region that moved on.
        let before = interpreter.state().clone();
        interpreter.handle(done(&branches[0], Output::Unit), now());
        assert_eq!(interpreter.state(), &before);
    }

    #[test]
    fn restore_reissues_calls_and_remaining_timers() {
        let chart = chart();
        let settings = Arc::new(settings());
        let (mut interpreter, effects) = Interpreter::start(chart.clone(), settings.clone(), now());
        let fetch = invocations(&effects, RegionId::HubCa).remove(0);
        interpreter.handle(done(&fetch, Output::HubCa(hub_ca())), now());

        let state = interpreter.state().clone();
        let pending = interpreter.timers().clone();
        let later = now() + chrono::Duration::seconds(45);

        let (restored, effects) = Interpreter::restore(chart, settings, state.clone(), pending, later).unwrap();
        assert_eq!(restored.state(), &state);

        // The client CSR was still being created when the snapshot was taken.
        let client = invocations(&effects, RegionId::DfspClientCert);
        assert_eq!(client.len(), 1);
        assert_eq!(client[0].state, "creatingDfspCSR");

        let hub_timer = timers(&effects)
            .into_iter()
            .find(|(id, _)| id.starts_with("HUB_CA."))
            .unwrap();
        assert_eq!(hub_timer.1, Duration::from_secs(15));
    }

    #[test]
    fn restore_rejects_unknown_state() {
        let chart = chart();
        let settings = Arc::new(settings());
        let (interpreter, _) = Interpreter::start(chart.clone(), settings.clone(), now());

        let mut state = interpreter.state().clone();
        state.regions[0].state = "renamedState".to_string();
        assert!(Interpreter::restore(chart, settings, state, BTreeMap::new(), now()).is_err());
    }

    #[test]
    fn restore_drops_orphaned_timers() {
        let chart = chart();
        let settings = Arc::new(settings());
        let (interpreter, _) = Interpreter::start(chart.clone(), settings.clone(), now());

        let mut pending = interpreter.timers().clone();
        pending.insert(
            "HUB_CA.retry#0".to_string(),
            TimerDescriptor {
                region: RegionId::HubCa,
                generation: 0,
                target: "fetchingHubCA".to_string(),
                fire_at: now(),
            },
        );
        let state = interpreter.state().clone();
        let (restored, effects) = Interpreter::restore(chart, settings, state, pending, now()).unwrap();

        assert!(!restored.timers().contains_key("HUB_CA.retry#0"));
        assert!(timers(&effects).iter().all(|(id, _)| id != "HUB_CA.retry#0"));
    }

    #[test]
    fn completion_is_notified_once() {
        let (mut interpreter, _) = Interpreter::start(chart(), Arc::new(settings()), now());
        let mut notified = 0;

        for notice in Notice::ALL.iter().rev().filter(|notice| notice.completes().is_some()) {
            let effects = interpreter.handle(Event::Notice(*notice).into(), now());
            notified += invocations(&effects, RegionId::ProgressMonitor).len();
        }
        assert_eq!(notified, 1);
        assert!(interpreter.context().progress_monitor.completion_notified);

        // Repeating a completion does not report again.
        let effects = interpreter.handle(Event::Notice(Notice::PeerJwsConfigured).into(), now());
        assert!(invocations(&effects, RegionId::ProgressMonitor).is_empty());
    }

    /// Feeds `events` to a fresh interpreter and counts completion reports.
    fn completion_reports(events: Vec<Event>) -> usize {
        let (mut interpreter, _) = Interpreter::start(chart(), Arc::new(settings()), now());
        let mut notified = 0;
        for event in events {
            let effects = interpreter.handle(event.into(), now());
            notified += invocations(&effects, RegionId::ProgressMonitor).len();
        }
        assert!(interpreter.context().progress_monitor.completion_notified);
        notified
    }

    fn failed(domain: Domain) -> Event {
        Event::Failed(Failure {
            machine: domain.as_str().to_string(),
            state: "uploading".to_string(),
            error: "503 Service Unavailable".to_string(),
            retries: 1,
        })
    }

    #[test]
    fn completion_is_notified_once_in_any_order() {
        let completing: Vec<Notice> = Notice::ALL.iter().copied().filter(|notice| notice.completes().is_some()).collect();
        let intermediate: Vec<Notice> = Notice::ALL.iter().copied().filter(|notice| notice.completes().is_none()).collect();
        let completions = |notices: &[Notice]| notices.iter().map(|notice| Event::Notice(*notice)).collect::<Vec<_>>();

        let forward = completions(&completing);

        let mut reversed = completions(&completing);
        reversed.reverse();

        let mut interleaved = Vec::new();
        for (index, notice) in completing.iter().enumerate() {
            interleaved.push(Event::Notice(intermediate[index % intermediate.len()]));
            interleaved.push(Event::Notice(*notice));
            interleaved.push(Event::Notice(intermediate[(index * 7 + 3) % intermediate.len()]));
        }

        // The first domain fails before the rest complete and completes anew last.
        let (first_domain, _) = completing[0].completes().unwrap();
        let mut recovered = completions(&completing[..3]);
        recovered.push(failed(first_domain));
        recovered.extend(completions(&completing[3..]));
        recovered.push(Event::Notice(completing[0]));

        // Completing twice on the way does not matter either.
        let mut repeated = Vec::new();
        for notice in &completing {
            repeated.push(Event::Notice(*notice));
            repeated.push(Event::Notice(completing[0]));
        }

        for (name, events) in [
            ("forward", forward),
            ("reversed", reversed),
            ("interleaved", interleaved),
            ("recovered", recovered),
            ("repeated", repeated),
        ] {
            assert_eq!(completion_reports(events), 1, "{} order", name);
        }
    }

    #[test]
    fn failure_after_completion_allows_another_report() {
        let completing: Vec<Event> = Notice::ALL
            .iter()
            .filter(|notice| notice.completes().is_some())
            .map(|notice| Event::Notice(*notice))
            .collect();

        let mut events = completing.clone();
        events.push(failed(Domain::PeerJws));
        events.push(Event::Notice(Notice::PeerJwsConfigured));
        assert_eq!(completion_reports(events), 2);
    }
}
