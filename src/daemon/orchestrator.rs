//! Runs the connection state machine as a service.
//!
//! One task owns the [`Interpreter`] and processes inputs one at a time.
//! Calls run as separate tasks through the retry helper and report back
//! as completions; timers are tasks that sleep and then feed their id back
//! in. After every input the state is persisted, so a restarted process
//! continues where it left off.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use super::snapshot::Snapshot;
use crate::api::status::{ProgressTable, StatesReport};
use crate::commons::error::Error;
use crate::commons::{EmptyResult, Result};
use crate::machine::retry::{invoke_retry, RetryPolicy};
use crate::machine::{Chart, Completion, Effect, Event, Input, Interpreter, MachineState, Settings, TimerId};
use crate::remote::Collaborators;

//------------ OrchestratorConfig --------------------------------------------

/// Everything the orchestrator needs, handed in by whoever builds it.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub settings: Settings,
    pub retry: RetryPolicy,

    /// Interval of the progress report to the hub.
    pub report_interval: Duration,

    pub collaborators: Collaborators,
}

//------------ Command -------------------------------------------------------

enum Command {
    Input(Input),
    Stop(oneshot::Sender<()>),
}

//------------ Orchestrator --------------------------------------------------

pub struct Orchestrator {
    chart: RwLock<Arc<Chart>>,
    hash: RwLock<String>,
    settings: Arc<Settings>,
    retry: RetryPolicy,
    report_interval: Duration,
    deps: Collaborators,

    /// The machine state as of the last processed input.
    current: Arc<RwLock<Option<MachineState>>>,

    commands: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    event_loop: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let chart = Chart::build()?;
        let hash = chart.hash()?;
        debug!("State machine definition hash: {}", hash);

        Ok(Orchestrator {
            chart: RwLock::new(Arc::new(chart)),
            hash: RwLock::new(hash),
            settings: Arc::new(config.settings),
            retry: config.retry,
            report_interval: config.report_interval,
            deps: config.collaborators,
            current: Arc::new(RwLock::new(None)),
            commands: RwLock::new(None),
            running: Mutex::new(None),
        })
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Starts the machine, from the persisted snapshot if there is a usable
    /// one and from scratch otherwise, and starts the periodic progress
    /// report.
    pub async fn start(&self) -> EmptyResult {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("State machine is already running");
            return Ok(());
        }

        let chart = self.chart.read().unwrap().clone();
        let hash = self.hash.read().unwrap().clone();
        let now = Utc::now();

        let (interpreter, effects) = match self.load_snapshot(&hash).await {
            Some(snapshot) => {
                match Interpreter::restore(
                    chart.clone(),
                    self.settings.clone(),
                    snapshot.state,
                    snapshot.pending_timers,
                    now,
                ) {
                    Ok(restored) => {
                        info!("Resuming state machine from persisted snapshot");
                        restored
                    }
                    Err(e) => {
                        info!("Cannot resume from persisted snapshot ({}), starting fresh", e);
                        Interpreter::start(chart, self.settings.clone(), now)
                    }
                }
            }
            None => Interpreter::start(chart, self.settings.clone(), now),
        };

        *self.current.write().unwrap() = Some(interpreter.state().clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            interpreter,
            hash,
            retry: self.retry.clone(),
            deps: self.deps.clone(),
            commands: tx.clone(),
            invocations: JoinSet::new(),
            timers: HashMap::new(),
            current: self.current.clone(),
            persisted: None,
        };
        let event_loop = tokio::spawn(event_loop.run(rx, effects));
        let reporter = tokio::spawn(report_states(
            self.deps.clone(),
            self.current.clone(),
            self.report_interval,
        ));

        *self.commands.write().unwrap() = Some(tx);
        *running = Some(Running { event_loop, reporter });
        info!("State machine started");
        Ok(())
    }

    /// Stops the machine and the progress report. Persisted state is kept.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.reporter.abort();

        let commands = self.commands.write().unwrap().take();
        if let Some(commands) = commands {
            let (ack, done) = oneshot::channel();
            if commands.send(Command::Stop(ack)).is_ok() {
                let _ = done.await;
            }
        }
        if let Err(e) = running.event_loop.await {
            if !e.is_cancelled() {
                error!("State machine task ended abnormally: {}", e);
            }
        }
        info!("State machine stopped");
    }

    /// Stops, forgets all state, local and persisted, and starts afresh.
    ///
    /// Fails if the persisted state cannot be removed. A snapshot that still
    /// reads back after the delete is only logged.
    pub async fn restart(&self) -> EmptyResult {
        self.stop().await;

        self.deps.vault.delete_state_machine_state().await?;
        match self.deps.vault.get_state_machine_state().await {
            Ok(None) => {}
            Ok(Some(_)) => warn!("Persisted state still present after delete, starting afresh anyway"),
            Err(e) => warn!("Cannot verify that the persisted state was deleted: {}", e),
        }
        *self.current.write().unwrap() = None;

        let chart = Chart::build()?;
        let hash = chart.hash()?;
        {
            let mut known = self.hash.write().unwrap();
            if *known != hash {
                warn!("State machine definition changed while running: {} -> {}", known, hash);
            }
            *known = hash;
        }
        *self.chart.write().unwrap() = Arc::new(chart);

        self.start().await
    }

    /// Hands an event to the machine.
    pub fn send_event(&self, event: Event) -> EmptyResult {
        trace!("Received event {}", event);
        match self.commands.read().unwrap().as_ref() {
            Some(commands) => commands
                .send(Command::Input(Input::Event(event)))
                .map_err(|_| Error::custom("state machine is not running")),
            None => {
                warn!("State machine is not running, dropping event {}", event);
                Err(Error::custom("state machine is not running"))
            }
        }
    }

    /// Parses an event in its JSON form and hands it to the machine.
    /// Anything that is not a known event is dropped.
    pub fn send_json(&self, value: Value) -> EmptyResult {
        match Event::from_json(value) {
            Ok(event) => self.send_event(event),
            Err(e) => {
                warn!("Dropping event: {}", e);
                Err(e)
            }
        }
    }

    /// The progress table, raw or in the form reported to the hub.
    pub fn get_state(&self, formatted: bool) -> StatesReport {
        let progress = progress_of(&self.current);
        if formatted {
            StatesReport::Formatted(progress.formatted())
        } else {
            StatesReport::Raw(progress)
        }
    }

    /// The full machine state as of the last processed input.
    pub fn machine_state(&self) -> Option<MachineState> {
        self.current.read().unwrap().clone()
    }

    async fn load_snapshot(&self, hash: &str) -> Option<Snapshot> {
        match self.deps.vault.get_state_machine_state().await {
            Ok(Some(value)) => match Snapshot::restorable(value, hash) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    info!("Ignoring persisted state: {}", e);
                    None
                }
            },
            Ok(None) => {
                info!("No persisted state found, starting fresh");
                None
            }
            Err(e) => {
                warn!("Cannot read persisted state, starting fresh: {}", e);
                None
            }
        }
    }
}

fn progress_of(current: &RwLock<Option<MachineState>>) -> ProgressTable {
    current
        .read()
        .unwrap()
        .as_ref()
        .map(|state| state.context.progress_monitor.progress.clone())
        .unwrap_or_else(|| ProgressTable::initial(Utc::now()))
}

//------------ EventLoop -----------------------------------------------------

struct EventLoop {
    interpreter: Interpreter,
    hash: String,
    retry: RetryPolicy,
    deps: Collaborators,
    commands: mpsc::UnboundedSender<Command>,
    invocations: JoinSet<Completion>,
    timers: HashMap<TimerId, AbortHandle>,
    current: Arc<RwLock<Option<MachineState>>>,

    /// The last snapshot written, to skip writes that change nothing.
    persisted: Option<Value>,
}

impl EventLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, initial: Vec<Effect>) {
        self.apply(initial);
        self.publish().await;

        loop {
            let input = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Input(input)) => input,
                    Some(Command::Stop(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => break,
                },
                Some(res) = self.invocations.join_next(), if !self.invocations.is_empty() => match res {
                    Ok(completion) => Input::Done(completion),
                    Err(e) => {
                        error!("Call task ended abnormally: {}", e);
                        continue;
                    }
                },
            };

            if let Input::Timer(id) = &input {
                self.timers.remove(id);
            }
            let effects = self.interpreter.handle(input, Utc::now());
            self.apply(effects);
            self.publish().await;
        }
        self.shutdown().await;
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Invoke(invocation) => {
                    let deps = self.deps.clone();
                    let retry = self.retry.clone();
                    let commands = self.commands.clone();
                    self.invocations.spawn(async move {
                        let machine = invocation.region.machine_name();
                        let operation = &invocation.operation;
                        let deps = &deps;
                        let res = invoke_retry(
                            &retry,
                            machine,
                            &invocation.state,
                            operation.name(),
                            || operation.run(deps),
                            |event| {
                                let _ = commands.send(Command::Input(Input::Event(event)));
                            },
                        )
                        .await;
                        Completion::of(&invocation, res.map_err(|e| e.to_string()))
                    });
                }
                Effect::StartTimer { id, delay } => {
                    trace!("Starting timer {} for {} ms", id, delay.as_millis());
                    let commands = self.commands.clone();
                    let fire = id.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = commands.send(Command::Input(Input::Timer(fire)));
                    });
                    if let Some(old) = self.timers.insert(id, handle.abort_handle()) {
                        old.abort();
                    }
                }
                Effect::CancelTimer(id) => {
                    if let Some(handle) = self.timers.remove(&id) {
                        trace!("Cancelling timer {}", id);
                        handle.abort();
                    }
                }
            }
        }
    }

    /// Shares the new state and persists it.
    async fn publish(&mut self) {
        *self.current.write().unwrap() = Some(self.interpreter.state().clone());

        let snapshot = match Snapshot::of(&self.interpreter, &self.hash).to_json() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Cannot serialize state machine state: {}", e);
                return;
            }
        };
        if self.persisted.as_ref() == Some(&snapshot) {
            return;
        }
        match self.deps.vault.set_state_machine_state(&snapshot).await {
            Ok(()) => self.persisted = Some(snapshot),
            Err(e) => warn!("Cannot persist state machine state: {}", e),
        }
    }

    async fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.invocations.shutdown().await;
    }
}

//------------ Progress report -----------------------------------------------

async fn report_states(deps: Collaborators, current: Arc<RwLock<Option<MachineState>>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let status = progress_of(&current).formatted();
        match deps.hub.upload_dfsp_states_status(&status).await {
            Ok(()) => trace!("Reported connection states to the hub"),
            Err(e) => warn!("Cannot report connection states to the hub: {}", e),
        }
    }
}
