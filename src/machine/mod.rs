//! The connection state machine.
//!
//! A set of parallel regions, one per piece of trust material or
//! configuration, driven by a single interpreter. See [`chart`] for the
//! definition language and [`regions`] for the definitions themselves.

use std::fmt;

pub mod actions;
pub mod chart;
pub mod context;
pub mod event;
pub mod guards;
pub mod interpreter;
pub mod ops;
pub mod regions;
pub mod retry;
pub mod settings;

pub use self::chart::{Chart, RegionId};
pub use self::context::Context;
pub use self::event::{Event, EventKind, Failure, Notice};
pub use self::interpreter::{Completion, Effect, Input, Interpreter, MachineState, TimerId};
pub use self::ops::{Operation, Output};
pub use self::settings::{Settings, Thresholds};

//------------ Cause ---------------------------------------------------------

/// Why a region is moving: what guards and actions get to inspect.
///
/// Eventless transitions taken right after keep the cause of the step that
/// led to them, so a guard on an `always` transition still sees the event
/// or output that started the step.
#[derive(Clone, Copy, Debug)]
pub enum Cause<'a> {
    Start,
    Event(&'a Event),
    Done(&'a Output),
    Error(&'a str),
    Timer,
}

impl<'a> Cause<'a> {
    pub fn event(&self) -> Option<&'a Event> {
        match self {
            Cause::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&'a Output> {
        match self {
            Cause::Done(output) => Some(output),
            _ => None,
        }
    }
}

impl fmt::Display for Cause<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Cause::Start => f.write_str("start"),
            Cause::Event(event) => write!(f, "event {}", event),
            Cause::Done(_) => f.write_str("done"),
            Cause::Error(e) => write!(f, "error '{}'", e),
            Cause::Timer => f.write_str("timer"),
        }
    }
}
