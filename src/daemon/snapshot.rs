//! The persisted form of the running machine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commons::error::Error;
use crate::constants::STATE_VERSION;
use crate::machine::interpreter::TimerDescriptor;
use crate::machine::{Interpreter, MachineState, TimerId};

//------------ Snapshot ------------------------------------------------------

/// Everything needed to continue after a restart: where each region is,
/// the context, and the timers still pending.
///
/// A snapshot is only good for the chart it was taken from. The `hash`
/// identifies that chart and `version` the layout of the record itself.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub state: MachineState,
    pub hash: String,
    pub version: u32,
    #[serde(default)]
    pub pending_timers: BTreeMap<TimerId, TimerDescriptor>,
}

impl Snapshot {
    pub fn of(interpreter: &Interpreter, hash: &str) -> Self {
        Snapshot {
            state: interpreter.state().clone(),
            hash: hash.to_string(),
            version: STATE_VERSION,
            pending_timers: interpreter.timers().clone(),
        }
    }

    /// Parses a stored record and checks that it belongs to the chart with
    /// the given hash and to this version of the layout.
    pub fn restorable(value: Value, hash: &str) -> Result<Self, Error> {
        let version = value.get("version").and_then(Value::as_u64);
        if version != Some(u64::from(STATE_VERSION)) {
            return Err(Error::snapshot(format!(
                "version {} does not match {}",
                version.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string()),
                STATE_VERSION
            )));
        }
        if value.get("hash").and_then(Value::as_str) != Some(hash) {
            return Err(Error::snapshot("taken from a different state machine definition"));
        }
        serde_json::from_value(value).map_err(|e| Error::snapshot(format!("cannot parse: {}", e)))
    }

    pub fn to_json(&self) -> Result<Value, Error> {
        Ok(serde_json::to_value(self)?)
    }
}

//------------ Tests ---------------------------------------------------------
