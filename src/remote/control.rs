//! The in-process channel to connector-facing transports.
//!
//! Transports subscribe to a [`ControlChannel`] and forward what they
//! receive to the connectors they serve. Delivery is best effort.

use async_trait::async_trait;
use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::ControlPlane;
use crate::api::Jws;
use crate::commons::error::Error;

/// Messages kept for a subscriber that falls behind.
const CONTROL_CHANNEL_CAPACITY: usize = 64;

//------------ ControlMessage ------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// The current JWS keys of all peers.
    PeerJws { id: Uuid, data: Vec<Jws> },

    /// The merged connector configuration.
    Configuration { id: Uuid, data: Value },
}

impl ControlMessage {
    pub fn id(&self) -> Uuid {
        match self {
            ControlMessage::PeerJws { id, .. } | ControlMessage::Configuration { id, .. } => *id,
        }
    }
}

//------------ ControlChannel ------------------------------------------------

#[derive(Clone, Debug)]
pub struct ControlChannel {
    sender: broadcast::Sender<ControlMessage>,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CONTROL_CHANNEL_CAPACITY);
        ControlChannel { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.sender.subscribe()
    }

    fn publish(&self, msg: ControlMessage) {
        let id = msg.id();
        match self.sender.send(msg) {
            Ok(receivers) => trace!("Control message {} sent to {} subscriber(s)", id, receivers),
            Err(_) => debug!("No connector subscribed, control message {} dropped", id),
        }
    }
}

#[async_trait]
impl ControlPlane for ControlChannel {
    async fn notify_peer_jws(&self, keys: &[Jws]) -> Result<(), Error> {
        self.publish(ControlMessage::PeerJws {
            id: Uuid::new_v4(),
            data: keys.to_vec(),
        });
        Ok(())
    }

    async fn push_connector_config(&self, config: &Value) -> Result<(), Error> {
        self.publish(ControlMessage::Configuration {
            id: Uuid::new_v4(),
            data: config.clone(),
        });
        Ok(())
    }
}

//------------ Tests ---------------------------------------------------------
