//! The region definitions of the connection chart.
//!
//! Every module builds one [`Region`](super::chart::Region). The regions
//! share the context but only talk to each other through raised events.

pub mod connector_config;
pub mod dfsp_ca;
pub mod dfsp_client_cert;
pub mod dfsp_jws;
pub mod dfsp_server_cert;
pub mod endpoint_config;
pub mod hub_ca;
pub mod hub_cert;
pub mod peer_jws;
pub mod progress_monitor;
pub mod upload_peer_jws;
