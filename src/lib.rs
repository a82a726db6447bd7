//! The _MCM client_ library crate: keeps a payment-hub participant's mTLS
//! and JWS trust material in sync with the hub.

pub mod api;
pub mod commons;
pub mod constants;
pub mod daemon;
pub mod machine;
pub mod remote;
