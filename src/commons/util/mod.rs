//! General utility modules for use all over the code base
pub mod ext_serde;
pub mod httpclient;
pub mod merge;
