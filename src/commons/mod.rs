//! Common types used by the various components of the connection manager.
pub mod error;
pub mod util;

//------------ Response Aliases ----------------------------------------------

pub type EmptyResult = std::result::Result<(), self::error::Error>;
pub type Result<T> = std::result::Result<T, self::error::Error>;
