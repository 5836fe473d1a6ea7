//! The `utils` module holds the pieces shared by every other module:
//! the crate error type and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};
