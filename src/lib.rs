pub mod api;
pub mod daemon;
pub mod env;
pub mod error;
pub mod params;
pub mod protocol;

pub use error::{ConnectorError, Result};
