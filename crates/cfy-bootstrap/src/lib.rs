pub mod config;
pub mod coordinator;
mod error;
pub mod listeners;
pub mod probe;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::BootstrapConfig;
pub use coordinator::{BootstrapOutcome, Coordinator};
pub use error::{Error, Result};
pub use listeners::TracingListener;
pub use probe::RestGatewayProbe;
