pub mod command;
pub mod deadline;
pub mod details;
pub mod error;
pub mod installer;
pub mod listener;
pub mod registration;
pub mod remote;
pub mod retry;
pub mod script_errors;
pub mod upload;
pub mod validation;

pub use deadline::Deadline;
pub use details::InstallationDetails;
pub use error::{Error, Phase, Result};
pub use installer::{AgentlessInstaller, InstallReport, InstallState};
pub use listener::InstallerListener;
pub use registration::GridMembership;
pub use remote::{Connector, DefaultConnector};
pub use retry::RetryPolicy;
