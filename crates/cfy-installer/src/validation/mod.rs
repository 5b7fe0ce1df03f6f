//! Pre-flight checks for a machine that is about to run the grid agent.
//!
//! Validators run one after another in the order [`default_validators`]
//! returns them. The first error stops the run; warnings are reported and
//! the run continues.

mod locators;
mod port_range;
mod validators;

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{Error, Result};

pub use locators::{DEFAULT_LOOKUP_PORT, LookupLocator, LookupLocators};
pub use port_range::PortRange;
pub use validators::{
    HostNameValidator, LookupConnectivityValidator, NicAddressValidator, PortAvailabilityValidator,
    ValidationTarget, default_validators,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResultType {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for ValidationResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        })
    }
}

/// Indentation level of a validation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMessageType {
    TopLevel,
    Group,
    Entry,
}

impl ValidationMessageType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::TopLevel => "",
            Self::Group => "- > ",
            Self::Entry => "-    > ",
        }
    }

    pub fn format(&self, message: &str) -> String {
        format!("{}{message}", self.prefix())
    }
}

/// Receives validation progress.
pub trait ValidationContext: Send + Sync {
    fn validation_event(&self, message_type: ValidationMessageType, message: &str);

    /// Start of a check whose result follows in
    /// [`ValidationContext::validation_event_end`].
    fn validation_ongoing_event(&self, message_type: ValidationMessageType, message: &str);

    fn validation_event_end(&self, result: ValidationResultType);
}

/// Whether a check needs the machine to be reachable already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    /// Cheap local checks, run before provisioning.
    Pre,
    /// Connectivity-dependent checks.
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationPlan {
    Pre,
    Post,
    #[default]
    All,
}

impl ValidationPlan {
    pub fn includes(&self, stage: ValidationStage) -> bool {
        match self {
            Self::All => true,
            Self::Pre => stage == ValidationStage::Pre,
            Self::Post => stage == ValidationStage::Post,
        }
    }
}

impl std::str::FromStr for ValidationPlan {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pre" => Ok(Self::Pre),
            "post" => Ok(Self::Post),
            "all" => Ok(Self::All),
            other => Err(Error::Config(format!("unknown validation plan: {other}"))),
        }
    }
}

/// A passing check, possibly with something worth pointing out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Warning(String),
}

#[async_trait]
pub trait MachineValidator: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> ValidationStage;

    async fn validate(&self, ctx: &dyn ValidationContext) -> Result<Verdict>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorResult {
    pub validator: &'static str,
    pub result: ValidationResultType,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub entries: Vec<ValidatorResult>,
    /// The error that stopped the run.
    pub error: Option<Error>,
}

impl ValidationReport {
    pub fn has_warnings(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.result == ValidationResultType::Warning)
    }

    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Run the validators `plan` selects, in order, stopping at the first error.
pub async fn run_validators(
    validators: &[Box<dyn MachineValidator>],
    plan: ValidationPlan,
    ctx: &dyn ValidationContext,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    ctx.validation_event(ValidationMessageType::TopLevel, "Validating machine");

    for validator in validators.iter().filter(|v| plan.includes(v.stage())) {
        let name = validator.name();
        ctx.validation_ongoing_event(
            ValidationMessageType::Group,
            &format!("Validating {name}"),
        );
        match validator.validate(ctx).await {
            Ok(Verdict::Passed) => {
                ctx.validation_event_end(ValidationResultType::Ok);
                debug!(validator = name, "validation passed");
                report.entries.push(ValidatorResult {
                    validator: name,
                    result: ValidationResultType::Ok,
                    message: None,
                });
            }
            Ok(Verdict::Warning(message)) => {
                ctx.validation_event_end(ValidationResultType::Warning);
                ctx.validation_event(ValidationMessageType::Entry, &message);
                warn!(validator = name, %message, "validation warning");
                report.entries.push(ValidatorResult {
                    validator: name,
                    result: ValidationResultType::Warning,
                    message: Some(message),
                });
            }
            Err(e) => {
                ctx.validation_event_end(ValidationResultType::Error);
                let message = e.to_string();
                ctx.validation_event(ValidationMessageType::Entry, &message);
                report.entries.push(ValidatorResult {
                    validator: name,
                    result: ValidationResultType::Error,
                    message: Some(message),
                });
                report.error = Some(e);
                break;
            }
        }
    }
    report
}
