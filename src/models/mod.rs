// Domain models

mod alert;
mod deployment;
mod events;
mod metrics;
mod unit;

pub use alert::{Alert, AlertType, NewAlert, Severity};
pub use deployment::{BuildDescriptor, DeploymentJob, DeploymentTrigger, JobState, NewDeploymentJob};
pub use events::DashboardEvent;
pub use metrics::{InterfaceCounters, MetricSample, MetricsBatch};
pub use unit::{DEFAULT_BRANCH, PortMapping, Unit, UnitDefinition, UnitStatus, target_key};
