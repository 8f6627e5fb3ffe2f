pub mod changes;
pub mod config;
pub mod errors;
pub mod ids;
pub mod schedule;

pub use changes::{ChangeReport, FieldChange, TrackedField};
pub use config::{CheckingTime, EventConfig, PipelineConfig};
pub use errors::PipelineError;
