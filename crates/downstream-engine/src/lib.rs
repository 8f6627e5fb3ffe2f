pub mod error;
pub mod fetch;
pub mod frab;
pub mod reconcile;
pub mod refresh;
pub mod trigger;

pub use error::EngineError;
pub use fetch::{FetchedDocument, HttpFetcher, ScheduleFetcher};
pub use refresh::{RefreshOrchestrator, RefreshOutcome};
pub use trigger::{PeriodicTrigger, TickSummary};
