pub mod database;
pub mod error;
pub mod events;
pub mod jobs;
pub mod rooms;
pub mod row_helpers;
pub mod schedules;
pub mod schema;
pub mod session_types;
pub mod snapshots;
pub mod speakers;
pub mod submissions;
pub mod tracks;

pub use database::Database;
pub use error::StoreError;
