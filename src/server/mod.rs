//! Reference farm API that accepts the calls the sync engine makes.

pub mod records;
pub mod routes;

pub use records::{RecordStore, WriteOutcome};
pub use routes::{router, AppState, TokenSet};
