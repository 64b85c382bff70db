pub mod logging;
pub mod report;
pub mod rollback;
pub mod semver;

pub use rollback::{rollback_in_prod, RollbackError, RollbackOutcome};
