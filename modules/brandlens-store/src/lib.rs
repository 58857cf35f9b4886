pub mod pg;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use pg::PgStore;
pub use traits::{EvalStore, ExtractionPresence, OrgDirectory};
