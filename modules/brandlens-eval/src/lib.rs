pub mod backfill;
pub mod batch;
pub mod bootstrap;
pub mod cache;
pub mod citations;
pub mod llm;
pub mod notify;
pub mod persister;
pub mod processor;
pub mod scheduler;
pub mod sieve;
pub mod stats;
pub mod tasks;
pub mod traits;
pub mod usage;
pub mod workflows;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use batch::{BatchController, BatchError, BatchHandle};
pub use cache::{CacheError, OrgContextCache};
pub use persister::{EvalWrite, ExtractionPersister, PersistMode, PersistReport, SetWrite};
pub use processor::EvaluationProcessor;
pub use scheduler::{JobHandler, JobScheduler, SchedulerConfig};
pub use sieve::{MentionSieve, SieveVerdict};
pub use stats::{JobOutcome, RunTotals};
pub use traits::{OrgEvaluator, TextGenerator};
pub use usage::{UsageError, UsageLedger};
pub use workflows::{
    NetworkEvaluationWorkflow, OrgEvaluationWorkflow, PipelineDeps, WorkflowError, WorkflowReport,
};
