use tracing::info;

use crate::persister::{EvalWrite, PersistReport, SetWrite};

/// What a dry run would have done for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DryRunPlan {
    pub placeholder: bool,
    pub create_eval: bool,
    pub extract_competitors: bool,
    pub extract_citations: bool,
}

/// Result of one evaluation job as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    MissingRun,
    EmptyResponse,
    Persisted(PersistReport),
    DryRun(DryRunPlan),
    Failed(String),
    /// Dequeued after cancellation and never started.
    Cancelled,
}

/// Aggregate counters for one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub total: usize,
    pub processed: usize,
    pub created: usize,
    pub mentioned: usize,
    pub skipped_existing: usize,
    pub missing_runs: usize,
    pub empty_responses: usize,
    pub failed_placeholders: usize,
    pub competitors: usize,
    pub citations: usize,
    pub skipped_competitors: usize,
    pub skipped_citations: usize,
    pub errors: usize,
    pub cancelled: usize,
    /// Still queued when the run stopped.
    pub not_processed: usize,
}

impl RunTotals {
    pub fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::MissingRun => self.missing_runs += 1,
            JobOutcome::EmptyResponse => self.empty_responses += 1,
            JobOutcome::Failed(_) => self.errors += 1,
            JobOutcome::Cancelled => {
                self.cancelled += 1;
                self.errors += 1;
            }
            JobOutcome::DryRun(plan) => {
                if plan.placeholder {
                    self.failed_placeholders += 1;
                }
                if plan.create_eval {
                    self.created += 1;
                } else {
                    self.skipped_existing += 1;
                }
                if !plan.placeholder && !plan.extract_competitors {
                    self.skipped_competitors += 1;
                }
                if !plan.placeholder && !plan.extract_citations {
                    self.skipped_citations += 1;
                }
            }
            JobOutcome::Persisted(report) => self.record_report(report),
        }
    }

    fn record_report(&mut self, report: &PersistReport) {
        match report.eval {
            EvalWrite::Created { mentioned } => {
                self.created += 1;
                if mentioned {
                    self.mentioned += 1;
                }
            }
            EvalWrite::Placeholder => {
                self.created += 1;
                self.failed_placeholders += 1;
            }
            EvalWrite::SkippedExisting => self.skipped_existing += 1,
            EvalWrite::Failed(_) => {}
        }

        match report.competitors {
            SetWrite::Created(n) => self.competitors += n,
            SetWrite::SkippedExisting => self.skipped_competitors += 1,
            _ => {}
        }

        match report.citations {
            SetWrite::Created(n) => self.citations += n,
            SetWrite::SkippedExisting => self.skipped_citations += 1,
            _ => {}
        }

        if report.has_failure() {
            self.errors += 1;
        }
    }

    /// Merge counters from another run, e.g. one per network member.
    pub fn absorb(&mut self, other: &RunTotals) {
        self.total += other.total;
        self.processed += other.processed;
        self.created += other.created;
        self.mentioned += other.mentioned;
        self.skipped_existing += other.skipped_existing;
        self.missing_runs += other.missing_runs;
        self.empty_responses += other.empty_responses;
        self.failed_placeholders += other.failed_placeholders;
        self.competitors += other.competitors;
        self.citations += other.citations;
        self.skipped_competitors += other.skipped_competitors;
        self.skipped_citations += other.skipped_citations;
        self.errors += other.errors;
        self.cancelled += other.cancelled;
        self.not_processed += other.not_processed;
    }

    /// Single grep-able summary line with every counter.
    pub fn log_summary(&self, label: &str) {
        info!(
            label,
            processed = self.processed,
            total = self.total,
            created = self.created,
            mentioned = self.mentioned,
            skipped_existing = self.skipped_existing,
            missing_runs = self.missing_runs,
            empty_responses = self.empty_responses,
            failed_placeholders = self.failed_placeholders,
            competitors = self.competitors,
            citations = self.citations,
            skipped_competitors = self.skipped_competitors,
            skipped_citations = self.skipped_citations,
            errors = self.errors,
            not_processed = self.not_processed,
            "complete"
        );
    }
}

impl std::fmt::Display for RunTotals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Evaluation Run Complete ===")?;
        writeln!(f, "Processed:            {} / {}", self.processed, self.total)?;
        writeln!(f, "Evaluations created:  {} ({} mentioned)", self.created, self.mentioned)?;
        writeln!(f, "Skipped (existing):   {}", self.skipped_existing)?;
        writeln!(f, "Missing runs:         {}", self.missing_runs)?;
        writeln!(f, "Empty responses:      {}", self.empty_responses)?;
        writeln!(f, "Failed placeholders:  {}", self.failed_placeholders)?;
        writeln!(f, "Competitors created:  {} (skipped {})", self.competitors, self.skipped_competitors)?;
        writeln!(f, "Citations created:    {} (skipped {})", self.citations, self.skipped_citations)?;
        writeln!(f, "Errors:               {}", self.errors)?;
        if self.cancelled > 0 || self.not_processed > 0 {
            writeln!(f, "Cancelled:            {}", self.cancelled)?;
            writeln!(f, "Not processed:        {}", self.not_processed)?;
        }
        Ok(())
    }
}
