//! Question matrix: one AI answer per (question, model, location).
//!
//! Cells already answered in this batch are reused. A generation failure
//! stores the failed-prompt placeholder as the answer, so the run exists
//! but is never billed.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use brandlens_common::{Location, ModelTarget, Question, QuestionRun};
use brandlens_store::EvalStore;

use crate::batch::BatchController;
use crate::scheduler::{cancellable, Cancelled};
use crate::traits::TextGenerator;

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixCell {
    pub question: Question,
    pub model: ModelTarget,
    pub location: Option<Location>,
}

impl MatrixCell {
    fn key(&self) -> CellKey {
        (
            self.question.question_id,
            self.model.name.clone(),
            self.location.as_ref().map(|l| l.location_id),
        )
    }
}

type CellKey = (Uuid, String, Option<Uuid>);

fn run_key(run: &QuestionRun) -> CellKey {
    (run.question_id, run.model.clone(), run.location_id)
}

/// Every question for every model, per location (or once without one).
pub fn plan_matrix(
    questions: &[Question],
    models: &[ModelTarget],
    locations: &[Location],
) -> Vec<MatrixCell> {
    let slots: Vec<Option<&Location>> = if locations.is_empty() {
        vec![None]
    } else {
        locations.iter().map(Some).collect()
    };

    let mut cells = Vec::with_capacity(questions.len() * models.len() * slots.len());
    for question in questions {
        for model in models {
            for location in &slots {
                cells.push(MatrixCell {
                    question: question.clone(),
                    model: model.clone(),
                    location: location.cloned(),
                });
            }
        }
    }
    cells
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixOutcome {
    /// Every run of the batch's matrix, reused and new.
    pub runs: Vec<QuestionRun>,
    pub generated: usize,
    pub reused: usize,
    /// New runs whose generation failed and hold the placeholder.
    pub failed: usize,
}

impl MatrixOutcome {
    pub fn successful(&self, placeholder: &str) -> usize {
        self.runs.iter().filter(|r| r.is_successful(placeholder)).count()
    }
}

pub struct MatrixRunner<'a> {
    pub store: &'a dyn EvalStore,
    pub generator: &'a dyn TextGenerator,
    pub batches: &'a BatchController,
    pub placeholder: &'a str,
    pub concurrency: usize,
}

impl MatrixRunner<'_> {
    pub async fn execute(
        &self,
        batch_id: Uuid,
        cells: Vec<MatrixCell>,
        cancel: &CancellationToken,
    ) -> Result<MatrixOutcome> {
        let mut existing: HashMap<CellKey, QuestionRun> = self
            .store
            .question_runs_for_batch(batch_id)
            .await?
            .into_iter()
            .map(|run| (run_key(&run), run))
            .collect();

        let mut outcome = MatrixOutcome::default();
        let mut pending = Vec::new();
        for cell in cells {
            match existing.remove(&cell.key()) {
                Some(run) => {
                    outcome.reused += 1;
                    outcome.runs.push(run);
                }
                None => pending.push(cell),
            }
        }

        info!(
            batch = %batch_id,
            reused = outcome.reused,
            pending = pending.len(),
            "Executing question matrix"
        );

        let mut results = stream::iter(pending)
            .map(|cell| self.answer(batch_id, cell, cancel))
            .buffer_unordered(self.concurrency.max(1));

        while let Some(result) = results.next().await {
            let (run, generated) = result?;
            self.store.create_question_run(&run).await?;

            if generated {
                self.batches.update_progress(batch_id, 1, 0).await?;
            } else {
                outcome.failed += 1;
                self.batches.update_progress(batch_id, 0, 1).await?;
            }
            outcome.generated += 1;
            outcome.runs.push(run);
        }

        info!(
            batch = %batch_id,
            generated = outcome.generated,
            reused = outcome.reused,
            failed = outcome.failed,
            "Question matrix complete"
        );
        Ok(outcome)
    }

    /// Returns the run to store and whether generation succeeded.
    async fn answer(
        &self,
        batch_id: Uuid,
        cell: MatrixCell,
        cancel: &CancellationToken,
    ) -> Result<(QuestionRun, bool)> {
        let location = cell.location.as_ref().map(|l| l.label.as_str());
        let generated = cancellable(
            cancel,
            self.generator
                .generate(&cell.question.text, &cell.model.name, location),
        )
        .await;

        let mut run = QuestionRun {
            question_run_id: Uuid::new_v4(),
            question_id: cell.question.question_id,
            batch_id: Some(batch_id),
            model: cell.model.name.clone(),
            location_id: cell.location.as_ref().map(|l| l.location_id),
            location: cell.location.as_ref().map(|l| l.label.clone()),
            response_text: None,
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            created_at: Utc::now(),
        };

        match generated {
            Ok(answer) => {
                run.response_text = Some(answer.text);
                run.input_tokens = i32::try_from(answer.cost.input_tokens).unwrap_or(i32::MAX);
                run.output_tokens = i32::try_from(answer.cost.output_tokens).unwrap_or(i32::MAX);
                run.total_cost = answer.cost.total_cost;
                Ok((run, true))
            }
            Err(e) if e.is::<Cancelled>() => Err(e),
            Err(e) => {
                warn!(
                    batch = %batch_id,
                    question = %cell.question.question_id,
                    model = %cell.model.name,
                    error = %e,
                    "Generation failed, storing placeholder"
                );
                run.response_text = Some(self.placeholder.to_string());
                Ok((run, false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{org_details, MockGenerator};
    use brandlens_common::{BatchScope, FAILED_PROMPT_PLACEHOLDER};
    use brandlens_store::testing::MemoryStore;
    use std::sync::Arc;

    fn locations(labels: &[&str]) -> Vec<Location> {
        labels
            .iter()
            .map(|l| Location {
                location_id: Uuid::new_v4(),
                label: l.to_string(),
            })
            .collect()
    }

    #[test]
    fn plan_covers_every_combination() {
        let details = org_details(Uuid::new_v4(), "Acme", &["q1", "q2"]);
        assert_eq!(plan_matrix(&details.questions, &details.models, &[]).len(), 2);

        let cells = plan_matrix(
            &details.questions,
            &details.models,
            &locations(&["Berlin", "Austin", "Lagos"]),
        );
        assert_eq!(cells.len(), 6);
        assert!(cells.iter().all(|c| c.location.is_some()));
    }

    #[tokio::test]
    async fn failures_become_placeholders_and_resume_reuses_runs() {
        let store = Arc::new(MemoryStore::new());
        let batches = BatchController::new(store.clone());
        let batch = batches
            .get_or_create(BatchScope::Org, Uuid::new_v4(), 3)
            .await
            .unwrap();
        batches.start(batch.id()).await.unwrap();

        let details = org_details(Uuid::new_v4(), "Acme", &["best crm?", "cheap crm?", "broken"]);
        let cells = plan_matrix(&details.questions, &details.models, &[]);
        let generator = MockGenerator::new("Acme Corp is popular.").failing_on("broken");
        let runner = MatrixRunner {
            store: store.as_ref(),
            generator: &generator,
            batches: &batches,
            placeholder: FAILED_PROMPT_PLACEHOLDER,
            concurrency: 2,
        };
        let cancel = CancellationToken::new();

        let first = runner.execute(batch.id(), cells.clone(), &cancel).await.unwrap();
        assert_eq!(first.generated, 3);
        assert_eq!(first.failed, 1);
        assert_eq!(first.successful(FAILED_PROMPT_PLACEHOLDER), 2);

        let progress = store.batch(batch.id()).await.unwrap().unwrap();
        assert_eq!((progress.completed_questions, progress.failed_questions), (2, 1));

        let second = runner.execute(batch.id(), cells, &cancel).await.unwrap();
        assert_eq!(second.reused, 3);
        assert_eq!(second.generated, 0);
        assert_eq!(store.runs().len(), 3);
        assert_eq!(generator.prompts().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_is_not_a_placeholder() {
        let store = Arc::new(MemoryStore::new());
        let batches = BatchController::new(store.clone());
        let batch = batches
            .get_or_create(BatchScope::Org, Uuid::new_v4(), 1)
            .await
            .unwrap();
        batches.start(batch.id()).await.unwrap();

        let details = org_details(Uuid::new_v4(), "Acme", &["q"]);
        let generator = MockGenerator::new("answer");
        let runner = MatrixRunner {
            store: store.as_ref(),
            generator: &generator,
            batches: &batches,
            placeholder: FAILED_PROMPT_PLACEHOLDER,
            concurrency: 1,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner
            .execute(
                batch.id(),
                plan_matrix(&details.questions, &details.models, &[]),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is::<Cancelled>());
        assert!(store.runs().is_empty());
    }
}
