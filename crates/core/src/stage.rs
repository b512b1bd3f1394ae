//! Stage execution
//!
//! Runs pipeline stages one after another under their wall-clock budgets and
//! honors cancellation at stage boundaries.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StageBudgets;
use crate::error::{BuildError, Result, Stage, TimeoutError};
use crate::events::{Event, EventBus};

/// Sequences stages of one build invocation
pub struct StageRunner {
    budgets: StageBudgets,
    cancel: CancellationToken,
    events: Arc<EventBus>,
}

impl StageRunner {
    pub fn new(budgets: StageBudgets, cancel: CancellationToken, events: Arc<EventBus>) -> Self {
        Self {
            budgets,
            cancel,
            events,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run one stage.
    ///
    /// Fails with [`BuildError::Cancelled`] without polling `work` if the
    /// build was cancelled before the stage started. A stage already running
    /// is not interrupted by cancellation, only by its budget.
    pub async fn run<T, F>(&self, stage: Stage, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            warn!("Build cancelled, not starting {} stage", stage);
            return Err(BuildError::Cancelled(stage));
        }

        info!("Stage {} started", stage);
        self.events.emit(Event::StageStarted { stage });
        let started = Instant::now();

        let result = match self.budgets.budget(stage) {
            Some(budget) => match tokio::time::timeout(budget, work).await {
                Ok(result) => result,
                Err(_) => Err(TimeoutError { stage, budget }.into()),
            },
            None => work.await,
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => {
                info!("Stage {} completed in {:.2?}", stage, elapsed);
                self.events.emit(Event::StageCompleted { stage, elapsed });
            }
            Err(e) => warn!("Stage {} failed after {:.2?}: {}", stage, elapsed, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runner(budgets: StageBudgets) -> StageRunner {
        StageRunner::new(budgets, CancellationToken::new(), Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_stage_result_passes_through() {
        let runner = runner(StageBudgets::default());
        let sub = runner.events().subscribe();

        let value = runner.run(Stage::Manifest, async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);

        let events = sub.drain();
        assert_eq!(events[0], Event::StageStarted { stage: Stage::Manifest });
        assert!(matches!(
            events[1],
            Event::StageCompleted { stage: Stage::Manifest, .. }
        ));
    }

    #[tokio::test]
    async fn test_stage_budget_exceeded() {
        let budgets = StageBudgets {
            compile: 1,
            ..StageBudgets::default()
        };
        let runner = runner(budgets);

        let result: Result<()> = runner
            .run(Stage::Compile, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(BuildError::Timeout(t)) => assert_eq!(t.stage, Stage::Compile),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_stage() {
        let runner = runner(StageBudgets::default());
        runner.cancellation_token().cancel();

        let mut polled = false;
        let result: Result<()> = runner
            .run(Stage::Assembly, async {
                polled = true;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BuildError::Cancelled(Stage::Assembly))));
        assert!(!polled);
    }
}
