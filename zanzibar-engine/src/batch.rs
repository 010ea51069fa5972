use crate::{
    check::CheckEngine,
    error::{Result, ZanzibarError},
    models::CheckRequest,
    store::Revision,
};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Runs many checks against one revision with bounded concurrency.
///
/// Results come back in input order. A failing item only fails its own slot.
/// The whole batch shares one request deadline; items still unanswered when
/// it passes fail with `Timeout`.
pub struct BatchCheckCoordinator {
    checker: Arc<CheckEngine>,
    max_in_flight: usize,
}

impl BatchCheckCoordinator {
    pub fn new(checker: Arc<CheckEngine>, max_in_flight: usize) -> Self {
        Self {
            checker,
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub async fn check_all(&self, items: &[CheckRequest], revision: Revision) -> Vec<Result<bool>> {
        let timeout = self.checker.limits().timeout;
        let deadline = Instant::now() + timeout;

        let results: Vec<Result<bool>> = stream::iter(items)
            .map(|item| async move {
                tokio::time::timeout_at(deadline, self.checker.check(item, revision))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ZanzibarError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    })
            })
            .buffered(self.max_in_flight)
            .collect()
            .await;

        debug!(
            items = results.len(),
            failed = results.iter().filter(|r| r.is_err()).count(),
            %revision,
            "Batch check completed"
        );
        results
    }
}
