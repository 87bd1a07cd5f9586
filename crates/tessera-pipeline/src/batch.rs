//! Bounded worker pool for batch protect/recover.
//!
//! At most `pipeline.batch_concurrency` file pipelines run at once. Files are
//! independent: one failure is reported in its own [`BatchOutcome`] and the
//! rest carry on. Outcomes come back in input order.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use tessera_core::{FileMetadata, TesseraError, TesseraResult};
use tessera_crypto::WrappingKey;

use crate::engine::{ProtectOptions, Vault};

/// One file to protect as part of a batch
#[derive(Debug, Clone)]
pub struct ProtectJob {
    /// Caller-facing name (e.g. the source path), echoed in the outcome
    pub label: String,
    pub data: Vec<u8>,
    pub options: ProtectOptions,
}

/// Result for one input of a batch call
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub label: String,
    pub result: TesseraResult<T>,
}

impl<T> BatchOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `jobs` with at most `concurrency` in flight; results in input order.
async fn run_bounded<T, F, Fut>(
    concurrency: usize,
    jobs: Vec<(String, F)>,
) -> Vec<BatchOutcome<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = TesseraResult<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut labels = Vec::with_capacity(jobs.len());
    let mut slots: Vec<Option<TesseraResult<T>>> = Vec::with_capacity(jobs.len());

    for (index, (label, job)) in jobs.into_iter().enumerate() {
        labels.push(label);
        slots.push(None);

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                slots[index] = Some(Err(TesseraError::Other(anyhow::anyhow!(
                    "worker pool closed: {e}"
                ))));
                continue;
            }
        };
        let fut = job();
        set.spawn(async move {
            let _permit = permit;
            (index, fut.await)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => error!(error = %e, "batch task aborted"),
        }
    }

    labels
        .into_iter()
        .zip(slots)
        .map(|(label, slot)| BatchOutcome {
            result: slot.unwrap_or_else(|| {
                Err(TesseraError::Other(anyhow::anyhow!(
                    "pipeline task for {label} did not complete"
                )))
            }),
            label,
        })
        .collect()
}

impl Vault {
    /// Protect every job, `pipeline.batch_concurrency` at a time.
    ///
    /// A file id named by more than one job is protected once, for its first
    /// job; the later jobs fail with a validation error without running.
    pub async fn protect_batch(&self, jobs: Vec<ProtectJob>) -> Vec<BatchOutcome<FileMetadata>> {
        let total = jobs.len();
        let mut seen = HashSet::new();
        let mut slots: Vec<Option<BatchOutcome<FileMetadata>>> = Vec::with_capacity(total);
        let mut positions = Vec::with_capacity(total);
        let mut work = Vec::with_capacity(total);

        for (index, job) in jobs.into_iter().enumerate() {
            if let Some(file_id) = job.options.file_id.as_deref() {
                if !seen.insert(file_id.to_string()) {
                    warn!(file_id, label = %job.label, "duplicate file id in batch");
                    slots.push(Some(BatchOutcome {
                        result: Err(TesseraError::validation(format!(
                            "file id {file_id} appears more than once in the batch"
                        ))),
                        label: job.label,
                    }));
                    continue;
                }
            }
            slots.push(None);
            positions.push(index);

            let vault = self.clone();
            let label = job.label.clone();
            work.push((label, move || async move {
                vault.protect(&job.data, &job.options).await
            }));
        }

        let ran = run_bounded(self.defaults().batch_concurrency, work).await;
        for (index, outcome) in positions.into_iter().zip(ran) {
            slots[index] = Some(outcome);
        }
        let outcomes: Vec<_> = slots.into_iter().flatten().collect();

        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        info!(total, ok, failed = total - ok, "batch protect finished");
        outcomes
    }

    /// Recover every file id, `pipeline.batch_concurrency` at a time.
    pub async fn recover_batch(
        &self,
        file_ids: Vec<String>,
        user_key: Option<WrappingKey>,
    ) -> Vec<BatchOutcome<Vec<u8>>> {
        let total = file_ids.len();
        let work = file_ids
            .into_iter()
            .map(|file_id| {
                let vault = self.clone();
                let user_key = user_key.clone();
                (file_id.clone(), move || async move {
                    vault.recover(&file_id, user_key.as_ref()).await
                })
            })
            .collect();

        let outcomes = run_bounded(self.defaults().batch_concurrency, work).await;
        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        info!(total, ok, failed = total - ok, "batch recover finished");
        outcomes
    }
}
