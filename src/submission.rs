use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::record::{Record, RecordFactory};
use crate::store::{Status, StoreClient};

// Upper bound on records in flight. Keeps the permit and channel sizes well inside
// what tokio accepts.
pub const MAX_WORKERS: usize = 1024;

// How a run is driven. `max_attempts` bounds failure statuses and transport errors
// alike; a record that never succeeds is submitted exactly that many times.
#[derive(Debug, Clone)]
pub struct Plan {
    pub rows: u64,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub index: u64,
    pub id: String,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: Vec<FailedRecord>,
    pub submissions: u64,
    pub rejections: u64,
    pub transport_errors: u64,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.id.as_str())
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Added {} records, {} stored, {} failed after retries [submissions={}, rejections={}, transport_errors={}]",
            self.attempted,
            self.succeeded,
            self.failed.len(),
            self.submissions,
            self.rejections,
            self.transport_errors
        )?;
        if self.interrupted {
            write!(f, " (interrupted)")?;
        }
        Ok(())
    }
}

// Drives `plan.rows` records through the store. Per-record failures never escape: they
// end up in the summary. The only errors returned are internal, a panicked task.
//
// Each record is generated once a worker permit is free and is then owned by a single
// task for its whole attempt sequence, so with one worker exactly one record is in
// flight at any time. Outcomes flow over a channel to a tally task, which is the only
// owner of the counters.
pub async fn run<S: StoreClient>(
    store: Arc<S>,
    mut factory: RecordFactory,
    plan: &Plan,
    cancel: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let workers = plan.workers.clamp(1, MAX_WORKERS);
    tracing::info!(
        "Starting run [rows={}, max_attempts={}, workers={}, last_name={}]",
        plan.rows,
        plan.max_attempts,
        workers,
        factory.last_name()
    );

    let (outcome_tx, outcome_rx) = mpsc::channel(workers * 2);
    let tally = tokio::spawn(Tally::default().listen(outcome_rx));
    let semaphore = Arc::new(Semaphore::new(workers));

    let mut attempted = 0;
    let mut interrupted = false;
    for counter in 0..plan.rows {
        // Checking the token first means a cancelled run never starts another record,
        // even when a permit is already available.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("Interrupted, no more records will be generated [counter={}]", counter);
                interrupted = true;
                break;
            },
            permit = semaphore.clone().acquire_owned() => permit?,
        };

        let record = factory.next(Utc::now());
        attempted += 1;

        let store = store.clone();
        let outcome_tx = outcome_tx.clone();
        let plan = plan.clone();
        tokio::spawn(async move {
            let outcome = submit_record(store.as_ref(), counter, record, &plan).await;
            // The tally only stops once every sender is gone, so this cannot fail.
            let _ = outcome_tx.send(outcome).await;
            drop(permit);
        });
    }

    // The tally drains the channel once the in-flight tasks drop their senders too.
    drop(outcome_tx);
    let mut summary = tally.await?;
    summary.attempted = attempted;
    summary.interrupted = interrupted;
    tracing::info!("{}", summary);
    Ok(summary)
}

#[derive(Debug)]
struct Outcome {
    counter: u64,
    attempts: u32,
    rejections: u64,
    transport_errors: u64,
    failure: Option<FailedRecord>,
}

async fn submit_record<S: StoreClient>(
    store: &S,
    counter: u64,
    record: Record,
    plan: &Plan,
) -> Outcome {
    let batch = [record];
    let mut outcome = Outcome {
        counter,
        attempts: 0,
        rejections: 0,
        transport_errors: 0,
        failure: None,
    };
    let mut last_error = String::new();

    for attempt in 1..=plan.max_attempts {
        outcome.attempts = attempt;
        match store.submit(&batch).await {
            Ok(Status::Success) => {
                tracing::info!(counter, attempt, status = Status::SUCCESS_CODE, "Record submitted");
                return outcome;
            }
            Ok(status @ Status::Failure(code)) => {
                tracing::info!(counter, attempt, status = code, "Record rejected");
                outcome.rejections += 1;
                last_error = format!("status {status}");
            }
            Err(err) => {
                tracing::warn!(counter, attempt, error = %err, "Submission failed");
                outcome.transport_errors += 1;
                last_error = err.to_string();
            }
        }
        if attempt < plan.max_attempts && !plan.backoff.is_zero() {
            tokio::time::sleep(backoff_delay(plan.backoff, attempt)).await;
        }
    }

    let [record] = batch;
    tracing::error!(
        counter,
        id = %record.id,
        attempts = outcome.attempts,
        "Failed send at {}",
        counter
    );
    outcome.failure = Some(FailedRecord {
        index: counter,
        id: record.id,
        attempts: outcome.attempts,
        last_error,
    });
    outcome
}

// Linear in the attempt number, saturating instead of overflowing.
fn backoff_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt)
}

#[derive(Default)]
struct Tally {
    summary: RunSummary,
}

impl Tally {
    async fn listen(mut self, mut outcome_rx: mpsc::Receiver<Outcome>) -> RunSummary {
        while let Some(outcome) = outcome_rx.recv().await {
            self.record(outcome);
        }
        // Workers finish out of order.
        self.summary.failed.sort_by_key(|f| f.index);
        self.summary
    }

    fn record(&mut self, outcome: Outcome) {
        tracing::debug!(
            "Outcome received [counter={}, attempts={}]",
            outcome.counter,
            outcome.attempts
        );
        let summary = &mut self.summary;
        summary.submissions += u64::from(outcome.attempts);
        summary.rejections += outcome.rejections;
        summary.transport_errors += outcome.transport_errors;
        match outcome.failure {
            Some(failure) => summary.failed.push(failure),
            None => summary.succeeded += 1,
        }
    }
}
