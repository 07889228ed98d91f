use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::outcome::{SubjectError, SubjectOutcome, SubjectResult};

/// Reason recorded for subjects never dispatched because the run was cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// Something the coordinator can fan out over.
pub trait FanOutSubject: Clone + Send + Sync + 'static {
  fn subject_id(&self) -> &str;
}

impl FanOutSubject for String {
  fn subject_id(&self) -> &str {
    self
  }
}

/// Bounded, failure-isolated per-subject execution.
#[derive(Debug, Clone)]
pub struct FanOutCoordinator {
  concurrency: usize,
  subject_retries: u32,
}

impl FanOutCoordinator {
  /// `concurrency` is clamped to at least one.
  pub fn new(concurrency: usize, subject_retries: u32) -> Self {
    Self {
      concurrency: concurrency.max(1),
      subject_retries,
    }
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Run `work` once per subject and return exactly one outcome per subject.
  ///
  /// At most `concurrency` subjects are in flight at a time. Each subject runs
  /// in its own task, so an error or panic only affects its own outcome.
  /// [`SubjectError::Retryable`] is retried up to `subject_retries` times.
  /// Once `cancel` fires no further subject is dispatched; those left over are
  /// reported as skipped while in-flight subjects run to completion. Dropping
  /// the returned future aborts the subjects still running.
  pub async fn for_each<S, F, Fut>(
    &self,
    subjects: Vec<S>,
    work: F,
    cancel: &CancellationToken,
  ) -> Vec<SubjectOutcome>
  where
    S: FanOutSubject,
    F: Fn(S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SubjectResult, SubjectError>> + Send + 'static,
  {
    let total = subjects.len();
    info!(
      subjects = total,
      concurrency = self.concurrency,
      "fanout_started"
    );

    let semaphore = Arc::new(Semaphore::new(self.concurrency));
    let work = Arc::new(work);
    let retries = self.subject_retries;

    // Dropping the set aborts every subject still in flight, so a caller that
    // gives up on this future leaves no work running behind it.
    let mut tasks: JoinSet<(usize, SubjectResult)> = JoinSet::new();
    let mut ids = Vec::with_capacity(total);
    let mut skipped = Vec::new();
    let mut subjects = subjects.into_iter();

    for subject in subjects.by_ref() {
      let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = semaphore.clone().acquire_owned() => permit.ok(),
      };
      let Some(permit) = permit else {
        skipped.push(subject.subject_id().to_string());
        break;
      };

      let index = ids.len();
      ids.push(subject.subject_id().to_string());
      let work = work.clone();
      tasks.spawn(async move {
        let subject_id = subject.subject_id().to_string();
        let result = AssertUnwindSafe(run_subject(subject, work.as_ref(), retries))
          .catch_unwind()
          .await
          .unwrap_or_else(|_| {
            warn!(subject_id = %subject_id, "subject_task_panicked");
            SubjectResult::failed("subject task panicked")
          });
        drop(permit);
        (index, result)
      });
    }
    skipped.extend(subjects.map(|s| s.subject_id().to_string()));

    if !skipped.is_empty() {
      info!(skipped = skipped.len(), "fanout_cancelled");
    }

    let mut results: Vec<Option<SubjectResult>> = vec![None; ids.len()];
    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((index, result)) => results[index] = Some(result),
        Err(e) => warn!(error = %e, "subject_task_failed"),
      }
    }

    let mut outcomes = Vec::with_capacity(total);
    for (subject_id, result) in ids.into_iter().zip(results) {
      let result = result.unwrap_or_else(|| SubjectResult::failed("subject task failed"));
      outcomes.push(SubjectOutcome::new(subject_id, result));
    }
    outcomes.extend(
      skipped
        .into_iter()
        .map(|subject_id| SubjectOutcome::new(subject_id, SubjectResult::skipped(CANCELLED_REASON))),
    );

    info!(
      subjects = total,
      generated = outcomes.iter().filter(|o| o.is_generated()).count(),
      "fanout_completed"
    );
    outcomes
  }
}

async fn run_subject<S, F, Fut>(subject: S, work: &F, retries: u32) -> SubjectResult
where
  S: FanOutSubject,
  F: Fn(S) -> Fut,
  Fut: Future<Output = Result<SubjectResult, SubjectError>>,
{
  let mut attempt = 0;
  loop {
    match work(subject.clone()).await {
      Ok(result) => return result,
      Err(SubjectError::Retryable(error)) if attempt < retries => {
        attempt += 1;
        debug!(
          subject_id = %subject.subject_id(),
          attempt,
          error = %error,
          "subject_retrying"
        );
      }
      Err(SubjectError::Retryable(error)) | Err(SubjectError::Fatal(error)) => {
        warn!(subject_id = %subject.subject_id(), error = %error, "subject_failed");
        return SubjectResult::failed(error);
      }
    }
  }
}
