use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempo_config::{RetryBackoff, TriggerDef};
use tempo_fanout::{FanOutCoordinator, SubjectOutcome, SubjectResult};
use tempo_planning::{
  ContentGenerator, FETCH_ACTIVE_USERS, GENERATE_PLANS, GeneratorError, NOTIFY_USERS,
  NotifyError, PlanNotifier, PlanPayload, StaticSubjectRepository, Subject, TemplateGenerator,
  weekly_plan_workflow,
};
use tempo_store::{MemoryStore, RunStatus, StepStatus, Store, Trigger};
use tempo_trigger::{RunRequest, TriggerDispatcher};
use tempo_workflow::{ExecutorConfig, RetryPolicy, WorkflowExecutor};
use tokio_util::sync::CancellationToken;

const WORKFLOW_ID: &str = "generate-weekly-plan";
const EVENT: &str = "app/planning.requested";
const CRON: &str = "0 9 * * Mon";

/// Fails for the listed subjects, renders a plan for everyone else.
struct ScriptedGenerator {
  failures: HashMap<String, GeneratorError>,
  /// Subjects that fail only on their first call.
  flaky: Mutex<Vec<String>>,
  calls: Mutex<HashMap<String, u32>>,
  inner: TemplateGenerator,
}

impl ScriptedGenerator {
  fn new() -> Self {
    Self {
      failures: HashMap::new(),
      flaky: Mutex::new(Vec::new()),
      calls: Mutex::new(HashMap::new()),
      inner: TemplateGenerator::default(),
    }
  }

  fn failing(mut self, subject_id: &str, error: GeneratorError) -> Self {
    self.failures.insert(subject_id.to_string(), error);
    self
  }

  fn flaky(self, subject_id: &str) -> Self {
    self.flaky.lock().unwrap().push(subject_id.to_string());
    self
  }

  fn calls(&self, subject_id: &str) -> u32 {
    self
      .calls
      .lock()
      .unwrap()
      .get(subject_id)
      .copied()
      .unwrap_or(0)
  }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
  async fn generate(&self, subject: &Subject) -> Result<PlanPayload, GeneratorError> {
    *self
      .calls
      .lock()
      .unwrap()
      .entry(subject.id.clone())
      .or_default() += 1;

    if let Some(error) = self.failures.get(&subject.id) {
      return Err(error.clone());
    }
    {
      let mut flaky = self.flaky.lock().unwrap();
      if let Some(pos) = flaky.iter().position(|id| id == &subject.id) {
        flaky.remove(pos);
        return Err(GeneratorError::RateLimited("slow down".into()));
      }
    }
    self.inner.generate(subject).await
  }
}

#[derive(Default)]
struct RecordingNotifier {
  delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl PlanNotifier for RecordingNotifier {
  async fn notify(&self, plans: &[PlanPayload]) -> Result<usize, NotifyError> {
    let mut delivered = self.delivered.lock().unwrap();
    delivered.extend(plans.iter().map(|p| p.subject_id.clone()));
    Ok(plans.len())
  }
}

fn subjects(n: usize) -> Vec<Subject> {
  (1..=n)
    .map(|i| Subject::new(format!("user_{i}"), format!("User {i}"), ["Career", "Health"]))
    .collect()
}

fn config() -> ExecutorConfig {
  ExecutorConfig {
    retry: RetryPolicy {
      max_attempts: 3,
      backoff: RetryBackoff::Exponential,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(5),
    },
    step_timeout: Duration::from_secs(30),
    lease_ttl: Duration::from_secs(60),
    owner: "planning-test".to_string(),
  }
}

struct Harness {
  store: Arc<MemoryStore>,
  dispatcher: TriggerDispatcher,
  executor: WorkflowExecutor,
  notifier: Arc<RecordingNotifier>,
}

fn harness(subjects: Vec<Subject>, generator: Arc<ScriptedGenerator>) -> Harness {
  harness_with(subjects, generator, FanOutCoordinator::new(5, 1), config())
}

fn harness_with(
  subjects: Vec<Subject>,
  generator: Arc<dyn ContentGenerator>,
  coordinator: FanOutCoordinator,
  config: ExecutorConfig,
) -> Harness {
  let store = Arc::new(MemoryStore::new());
  let notifier = Arc::new(RecordingNotifier::default());

  let workflow = weekly_plan_workflow(
    WORKFLOW_ID,
    Arc::new(StaticSubjectRepository::new(subjects)),
    generator,
    notifier.clone(),
    coordinator,
  )
  .unwrap();

  let dispatcher = TriggerDispatcher::new(
    store.clone(),
    WORKFLOW_ID,
    &[TriggerDef::cron(CRON), TriggerDef::event(EVENT)],
  )
  .unwrap();
  let executor = WorkflowExecutor::new(Arc::new(workflow), store.clone(), config);

  Harness {
    store,
    dispatcher,
    executor,
    notifier,
  }
}

async fn scheduled(h: &Harness) -> RunRequest {
  h.dispatcher
    .on_schedule_tick(CRON, chrono::Utc::now())
    .await
    .unwrap()
}

#[tokio::test]
async fn test_one_unavailable_subject_does_not_fail_run() {
  let generator = Arc::new(
    ScriptedGenerator::new().failing("user_4", GeneratorError::Unavailable("down".into())),
  );
  let h = harness(subjects(10), generator.clone());

  let request = scheduled(&h).await;
  let outcome = h
    .executor
    .start(&request, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcome.status, RunStatus::Completed);
  assert_eq!(
    (
      outcome.summary.generated,
      outcome.summary.skipped,
      outcome.summary.failed
    ),
    (9, 0, 1)
  );
  // One retry for the unavailable subject.
  assert_eq!(generator.calls("user_4"), 2);
  assert_eq!(generator.calls("user_1"), 1);

  let delivered = h.notifier.delivered.lock().unwrap().clone();
  assert_eq!(delivered.len(), 9);
  assert!(!delivered.contains(&"user_4".to_string()));

  let run = h.store.get_run(&request.run_id).await.unwrap();
  let names: Vec<&str> = run.steps.iter().map(|s| s.step_name.as_str()).collect();
  assert_eq!(names, vec![FETCH_ACTIVE_USERS, GENERATE_PLANS, NOTIFY_USERS]);
  assert!(run.steps.iter().all(|s| s.status == StepStatus::Succeeded));
  assert_eq!(
    run.steps[2].output.as_ref().map(|o| o.0.clone()),
    Some(json!({"sent": 9}))
  );

  let outcomes: Vec<SubjectOutcome> =
    serde_json::from_value(run.steps[1].output.clone().unwrap().0).unwrap();
  let failed: Vec<&SubjectOutcome> = outcomes
    .iter()
    .filter(|o| matches!(o.result, SubjectResult::Failed { .. }))
    .collect();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].subject_id, "user_4");
}

#[tokio::test]
async fn test_no_active_subjects_completes_empty() {
  let h = harness(Vec::new(), Arc::new(ScriptedGenerator::new()));

  let request = scheduled(&h).await;
  let outcome = h
    .executor
    .start(&request, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcome.status, RunStatus::Completed);
  assert_eq!(
    (
      outcome.summary.generated,
      outcome.summary.skipped,
      outcome.summary.failed
    ),
    (0, 0, 0)
  );
  assert!(h.notifier.delivered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_event_payload_does_not_bypass_subject_listing() {
  let h = harness(subjects(2), Arc::new(ScriptedGenerator::new()));

  let request = h
    .dispatcher
    .on_event(EVENT, json!({"requestedBy": "user_9"}))
    .await
    .unwrap();
  assert_eq!(
    request.trigger,
    Trigger::EventPublished {
      event: EVENT.to_string(),
      payload: json!({"requestedBy": "user_9"}),
    }
  );

  let outcome = h
    .executor
    .start(&request, CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(outcome.summary.generated, 2);

  let fetched: Vec<Subject> = serde_json::from_value(
    h.executor
      .ledger()
      .get_result(&request.run_id, FETCH_ACTIVE_USERS)
      .await
      .unwrap()
      .unwrap(),
  )
  .unwrap();
  assert_eq!(fetched, subjects(2));
}

#[tokio::test]
async fn test_subjects_without_domains_are_skipped() {
  let mut list = subjects(2);
  list.push(Subject::new("user_3", "No Focus", Vec::<String>::new()));
  let generator = Arc::new(ScriptedGenerator::new());
  let h = harness(list, generator.clone());

  let request = scheduled(&h).await;
  let outcome = h
    .executor
    .start(&request, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(
    (
      outcome.summary.generated,
      outcome.summary.skipped,
      outcome.summary.failed
    ),
    (2, 1, 0)
  );
  assert_eq!(generator.calls("user_3"), 0);
}

#[tokio::test]
async fn test_rate_limited_subject_recovers_on_retry() {
  let generator = Arc::new(ScriptedGenerator::new().flaky("user_2"));
  let h = harness(subjects(3), generator.clone());

  let request = scheduled(&h).await;
  let outcome = h
    .executor
    .start(&request, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcome.summary.generated, 3);
  assert_eq!(generator.calls("user_2"), 2);
}

#[tokio::test]
async fn test_rejected_subject_not_retried() {
  let generator = Arc::new(
    ScriptedGenerator::new().failing("user_1", GeneratorError::Rejected("policy".into())),
  );
  let h = harness(subjects(2), generator.clone());

  let request = scheduled(&h).await;
  let outcome = h
    .executor
    .start(&request, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcome.status, RunStatus::Completed);
  assert_eq!((outcome.summary.generated, outcome.summary.failed), (1, 1));
  assert_eq!(generator.calls("user_1"), 1);
}

#[tokio::test]
async fn test_overlapping_schedule_ticks_run_once() {
  let h = harness(subjects(1), Arc::new(ScriptedGenerator::new()));
  let now = chrono::Utc::now();

  let first = h.dispatcher.on_schedule_tick(CRON, now).await.unwrap();
  let second = h.dispatcher.on_schedule_tick(CRON, now).await;
  assert!(second.unwrap_err().is_suppressed());

  h.executor
    .start(&first, CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(h.store.list_runs(WORKFLOW_ID).await.unwrap().len(), 1);
}

/// Takes `delay` per plan and tracks how many calls overlap.
struct SlowGenerator {
  delay: Duration,
  calls: AtomicUsize,
  in_flight: Arc<AtomicUsize>,
  peak: AtomicUsize,
  inner: TemplateGenerator,
}

impl SlowGenerator {
  fn new(delay: Duration) -> Self {
    Self {
      delay,
      calls: AtomicUsize::new(0),
      in_flight: Arc::new(AtomicUsize::new(0)),
      peak: AtomicUsize::new(0),
      inner: TemplateGenerator::default(),
    }
  }
}

/// Leaves the in-flight count when the call ends or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

#[async_trait]
impl ContentGenerator for SlowGenerator {
  async fn generate(&self, subject: &Subject) -> Result<PlanPayload, GeneratorError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    let _guard = InFlight(self.in_flight.clone());
    self.peak.fetch_max(now, Ordering::SeqCst);

    tokio::time::sleep(self.delay).await;
    self.inner.generate(subject).await
  }
}

#[tokio::test]
async fn test_timed_out_generation_stops_its_subjects() {
  let generator = Arc::new(SlowGenerator::new(Duration::from_millis(300)));
  let mut config = config();
  config.step_timeout = Duration::from_millis(100);
  config.retry.base_delay = Duration::from_millis(10);
  config.retry.max_delay = Duration::from_millis(10);
  let h = harness_with(
    subjects(4),
    generator.clone(),
    FanOutCoordinator::new(2, 0),
    config,
  );

  let request = scheduled(&h).await;
  let outcome = h
    .executor
    .start(&request, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcome.status, RunStatus::Failed);
  assert!(outcome.error.unwrap().contains("timed out"));
  // Every attempt starts a fresh fan-out; the abandoned one never overlaps it.
  assert!(generator.peak.load(Ordering::SeqCst) <= 2);

  let calls = generator.calls.load(Ordering::SeqCst);
  tokio::time::sleep(Duration::from_millis(400)).await;
  assert_eq!(generator.calls.load(Ordering::SeqCst), calls);
  assert_eq!(generator.in_flight.load(Ordering::SeqCst), 0);
  assert!(h.notifier.delivered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_during_generation_reports_every_subject() {
  let generator = Arc::new(SlowGenerator::new(Duration::from_millis(100)));
  let h = harness_with(
    subjects(4),
    generator.clone(),
    FanOutCoordinator::new(2, 0),
    config(),
  );

  let request = scheduled(&h).await;
  let (outcome, cancelled) = tokio::join!(
    h.executor.start(&request, CancellationToken::new()),
    async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      h.executor.cancel_run(&request.run_id).await
    }
  );
  assert!(cancelled.unwrap());
  let outcome = outcome.unwrap();

  assert_eq!(outcome.status, RunStatus::Failed);
  assert_eq!(outcome.error.as_deref(), Some("cancelled"));
  // In-flight subjects finish, the rest are never dispatched.
  assert_eq!(
    (
      outcome.summary.generated,
      outcome.summary.skipped,
      outcome.summary.failed
    ),
    (2, 2, 0)
  );
  assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
  assert_eq!(
    h.store.get_summary(&request.run_id).await.unwrap(),
    Some(outcome.summary)
  );

  // Nothing after generation ran and the partial fan-out is not memoized.
  assert!(h.notifier.delivered.lock().unwrap().is_empty());
  assert_eq!(
    h.executor
      .ledger()
      .get_result(&request.run_id, GENERATE_PLANS)
      .await
      .unwrap(),
    None
  );
}
