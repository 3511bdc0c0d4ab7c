use crate::cache::{self, Caches};
use crate::claim::VaultSecretClaim;
use crate::prelude::*;
use crate::queue::WorkQueue;
use crate::reconcile::{ApiSecretWriter, Outcome, Reconciler};
use crate::vault::Assemble;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;

/// Consecutive failures tolerated per key before it is dropped.
const MAX_RETRIES: u32 = 5;

/// Interval at which cached claim keys are replayed through the queue.
const RESYNC_PERIOD: Duration = Duration::from_secs(60);

const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Error)]
pub enum Error {
  #[error("timed out waiting for caches to populate")]
  CacheSync,
}

/// Wires caches, queue and reconciler together and owns their lifetimes.
pub struct Controller {
  client: Client,
  assembler: Arc<dyn Assemble>,
  workers: usize,
}

impl Controller {
  pub fn new(client: Client, assembler: Arc<dyn Assemble>) -> Self {
    Controller {
      client,
      assembler,
      workers: DEFAULT_WORKERS,
    }
  }

  /// Number of worker tasks. Distinct keys reconcile in parallel; the queue
  /// still serializes passes for the same key.
  #[allow(dead_code)]
  pub fn workers(mut self, workers: usize) -> Self {
    self.workers = workers.max(1);
    self
  }

  /// Runs informers and workers until `stop` is cancelled, then drains.
  /// Returns only after every spawned task has exited.
  pub async fn run(self, stop: CancellationToken) -> Result<(), Error> {
    let queue = WorkQueue::new();

    info!("starting dweller controller");

    let (claims, claims_synced, claims_task) = cache::mirror_claims(
      Api::<VaultSecretClaim>::all(self.client.clone()),
      ListParams::default(),
      queue.clone(),
      stop.clone(),
    );
    let (secrets, secrets_synced, secrets_task) = cache::mirror(
      Api::<Secret>::all(self.client.clone()),
      ListParams::default(),
      stop.clone(),
    );
    let (service_accounts, accounts_synced, accounts_task) = cache::mirror(
      Api::<ServiceAccount>::all(self.client.clone()),
      ListParams::default(),
      stop.clone(),
    );

    let mut flags = [claims_synced, secrets_synced, accounts_synced];
    if !cache::wait_for_sync(&mut flags, &stop).await {
      queue.shutdown();
      return Err(Error::CacheSync);
    }

    info!("controller synced and ready");

    let resync_task = cache::resync(claims.clone(), queue.clone(), RESYNC_PERIOD, stop.clone());

    let caches = Caches {
      claims,
      secrets,
      service_accounts,
    };
    let reconciler = Arc::new(Reconciler::new(
      caches,
      self.assembler,
      Arc::new(ApiSecretWriter::new(self.client)),
    ));

    let workers: Vec<JoinHandle<()>> = (0..self.workers)
      .map(|worker| tokio::spawn(run_worker(worker, queue.clone(), reconciler.clone())))
      .collect();

    stop.cancelled().await;

    // informers stop on the cancelled token; drain the queue so workers
    // observe the terminal dequeue and exit
    queue.shutdown();
    for worker in workers {
      let _ = worker.await;
    }
    for task in [claims_task, secrets_task, accounts_task, resync_task] {
      let _ = task.await;
    }

    Ok(())
  }
}

/// Worker loop: take a key, reconcile, classify. Reconciler panics are
/// contained here; they never take the controller down.
async fn run_worker(worker: usize, queue: WorkQueue, reconciler: Arc<Reconciler>) {
  debug!("worker {} started", worker);

  while let Some(key) = queue.get().await {
    let outcome = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await;
    queue.done(&key);

    match outcome {
      Ok(outcome) => classify(&queue, &key, outcome),
      Err(panic) => {
        error!("reconciler panicked for {}: {}", key, panic_message(&*panic));
        queue.forget(&key);
      }
    }
  }

  debug!("worker {} stopped", worker);
}

/// Retry policy for one finished reconciliation.
fn classify(queue: &WorkQueue, key: &str, outcome: Outcome) {
  match outcome {
    Outcome::Done => queue.forget(key),
    Outcome::Retry(err) => {
      if queue.num_requeues(key) < MAX_RETRIES {
        warn!("error processing {} (will retry): {}", key, err);
        queue.add_rate_limited(key);
      } else {
        error!("error processing {} (giving up): {}", key, err);
        queue.forget(key);
      }
    }
    Outcome::Fatal(err) => {
      error!("error processing {} (not retryable): {}", key, err);
      queue.forget(key);
    }
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
  panic
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("opaque panic payload")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::claim::{SecretTemplate, VaultSecretClaimSpec};
  use crate::reconcile::{SecretWriter, WriteError};
  use crate::vault::{self, Credentials};
  use k8s_openapi::api::core::v1::ObjectReference;
  use kube::runtime::reflector::store::Writer;
  use kube::runtime::watcher::Event;

  fn retry_error() -> Outcome {
    Outcome::Retry(crate::reconcile::Error::ServiceAccountNotFound {
      namespace: "app".to_owned(),
      name: "app-sa".to_owned(),
    })
  }

  #[tokio::test]
  async fn done_resets_the_retry_counter() {
    let queue = WorkQueue::new();
    queue.add_rate_limited("app/db");
    queue.add_rate_limited("app/db");

    classify(&queue, "app/db", Outcome::Done);
    assert_eq!(queue.num_requeues("app/db"), 0);
  }

  #[tokio::test]
  async fn retry_budget_is_bounded() {
    let queue = WorkQueue::new();

    for attempt in 0..MAX_RETRIES {
      assert_eq!(queue.num_requeues("app/db"), attempt);
      classify(&queue, "app/db", retry_error());
    }
    assert_eq!(queue.num_requeues("app/db"), MAX_RETRIES);

    // budget exhausted: the key is dropped and its counters reset
    classify(&queue, "app/db", retry_error());
    assert_eq!(queue.num_requeues("app/db"), 0);
  }

  #[tokio::test]
  async fn fatal_outcomes_are_not_requeued() {
    let queue = WorkQueue::new();
    classify(
      &queue,
      "app/db",
      Outcome::Fatal(crate::reconcile::Error::NotControlled {
        namespace: "app".to_owned(),
        name: "db".to_owned(),
      }),
    );

    assert_eq!(queue.num_requeues("app/db"), 0);
    queue.shutdown();
    assert_eq!(queue.get().await, None);
  }

  struct PanickingAssembler;

  #[async_trait::async_trait]
  impl Assemble for PanickingAssembler {
    async fn assemble(&self, _: &VaultSecretClaim, _: Option<&Credentials>) -> Result<Secret, vault::Error> {
      panic!("assembler blew up");
    }
  }

  struct NullWriter;

  #[async_trait::async_trait]
  impl SecretWriter for NullWriter {
    async fn create(&self, _: &str, _: &Secret) -> Result<(), WriteError> {
      Ok(())
    }

    async fn replace(&self, _: &str, _: &str, _: &Secret) -> Result<(), WriteError> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn worker_contains_reconciler_panics() {
    let mut claim = VaultSecretClaim::new(
      "db",
      VaultSecretClaimSpec {
        service_account_name: "app-sa".to_owned(),
        vault_role: "app".to_owned(),
        secret: SecretTemplate::default(),
      },
    );
    claim.metadata.namespace = Some("app".to_owned());
    claim.metadata.uid = Some("uid-1".to_owned());

    let account = ServiceAccount {
      metadata: ObjectMeta {
        name: Some("app-sa".to_owned()),
        namespace: Some("app".to_owned()),
        ..ObjectMeta::default()
      },
      secrets: Some(vec![ObjectReference {
        name: Some("app-sa-token".to_owned()),
        ..ObjectReference::default()
      }]),
      ..ServiceAccount::default()
    };

    let token_secret = Secret {
      metadata: ObjectMeta {
        name: Some("app-sa-token".to_owned()),
        namespace: Some("app".to_owned()),
        ..ObjectMeta::default()
      },
      data: Some(BTreeMap::from([("token".to_owned(), ByteString(b"jwt".to_vec()))])),
      ..Secret::default()
    };

    let mut claim_writer = Writer::default();
    claim_writer.apply_watcher_event(&Event::Applied(claim));
    let mut secret_writer = Writer::default();
    secret_writer.apply_watcher_event(&Event::Applied(token_secret));
    let mut account_writer = Writer::default();
    account_writer.apply_watcher_event(&Event::Applied(account));

    let reconciler = Arc::new(Reconciler::new(
      Caches {
        claims: claim_writer.as_reader(),
        secrets: secret_writer.as_reader(),
        service_accounts: account_writer.as_reader(),
      },
      Arc::new(PanickingAssembler),
      Arc::new(NullWriter),
    ));

    let queue = WorkQueue::new();
    queue.add("app/db");
    queue.shutdown();

    // the panic is swallowed at the worker boundary; the task exits cleanly
    let worker = tokio::spawn(run_worker(0, queue.clone(), reconciler));
    assert!(worker.await.is_ok());
    assert_eq!(queue.num_requeues("app/db"), 0);
  }
}
