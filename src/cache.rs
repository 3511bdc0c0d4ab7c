use crate::claim::VaultSecretClaim;
use crate::prelude::*;
use crate::queue::WorkQueue;
use futures::TryStreamExt;
use kube::runtime::reflector;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Read-only replicas of everything reconciliation depends on. Updated only
/// by the watch tasks; readers get shared objects and must copy before
/// mutating.
#[derive(Clone)]
pub struct Caches {
  pub claims: Store<VaultSecretClaim>,
  pub secrets: Store<Secret>,
  pub service_accounts: Store<ServiceAccount>,
}

/// Flips to `true` once the initial list for a resource has been applied.
pub type SyncFlag = watch::Receiver<bool>;

/// Mirrors `api` into a local store until `stop` is cancelled.
pub fn mirror<K>(api: Api<K>, params: ListParams, stop: CancellationToken) -> (Store<K>, SyncFlag, JoinHandle<()>)
where
  K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
  spawn_watch(api, params, stop, |_| {})
}

/// Like [`mirror`] for claims, feeding the key of every observed claim into
/// the queue: adds, updates, deletes, and the initial and periodic replays.
pub fn mirror_claims(
  api: Api<VaultSecretClaim>,
  params: ListParams,
  queue: WorkQueue,
  stop: CancellationToken,
) -> (Store<VaultSecretClaim>, SyncFlag, JoinHandle<()>) {
  spawn_watch(api, params, stop, move |claim| enqueue(&queue, claim))
}

fn spawn_watch<K>(
  api: Api<K>,
  params: ListParams,
  stop: CancellationToken,
  on_object: impl Fn(&K) + Send + 'static,
) -> (Store<K>, SyncFlag, JoinHandle<()>)
where
  K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
  let writer = Writer::default();
  let store = writer.as_reader();
  let (synced_tx, synced_rx) = watch::channel(false);

  let task = tokio::spawn(async move {
    let stream = reflector(writer, watcher(api, params));
    futures::pin_mut!(stream);

    loop {
      let event = tokio::select! {
        _ = stop.cancelled() => break,
        event = stream.try_next() => event,
      };

      match event {
        Ok(Some(Event::Restarted(objects))) => {
          for object in &objects {
            on_object(object);
          }
          let _ = synced_tx.send(true);
        }
        Ok(Some(Event::Applied(object) | Event::Deleted(object))) => on_object(&object),
        Ok(None) => break,
        // the watcher re-lists and re-watches on its own; just report
        Err(err) => warn!("watch stream for {}: {}", K::kind(&()), err),
      }
    }
  });

  (store, synced_rx, task)
}

/// Replays every cached claim key through the queue on a fixed interval,
/// independent of server-side change.
pub fn resync(
  store: Store<VaultSecretClaim>,
  queue: WorkQueue,
  period: Duration,
  stop: CancellationToken,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let start = tokio::time::Instant::now() + period;
    let mut tick = tokio::time::interval_at(start, period);

    loop {
      tokio::select! {
        _ = stop.cancelled() => break,
        _ = tick.tick() => {}
      }

      for claim in store.state() {
        enqueue(&queue, &claim);
      }
    }
  })
}

/// Blocks until every cache has applied its initial list. Bails out when the
/// stop signal wins the race; the controller never serves from a cold cache.
pub async fn wait_for_sync(flags: &mut [SyncFlag], stop: &CancellationToken) -> bool {
  let all = async {
    for flag in flags.iter_mut() {
      loop {
        if *flag.borrow_and_update() {
          break;
        }
        if flag.changed().await.is_err() {
          return false;
        }
      }
    }
    true
  };

  tokio::select! {
    synced = all => synced,
    _ = stop.cancelled() => false,
  }
}

fn enqueue(queue: &WorkQueue, claim: &VaultSecretClaim) {
  match claim_key(claim) {
    Some(key) => queue.add(&key),
    // nothing to key the reconciliation on; report and drop
    None => warn!("dropping claim event without name metadata"),
  }
}

/// `"namespace/name"`, the canonical reconciliation key. Cluster-scoped
/// objects would key on the bare name.
pub fn claim_key(claim: &VaultSecretClaim) -> Option<String> {
  let name = claim.metadata.name.as_deref()?;
  match claim.metadata.namespace.as_deref() {
    Some(namespace) => Some(format!("{}/{}", namespace, name)),
    None => Some(name.to_owned()),
  }
}

/// Lookup reference for a cache entry.
pub fn object_ref<K>(namespace: Option<&str>, name: &str) -> ObjectRef<K>
where
  K: Resource<DynamicType = ()>,
{
  let reference = ObjectRef::new(name);
  match namespace {
    Some(namespace) => reference.within(namespace),
    None => reference,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::claim::{SecretTemplate, VaultSecretClaimSpec};

  fn claim(namespace: Option<&str>, name: &str) -> VaultSecretClaim {
    let mut claim = VaultSecretClaim::new(
      name,
      VaultSecretClaimSpec {
        service_account_name: "app-sa".to_owned(),
        vault_role: "app".to_owned(),
        secret: SecretTemplate::default(),
      },
    );
    claim.metadata.namespace = namespace.map(str::to_owned);
    claim
  }

  #[test]
  fn keys_are_namespace_slash_name() {
    assert_eq!(claim_key(&claim(Some("app"), "db")).as_deref(), Some("app/db"));
    assert_eq!(claim_key(&claim(None, "db")).as_deref(), Some("db"));
  }

  #[test]
  fn unnamed_objects_cannot_be_keyed() {
    let mut nameless = claim(Some("app"), "db");
    nameless.metadata.name = None;
    assert_eq!(claim_key(&nameless), None);
  }

  #[tokio::test]
  async fn enqueue_feeds_the_queue() {
    let queue = WorkQueue::new();
    enqueue(&queue, &claim(Some("app"), "db"));

    assert_eq!(queue.get().await.as_deref(), Some("app/db"));
    queue.done("app/db");
  }

  #[test]
  fn object_refs_resolve_cache_entries() {
    let mut writer = Writer::default();
    writer.apply_watcher_event(&Event::Applied(claim(Some("app"), "db")));
    let store = writer.as_reader();

    assert!(store.get(&object_ref(Some("app"), "db")).is_some());
    assert!(store.get(&object_ref(Some("other"), "db")).is_none());
    assert!(store.get(&object_ref(None, "db")).is_none());
  }
}
