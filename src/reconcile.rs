use crate::cache::{object_ref, Caches};
use crate::claim::VaultSecretClaim;
use crate::prelude::*;
use crate::vault::{self, Assemble, Credentials};

/// Field of the service-account token secret holding the JWT.
const TOKEN_KEY: &str = "token";

/// Result of one reconciliation pass.
#[derive(Debug)]
pub enum Outcome {
  /// Desired state reached (or the claim is gone); drop the retry counters.
  Done,
  /// Transient failure; the key goes back on the queue with backoff.
  Retry(Error),
  /// Non-retryable conflict; logged and dropped until a new event arrives.
  Fatal(Error),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("service account {namespace}/{name} not found")]
  ServiceAccountNotFound { namespace: String, name: String },

  #[error("service account {namespace}/{name} must have exactly one bound token secret, found {count}")]
  TokenSecretCount {
    namespace: String,
    name: String,
    count: usize,
  },

  #[error("token secret {namespace}/{name} not found")]
  TokenSecretNotFound { namespace: String, name: String },

  #[error("token secret {namespace}/{name} has no usable token")]
  MissingToken { namespace: String, name: String },

  #[error("secret {namespace}/{name} exists but is not controlled by the claim")]
  NotControlled { namespace: String, name: String },

  #[error("secret {0} was created concurrently")]
  CreateRace(String),

  #[error("failed to create secret: {0}")]
  Create(#[source] WriteError),

  #[error("failed to update secret: {0}")]
  Update(#[source] WriteError),

  #[error(transparent)]
  Assemble(#[from] vault::Error),

  #[error("MissingObjectKey: {0}")]
  MissingObjectKey(&'static str),
}

impl Error {
  /// Ownership conflicts never heal on their own; everything else may.
  fn is_fatal(&self) -> bool {
    matches!(self, Error::NotControlled { .. })
  }
}

/// Write half of the kubernetes secret API, split out so reconciliation
/// scenarios can run against a recording fake.
#[async_trait::async_trait]
pub trait SecretWriter: Send + Sync {
  async fn create(&self, namespace: &str, secret: &Secret) -> Result<(), WriteError>;
  async fn replace(&self, namespace: &str, name: &str, secret: &Secret) -> Result<(), WriteError>;
}

#[derive(Debug, Error)]
pub enum WriteError {
  #[error("already exists")]
  AlreadyExists,

  #[error(transparent)]
  Api(kube::Error),
}

/// [`SecretWriter`] backed by the kubernetes API.
pub struct ApiSecretWriter {
  client: Client,
}

impl ApiSecretWriter {
  pub fn new(client: Client) -> Self {
    ApiSecretWriter { client }
  }
}

#[async_trait::async_trait]
impl SecretWriter for ApiSecretWriter {
  #[tracing::instrument(skip_all, fields(secret.namespace = namespace))]
  async fn create(&self, namespace: &str, secret: &Secret) -> Result<(), WriteError> {
    let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
    match api.create(&PostParams::default(), secret).await {
      Ok(_) => Ok(()),
      Err(kube::Error::Api(response)) if response.code == 409 => Err(WriteError::AlreadyExists),
      Err(err) => Err(WriteError::Api(err)),
    }
  }

  #[tracing::instrument(skip_all, fields(secret.namespace = namespace, secret.name = name))]
  async fn replace(&self, namespace: &str, name: &str, secret: &Secret) -> Result<(), WriteError> {
    let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
    api
      .replace(name, &PostParams::default(), secret)
      .await
      .map(|_| ())
      .map_err(WriteError::Api)
  }
}

/// Drives a single claim towards its desired state. The only component that
/// writes to the cluster; everything it reads comes from the caches.
pub struct Reconciler {
  caches: Caches,
  assembler: Arc<dyn Assemble>,
  secrets: Arc<dyn SecretWriter>,
}

impl Reconciler {
  pub fn new(caches: Caches, assembler: Arc<dyn Assemble>, secrets: Arc<dyn SecretWriter>) -> Self {
    Reconciler {
      caches,
      assembler,
      secrets,
    }
  }

  /// Runs one pass for `key` and classifies the result. Never invoked
  /// concurrently for the same key; the queue serializes that.
  #[tracing::instrument(skip(self))]
  pub async fn reconcile(&self, key: &str) -> Outcome {
    match self.sync(key).await {
      Ok(()) => Outcome::Done,
      Err(err) if err.is_fatal() => Outcome::Fatal(err),
      Err(err) => Outcome::Retry(err),
    }
  }

  async fn sync(&self, key: &str) -> Result<(), Error> {
    let (namespace, name) = split_key(key);

    // An absent claim means it was deleted; the child secret follows through
    // the garbage collector, no explicit delete here.
    let claim = match self.caches.claims.get(&object_ref(namespace, name)) {
      None => return Ok(()),
      // cache objects are shared, work on an independent copy
      Some(claim) => (*claim).clone(),
    };

    let namespace = claim
      .metadata
      .namespace
      .clone()
      .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = claim
      .metadata
      .name
      .clone()
      .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let creds = self.credentials(&claim, &namespace)?;

    match self.caches.secrets.get(&object_ref(Some(namespace.as_str()), &name)) {
      None => {
        let secret = self.assembler.assemble(&claim, Some(&creds)).await?;
        info!("creating secret {}/{}", namespace, name);
        match self.secrets.create(&namespace, &secret).await {
          Ok(()) => Ok(()),
          // lost a creation race; the next pass sees the winner in the cache
          Err(WriteError::AlreadyExists) => Err(Error::CreateRace(key.to_owned())),
          Err(err) => Err(Error::Create(err)),
        }
      }

      Some(existing) if !controlled_by(&existing, &claim) => Err(Error::NotControlled { namespace, name }),

      Some(existing) => {
        let assembled = self.assembler.assemble(&claim, Some(&creds)).await?;

        // refresh metadata and replace the payload wholesale; owner
        // references and everything else on the child stay untouched
        let mut updated = (*existing).clone();
        updated.metadata.labels = assembled.metadata.labels.clone();
        updated.metadata.annotations = assembled.metadata.annotations.clone();
        updated.data = None;
        updated.string_data = assembled.string_data;

        info!("updating secret {}/{}", namespace, name);
        self.secrets.replace(&namespace, &name, &updated).await.map_err(Error::Update)
      }
    }
  }

  /// Resolves the claim's service account to vault credentials: exactly one
  /// bound token secret, carrying a non-empty UTF-8 token.
  fn credentials(&self, claim: &VaultSecretClaim, namespace: &str) -> Result<Credentials, Error> {
    let sa_name = claim.spec.service_account_name.as_str();
    let account = self
      .caches
      .service_accounts
      .get(&object_ref(Some(namespace), sa_name))
      .ok_or_else(|| Error::ServiceAccountNotFound {
        namespace: namespace.to_owned(),
        name: sa_name.to_owned(),
      })?;

    let bound = account.secrets.as_deref().unwrap_or_default();
    if bound.len() != 1 {
      return Err(Error::TokenSecretCount {
        namespace: namespace.to_owned(),
        name: sa_name.to_owned(),
        count: bound.len(),
      });
    }

    let token_secret_name = bound[0]
      .name
      .as_deref()
      .ok_or(Error::MissingObjectKey("serviceAccount.secrets[0].name"))?;

    let token_secret = self
      .caches
      .secrets
      .get(&object_ref(Some(namespace), token_secret_name))
      .ok_or_else(|| Error::TokenSecretNotFound {
        namespace: namespace.to_owned(),
        name: token_secret_name.to_owned(),
      })?;

    let token = token_secret
      .data
      .as_ref()
      .and_then(|data| data.get(TOKEN_KEY))
      .and_then(|ByteString(bytes)| String::from_utf8(bytes.clone()).ok())
      .unwrap_or_default();

    if token.is_empty() {
      return Err(Error::MissingToken {
        namespace: namespace.to_owned(),
        name: token_secret_name.to_owned(),
      });
    }

    Ok(Credentials {
      token,
      role: claim.spec.vault_role.clone(),
    })
  }
}

/// Splits a `"namespace/name"` key; cluster-scoped keys carry no namespace.
fn split_key(key: &str) -> (Option<&str>, &str) {
  match key.split_once('/') {
    Some((namespace, name)) => (Some(namespace), name),
    None => (None, key),
  }
}

fn controlled_by(secret: &Secret, claim: &VaultSecretClaim) -> bool {
  let uid = match claim.metadata.uid.as_deref() {
    Some(uid) => uid,
    None => return false,
  };

  secret
    .owner_references()
    .iter()
    .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}
