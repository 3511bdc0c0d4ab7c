use crate::claim::{DataItem, VaultSecretClaim};
use crate::prelude::*;
use serde_json::Value;
use vaultrs::auth::kubernetes;
use vaultrs::client::{Client as _, VaultClient, VaultClientSettings};
use vaultrs::error::ClientError;
use vaultrs::kv1;

/// Mount of the kubernetes auth method (`auth/kubernetes/login`).
const AUTH_MOUNT: &str = "kubernetes";

/// Auth parameters for one reconciliation. Built from the claim's service
/// account token, handed to the assembler, never stored anywhere.
pub struct Credentials {
  pub token: String,
  pub role: String,
}

/// Turns a claim plus credentials into a fully populated kubernetes secret.
///
/// The vault-backed implementation is [`VaultAssembler`]; tests substitute a
/// deterministic fake.
#[async_trait::async_trait]
pub trait Assemble: Send + Sync {
  async fn assemble(&self, claim: &VaultSecretClaim, creds: Option<&Credentials>) -> Result<Secret, Error>;
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("failed to build vault client: {0}")]
  Client(#[source] ClientError),

  #[error("vault login failed: {0}")]
  Login(#[source] ClientError),

  #[error("failed to read vault secret at {path:?}: {source}")]
  Read {
    path: String,
    #[source]
    source: ClientError,
  },

  #[error("no secret found by path {0:?}")]
  NoSecret(String),

  #[error("secret has no field {0:?}")]
  NoField(String),

  #[error("unknown type: {0}")]
  UnknownType(&'static str),

  #[error("MissingObjectKey: {0}")]
  MissingObjectKey(&'static str),
}

/// Assembles secrets by logging into Vault with the claim's credentials and
/// reading each declared field.
pub struct VaultAssembler {
  settings: VaultClientSettings,
}

impl VaultAssembler {
  /// `settings` carry the Vault address and the base token. They are cloned
  /// into a fresh client per assembly; the shared copy is never mutated.
  pub fn new(settings: VaultClientSettings) -> Self {
    VaultAssembler { settings }
  }

  /// Exchanges the service-account token for a Vault session, or hands back
  /// a base-token client when no credentials are given.
  async fn login(&self, creds: Option<&Credentials>) -> Result<VaultClient, Error> {
    let base = VaultClient::new(self.settings.clone()).map_err(Error::Client)?;

    let creds = match creds {
      None => return Ok(base),
      Some(creds) => creds,
    };

    let auth = kubernetes::login(&base, AUTH_MOUNT, &creds.role, &creds.token)
      .await
      .map_err(Error::Login)?;

    let mut session = VaultClient::new(self.settings.clone()).map_err(Error::Client)?;
    session.set_token(&auth.client_token);
    Ok(session)
  }

  async fn fetch(&self, session: &VaultClient, items: &[DataItem]) -> Result<BTreeMap<String, String>, Error> {
    let mut data = BTreeMap::new();

    for item in items {
      let (mount, path) = split_path(&item.vault_path);
      let fields: HashMap<String, Value> = match kv1::get(session, mount, path).await {
        Ok(fields) => fields,
        Err(ClientError::APIError { code: 404, .. }) => return Err(Error::NoSecret(item.vault_path.clone())),
        Err(source) => {
          return Err(Error::Read {
            path: item.vault_path.clone(),
            source,
          })
        }
      };

      data.insert(item.key.clone(), string_field(&fields, &item.vault_field)?);
    }

    Ok(data)
  }
}

#[async_trait::async_trait]
impl Assemble for VaultAssembler {
  #[tracing::instrument(skip_all, fields(
    claim.namespace = claim.metadata.namespace.as_deref(),
    claim.name = claim.metadata.name.as_deref(),
  ))]
  async fn assemble(&self, claim: &VaultSecretClaim, creds: Option<&Credentials>) -> Result<Secret, Error> {
    let session = self.login(creds).await?;
    let metadata = secret_metadata(claim)?;
    let string_data = self.fetch(&session, &claim.spec.secret.data).await?;

    Ok(Secret {
      metadata,
      type_: Some("Opaque".to_owned()),
      string_data: Some(string_data),
      ..Secret::default()
    })
  }
}

/// Metadata of the produced secret: named after the claim, in the claim's
/// namespace, labels and annotations from the template, controller owner
/// reference pointing back at the claim.
pub fn secret_metadata(claim: &VaultSecretClaim) -> Result<ObjectMeta, Error> {
  let owner = claim
    .controller_owner_ref(&())
    .ok_or(Error::MissingObjectKey(".metadata"))?;
  let template = &claim.spec.secret.metadata;

  Ok(ObjectMeta {
    name: claim.metadata.name.clone(),
    namespace: claim.metadata.namespace.clone(),
    labels: template.labels.clone(),
    annotations: template.annotations.clone(),
    owner_references: Some(vec![owner]),
    ..ObjectMeta::default()
  })
}

/// Splits a logical vault path into the engine mount and the path below it.
fn split_path(vault_path: &str) -> (&str, &str) {
  vault_path.split_once('/').unwrap_or((vault_path, ""))
}

/// Vault fields are dynamically typed; only strings may land in a secret.
fn string_field(fields: &HashMap<String, Value>, field: &str) -> Result<String, Error> {
  match fields.get(field) {
    None => Err(Error::NoField(field.to_owned())),
    Some(Value::String(value)) => Ok(value.clone()),
    Some(other) => Err(Error::UnknownType(json_type(other))),
  }
}

fn json_type(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::claim::{SecretTemplate, SecretTemplateMeta, VaultSecretClaimSpec};
  use serde_json::json;

  fn claim() -> VaultSecretClaim {
    let mut claim = VaultSecretClaim::new(
      "db",
      VaultSecretClaimSpec {
        service_account_name: "app-sa".to_owned(),
        vault_role: "app".to_owned(),
        secret: SecretTemplate {
          metadata: SecretTemplateMeta {
            labels: Some(BTreeMap::from([("env".to_owned(), "prod".to_owned())])),
            annotations: None,
          },
          data: vec![],
        },
      },
    );
    claim.metadata.namespace = Some("app".to_owned());
    claim.metadata.uid = Some("uid-1".to_owned());
    claim
  }

  #[test]
  fn metadata_is_named_after_the_claim() {
    let meta = secret_metadata(&claim()).unwrap();

    assert_eq!(meta.name.as_deref(), Some("db"));
    assert_eq!(meta.namespace.as_deref(), Some("app"));
    assert_eq!(meta.labels.unwrap()["env"], "prod");
  }

  #[test]
  fn metadata_carries_exactly_one_controller_owner() {
    let meta = secret_metadata(&claim()).unwrap();
    let owners = meta.owner_references.unwrap();

    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "VaultSecretClaim");
    assert_eq!(owners[0].name, "db");
    assert_eq!(owners[0].uid, "uid-1");
    assert_eq!(owners[0].controller, Some(true));
  }

  #[test]
  fn metadata_requires_claim_identity() {
    let mut claim = claim();
    claim.metadata.uid = None;

    assert!(matches!(secret_metadata(&claim), Err(Error::MissingObjectKey(_))));
  }

  #[test]
  fn string_fields_pass_through() {
    let fields = HashMap::from([("password".to_owned(), json!("s3cret"))]);
    assert_eq!(string_field(&fields, "password").unwrap(), "s3cret");
  }

  #[test]
  fn non_string_fields_are_rejected() {
    let fields = HashMap::from([("password".to_owned(), json!(42))]);
    let err = string_field(&fields, "password").unwrap_err();
    assert_eq!(err.to_string(), "unknown type: number");
  }

  #[test]
  fn missing_fields_are_reported_by_name() {
    let fields = HashMap::from([("password".to_owned(), json!("s3cret"))]);
    let err = string_field(&fields, "username").unwrap_err();
    assert_eq!(err.to_string(), r#"secret has no field "username""#);
  }

  #[test]
  fn paths_split_at_the_engine_mount() {
    assert_eq!(split_path("kv/app"), ("kv", "app"));
    assert_eq!(split_path("kv/teams/app"), ("kv", "teams/app"));
    assert_eq!(split_path("kv"), ("kv", ""));
  }
}
