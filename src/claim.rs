use crate::prelude::*;

/// A claim for a kubernetes `Secret` whose values live in Vault.
///
/// The controller materializes one `Secret` per claim, named after the claim,
/// in the claim's namespace, owned by the claim so that deleting the claim
/// garbage-collects the secret.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "dweller.io", version = "v1alpha1", kind = "VaultSecretClaim")]
#[kube(shortname = "vsc", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct VaultSecretClaimSpec {
  /// Service account in the claim's namespace whose bound token is presented
  /// to Vault's kubernetes auth method.
  pub service_account_name: String,

  /// Vault kubernetes-auth role to assume.
  pub vault_role: String,

  pub secret: SecretTemplate,
}

/// Desired shape of the produced secret.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct SecretTemplate {
  #[serde(default)]
  pub metadata: SecretTemplateMeta,

  #[serde(default)]
  pub data: Vec<DataItem>,
}

/// User-controlled metadata for the produced secret. Name and namespace are
/// not part of this: they are always taken from the claim.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct SecretTemplateMeta {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub labels: Option<BTreeMap<String, String>>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub annotations: Option<BTreeMap<String, String>>,
}

/// One entry of the produced secret: `stringData[key]` is read from
/// `vaultField` of the Vault secret at `vaultPath`.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataItem {
  pub key: String,
  pub vault_path: String,
  pub vault_field: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn spec_deserializes_from_manifest_shape() {
    let yaml = r#"
      serviceAccountName: app-sa
      vaultRole: app
      secret:
        metadata:
          labels:
            env: prod
        data:
          - key: pw
            vaultPath: kv/app
            vaultField: password
    "#;

    let spec: VaultSecretClaimSpec = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(spec.service_account_name, "app-sa");
    assert_eq!(spec.vault_role, "app");
    assert_eq!(spec.secret.metadata.labels.as_ref().unwrap()["env"], "prod");
    assert_eq!(spec.secret.data.len(), 1);
    assert_eq!(spec.secret.data[0].key, "pw");
    assert_eq!(spec.secret.data[0].vault_path, "kv/app");
    assert_eq!(spec.secret.data[0].vault_field, "password");
  }

  #[test]
  fn template_metadata_is_optional() {
    let yaml = r#"
      serviceAccountName: app-sa
      vaultRole: app
      secret:
        data: []
    "#;

    let spec: VaultSecretClaimSpec = serde_yaml::from_str(yaml).unwrap();
    assert!(spec.secret.metadata.labels.is_none());
    assert!(spec.secret.metadata.annotations.is_none());
    assert!(spec.secret.data.is_empty());
  }
}
