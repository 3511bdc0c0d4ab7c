use crate::prelude::*;
use std::env;

/// Application configuration, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
  /// Path to a kubeconfig file. Empty or unset means in-cluster configuration.
  pub kubeconfig: Option<String>,

  /// Address of the Vault instance to talk to.
  pub vault_addr: String,

  /// Token for the base Vault client. Only used when a reconciliation does
  /// not derive credentials from a claim.
  pub vault_token: String,

  /// Log level for this crate's tracing target, `info` by default.
  pub log_level: String,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("required environment variable {0} is not set")]
  Missing(&'static str),
}

impl Config {
  pub fn from_environment() -> Result<Self, Error> {
    Ok(Config {
      kubeconfig: optional("KUBECONFIG"),
      vault_addr: required("VAULT_ADDR")?,
      vault_token: required("VAULT_TOKEN")?,
      log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
    })
  }
}

fn optional(name: &str) -> Option<String> {
  env::var(name).ok().filter(|value| !value.is_empty())
}

fn required(name: &'static str) -> Result<String, Error> {
  optional(name).ok_or(Error::Missing(name))
}
