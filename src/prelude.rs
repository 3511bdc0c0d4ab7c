pub use color_eyre::Result;
pub use futures::StreamExt;
pub use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
pub use k8s_openapi::ByteString;
pub use kube::{
  api::{ListParams, PostParams},
  core::ObjectMeta,
  runtime::{
    reflector::{ObjectRef, Store},
    watcher,
  },
  Api, Client, CustomResource, CustomResourceExt, Resource, ResourceExt,
};
pub use schemars::JsonSchema;
pub use serde::{Deserialize, Serialize};
pub use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
  time::Duration,
};
pub use thiserror::Error;
pub use tokio_util::sync::CancellationToken;
pub use tracing::{debug, error, info, warn};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};
use tracing_tree::HierarchicalLayer;

/// Installs color-eyre and the hierarchical tracing subscriber, filtered to
/// this crate's target at `level`. Unknown levels are a startup error.
pub fn setup_logging(level: &str) -> Result<()> {
  color_eyre::install()?;

  let directive = format!("{}={}", env!("CARGO_PKG_NAME").replace('-', "_"), level);
  Registry::default()
    .with(EnvFilter::try_new(directive)?)
    .with(HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(true))
    .init();

  Ok(())
}

/// Completes when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    tokio::select! {
      _ = sigint.recv() => {}
      _ = sigterm.recv() => {}
    }
  }

  #[cfg(not(unix))]
  {
    tokio::signal::ctrl_c().await.expect("install ctrl-c handler");
  }
}
