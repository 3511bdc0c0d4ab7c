mod cache;
mod claim;
mod config;
mod controller;
mod prelude;
mod queue;
mod reconcile;
mod vault;

use claim::VaultSecretClaim;
use config::Config;
use controller::Controller;
use kube::config::{KubeConfigOptions, Kubeconfig};
use prelude::*;
use vault::VaultAssembler;
use vaultrs::client::VaultClientSettingsBuilder;

/// Client-level timeout for kubernetes and vault calls.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
  let args = argwerk::args! {
    /// dweller controller
    "dweller [--crd|-h]" {
      help: bool,
      crd: bool,
    }

    /// Print the crd.
    ["--crd"] => {
      crd = true
    }

    /// Print this help.
    ["-h" | "--help"] => {
      println!("{}", HELP);
      help = true;
    }
  }?;

  if args.help {
    return Ok(());
  }

  if args.crd {
    let crd = VaultSecretClaim::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{yaml}");

    return Ok(());
  }

  let config = Config::from_environment()?;
  setup_logging(&config.log_level)?;

  let client = kube_client(config.kubeconfig.as_deref()).await?;
  let settings = VaultClientSettingsBuilder::default()
    .address(&config.vault_addr)
    .token(&config.vault_token)
    .timeout(Some(CLIENT_TIMEOUT))
    .build()?;
  let assembler = Arc::new(VaultAssembler::new(settings));

  let stop = CancellationToken::new();
  tokio::spawn({
    let stop = stop.clone();
    async move {
      shutdown_signal().await;
      info!("shutting down ...");
      stop.cancel();
    }
  });

  Controller::new(client, assembler).run(stop).await?;

  info!("controller terminated");
  Ok(())
}

/// Out-of-cluster configuration when a kubeconfig path is given, in-cluster
/// configuration otherwise.
async fn kube_client(kubeconfig: Option<&str>) -> Result<Client> {
  let mut config = match kubeconfig {
    Some(path) => {
      let kubeconfig = Kubeconfig::read_from(path)?;
      kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
    }
    None => kube::Config::from_cluster_env()?,
  };
  config.timeout = Some(CLIENT_TIMEOUT);

  Ok(Client::try_from(config)?)
}
