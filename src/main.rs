use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use provider_slicervm::vm::VM;
use provider_slicervm::{vm_reconciler, Config};
use std::fs::File;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let client = Client::try_default().await?;

    let config: Config = if let Ok(config_filename) = std::env::var("CONFIG") {
        serde_yaml::from_reader(File::open(config_filename)?)?
    } else {
        Config::default()
    };

    let vms = Api::<VM>::all(client.clone());

    Controller::new(vms, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            vm_reconciler::reconcile,
            vm_reconciler::error_policy,
            Arc::new(vm_reconciler::Data { client, config }),
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("reconciled {}", o.0.name),
                Err(e) => warn!("reconciliation error: {:?}", e),
            }
        })
        .await;

    Ok(())
}
