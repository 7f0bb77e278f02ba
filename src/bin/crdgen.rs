// Prints the provider's CRDs as YAML, for `kubectl apply -f -`.

use kube::CustomResourceExt;
use provider_slicervm::provider_config::{ClusterProviderConfig, ProviderConfig};
use provider_slicervm::vm::VM;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&VM::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ProviderConfig::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ClusterProviderConfig::crd())?);
    Ok(())
}
