use serde::{Deserialize, Serialize};

pub mod provider_config;
pub mod slicer;
pub mod vm;
pub mod vm_reconciler;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_HOST_GROUP: &str = "api";
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_RAM_GB: u32 = 4;

pub const EXTERNAL_NAME_ANNOTATION: &str = "vm.slicervm.crossplane.io/external-name";
pub const FINALIZER: &str = "vm.slicervm.crossplane.io/finalizer";
pub const USER_AGENT: &str = "provider-slicervm/1.0";
pub const FIELD_MANAGER: &str = "provider-slicervm";

#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub error_requeue_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            error_requeue_secs: 1,
        }
    }
}
