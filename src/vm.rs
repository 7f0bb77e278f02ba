use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::EXTERNAL_NAME_ANNOTATION;

/// VMParameters are the configurable fields of a Slicer VM.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VMParameters {
    /// Host group to create the VM in. Falls back to the provider
    /// config's default host group when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_group: Option<String>,

    /// Number of virtual CPUs. Defaults to 2 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    /// Amount of RAM in GB. Defaults to 4 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<u32>,

    /// Cloud-init userdata script to run on boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,

    /// SSH public keys to add to the VM.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,

    /// GitHub username to import SSH keys from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_user: Option<String>,

    /// Labels to apply to the VM.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// VMObservation are the observable fields of a Slicer VM, written
/// only by the controller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VMObservation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
}

/// Reference to the ProviderConfig or ClusterProviderConfig supplying
/// endpoint, defaults, and credentials for this VM.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigReference {
    /// Kind of the referenced config object, either ProviderConfig or
    /// ClusterProviderConfig.
    #[serde(default = "default_provider_config_kind")]
    pub kind: String,
    pub name: String,
}

fn default_provider_config_kind() -> String {
    "ProviderConfig".to_string()
}

/// What happens to the remote VM when the resource is deleted.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Orphan,
}

/// Target secret for connection details in the VM's namespace.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSecretReference {
    pub name: String,
}

/// A VM is a managed resource that represents a Slicer VM.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vm.slicervm.crossplane.io",
    version = "v1alpha1",
    kind = "VM",
    namespaced,
    status = "VMStatus",
    category = "crossplane",
    category = "managed",
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#,
    printcolumn = r#"{"name":"HOSTNAME","type":"string","jsonPath":".status.atProvider.hostname"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".status.atProvider.ip"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VMSpec {
    pub for_provider: VMParameters,
    pub provider_config_ref: ProviderConfigReference,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<ConnectionSecretReference>,
}

/// VMStatus represents the observed state of a Slicer VM.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VMStatus {
    #[serde(default)]
    pub at_provider: VMObservation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl VMStatus {
    /// Sets a condition, replacing any existing condition of the same type.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: String,
}

impl Condition {
    fn new(type_: &str, status: &str, reason: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: None,
            last_transition_time: Utc::now().to_rfc3339(),
        }
    }

    pub fn available() -> Self {
        Self::new("Ready", "True", "Available")
    }

    pub fn creating() -> Self {
        Self::new("Ready", "False", "Creating")
    }

    pub fn deleting() -> Self {
        Self::new("Ready", "False", "Deleting")
    }

    pub fn reconcile_success() -> Self {
        Self::new("Synced", "True", "ReconcileSuccess")
    }
}

/// Returns the external name (the remote hostname) bound to this VM,
/// if one has been assigned.
pub fn external_name(vm: &VM) -> Option<&str> {
    vm.metadata
        .annotations
        .as_ref()?
        .get(EXTERNAL_NAME_ANNOTATION)
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_vm(yaml: &str) -> VM {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn spec_defaults() {
        let vm = minimal_vm(
            r#"
            apiVersion: vm.slicervm.crossplane.io/v1alpha1
            kind: VM
            metadata:
              name: test
              namespace: default
            spec:
              forProvider: {}
              providerConfigRef:
                name: default
            "#,
        );
        assert_eq!(vm.spec.provider_config_ref.kind, "ProviderConfig");
        assert_eq!(vm.spec.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(vm.spec.for_provider.cpus, None);
        assert_eq!(vm.spec.for_provider.ram_gb, None);
        assert!(vm.spec.write_connection_secret_to_ref.is_none());
    }

    #[test]
    fn explicit_parameters_survive() {
        let vm = minimal_vm(
            r#"
            apiVersion: vm.slicervm.crossplane.io/v1alpha1
            kind: VM
            metadata:
              name: test
              namespace: default
            spec:
              forProvider:
                hostGroup: workers
                cpus: 3
                ramGb: 8
                sshKeys: ["ssh-ed25519 AAAA"]
                importUser: octocat
                tags: ["a", "b"]
              providerConfigRef:
                kind: ClusterProviderConfig
                name: default
              deletionPolicy: Orphan
            "#,
        );
        assert_eq!(vm.spec.for_provider.host_group.as_deref(), Some("workers"));
        assert_eq!(vm.spec.for_provider.cpus, Some(3));
        assert_eq!(vm.spec.for_provider.ram_gb, Some(8));
        assert_eq!(vm.spec.provider_config_ref.kind, "ClusterProviderConfig");
        assert_eq!(vm.spec.deletion_policy, DeletionPolicy::Orphan);
    }

    #[test]
    fn external_name_from_annotation() {
        let mut vm = minimal_vm(
            r#"
            apiVersion: vm.slicervm.crossplane.io/v1alpha1
            kind: VM
            metadata:
              name: test
              namespace: default
            spec:
              forProvider: {}
              providerConfigRef:
                name: default
            "#,
        );
        assert_eq!(external_name(&vm), None);

        vm.metadata.annotations = Some(
            [(EXTERNAL_NAME_ANNOTATION.to_string(), "vm-1".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(external_name(&vm), Some("vm-1"));
    }

    #[test]
    fn set_condition_replaces_same_type() {
        let mut status = VMStatus::default();
        status.set_condition(Condition::creating());
        status.set_condition(Condition::available());
        status.set_condition(Condition::reconcile_success());

        assert_eq!(status.conditions.len(), 2);
        let ready = status.conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "Available");
    }
}
