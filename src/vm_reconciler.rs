// Reconciles VM managed resources against the Slicer API.
// Observe lists the resolved host group and matches on hostname (the
// external name); a missing match triggers Create, and deletion runs
// through a finalizer into Delete. Slicer nodes cannot be mutated in
// place, so Update is a no-op and Observe always reports up to date.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::provider_config::{ConfigSelector, ResolveError};
use crate::slicer::{self, CreateNodeRequest, Node, SlicerClient};
use crate::vm::{external_name, Condition, DeletionPolicy, VMObservation, VMParameters, VM};
use crate::{Config, DEFAULT_CPUS, DEFAULT_RAM_GB};

pub struct Data {
    pub client: Client,
    pub config: Config,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("VM missing .metadata.namespace")]
    MissingNamespace,
    #[error("k8s error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("{0}")]
    ResolveError(#[source] ResolveError),
    #[error("cannot create new Slicer client: {0}")]
    NewClient(#[source] slicer::Error),
    #[error("cannot list VMs: {0}")]
    ListVMs(#[source] slicer::Error),
    #[error("cannot create VM: {0}")]
    CreateVM(#[source] slicer::Error),
    #[error("cannot delete VM: {0}")]
    DeleteVM(#[source] slicer::Error),
    #[error("finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl From<kube::Error> for Error {
    fn from(v: kube::Error) -> Self {
        Error::KubeError(v)
    }
}

impl From<ResolveError> for Error {
    fn from(v: ResolveError) -> Self {
        Error::ResolveError(v)
    }
}

/// Produces an External adapter for one reconciliation by resolving the
/// referenced provider config and its credentials.
pub struct Connector {
    pub client: Client,
}

impl Connector {
    pub async fn connect(&self, vm: &VM) -> Result<External, Error> {
        let namespace = vm.namespace().ok_or(Error::MissingNamespace)?;
        let selector = ConfigSelector::from_ref(&vm.spec.provider_config_ref, &namespace)?;
        let config = selector.resolve(&self.client).await?;
        let token = config.token(&self.client).await?;
        let client = SlicerClient::new(&config.url, token).map_err(Error::NewClient)?;

        Ok(External {
            client,
            host_group: config.host_group,
        })
    }
}

/// Translates between the VM schema and the Slicer API. Holds the client
/// and default host group resolved at connect time, immutable for the
/// connection's lifetime.
pub struct External {
    client: SlicerClient,
    host_group: String,
}

/// Result of an Observe call.
#[derive(Debug, Default, PartialEq)]
pub struct Observation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
    pub at_provider: Option<VMObservation>,
}

/// Result of a successful Create call.
#[derive(Debug, PartialEq)]
pub struct Creation {
    pub hostname: String,
    pub at_provider: VMObservation,
    pub connection_details: BTreeMap<String, Vec<u8>>,
}

impl External {
    fn effective_host_group<'a>(&'a self, vm: &'a VM) -> &'a str {
        match &vm.spec.for_provider.host_group {
            Some(hg) if !hg.is_empty() => hg,
            _ => &self.host_group,
        }
    }

    /// Determines whether the remote VM exists. A VM without an external
    /// name is not yet created, never an error.
    pub async fn observe(&self, vm: &VM) -> Result<Observation, Error> {
        if vm.metadata.deletion_timestamp.is_some() {
            return Ok(Observation::default());
        }

        let hostname = match external_name(vm) {
            Some(hostname) => hostname,
            None => return Ok(Observation::default()),
        };

        let nodes = self
            .client
            .host_group_nodes(self.effective_host_group(vm))
            .await
            .map_err(Error::ListVMs)?;

        match find_node(&nodes, hostname) {
            Some(node) => Ok(Observation {
                resource_exists: true,
                // No drift detection: existing nodes are always up to date.
                resource_up_to_date: true,
                at_provider: Some(observed(node)),
            }),
            None => Ok(Observation::default()),
        }
    }

    pub async fn create(&self, vm: &VM) -> Result<Creation, Error> {
        let req = create_request(&vm.spec.for_provider);
        let node = self
            .client
            .create_node(self.effective_host_group(vm), &req)
            .await
            .map_err(Error::CreateVM)?;

        Ok(Creation {
            hostname: node.hostname.clone(),
            at_provider: observed(&node),
            connection_details: connection_details(&node),
        })
    }

    /// Slicer nodes cannot be updated in place, only recreated.
    pub async fn update(&self, _vm: &VM) -> Result<(), Error> {
        Ok(())
    }

    /// Deletes the remote VM. Nothing to do when no external name was
    /// ever assigned.
    pub async fn delete(&self, vm: &VM) -> Result<(), Error> {
        let hostname = match external_name(vm) {
            Some(hostname) => hostname,
            None => return Ok(()),
        };

        self.client
            .delete_node(self.effective_host_group(vm), hostname)
            .await
            .map_err(Error::DeleteVM)?;
        Ok(())
    }
}

fn find_node<'a>(nodes: &'a [Node], hostname: &str) -> Option<&'a Node> {
    nodes.iter().find(|n| n.hostname == hostname)
}

fn observed(node: &Node) -> VMObservation {
    VMObservation {
        hostname: node.hostname.clone(),
        ip: node.ip.clone(),
        state: "running".to_string(),
        created_at: node.created_at.to_rfc3339(),
    }
}

fn create_request(params: &VMParameters) -> CreateNodeRequest {
    CreateNodeRequest {
        ram_gb: params.ram_gb.unwrap_or(DEFAULT_RAM_GB),
        cpus: params.cpus.unwrap_or(DEFAULT_CPUS),
        userdata: params.userdata.clone().filter(|u| !u.is_empty()),
        ssh_keys: params.ssh_keys.clone(),
        import_user: params.import_user.clone().filter(|u| !u.is_empty()),
        tags: params.tags.clone(),
    }
}

fn connection_details(node: &Node) -> BTreeMap<String, Vec<u8>> {
    BTreeMap::from([
        ("hostname".to_string(), node.hostname.clone().into_bytes()),
        ("ip".to_string(), node.ip.clone().into_bytes()),
    ])
}

pub async fn reconcile(vm: Arc<VM>, ctx: Arc<Data>) -> Result<Action, Error> {
    let namespace = vm.namespace().ok_or(Error::MissingNamespace)?;
    let vms = Api::<VM>::namespaced(ctx.client.clone(), &namespace);

    finalizer(&vms, crate::FINALIZER, vm, |event| async {
        match event {
            Finalizer::Apply(vm) => apply(vm, &ctx).await,
            Finalizer::Cleanup(vm) => cleanup(vm, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

pub fn error_policy(_object: Arc<VM>, _error: &Error, ctx: Arc<Data>) -> Action {
    Action::requeue(Duration::from_secs(ctx.config.error_requeue_secs))
}

async fn apply(vm: Arc<VM>, ctx: &Data) -> Result<Action, Error> {
    let namespace = vm.namespace().ok_or(Error::MissingNamespace)?;
    let name = vm.name_any();
    let vms = Api::<VM>::namespaced(ctx.client.clone(), &namespace);

    let connector = Connector {
        client: ctx.client.clone(),
    };
    let external = connector.connect(&vm).await?;
    let observation = external.observe(&vm).await?;

    if observation.resource_exists {
        if !observation.resource_up_to_date {
            external.update(&vm).await?;
        }

        let mut status = vm.status.clone().unwrap_or_default();
        if let Some(at_provider) = observation.at_provider {
            status.at_provider = at_provider;
        }
        status.set_condition(Condition::available());
        status.set_condition(Condition::reconcile_success());
        patch_status(&vms, &name, &status).await?;

        return Ok(Action::requeue(Duration::from_secs(
            ctx.config.poll_interval_secs,
        )));
    }

    let mut status = vm.status.clone().unwrap_or_default();
    status.set_condition(Condition::creating());
    patch_status(&vms, &name, &status).await?;

    let creation = external.create(&vm).await?;

    // Binding the returned hostname as the external name is what ties this
    // resource to the remote VM; it must land before anything else.
    set_external_name(&vms, &name, &creation.hostname).await?;

    status.at_provider = creation.at_provider;
    status.set_condition(Condition::reconcile_success());
    patch_status(&vms, &name, &status).await?;

    if let Some(secret_ref) = &vm.spec.write_connection_secret_to_ref {
        publish_connection_details(
            &ctx.client,
            &vm,
            &namespace,
            &secret_ref.name,
            &creation.connection_details,
        )
        .await?;
    }

    info!("created VM {} as {}", name, creation.hostname);
    Ok(Action::requeue(Duration::from_secs(
        ctx.config.poll_interval_secs,
    )))
}

async fn cleanup(vm: Arc<VM>, ctx: &Data) -> Result<Action, Error> {
    let namespace = vm.namespace().ok_or(Error::MissingNamespace)?;
    let name = vm.name_any();

    if vm.spec.deletion_policy == DeletionPolicy::Orphan {
        info!("orphaning VM {}", name);
        return Ok(Action::await_change());
    }

    let vms = Api::<VM>::namespaced(ctx.client.clone(), &namespace);
    let mut status = vm.status.clone().unwrap_or_default();
    status.set_condition(Condition::deleting());
    patch_status(&vms, &name, &status).await?;

    let connector = Connector {
        client: ctx.client.clone(),
    };
    let external = connector.connect(&vm).await?;
    external.delete(&vm).await?;

    info!("deleted VM {}", name);
    Ok(Action::await_change())
}

async fn patch_status(vms: &Api<VM>, name: &str, status: &crate::vm::VMStatus) -> Result<(), Error> {
    vms.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;
    Ok(())
}

async fn set_external_name(vms: &Api<VM>, name: &str, hostname: &str) -> Result<(), Error> {
    vms.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "metadata": {
                "annotations": { crate::EXTERNAL_NAME_ANNOTATION: hostname },
            },
        })),
    )
    .await?;
    Ok(())
}

async fn publish_connection_details(
    client: &Client,
    vm: &VM,
    namespace: &str,
    secret_name: &str,
    details: &BTreeMap<String, Vec<u8>>,
) -> Result<(), Error> {
    let mut string_data = BTreeMap::new();
    for (key, value) in details {
        string_data.insert(key.clone(), String::from_utf8_lossy(value).into_owned());
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: vm.controller_owner_ref(&()).map(|r| vec![r]),
            ..ObjectMeta::default()
        },
        string_data: Some(string_data),
        ..Secret::default()
    };

    let secrets = Api::<Secret>::namespaced(client.clone(), namespace);
    secrets
        .patch(
            secret_name,
            &PatchParams::apply(crate::FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn node(hostname: &str, ip: &str) -> Node {
        Node {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    fn vm_with_host_group(host_group: Option<&str>) -> VM {
        let mut vm = VM::new(
            "test",
            crate::vm::VMSpec {
                for_provider: VMParameters {
                    host_group: host_group.map(str::to_string),
                    ..VMParameters::default()
                },
                provider_config_ref: crate::vm::ProviderConfigReference {
                    kind: "ProviderConfig".to_string(),
                    name: "default".to_string(),
                },
                deletion_policy: DeletionPolicy::Delete,
                write_connection_secret_to_ref: None,
            },
        );
        vm.metadata.namespace = Some("default".to_string());
        vm
    }

    fn external_with_default(host_group: &str) -> External {
        External {
            client: SlicerClient::new(crate::DEFAULT_API_URL, "").expect("client"),
            host_group: host_group.to_string(),
        }
    }

    #[test]
    fn create_request_applies_defaults_when_unset() {
        let req = create_request(&VMParameters::default());
        assert_eq!(req.cpus, 2);
        assert_eq!(req.ram_gb, 4);
        assert_eq!(req.userdata, None);
        assert!(req.ssh_keys.is_empty());
        assert_eq!(req.import_user, None);
        assert!(req.tags.is_empty());
    }

    #[test]
    fn create_request_passes_explicit_values() {
        let req = create_request(&VMParameters {
            cpus: Some(3),
            ram_gb: Some(8),
            userdata: Some("#cloud-config".to_string()),
            ssh_keys: vec!["ssh-ed25519 AAAA".to_string()],
            import_user: Some("octocat".to_string()),
            tags: vec!["dev".to_string()],
            ..VMParameters::default()
        });
        assert_eq!(req.cpus, 3);
        assert_eq!(req.ram_gb, 8);
        assert_eq!(req.userdata.as_deref(), Some("#cloud-config"));
        assert_eq!(req.ssh_keys, vec!["ssh-ed25519 AAAA".to_string()]);
        assert_eq!(req.import_user.as_deref(), Some("octocat"));
        assert_eq!(req.tags, vec!["dev".to_string()]);
    }

    #[test]
    fn create_request_drops_empty_strings() {
        let req = create_request(&VMParameters {
            userdata: Some(String::new()),
            import_user: Some(String::new()),
            ..VMParameters::default()
        });
        assert_eq!(req.userdata, None);
        assert_eq!(req.import_user, None);
    }

    #[test]
    fn find_node_matches_on_hostname() {
        let nodes = vec![node("vm-1", "10.0.0.1"), node("vm-2", "10.0.0.2")];
        assert_eq!(find_node(&nodes, "vm-2").map(|n| n.ip.as_str()), Some("10.0.0.2"));
        assert_eq!(find_node(&nodes, "vm-3"), None);
    }

    #[test]
    fn find_node_first_match_wins() {
        let nodes = vec![node("vm-1", "10.0.0.1"), node("vm-1", "10.0.0.9")];
        assert_eq!(find_node(&nodes, "vm-1").map(|n| n.ip.as_str()), Some("10.0.0.1"));
    }

    #[test]
    fn observed_node_is_running() {
        let obs = observed(&node("vm-1", "10.0.0.1"));
        assert_eq!(obs.hostname, "vm-1");
        assert_eq!(obs.ip, "10.0.0.1");
        assert_eq!(obs.state, "running");
        assert_eq!(obs.created_at, "2025-01-02T03:04:05+00:00");
    }

    #[test]
    fn connection_details_are_hostname_and_ip() {
        let details = connection_details(&node("vm-1", "10.0.0.1"));
        assert_eq!(details.len(), 2);
        assert_eq!(details["hostname"], b"vm-1".to_vec());
        assert_eq!(details["ip"], b"10.0.0.1".to_vec());
    }

    #[test]
    fn host_group_override_beats_provider_default() {
        let external = external_with_default("api");
        assert_eq!(
            external.effective_host_group(&vm_with_host_group(Some("custom"))),
            "custom"
        );
        assert_eq!(external.effective_host_group(&vm_with_host_group(None)), "api");
        assert_eq!(
            external.effective_host_group(&vm_with_host_group(Some(""))),
            "api"
        );
    }

    #[tokio::test]
    async fn observe_without_external_name_reports_absent() {
        let external = external_with_default("api");
        let vm = vm_with_host_group(None);
        let observation = external.observe(&vm).await.unwrap();
        assert_eq!(observation, Observation::default());
        assert!(!observation.resource_exists);
    }

    #[tokio::test]
    async fn observe_of_deleted_vm_reports_absent() {
        let external = external_with_default("api");
        let mut vm = vm_with_host_group(None);
        vm.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        vm.metadata.annotations = Some(
            [(crate::EXTERNAL_NAME_ANNOTATION.to_string(), "vm-1".to_string())]
                .into_iter()
                .collect(),
        );
        // Short-circuits before any remote call, so no server is needed.
        let observation = external.observe(&vm).await.unwrap();
        assert!(!observation.resource_exists);
    }

    #[tokio::test]
    async fn delete_without_external_name_is_a_noop() {
        let external = external_with_default("api");
        let vm = vm_with_host_group(None);
        assert!(external.delete(&vm).await.is_ok());
    }

    #[tokio::test]
    async fn update_never_errors() {
        let external = external_with_default("api");
        let vm = vm_with_host_group(None);
        assert!(external.update(&vm).await.is_ok());
    }
}
