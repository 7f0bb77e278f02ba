// Resolves a VM's providerConfigRef to a Slicer endpoint, default host
// group, and credential token. ProviderConfig is namespaced (looked up in
// the VM's namespace), ClusterProviderConfig is cluster-scoped; any other
// kind is rejected. Defaults for URL and host group are applied here so
// the adapter never sees empty values.

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vm::ProviderConfigReference;
use crate::{DEFAULT_API_URL, DEFAULT_HOST_GROUP};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported provider config kind: {0}")]
    UnsupportedKind(String),
    #[error("cannot get ProviderConfig: {0}")]
    GetProviderConfig(#[source] kube::Error),
    #[error("cannot get ClusterProviderConfig: {0}")]
    GetClusterProviderConfig(#[source] kube::Error),
    #[error("cannot get credentials: {0}")]
    GetCredentials(#[source] kube::Error),
    #[error("credentials secret {0} has no key {1}")]
    MissingSecretKey(String, String),
    #[error("credentials are not valid UTF-8: {0}")]
    InvalidToken(#[source] std::string::FromUtf8Error),
    #[error("credentials source is Secret but secretRef is unset")]
    MissingSecretRef,
    #[error("secretRef.namespace is required with ClusterProviderConfig")]
    MissingSecretNamespace,
    #[error("credentials source is Env but env is unset")]
    MissingEnvSelector,
    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),
}

/// ProviderConfig configures the Slicer provider for VMs in one namespace.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "slicervm.crossplane.io",
    version = "v1alpha1",
    kind = "ProviderConfig",
    namespaced,
    category = "crossplane"
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    /// Base URL of the Slicer API. Defaults to http://127.0.0.1:8080.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Default host group for VMs using this config. Defaults to "api".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_group: Option<String>,

    pub credentials: ProviderCredentials,
}

/// ClusterProviderConfig is the cluster-scoped counterpart of ProviderConfig.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "slicervm.crossplane.io",
    version = "v1alpha1",
    kind = "ClusterProviderConfig",
    category = "crossplane"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProviderConfigSpec {
    /// Base URL of the Slicer API. Defaults to http://127.0.0.1:8080.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Default host group for VMs using this config. Defaults to "api".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_group: Option<String>,

    pub credentials: ProviderCredentials,
}

/// How the Slicer API token is obtained.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CredentialSource {
    None,
    Secret,
    Env,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    pub source: CredentialSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvSelector>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub name: String,
    /// Namespace of the secret. Defaults to the ProviderConfig's own
    /// namespace; required with ClusterProviderConfig.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvSelector {
    pub name: String,
}

/// A providerConfigRef dispatched to one of the two supported kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigSelector {
    Namespaced { name: String, namespace: String },
    Cluster { name: String },
}

impl ConfigSelector {
    /// Dispatches on the reference's kind. The VM's namespace scopes the
    /// lookup for the namespaced kind.
    pub fn from_ref(
        reference: &ProviderConfigReference,
        vm_namespace: &str,
    ) -> Result<Self, ResolveError> {
        match reference.kind.as_str() {
            "ProviderConfig" => Ok(Self::Namespaced {
                name: reference.name.clone(),
                namespace: vm_namespace.to_string(),
            }),
            "ClusterProviderConfig" => Ok(Self::Cluster {
                name: reference.name.clone(),
            }),
            other => Err(ResolveError::UnsupportedKind(other.to_string())),
        }
    }

    /// Fetches the referenced config object and returns its settings
    /// with defaults applied.
    pub async fn resolve(&self, client: &Client) -> Result<ResolvedConfig, ResolveError> {
        match self {
            Self::Namespaced { name, namespace } => {
                let api = Api::<ProviderConfig>::namespaced(client.clone(), namespace);
                let pc = api.get(name).await.map_err(ResolveError::GetProviderConfig)?;
                Ok(ResolvedConfig::new(
                    pc.spec.url,
                    pc.spec.host_group,
                    pc.spec.credentials,
                    Some(namespace.clone()),
                ))
            }
            Self::Cluster { name } => {
                let api = Api::<ClusterProviderConfig>::all(client.clone());
                let cpc = api
                    .get(name)
                    .await
                    .map_err(ResolveError::GetClusterProviderConfig)?;
                Ok(ResolvedConfig::new(
                    cpc.spec.url,
                    cpc.spec.host_group,
                    cpc.spec.credentials,
                    None,
                ))
            }
        }
    }
}

/// Provider settings after defaulting, ready to build a client from.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub url: String,
    pub host_group: String,
    pub credentials: ProviderCredentials,
    default_secret_namespace: Option<String>,
}

impl ResolvedConfig {
    fn new(
        url: Option<String>,
        host_group: Option<String>,
        credentials: ProviderCredentials,
        default_secret_namespace: Option<String>,
    ) -> Self {
        Self {
            url: url
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            host_group: host_group
                .filter(|hg| !hg.is_empty())
                .unwrap_or_else(|| DEFAULT_HOST_GROUP.to_string()),
            credentials,
            default_secret_namespace,
        }
    }

    /// Resolves the credential descriptor to a raw token.
    pub async fn token(&self, client: &Client) -> Result<String, ResolveError> {
        match self.credentials.source {
            CredentialSource::None => Ok(String::new()),
            CredentialSource::Env => {
                let env = self
                    .credentials
                    .env
                    .as_ref()
                    .ok_or(ResolveError::MissingEnvSelector)?;
                std::env::var(&env.name).map_err(|_| ResolveError::MissingEnvVar(env.name.clone()))
            }
            CredentialSource::Secret => {
                let secret_ref = self
                    .credentials
                    .secret_ref
                    .as_ref()
                    .ok_or(ResolveError::MissingSecretRef)?;
                let namespace = secret_ref
                    .namespace
                    .as_deref()
                    .or(self.default_secret_namespace.as_deref())
                    .ok_or(ResolveError::MissingSecretNamespace)?;

                let secrets = Api::<Secret>::namespaced(client.clone(), namespace);
                let secret = secrets
                    .get(&secret_ref.name)
                    .await
                    .map_err(ResolveError::GetCredentials)?;
                let value = secret
                    .data
                    .unwrap_or_default()
                    .remove(&secret_ref.key)
                    .ok_or_else(|| {
                        ResolveError::MissingSecretKey(
                            secret_ref.name.clone(),
                            secret_ref.key.clone(),
                        )
                    })?;
                String::from_utf8(value.0).map_err(ResolveError::InvalidToken)
            }
        }
    }
}
