//! Typed client for the Slicer VM management API.
//!
//! Covers the subset the controller needs: list the nodes of a host
//! group, create a node, delete a node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("slicer api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("slicer api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A node (VM) as reported by the Slicer API.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Node {
    pub hostname: String,
    pub ip: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CreateNodeRequest {
    pub ram_gb: u32,
    pub cpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_user: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Client for the Slicer REST API.
#[derive(Clone)]
pub struct SlicerClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl SlicerClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url: String = base_url.into();
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    pub async fn host_group_nodes(&self, host_group: &str) -> Result<Vec<Node>> {
        let resp = self
            .http
            .get(self.url(&format!("/api/hostgroups/{host_group}/nodes")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "list nodes")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn create_node(&self, host_group: &str, req: &CreateNodeRequest) -> Result<Node> {
        let resp = self
            .http
            .post(self.url(&format!("/api/hostgroups/{host_group}/nodes")))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create node")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn delete_node(&self, host_group: &str, hostname: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/hostgroups/{host_group}/nodes/{hostname}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check_allow_404(resp, "delete node").await?;
        Ok(())
    }
}
