use super::{CreateRequest, Deleted, Error, Provisioner, RemoteCluster};
use crate::credentials::Credential;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const PAGE_SIZE: u32 = 200;

/// [`Provisioner`] backed by the DigitalOcean Kubernetes (DOKS) REST API
#[derive(Debug, Clone)]
pub struct DigitalOcean {
    http: reqwest::Client,
    base_url: String,
}

impl DigitalOcean {
    /// Public endpoint of the DigitalOcean API
    pub const DEFAULT_API_URL: &'static str = "https://api.digitalocean.com";

    /// Creates a client against `base_url`, normally [`DigitalOcean::DEFAULT_API_URL`]
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("cluster-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn clusters_url(&self) -> String {
        format!("{}/v2/kubernetes/clusters", self.base_url)
    }

    fn cluster_url(&self, id: &str) -> String {
        format!("{}/{id}", self.clusters_url())
    }
}

#[derive(Serialize)]
struct CreateBody<'a> {
    name: &'a str,
    region: &'a str,
    version: &'a str,
    node_pools: [NodePoolBody<'a>; 1],
}

#[derive(Serialize)]
struct NodePoolBody<'a> {
    name: &'a str,
    size: &'a str,
    count: u32,
}

#[derive(Deserialize)]
struct ClusterEnvelope {
    kubernetes_cluster: ClusterBody,
}

#[derive(Deserialize)]
struct ClusterBody {
    id: String,
    name: String,
    #[serde(default)]
    status: Option<ClusterState>,
}

#[derive(Deserialize)]
struct ClusterState {
    state: String,
}

#[derive(Deserialize)]
struct ClusterPage {
    #[serde(default)]
    kubernetes_clusters: Vec<ClusterBody>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct Links {
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Turns a non-success response into [`Error::Api`]
async fn check(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ApiError>().await {
        Ok(body) => body.message,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Provisioner for DigitalOcean {
    async fn create(&self, credential: &Credential, request: &CreateRequest) -> Result<String, Error> {
        let body = CreateBody {
            name: &request.name,
            region: &request.region,
            version: &request.version,
            node_pools: [NodePoolBody {
                name: &request.node_pool.name,
                size: &request.node_pool.size,
                count: request.node_pool.count,
            }],
        };
        let response = self
            .http
            .post(self.clusters_url())
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await?;
        let created: ClusterEnvelope = check(response).await?.json().await?;
        debug!(cluster_id = %created.kubernetes_cluster.id, "cluster requested");
        Ok(created.kubernetes_cluster.id)
    }

    async fn get_status(&self, credential: &Credential, id: &str) -> Result<String, Error> {
        let response = self
            .http
            .get(self.cluster_url(id))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        let cluster: ClusterEnvelope = check(response).await?.json().await?;
        Ok(cluster
            .kubernetes_cluster
            .status
            .map(|status| status.state)
            .unwrap_or_default())
    }

    async fn delete(&self, credential: &Credential, id: &str) -> Result<Deleted, Error> {
        let response = self
            .http
            .delete(self.cluster_url(id))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Deleted::AlreadyGone);
        }
        check(response).await?;
        Ok(Deleted::Removed)
    }

    async fn list(&self, credential: &Credential) -> Result<Vec<RemoteCluster>, Error> {
        let mut clusters = Vec::new();
        let mut page = 1_u32;
        loop {
            let response = self
                .http
                .get(self.clusters_url())
                .bearer_auth(credential.expose())
                .query(&[("page", page), ("per_page", PAGE_SIZE)])
                .send()
                .await?;
            let body: ClusterPage = check(response).await?.json().await?;
            clusters.extend(body.kubernetes_clusters.into_iter().map(|c| RemoteCluster {
                id: c.id,
                name: c.name,
            }));
            let has_next = body
                .links
                .and_then(|links| links.pages)
                .and_then(|pages| pages.next)
                .is_some();
            if !has_next {
                break;
            }
            page += 1;
        }
        Ok(clusters)
    }

    async fn kubeconfig(&self, credential: &Credential, id: &str) -> Result<Option<String>, Error> {
        let response = self
            .http
            .get(format!("{}/kubeconfig", self.cluster_url(id)))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.text().await?))
    }
}
