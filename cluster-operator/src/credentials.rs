//! Provider tokens stored in Kubernetes Secrets
use crate::error::{Error, Result};
use async_trait::async_trait;
use cluster_core::SecretRef;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use secrecy::{ExposeSecret, SecretString};

/// Key of the Secret entry holding the token
pub const TOKEN_KEY: &str = "token";

/// A provider API token
///
/// Fetched once per reconcile pass and dropped with it.
#[derive(Debug)]
pub struct Credential(SecretString);

impl Credential {
    /// Wraps a raw token
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// The raw token, for building request headers
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Resolves credential references
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Reads the token held by `secret`
    async fn get_secret(&self, secret: &SecretRef) -> Result<Credential>;
}

/// [`CredentialStore`] reading the `token` key of a Kubernetes `Secret`
#[derive(Clone)]
pub struct SecretCredentials {
    client: Client,
}

impl SecretCredentials {
    /// Reads Secrets through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialStore for SecretCredentials {
    async fn get_secret(&self, secret_ref: &SecretRef) -> Result<Credential> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let secret = api
            .get_opt(&secret_ref.name)
            .await
            .map_err(|source| Error::CredentialRead {
                secret: secret_ref.clone(),
                source,
            })?
            .ok_or_else(|| Error::CredentialNotFound(secret_ref.clone()))?;
        token_from(&secret)
            .map(Credential::new)
            .ok_or_else(|| Error::CredentialMissingToken(secret_ref.clone()))
    }
}

/// The trimmed `token` entry; `stringData` is write-only and never read back
fn token_from(secret: &Secret) -> Option<String> {
    let bytes = secret.data.as_ref()?.get(TOKEN_KEY)?;
    let token = std::str::from_utf8(&bytes.0).ok()?.trim();
    (!token.is_empty()).then(|| token.to_string())
}
