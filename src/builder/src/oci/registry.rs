//! Registry transport.
//!
//! The composer talks to registries through the [`RegistryTransport`]
//! trait: a manifest existence probe and a push. The production
//! implementation wraps the `oci-distribution` client; tests substitute
//! scripted transports to exercise tag ordering and retry behavior
//! without a registry.

use async_trait::async_trait;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::Reference;

use pxeforge_core::error::{ForgeError, Result};

use super::layer::MEDIA_TYPE_CONFIG;

/// Everything a push needs: the serialized config blob and the layer
/// blobs with their media types, in order.
#[derive(Debug, Clone)]
pub struct PushableImage {
    pub config_data: Vec<u8>,
    pub layers: Vec<PushableLayer>,
}

#[derive(Debug, Clone)]
pub struct PushableLayer {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// Seam between the composer and the registry wire protocol.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Probe whether a manifest exists under `reference`. Probe failures
    /// count as "absent".
    async fn manifest_exists(&self, reference: &Reference) -> bool;

    /// Push an image under `reference`.
    async fn push(&self, reference: &Reference, image: &PushableImage) -> Result<()>;
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous access (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Credentials from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, falling
    /// back to anonymous.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Whether the user's registry option strings disable TLS verification.
pub fn insecure_requested(opts: &[String]) -> bool {
    opts.iter().any(|opt| opt == "--tls-verify=false")
}

/// `oci-distribution`-backed transport.
pub struct DistributionTransport {
    client: Client,
    auth: RegistryAuth,
}

impl DistributionTransport {
    /// Build a transport, choosing plain HTTP when the push options ask
    /// for `--tls-verify=false`.
    pub fn new(registry_opts: &[String]) -> Self {
        let protocol = if insecure_requested(registry_opts) {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        Self {
            client,
            auth: RegistryAuth::from_env(),
        }
    }
}

#[async_trait]
impl RegistryTransport for DistributionTransport {
    async fn manifest_exists(&self, reference: &Reference) -> bool {
        self.client
            .pull_manifest(reference, &self.auth.to_oci_auth())
            .await
            .is_ok()
    }

    async fn push(&self, reference: &Reference, image: &PushableImage) -> Result<()> {
        let layers: Vec<ImageLayer> = image
            .layers
            .iter()
            .map(|layer| ImageLayer::new(layer.data.clone(), layer.media_type.clone(), None))
            .collect();
        let config = Config::new(image.config_data.clone(), MEDIA_TYPE_CONFIG.to_string(), None);

        self.client
            .push(reference, &layers, config, &self.auth.to_oci_auth(), None)
            .await
            .map(|_| ())
            .map_err(|e| ForgeError::Registry(format!("failed to push {reference}: {e}")))
    }
}
