use std::sync::Arc;

use anyhow::{Result, ensure};
use parking_lot::Mutex;
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::error::HttpError;

/// Client TLS configuration trusting the platform's root certificates.
pub fn client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;

    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates or supply a TLS config"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client TLS configuration loaded on first use, so plain-HTTP clients never touch the
/// platform trust store.
#[derive(Default)]
pub struct LazyClientConfig {
    config: Mutex<Option<Arc<ClientConfig>>>,
}

impl LazyClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            config: Mutex::new(Some(config)),
        }
    }

    pub fn get(&self) -> Result<Arc<ClientConfig>, HttpError> {
        let mut slot = self.config.lock();
        if let Some(config) = slot.as_ref() {
            return Ok(config.clone());
        }
        let config = client_config().map_err(|err| HttpError::Tls(format!("{err:#}")))?;
        *slot = Some(config.clone());
        Ok(config)
    }
}

impl std::fmt::Debug for LazyClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyClientConfig")
            .field("loaded", &self.config.lock().is_some())
            .finish()
    }
}
