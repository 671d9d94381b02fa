//! Wiring from configuration to concrete store, directory and logging.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use medc_core::directory::{InMemoryDirectory, KeyDirectory};
use medc_core::http_directory::HttpKeyDirectory;
use medc_core::sealed_store::SealedKeyStore;
use medc_core::sqlite_store::SqliteKeyStore;
use medc_core::{EncryptionConfig, KeyStore};
use medc_crypto::{CryptoProvider, SymmetricKey};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const STORAGE_KEY_VAR: &str = "MEDC_STORAGE_KEY";

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable.
pub fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "medc={},medc_core={},medc_crypto={}",
            level, level, level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Parse a base64 32-byte storage key.
pub fn parse_storage_key(encoded: &str) -> anyhow::Result<SymmetricKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("storage key is not valid base64")?;
    SymmetricKey::from_slice(&bytes).map_err(|e| anyhow!("storage key: {}", e))
}

/// SQLite store under `data_dir`, sealed with `MEDC_STORAGE_KEY` when
/// `seal_store` is on.
pub fn open_store(
    config: &EncryptionConfig,
    provider: Arc<dyn CryptoProvider>,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Arc<dyn KeyStore>> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let path = config.database_path();
    let sqlite = SqliteKeyStore::new(&path)?;
    info!(path = %path.display(), sealed = config.seal_store, "Opened key store");

    if !config.seal_store {
        warn!("Key store is not sealed; private keys are stored in the clear");
        return Ok(Arc::new(sqlite));
    }

    let encoded = match lookup(STORAGE_KEY_VAR) {
        Some(v) => v,
        None => bail!(
            "{} must hold a base64 32-byte key when seal_store is enabled",
            STORAGE_KEY_VAR
        ),
    };
    let key = parse_storage_key(&encoded)?;
    Ok(Arc::new(SealedKeyStore::new(sqlite, key, provider)))
}

/// HTTP directory when a URL is configured, otherwise a process-local one.
pub fn open_directory(config: &EncryptionConfig) -> anyhow::Result<Arc<dyn KeyDirectory>> {
    match &config.directory_url {
        Some(url) => Ok(Arc::new(HttpKeyDirectory::new(url.clone())?)),
        None => {
            warn!("No directory_url configured; peer keys can only arrive in-band");
            Ok(Arc::new(InMemoryDirectory::new()))
        }
    }
}
