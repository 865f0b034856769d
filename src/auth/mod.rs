pub mod storage;

pub use storage::AuthStorage;

use anyhow::{Context, Result, bail};

/// Providers that take an API key.
const SUPPORTED_PROVIDERS: &[&str] = &["together"];

/// Store an API key for a provider.
///
/// Returns an error if the provider is not supported, the key is blank,
/// or the key cannot be saved.
pub fn login(db_path: &str, provider: &str, key: &str) -> Result<()> {
    if !SUPPORTED_PROVIDERS.contains(&provider) {
        bail!("unsupported provider: {provider}");
    }
    let key = key.trim();
    if key.is_empty() {
        bail!("no API key provided");
    }
    let storage = AuthStorage::open(db_path).context("failed to open auth storage")?;
    storage
        .set(provider, key)
        .context("failed to save credentials")?;
    Ok(())
}

/// Remove the stored API key for a provider.
pub fn logout(db_path: &str, provider: &str) -> Result<()> {
    let storage = AuthStorage::open(db_path).context("failed to open auth storage")?;
    storage
        .remove(provider)
        .context("failed to remove credentials")?;
    Ok(())
}
