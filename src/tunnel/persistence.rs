use anyhow::{Context, Result};
use iroh::SecretKey;
use std::path::Path;

pub const DEFAULT_KEY_PATH: &str = ".tunnel_key";

/// Load the endpoint key from `path`, or generate one. With `persist` unset a
/// fresh key is used every run, so the descriptor changes every run too.
pub async fn get_or_create_secret_key(persist: bool, path: &Path) -> Result<SecretKey> {
    if persist && path.exists() {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid key length in {}", path.display()))?;
        tracing::info!("loaded persistent secret key from {}", path.display());
        return Ok(SecretKey::from(bytes));
    }

    let key = SecretKey::generate(&mut rand::rng());
    if persist {
        tokio::fs::write(path, key.to_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("generated and saved new secret key to {}", path.display());
    } else {
        tracing::info!("generated ephemeral secret key (not persisted)");
    }
    Ok(key)
}
