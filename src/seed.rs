//! Persistent overlay identity.
//!
//! The overlay address is derived from a wallet seed, so keeping the seed
//! stable across restarts keeps the address stable. An explicit `NKN_SEED`
//! always wins; otherwise the seed file is loaded, and only if both are
//! absent is a fresh seed minted through the overlay SDK (the one source
//! of well-formed seeds) and persisted with owner-only permissions.

use std::path::Path;

use anyhow::{format_err, Context};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::sidecar::asset::WALLET_SNIPPET;
use crate::Result;

/// Resolve the seed to hand the sidecar. `None` means we proceed with an
/// ephemeral identity, which is allowed but logged as an error.
pub async fn ensure_seed(config: &Config) -> Option<String> {
    if !config.nkn_seed.is_empty() {
        info!(
            length = config.nkn_seed.len(),
            "using NKN_SEED from environment"
        );
        return Some(config.nkn_seed.clone());
    }

    if let Some(seed) = load_persisted(&config.nkn_seed_file).await {
        info!(path = ?config.nkn_seed_file, "loaded persisted NKN seed");
        return Some(seed);
    }

    match generate_seed(&config.sidecar_dir).await {
        Ok(seed) => {
            if let Err(err) = persist_seed(&config.nkn_seed_file, &seed).await {
                warn!("could not persist NKN seed: {}", err);
            } else {
                info!(path = ?config.nkn_seed_file, "generated and persisted new NKN seed");
            }
            Some(seed)
        }
        Err(err) => {
            // The sidecar falls back to an ephemeral identity, so the
            // address changes on every restart.
            error!("failed to generate NKN seed: {}", err);
            None
        }
    }
}

/// Load a previously persisted seed, if the file exists and is non-empty.
async fn load_persisted(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let seed = contents.trim().to_owned();
            if seed.is_empty() {
                None
            } else {
                Some(seed)
            }
        }
        Err(_) => None,
    }
}

/// Mint a fresh seed through the overlay SDK's wallet. Runs from the
/// sidecar directory so `require('nkn-sdk')` resolves.
async fn generate_seed(sidecar_dir: &Path) -> Result<String> {
    tokio::fs::create_dir_all(sidecar_dir)
        .await
        .with_context(|| format!("could not create {:?}", sidecar_dir))?;
    let output = Command::new("node")
        .arg("-e")
        .arg(WALLET_SNIPPET)
        .current_dir(sidecar_dir)
        .output()
        .await
        .context("could not run node to generate a wallet seed")?;
    if !output.status.success() {
        return Err(format_err!(
            "wallet generation failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    let seed = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if seed.is_empty() {
        return Err(format_err!("empty seed from wallet"));
    }
    Ok(seed)
}

/// Write the seed file with owner-only permissions where the host
/// supports them.
async fn persist_seed(path: &Path, seed: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("could not create {:?}", parent))?;
    }
    tokio::fs::write(path, seed)
        .await
        .with_context(|| format!("could not write {:?}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(err) = tokio::fs::set_permissions(path, perms).await {
            warn!(path = ?path, "could not restrict seed permissions: {}", err);
        }
    }
    Ok(())
}
