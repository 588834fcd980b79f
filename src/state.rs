//! The local state crib.
//!
//! A single JSON file recording which service identities the engine
//! believes it has registered, plus their payload fingerprints. It is a
//! disaster-recovery hint, not a source of truth: losing it only causes a
//! harmless re-register on the next tick, so readers treat a missing or
//! unreadable file as empty state. Writes go through a temp file and an
//! atomic rename; a cycle interrupted mid-write leaves either the old file
//! or the new one, never a torn one.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while persisting state. Load errors are tolerated and
/// never surface as this type.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem failure.
    #[error("state file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The state could not be serialized.
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted engine state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    /// Service identities believed registered, as a true-marker map.
    #[serde(default)]
    pub services: BTreeMap<String, bool>,

    /// Payload fingerprint per identity.
    #[serde(default)]
    pub service_hashes: BTreeMap<String, String>,
}

/// Load state from disk, tolerating absent or corrupt files.
pub async fn load(path: &str) -> State {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(path, "no prior state loaded: {e}");
            return State::default();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(path, "state file unreadable, starting empty: {e}");
            State::default()
        }
    }
}

/// Persist state atomically: write a sibling temp file, fix permissions,
/// rename over the target.
pub async fn save(path: &str, state: &State) -> Result<(), StateError> {
    let bytes = serde_json::to_vec_pretty(state)?;

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &str) -> String {
    let path = Path::new(path);
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".tmp");
    path.with_file_name(name).to_string_lossy().into_owned()
}
