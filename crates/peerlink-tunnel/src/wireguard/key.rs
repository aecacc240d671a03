//! WireGuard key validation and private key file handling.

use once_cell::sync::Lazy;
use peerlink_common::{PeerlinkError, PeerlinkResult};
use regex::Regex;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

use super::control::WgControl;

/// 32 bytes of base64: 43 significant characters and one `=` of padding.
/// The 43rd character carries only four data bits.
static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9+/]{42}[AEIMQUYcgkosw048]=$").expect("Invalid regex pattern")
});

pub fn is_valid_key(key: &str) -> bool {
    KEY_RE.is_match(key)
}

fn key_file_error(path: &Path, e: std::io::Error) -> PeerlinkError {
    PeerlinkError::tunnel("wireguard", format!("private key {}: {}", path.display(), e))
}

/// Makes sure a valid private key exists at `path`, generating one when the
/// file is missing. Returns true if a key was generated.
pub async fn ensure_private_key(wg: &dyn WgControl, path: &Path) -> PeerlinkResult<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            if !is_valid_key(contents.trim()) {
                return Err(PeerlinkError::invalid_config(
                    "tunnel.private_key_path",
                    format!("{} does not hold a WireGuard key", path.display()),
                ));
            }
            Ok(false)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = wg.genkey().await?;
            if !is_valid_key(&key) {
                return Err(PeerlinkError::tunnel("wireguard", "wg genkey returned a malformed key"));
            }
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| key_file_error(path, e))?;
            }
            tokio::fs::write(path, format!("{}\n", key))
                .await
                .map_err(|e| key_file_error(path, e))?;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| key_file_error(path, e))?;
            info!("Generated WireGuard private key at {}", path.display());
            Ok(true)
        }
        Err(e) => Err(key_file_error(path, e)),
    }
}
