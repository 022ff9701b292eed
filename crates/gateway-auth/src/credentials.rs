//! Credential State and its optional on-disk record
//!
//! A `Credential` is the complete token set for the gateway's service account.
//! It is only ever replaced wholesale, so the access token, refresh token,
//! subject id and expiry are always consistent with each other.
//!
//! `CredentialStore` persists that single record so a restart does not force a
//! fresh sign-in. Writes use atomic temp-file + rename to prevent corruption on
//! crash, and a tokio Mutex serializes concurrent writers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// The service account's current tokens.
///
/// `expires` is a unix timestamp in milliseconds (absolute, not a delta).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token for platform calls
    pub access: String,
    /// Token presented to the refresh endpoint
    pub refresh: String,
    /// Subject id sent in the `userid` header
    pub subject_id: String,
    /// Expiration as unix timestamp in milliseconds
    pub expires: u64,
}

impl Credential {
    /// Whether the token is still usable at `now_millis`.
    ///
    /// A token is expired once `now >= expires - buffer`. Tokens expiring
    /// within the buffer are already stale so no call races the real expiry.
    pub fn is_fresh(&self, now_millis: u64, buffer: Duration) -> bool {
        let buffer_millis = buffer.as_millis() as u64;
        self.expires.saturating_sub(buffer_millis) > now_millis
    }

    /// Milliseconds until the token enters the refresh buffer (0 if it already has).
    pub fn remaining_millis(&self, now_millis: u64, buffer: Duration) -> u64 {
        self.expires
            .saturating_sub(buffer.as_millis() as u64)
            .saturating_sub(now_millis)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access", &"[REDACTED]")
            .field("refresh", &"[REDACTED]")
            .field("subject_id", &self.subject_id)
            .field("expires", &self.expires)
            .finish()
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// File-backed storage for the single credential record.
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted credential.
    ///
    /// A missing file is a cold start and yields `None`.
    pub async fn load(&self) -> Result<Option<Credential>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no persisted credential, starting signed out");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
        };
        let credential: Credential = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
        info!(
            path = %self.path.display(),
            subject_id = %credential.subject_id,
            "loaded persisted credential"
        );
        Ok(Some(credential))
    }

    /// Replace the persisted credential.
    pub async fn save(&self, credential: &Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, credential).await
    }

    /// Replace the persisted credential if `still_current()` holds once the
    /// write lock is taken. Returns whether the record was written.
    pub async fn save_if(
        &self,
        credential: &Credential,
        still_current: impl FnOnce() -> bool,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if !still_current() {
            return Ok(false);
        }
        write_atomic(&self.path, credential).await?;
        Ok(true)
    }

    /// Delete the persisted credential. Missing files are not an error.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed persisted credential");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
        }
    }
}

/// Write the credential to a file atomically with 0600 permissions.
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let json = serde_json::to_string_pretty(credential)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credential.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}
