// src/dest.rs
// Destination types. One exists today: a B2 bucket behind an rclone crypt
// overlay. The seam keeps a future destination type to a new variant.

use crate::models::CredentialBundle;
use crate::rclone::RcloneDriver;
use crate::BackupError;
use tracing::info;

pub const DEST_TYPE_B2_CRYPT: &str = "b2_crypt";

/// A destination type knows how to configure its remotes, validate its
/// credentials, probe itself end-to-end, and name its backup target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    /// Object store with an encryption overlay: `<name>-base` is the raw
    /// b2 backend, `<name>-crypt` encrypts everything routed through it.
    B2Crypt,
}

impl DestinationKind {
    pub fn from_type_str(dest_type: &str) -> Result<Self, BackupError> {
        match dest_type {
            DEST_TYPE_B2_CRYPT => Ok(DestinationKind::B2Crypt),
            other => Err(BackupError::NotFound(format!(
                "destination type '{}'",
                other
            ))),
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            DestinationKind::B2Crypt => DEST_TYPE_B2_CRYPT,
        }
    }

    pub fn base_remote(&self, name: &str) -> String {
        format!("{}-base", name)
    }

    pub fn crypt_remote(&self, name: &str) -> String {
        format!("{}-crypt", name)
    }

    /// All backups target the overlay, so content is encrypted before it
    /// leaves the host.
    pub fn backup_target(&self, name: &str) -> String {
        format!("{}:", self.crypt_remote(name))
    }

    /// All required credential fields present and non-empty.
    pub fn validate(&self, creds: &CredentialBundle) -> Result<(), BackupError> {
        let blank = [
            ("application_key_id", &creds.application_key_id),
            ("application_key", &creds.application_key),
            ("bucket_name", &creds.bucket_name),
            ("encryption_password", &creds.encryption_password),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();

        if blank.is_empty() {
            Ok(())
        } else {
            Err(BackupError::CredentialsIncomplete(format!(
                "empty field(s): {}",
                blank.join(", ")
            )))
        }
    }

    /// (Re)create both remotes. rclone cannot create-or-replace, so any
    /// prior remote of the same name is deleted first; the whole sequence
    /// is safe to re-run.
    pub async fn configure(
        &self,
        rclone: &RcloneDriver,
        name: &str,
        bucket: &str,
        remote_path: &str,
        creds: &CredentialBundle,
    ) -> Result<(), BackupError> {
        let base = self.base_remote(name);
        let crypt = self.crypt_remote(name);

        rclone.delete_remote(&base).await.ok();
        rclone
            .configure_remote(
                &base,
                "b2",
                &[
                    ("account".to_string(), creds.application_key_id.clone()),
                    ("key".to_string(), creds.application_key.clone()),
                ],
            )
            .await?;
        info!(remote = %base, "base remote configured");

        let obscured = rclone.obscure(&creds.encryption_password).await?;
        rclone.delete_remote(&crypt).await.ok();
        rclone
            .configure_remote(
                &crypt,
                "crypt",
                &[
                    (
                        "remote".to_string(),
                        format!("{}:{}{}", base, bucket, remote_path),
                    ),
                    ("password".to_string(), obscured),
                    ("filename_encryption".to_string(), "standard".to_string()),
                    ("directory_name_encryption".to_string(), "true".to_string()),
                ],
            )
            .await?;
        info!(remote = %crypt, "encryption overlay configured");

        Ok(())
    }

    /// End-to-end probe through the overlay.
    pub async fn test_write(&self, rclone: &RcloneDriver, name: &str) -> Result<(), BackupError> {
        let crypt = self.crypt_remote(name);
        if rclone.test_write(&crypt).await? {
            Ok(())
        } else {
            Err(BackupError::TestWriteFailed(crypt))
        }
    }
}
