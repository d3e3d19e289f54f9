// src/setup.rs
// One-shot setup wizard. Every step is idempotent: a failed run is
// resumed by running the whole thing again, completed steps no-op.

use crate::dest::{DestinationKind, DEST_TYPE_B2_CRYPT};
use crate::models::CredentialBundle;
use crate::rclone::RcloneDriver;
use crate::secrets::{self, SecretClient, REQUIRED_FIELDS};
use crate::store::Store;
use crate::BackupError;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use tracing::{info, warn};

pub const SECRET_VAULT: &str = "Private";
pub const SECRET_ITEM_TITLE: &str = "Immich Backup B2";
pub const SECRET_CATEGORY: &str = "Secure Note";

/// A credential field still carrying this marker has not been filled in.
pub const PLACEHOLDER_MARKER: &str = "REPLACE";

/// Path under the bucket all encrypted content lives in.
pub const DEFAULT_REMOTE_PATH: &str = "/immich";

const GENERATED_PASSWORD_LENGTH: usize = 32;

pub struct SetupController<'a> {
    store: &'a Store,
    rclone: RcloneDriver,
    secrets: SecretClient,
}

/// Result of one prerequisite probe, for the `--check` report.
#[derive(Debug)]
pub struct Diagnostic {
    pub label: String,
    pub ok: bool,
    pub detail: String,
}

impl<'a> SetupController<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            rclone: RcloneDriver,
            secrets: SecretClient,
        }
    }

    /// Probe every external collaborator. Used by `--check` and as the
    /// first setup step.
    pub async fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut results = Vec::new();

        match self.rclone.version().await {
            Ok(version) => results.push(Diagnostic {
                label: "rclone installed".to_string(),
                ok: true,
                detail: version,
            }),
            Err(e) => results.push(Diagnostic {
                label: "rclone installed".to_string(),
                ok: false,
                detail: e.to_string(),
            }),
        }

        let op_installed = self.secrets.check_installed().await;
        results.push(Diagnostic {
            label: "op installed".to_string(),
            ok: op_installed,
            detail: if op_installed {
                "found in PATH".to_string()
            } else {
                "not found; install the 1Password CLI".to_string()
            },
        });

        if op_installed {
            let authed = self.secrets.check_authenticated().await;
            results.push(Diagnostic {
                label: "op authenticated".to_string(),
                ok: authed,
                detail: if authed {
                    "session active".to_string()
                } else {
                    "no active session; run `op signin`".to_string()
                },
            });
        }

        results
    }

    /// Step 1: halt with an actionable message if any collaborator is
    /// missing.
    pub async fn check_prerequisites(&self) -> Result<(), BackupError> {
        self.rclone.version().await?;

        if !self.secrets.check_installed().await {
            return Err(BackupError::PrerequisiteMissing(
                "op is not installed (install the 1Password CLI: https://developer.1password.com/docs/cli/)"
                    .to_string(),
            ));
        }
        if !self.secrets.check_authenticated().await {
            return Err(BackupError::PrerequisiteMissing(
                "op has no active session; run `op signin` first".to_string(),
            ));
        }
        Ok(())
    }

    /// Run the whole wizard for one named destination.
    pub async fn run(&self, destination_name: &str) -> Result<(), BackupError> {
        info!(destination = destination_name, "starting setup");
        self.check_prerequisites().await?;

        let fields = self.ensure_secret_item().await?;

        // Step 3: every required field present, non-empty, and filled in
        let placeholders = placeholder_fields(&fields);
        if !placeholders.is_empty() {
            return Err(BackupError::CredentialsIncomplete(format!(
                "field(s) still contain placeholder values: {} (edit the '{}' item and re-run --setup)",
                placeholders.join(", "),
                SECRET_ITEM_TITLE
            )));
        }
        let creds = secrets::credentials_from_fields(&fields)?;

        let kind = DestinationKind::B2Crypt;
        kind.validate(&creds)?;

        // Steps 4 + 5: remotes, base first, then the crypt overlay
        kind.configure(
            &self.rclone,
            destination_name,
            &creds.bucket_name,
            DEFAULT_REMOTE_PATH,
            &creds,
        )
        .await?;

        let base = kind.base_remote(destination_name);
        if !self.rclone.test_connection(&base).await? {
            return Err(BackupError::ConnectionTestFailed(base));
        }

        // Step 6: prove the overlay encrypts and round-trips end to end
        kind.test_write(&self.rclone, destination_name).await?;
        info!(destination = destination_name, "test write through the crypt overlay succeeded");

        // Step 7: persist, unless an earlier run already did
        self.persist_destination(destination_name, &creds)?;

        println!("Setup complete. Run `backup` to start the first transfer.");
        Ok(())
    }

    /// Step 2: read the secret item, creating it with placeholders (and a
    /// generated encryption password) when it does not exist yet.
    async fn ensure_secret_item(&self) -> Result<HashMap<String, String>, BackupError> {
        if self
            .secrets
            .item_exists(SECRET_VAULT, SECRET_ITEM_TITLE)
            .await?
        {
            return self.secrets.get_item(SECRET_VAULT, SECRET_ITEM_TITLE).await;
        }

        println!(
            "Secret item '{}' was not found in vault '{}'.",
            SECRET_ITEM_TITLE, SECRET_VAULT
        );
        if !confirm("Create it now with placeholder credentials?") {
            return Err(BackupError::CredentialsIncomplete(
                "setup aborted: no secret item".to_string(),
            ));
        }

        let password = self.secrets.generate_password(GENERATED_PASSWORD_LENGTH);
        let fields = placeholder_item_fields(&password);
        self.secrets
            .create_item(SECRET_VAULT, SECRET_ITEM_TITLE, SECRET_CATEGORY, &fields)
            .await?;

        println!(
            "Created '{}' in vault '{}'. The encryption password was generated for you;",
            SECRET_ITEM_TITLE, SECRET_VAULT
        );
        println!("open 1Password and replace the {} placeholders with your B2 credentials.", PLACEHOLDER_MARKER);
        wait_for_enter("Press Enter once the placeholders are filled in...");

        self.secrets.get_item(SECRET_VAULT, SECRET_ITEM_TITLE).await
    }

    fn persist_destination(
        &self,
        name: &str,
        creds: &CredentialBundle,
    ) -> Result<(), BackupError> {
        match self.store.get_destination(name) {
            Ok(existing) => {
                info!(destination = name, id = existing.id, "destination already persisted");
                Ok(())
            }
            Err(BackupError::NotFound(_)) => {
                let id = self.store.create_destination(
                    name,
                    DEST_TYPE_B2_CRYPT,
                    &creds.bucket_name,
                    DEFAULT_REMOTE_PATH,
                )?;
                info!(destination = name, id, "destination persisted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Initial field set for a fresh secret item. The encryption password is
/// real from the start; the B2 credentials the user must paste in.
fn placeholder_item_fields(encryption_password: &str) -> Vec<(String, String)> {
    vec![
        (
            "application_key_id".to_string(),
            format!("{}_WITH_KEY_ID", PLACEHOLDER_MARKER),
        ),
        (
            "application_key".to_string(),
            format!("{}_WITH_APPLICATION_KEY", PLACEHOLDER_MARKER),
        ),
        (
            "bucket_name".to_string(),
            format!("{}_WITH_BUCKET_NAME", PLACEHOLDER_MARKER),
        ),
        (
            "encryption_password".to_string(),
            encryption_password.to_string(),
        ),
    ]
}

/// Required fields whose value still contains the placeholder marker.
fn placeholder_fields(fields: &HashMap<String, String>) -> Vec<String> {
    REQUIRED_FIELDS
        .iter()
        .filter(|name| {
            secrets::lookup_field(fields, name)
                .map(|value| value.contains(PLACEHOLDER_MARKER))
                .unwrap_or(false)
        })
        .map(|name| name.to_string())
        .collect()
}

pub fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        warn!("failed to read confirmation, assuming no");
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn wait_for_enter(prompt: &str) {
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_item_has_real_password() {
        let fields = placeholder_item_fields("s3cretgeneratedpassword12345678!");

        let map: HashMap<String, String> = fields.into_iter().collect();
        assert!(map["application_key_id"].contains(PLACEHOLDER_MARKER));
        assert!(map["application_key"].contains(PLACEHOLDER_MARKER));
        assert!(map["bucket_name"].contains(PLACEHOLDER_MARKER));
        assert!(!map["encryption_password"].contains(PLACEHOLDER_MARKER));
    }

    #[test]
    fn test_placeholder_detection() {
        let mut fields = HashMap::new();
        fields.insert("application_key_id".to_string(), "0012ab34cd56".to_string());
        fields.insert(
            "application_key".to_string(),
            "REPLACE_WITH_APPLICATION_KEY".to_string(),
        );
        fields.insert("bucket_name".to_string(), "immich-backup".to_string());
        fields.insert("encryption_password".to_string(), "x".repeat(32));

        let remaining = placeholder_fields(&fields);
        assert_eq!(remaining, vec!["application_key"]);
    }

    #[test]
    fn test_missing_field_is_not_a_placeholder() {
        // Campos ausentes são reportados por credentials_from_fields, não
        // pela detecção de placeholder
        let fields = HashMap::new();
        assert!(placeholder_fields(&fields).is_empty());
    }
}
