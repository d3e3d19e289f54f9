// src/secrets.rs
// Wrapper for the 1Password CLI (`op`): credential reads, item creation,
// password generation. Credentials only ever live in process memory.

use crate::models::CredentialBundle;
use crate::BackupError;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub const INSTALL_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const ITEM_TIMEOUT: Duration = Duration::from_secs(30);

/// Fields the secret item must carry for the supported destination type.
pub const REQUIRED_FIELDS: [&str; 4] = [
    "application_key_id",
    "application_key",
    "bucket_name",
    "encryption_password",
];

/// Password alphabet for generated encryption passwords.
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#%^*-_=+";

#[derive(Debug, Clone, Default)]
pub struct SecretClient;

async fn run_op(args: &[String], deadline: Duration, what: &str) -> Result<std::process::Output, BackupError> {
    let mut cmd = Command::new("op");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(deadline, cmd.output()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BackupError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("op {} timed out after {}s", what, deadline.as_secs()),
        ))),
    }
}

impl SecretClient {
    pub async fn check_installed(&self) -> bool {
        matches!(
            run_op(&["--version".to_string()], INSTALL_CHECK_TIMEOUT, "--version").await,
            Ok(output) if output.status.success()
        )
    }

    /// Whether an `op` session is signed in.
    pub async fn check_authenticated(&self) -> bool {
        matches!(
            run_op(&["whoami".to_string()], INSTALL_CHECK_TIMEOUT, "whoami").await,
            Ok(output) if output.status.success()
        )
    }

    /// Read an item's fields as a label → value map.
    pub async fn get_item(
        &self,
        vault: &str,
        title: &str,
    ) -> Result<HashMap<String, String>, BackupError> {
        let args = vec![
            "item".to_string(),
            "get".to_string(),
            title.to_string(),
            "--vault".to_string(),
            vault.to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        let output = run_op(&args, ITEM_TIMEOUT, "item get").await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("isn't an item") || stderr.contains("not found") {
                return Err(BackupError::NotFound(format!(
                    "secret item '{}' in vault '{}'",
                    title, vault
                )));
            }
            return Err(BackupError::PrerequisiteMissing(format!(
                "op item get failed (run `op signin`?): {}",
                stderr.trim()
            )));
        }

        parse_item_fields(&output.stdout)
    }

    pub async fn item_exists(&self, vault: &str, title: &str) -> Result<bool, BackupError> {
        match self.get_item(vault, title).await {
            Ok(_) => Ok(true),
            Err(BackupError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create an item with typed fields (`label=value` assignments).
    pub async fn create_item(
        &self,
        vault: &str,
        title: &str,
        category: &str,
        fields: &[(String, String)],
    ) -> Result<(), BackupError> {
        let mut args = vec![
            "item".to_string(),
            "create".to_string(),
            "--vault".to_string(),
            vault.to_string(),
            "--title".to_string(),
            title.to_string(),
            "--category".to_string(),
            category.to_string(),
        ];
        for (label, value) in fields {
            args.push(format!("{}={}", label, value));
        }

        let output = run_op(&args, ITEM_TIMEOUT, "item create").await?;
        if !output.status.success() {
            return Err(BackupError::PrerequisiteMissing(format!(
                "op item create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(title, vault, "secret item created");
        Ok(())
    }

    /// Random password from a mixed alphabet. Local generation keeps the
    /// value out of shell history and subprocess argument lists.
    pub fn generate_password(&self, length: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| {
                let idx = rng.gen_range(0..PASSWORD_CHARSET.len());
                PASSWORD_CHARSET[idx] as char
            })
            .collect()
    }
}

fn parse_item_fields(stdout: &[u8]) -> Result<HashMap<String, String>, BackupError> {
    let value: Value = serde_json::from_slice(stdout).map_err(|e| {
        BackupError::CredentialsIncomplete(format!("unparseable op item output: {}", e))
    })?;

    let mut fields = HashMap::new();
    if let Some(entries) = value.get("fields").and_then(Value::as_array) {
        for entry in entries {
            let label = entry.get("label").and_then(Value::as_str);
            let field_value = entry.get("value").and_then(Value::as_str);
            if let (Some(label), Some(field_value)) = (label, field_value) {
                if !field_value.is_empty() {
                    fields.insert(label.to_string(), field_value.to_string());
                }
            }
        }
    }
    Ok(fields)
}

/// Look a field up under both of its accepted spellings: `snake_case` as
/// stored by this tool, `camelCase` as some hand-created items use.
pub fn lookup_field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    if let Some(value) = fields.get(name) {
        return Some(value);
    }
    fields.get(&snake_to_camel(name)).map(String::as_str)
}

fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Assemble the credential bundle, naming every missing field at once.
pub fn credentials_from_fields(
    fields: &HashMap<String, String>,
) -> Result<CredentialBundle, BackupError> {
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .filter(|name| lookup_field(fields, name).map_or(true, str::is_empty))
        .copied()
        .collect();

    if !missing.is_empty() {
        return Err(BackupError::CredentialsIncomplete(format!(
            "missing field(s): {}",
            missing.join(", ")
        )));
    }

    Ok(CredentialBundle {
        application_key_id: lookup_field(fields, "application_key_id").unwrap_or_default().to_string(),
        application_key: lookup_field(fields, "application_key").unwrap_or_default().to_string(),
        bucket_name: lookup_field(fields, "bucket_name").unwrap_or_default().to_string(),
        encryption_password: lookup_field(fields, "encryption_password")
            .unwrap_or_default()
            .to_string(),
    })
}
