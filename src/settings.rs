//! Derivation of the WAL-E environment from resolved credentials.
//!
//! The output is a pure function of its inputs: the same record and
//! settings always produce the same [`EnvironmentMapping`] and
//! [`HostOverride`].

use crate::credentials::CredentialRecord;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Built-in variables, in the order their files are written.
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const WALE_S3_PREFIX: &str = "WALE_S3_PREFIX";
pub const WALE_GPG_KEY_ID: &str = "WALE_GPG_KEY_ID";

const BUILTIN_VARIABLES: [&str; 4] = [
    AWS_SECRET_ACCESS_KEY,
    AWS_ACCESS_KEY_ID,
    WALE_S3_PREFIX,
    WALE_GPG_KEY_ID,
];

/// Path appended to every storage prefix.
const PREFIX_SUFFIX: &str = "wal-e";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// An extra variable name cannot be used as an env file name.
    #[error("invalid environment variable name: '{name}'")]
    InvalidVariable { name: String },

    /// An extra variable would replace a built-in one.
    #[error("environment variable '{name}' is managed by wale-provision and cannot be overridden")]
    ReservedVariable { name: String },
}

/// Caller-supplied settings combined with the credential record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredSettings {
    /// Logical name of the host, used in the storage prefix.
    pub node_identifier: String,
    /// GPG key used by WAL-E to encrypt backups.
    pub signing_key_id: Option<String>,
    /// Custom S3 endpoint written to the legacy boto config.
    pub s3_default_host: Option<String>,
    /// Additional variables written next to the built-in ones.
    pub extra_env: BTreeMap<String, String>,
}

/// Ordered variable name to value mapping.
///
/// `Debug` lists variable names only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMapping {
    entries: Vec<(String, String)>,
}

impl EnvironmentMapping {
    fn push(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    /// Get a value by variable name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Iterate over `(name, value)` pairs in write order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for EnvironmentMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Custom S3 endpoint for the boto library WAL-E uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOverride {
    pub host: String,
}

impl HostOverride {
    /// Render the boto config file.
    ///
    /// ```
    /// use wale_provision::settings::HostOverride;
    ///
    /// let rendered = HostOverride { host: "s3.example.com".to_string() }.render();
    /// assert_eq!(rendered, "[s3]\nhost=s3.example.com\n");
    /// ```
    pub fn render(&self) -> String {
        format!("[s3]\nhost={}\n", self.host)
    }
}

/// Build the storage prefix for a bucket and node.
pub fn storage_prefix(bucket: &str, node_identifier: &str) -> String {
    format!("s3://{}/{}/{}", bucket, node_identifier, PREFIX_SUFFIX)
}

/// Combine a credential record with declared settings.
///
/// # Errors
///
/// Returns an error if an extra variable has an unusable or reserved name.
pub fn derive(
    record: &CredentialRecord,
    declared: &DeclaredSettings,
) -> Result<(EnvironmentMapping, Option<HostOverride>), SettingsError> {
    let mut env = EnvironmentMapping::default();

    env.push(AWS_SECRET_ACCESS_KEY, record.secret_access_key.as_str());
    env.push(AWS_ACCESS_KEY_ID, record.access_key_id.as_str());
    env.push(
        WALE_S3_PREFIX,
        storage_prefix(&record.bucket, &declared.node_identifier),
    );
    env.push(
        WALE_GPG_KEY_ID,
        declared.signing_key_id.clone().unwrap_or_default(),
    );

    for (name, value) in &declared.extra_env {
        validate_variable_name(name)?;
        env.push(name, value.as_str());
    }

    let host_override = declared
        .s3_default_host
        .as_deref()
        .filter(|host| !host.is_empty())
        .map(|host| HostOverride {
            host: host.to_string(),
        });

    Ok((env, host_override))
}

fn validate_variable_name(name: &str) -> Result<(), SettingsError> {
    if BUILTIN_VARIABLES.contains(&name) {
        return Err(SettingsError::ReservedVariable {
            name: name.to_string(),
        });
    }

    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(SettingsError::InvalidVariable {
            name: name.to_string(),
        });
    }

    Ok(())
}
