// wale-provision Configuration Module
//
// This module handles loading and parsing the configuration from wal-e.yaml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::converge::Layout;
use crate::credentials::{
    ConfigSelector, CredentialSource, DataBagStore, DecryptionContext, EncryptedDataBagStore,
};
use crate::materializer::Ownership;
use crate::settings::DeclaredSettings;

/// Mode shared by the configuration directories and every file in them
pub const SECRETS_MODE: u32 = 0o750;

/// S3 credential selection and endpoint settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Read credentials from the encrypted data bag instead of the plain one
    #[serde(default)]
    pub use_encrypted_data_bag: bool,

    /// Data bag holding the credential items
    #[serde(default = "default_data_bag")]
    pub data_bag: String,

    /// Item within the data bag
    #[serde(default = "default_data_bag_item")]
    pub data_bag_item: String,

    /// Custom S3 endpoint; empty means no boto config is written
    #[serde(default)]
    pub default_host: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            use_encrypted_data_bag: false,
            data_bag: default_data_bag(),
            data_bag_item: default_data_bag_item(),
            default_host: String::new(),
        }
    }
}

fn default_data_bag() -> String {
    "aws_credentials".to_string()
}

fn default_data_bag_item() -> String {
    "wal_e".to_string()
}

/// Where data bag items and the decryption key live
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DataBagsConfig {
    /// Root directory containing one directory per data bag
    #[serde(default = "default_data_bag_path")]
    pub path: String,

    /// age key file used to decrypt encrypted data bag items
    #[serde(default = "default_secret_key_file")]
    pub secret_key_file: String,
}

impl Default for DataBagsConfig {
    fn default() -> Self {
        Self {
            path: default_data_bag_path(),
            secret_key_file: default_secret_key_file(),
        }
    }
}

fn default_data_bag_path() -> String {
    "/var/lib/wal-e-provision/data_bags".to_string()
}

fn default_secret_key_file() -> String {
    "/etc/wal-e-provision/data_bag_key.txt".to_string()
}

/// Installation that must already exist before convergence (checked by `doctor`)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    /// Virtualenv WAL-E is installed into
    #[serde(default = "default_virtualenv")]
    pub virtualenv: String,

    /// Expected WAL-E version
    #[serde(default = "default_version")]
    pub version: String,

    /// Binaries WAL-E shells out to
    #[serde(default = "default_binaries")]
    pub binaries: Vec<String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            virtualenv: default_virtualenv(),
            version: default_version(),
            binaries: default_binaries(),
        }
    }
}

fn default_virtualenv() -> String {
    "/opt/wal-e/".to_string()
}

fn default_version() -> String {
    "0.7.1".to_string()
}

fn default_binaries() -> Vec<String> {
    vec!["lzop".to_string(), "pv".to_string()]
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    /// Logical name of this host, used in the S3 prefix
    pub node_name: String,

    /// Configuration root
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Deprecated boto config, written only when `s3.default_host` is set
    #[serde(default = "default_legacy_config_path")]
    pub legacy_config_path: String,

    /// Owner of every materialized artifact
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Group WAL-E runs as
    #[serde(default = "default_group")]
    pub group: String,

    /// GPG key WAL-E encrypts backups with
    #[serde(default)]
    pub gpg_key_id: Option<String>,

    /// Additional variables written to the env directory
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,

    /// Lock file serializing concurrent runs
    #[serde(default = "default_lock_path")]
    pub lock_path: String,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub data_bags: DataBagsConfig,

    #[serde(default)]
    pub install: InstallConfig,
}

fn default_config_dir() -> String {
    "/etc/wal-e.d".to_string()
}

fn default_legacy_config_path() -> String {
    "/etc/boto.cfg".to_string()
}

fn default_owner() -> String {
    "root".to_string()
}

fn default_group() -> String {
    "postgres".to_string()
}

fn default_lock_path() -> String {
    "/run/lock/wal-e-provision.lock".to_string()
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            anyhow::bail!("node_name cannot be empty");
        }

        let bag = &self.s3.data_bag;
        if bag.is_empty() || bag.contains('/') || bag.contains('\\') || bag.contains("..") {
            anyhow::bail!("s3.data_bag must be a plain directory name, got '{}'", bag);
        }

        if self.s3.data_bag_item.is_empty() {
            anyhow::bail!("s3.data_bag_item cannot be empty");
        }

        if self.owner.is_empty() || self.group.is_empty() {
            anyhow::bail!("owner and group cannot be empty");
        }

        let config_dir = self.config_dir_path()?;
        if !config_dir.is_absolute() {
            anyhow::bail!("config_dir must be an absolute path, got '{}'", self.config_dir);
        }

        let legacy_config = self.legacy_config_path()?;
        if !legacy_config.is_absolute() {
            anyhow::bail!(
                "legacy_config_path must be an absolute path, got '{}'",
                self.legacy_config_path
            );
        }

        Ok(())
    }

    pub fn config_dir_path(&self) -> Result<PathBuf> {
        expand_path(&self.config_dir)
    }

    pub fn legacy_config_path(&self) -> Result<PathBuf> {
        expand_path(&self.legacy_config_path)
    }

    pub fn data_bag_path(&self) -> Result<PathBuf> {
        expand_path(&self.data_bags.path)
    }

    pub fn secret_key_file(&self) -> Result<PathBuf> {
        expand_path(&self.data_bags.secret_key_file)
    }

    pub fn lock_path(&self) -> Result<PathBuf> {
        expand_path(&self.lock_path)
    }

    /// Path of the WAL-E executable inside the virtualenv
    pub fn wale_binary(&self) -> Result<PathBuf> {
        Ok(expand_path(&self.install.virtualenv)?.join("bin").join("wal-e"))
    }

    pub fn selector(&self) -> ConfigSelector {
        ConfigSelector {
            use_encrypted_source: self.s3.use_encrypted_data_bag,
            source_identifier: self.s3.data_bag_item.clone(),
        }
    }

    pub fn declared_settings(&self) -> DeclaredSettings {
        DeclaredSettings {
            node_identifier: self.node_name.clone(),
            signing_key_id: self.gpg_key_id.clone(),
            s3_default_host: Some(self.s3.default_host.clone()),
            extra_env: self.extra_env.clone(),
        }
    }

    pub fn layout(&self) -> Result<Layout> {
        Ok(Layout {
            config_dir: self.config_dir_path()?,
            legacy_config_path: self.legacy_config_path()?,
            ownership: Ownership::new(&self.owner, &self.group, SECRETS_MODE),
        })
    }

    /// Build both credential backends from the data bag settings
    pub fn credential_source(&self) -> Result<CredentialSource> {
        let root = self.data_bag_path()?;
        let bag = &self.s3.data_bag;

        Ok(CredentialSource::new(
            DataBagStore::new(&root, bag),
            EncryptedDataBagStore::new(
                &root,
                bag,
                DecryptionContext::key_file(self.secret_key_file()?),
            ),
        ))
    }
}

/// Expand a leading `~` to the home directory
fn expand_path(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir().context("Failed to determine home directory")?;
            Ok(home.join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(raw)),
    }
}
