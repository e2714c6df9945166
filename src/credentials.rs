//! Credential resolution from plain or age-encrypted data bags.
//!
//! # Security Guarantees
//!
//! - **Memory-only decryption**: Encrypted items are decrypted straight into memory
//! - **No value logging**: Spans and errors carry identifiers, never secret values
//! - **All-or-nothing**: An item missing any field is rejected as a whole
//!
//! # Layout
//!
//! Items live under `<data_bag_path>/<bag>/`:
//!
//! - Plain: `<identifier>.json`, `<identifier>.yaml` or `<identifier>.yml`
//! - Encrypted: the same names with an `.age` suffix, encrypted to an X25519 recipient
//!
//! # Example
//!
//! ```no_run
//! use wale_provision::credentials::{
//!     ConfigSelector, CredentialSource, DataBagStore, DecryptionContext, EncryptedDataBagStore,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let source = CredentialSource::new(
//!     DataBagStore::new("/var/lib/wal-e-provision/data_bags", "aws_credentials"),
//!     EncryptedDataBagStore::new(
//!         "/var/lib/wal-e-provision/data_bags",
//!         "aws_credentials",
//!         DecryptionContext::key_file("/etc/wal-e-provision/data_bag_key.txt"),
//!     ),
//! );
//!
//! let record = source.resolve(&ConfigSelector {
//!     use_encrypted_source: false,
//!     source_identifier: "wal_e".to_string(),
//! })?;
//! println!("bucket: {}", record.bucket);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, instrument};

/// Extensions probed, in order, when looking an item up.
const ITEM_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// Suffix appended to item files in the encrypted store.
const ENCRYPTED_SUFFIX: &str = "age";

/// Errors produced while resolving credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The identifier is absent from the selected store.
    #[error("credential item '{identifier}' not found in data bag '{bag}'")]
    NotFound { bag: String, identifier: String },

    /// The encrypted item could not be decrypted.
    #[error("failed to decrypt credential item '{identifier}': {reason}")]
    Decryption { identifier: String, reason: String },

    /// The item was read but does not hold a complete credential record.
    #[error("credential item '{identifier}' is malformed: {reason}")]
    Malformed { identifier: String, reason: String },

    /// The identifier cannot name an item file.
    #[error("invalid credential identifier: '{identifier}'")]
    InvalidIdentifier { identifier: String },

    /// Reading the item file failed.
    #[error("failed to read credential item '{identifier}'")]
    Io {
        identifier: String,
        #[source]
        source: std::io::Error,
    },
}

/// AWS credentials for the backup bucket.
///
/// `Debug` redacts both keys so a record can never leak through logging.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("access_key_id", &"[REDACTED]")
            .field("secret_access_key", &"[REDACTED]")
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Which backend and which named item to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSelector {
    pub use_encrypted_source: bool,
    pub source_identifier: String,
}

/// Shared contract for credential backends.
pub trait CredentialStore {
    /// Short backend name used in spans.
    fn backend(&self) -> &'static str;

    /// Look up an item by identifier.
    fn lookup(&self, identifier: &str) -> Result<CredentialRecord, CredentialError>;
}

/// Plain data bag store: items are unencrypted JSON or YAML files.
#[derive(Debug, Clone)]
pub struct DataBagStore {
    bag_dir: PathBuf,
    bag: String,
}

impl DataBagStore {
    pub fn new(root: impl AsRef<Path>, bag: &str) -> Self {
        Self {
            bag_dir: root.as_ref().join(bag),
            bag: bag.to_string(),
        }
    }
}

impl CredentialStore for DataBagStore {
    fn backend(&self) -> &'static str {
        "data_bag"
    }

    fn lookup(&self, identifier: &str) -> Result<CredentialRecord, CredentialError> {
        validate_identifier(identifier)?;

        let (path, extension) = find_item(&self.bag_dir, identifier, None).ok_or_else(|| {
            CredentialError::NotFound {
                bag: self.bag.clone(),
                identifier: identifier.to_string(),
            }
        })?;

        let bytes = fs::read(&path).map_err(|source| CredentialError::Io {
            identifier: identifier.to_string(),
            source,
        })?;

        parse_item(identifier, extension, &bytes)
    }
}

/// Decryption keys for the encrypted store, owned by the execution environment.
pub enum DecryptionContext {
    /// An age key file, read at decryption time.
    KeyFile(PathBuf),
    /// Identities already held in memory.
    Identities(Vec<age::x25519::Identity>),
}

impl DecryptionContext {
    pub fn key_file(path: impl Into<PathBuf>) -> Self {
        Self::KeyFile(path.into())
    }

    pub fn identities(identities: Vec<age::x25519::Identity>) -> Self {
        Self::Identities(identities)
    }

    fn decrypt(&self, identifier: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let result = match self {
            Self::KeyFile(path) => {
                read_identities(path).and_then(|ids| decrypt_with(&ids, ciphertext))
            }
            Self::Identities(ids) => decrypt_with(ids, ciphertext),
        };

        result.map_err(|reason| CredentialError::Decryption {
            identifier: identifier.to_string(),
            reason,
        })
    }
}

impl fmt::Debug for DecryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Identities(ids) => write!(f, "Identities({} key(s))", ids.len()),
        }
    }
}

/// Encrypted data bag store: items are age-encrypted JSON or YAML files.
#[derive(Debug)]
pub struct EncryptedDataBagStore {
    bag_dir: PathBuf,
    bag: String,
    context: DecryptionContext,
}

impl EncryptedDataBagStore {
    pub fn new(root: impl AsRef<Path>, bag: &str, context: DecryptionContext) -> Self {
        Self {
            bag_dir: root.as_ref().join(bag),
            bag: bag.to_string(),
            context,
        }
    }
}

impl CredentialStore for EncryptedDataBagStore {
    fn backend(&self) -> &'static str {
        "encrypted_data_bag"
    }

    fn lookup(&self, identifier: &str) -> Result<CredentialRecord, CredentialError> {
        validate_identifier(identifier)?;

        let (path, extension) = find_item(&self.bag_dir, identifier, Some(ENCRYPTED_SUFFIX))
            .ok_or_else(|| CredentialError::NotFound {
                bag: self.bag.clone(),
                identifier: identifier.to_string(),
            })?;

        let ciphertext = fs::read(&path).map_err(|source| CredentialError::Io {
            identifier: identifier.to_string(),
            source,
        })?;

        let plaintext = self.context.decrypt(identifier, &ciphertext)?;
        parse_item(identifier, extension, &plaintext)
    }
}

/// Resolves a [`CredentialRecord`] from whichever backend the selector names.
///
/// This is the only place the `use_encrypted_source` flag is inspected.
pub struct CredentialSource {
    plain: Box<dyn CredentialStore>,
    encrypted: Box<dyn CredentialStore>,
}

impl CredentialSource {
    pub fn new(
        plain: impl CredentialStore + 'static,
        encrypted: impl CredentialStore + 'static,
    ) -> Self {
        Self {
            plain: Box::new(plain),
            encrypted: Box::new(encrypted),
        }
    }

    /// Resolve the record named by `selector`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The identifier is absent from the selected store
    /// - The encrypted item cannot be decrypted
    /// - The item lacks one of `access_key_id`, `secret_access_key`, `bucket`
    #[instrument(
        skip_all,
        fields(identifier = %selector.source_identifier, backend = tracing::field::Empty)
    )]
    pub fn resolve(&self, selector: &ConfigSelector) -> Result<CredentialRecord, CredentialError> {
        let store = if selector.use_encrypted_source {
            &self.encrypted
        } else {
            &self.plain
        };
        tracing::Span::current().record("backend", store.backend());

        let record = store.lookup(&selector.source_identifier)?;
        debug!("credentials resolved");
        Ok(record)
    }
}

fn validate_identifier(identifier: &str) -> Result<(), CredentialError> {
    let invalid = identifier.is_empty()
        || identifier.contains('/')
        || identifier.contains('\\')
        || identifier.contains("..");

    if invalid {
        return Err(CredentialError::InvalidIdentifier {
            identifier: identifier.to_string(),
        });
    }
    Ok(())
}

/// Locate the item file, returning its path and its data format extension.
fn find_item(
    bag_dir: &Path,
    identifier: &str,
    suffix: Option<&str>,
) -> Option<(PathBuf, &'static str)> {
    ITEM_EXTENSIONS.iter().find_map(|ext| {
        let name = match suffix {
            Some(suffix) => format!("{identifier}.{ext}.{suffix}"),
            None => format!("{identifier}.{ext}"),
        };
        let path = bag_dir.join(name);
        path.is_file().then_some((path, *ext))
    })
}

fn parse_item(
    identifier: &str,
    extension: &str,
    bytes: &[u8],
) -> Result<CredentialRecord, CredentialError> {
    let malformed = |reason: String| CredentialError::Malformed {
        identifier: identifier.to_string(),
        reason,
    };

    // Parser messages quote the offending scalar, so only positions are reported
    let value: serde_json::Value = match extension {
        "json" => serde_json::from_slice(bytes).map_err(|e| {
            malformed(format!(
                "not valid JSON (line {}, column {})",
                e.line(),
                e.column()
            ))
        })?,
        _ => serde_yaml::from_slice(bytes).map_err(|e| {
            malformed(match e.location() {
                Some(at) => format!(
                    "not valid YAML (line {}, column {})",
                    at.line(),
                    at.column()
                ),
                None => "not valid YAML".to_string(),
            })
        })?,
    };

    let Some(fields) = value.as_object() else {
        return Err(malformed("expected a mapping of credential fields".to_string()));
    };
    let field = |name: &str| match fields.get(name) {
        Some(serde_json::Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(malformed(format!("field '{}' must be a string", name))),
        None => Err(malformed(format!("missing field '{}'", name))),
    };

    Ok(CredentialRecord {
        access_key_id: field("access_key_id")?,
        secret_access_key: field("secret_access_key")?,
        bucket: field("bucket")?,
    })
}

/// Read X25519 identities from an age key file.
///
/// Key file format:
/// ```text
/// # public key: age1ql3z7j3...
/// AGE-SECRET-KEY-1YPV883...
/// ```
fn read_identities(path: &Path) -> Result<Vec<age::x25519::Identity>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("cannot read key file {}: {}", path.display(), e))?;

    let identities = content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("AGE-SECRET-KEY-1"))
        .map(|line| age::x25519::Identity::from_str(line).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    if identities.is_empty() {
        return Err(format!(
            "no identities found in key file {}. Expected 'AGE-SECRET-KEY-1...'",
            path.display()
        ));
    }

    Ok(identities)
}

fn decrypt_with(
    identities: &[age::x25519::Identity],
    ciphertext: &[u8],
) -> Result<Vec<u8>, String> {
    let decryptor = age::Decryptor::new(ciphertext).map_err(|e| e.to_string())?;

    let mut reader = decryptor
        .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
        .map_err(|e| e.to_string())?;

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| e.to_string())?;

    Ok(plaintext)
}
