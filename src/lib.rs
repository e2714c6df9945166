//! wale-provision - Converges WAL-E credentials and settings onto a host.
//!
//! This library resolves AWS credentials from a plain or age-encrypted data
//! bag and materializes them, with derived WAL-E settings, as root-owned
//! files readable only by the backup agent's group.

pub mod config;
pub mod converge;
pub mod credentials;
pub mod lock;
pub mod materializer;
pub mod settings;
