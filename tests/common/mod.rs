//! Common testing utilities for wale-provision integration tests.

use nix::unistd::{getgid, getuid, Group, User};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Data bag used by every test.
pub const DATA_BAG: &str = "aws_credentials";

/// Test context that manages temporary files and directories.
pub struct TestContext {
    /// Path to temporary directory
    pub temp_path: PathBuf,
    /// The temporary directory (kept to prevent early deletion)
    _temp_dir: TempDir,
}

impl TestContext {
    /// Create a new test context with a temporary directory.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let temp_path = temp_dir.path().to_path_buf();

        Ok(Self {
            temp_path,
            _temp_dir: temp_dir,
        })
    }

    /// Get the path to a file in the temp directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_path.join(name)
    }

    /// Root of the data bag tree.
    pub fn data_bags(&self) -> PathBuf {
        self.path("data_bags")
    }

    /// Configuration root the tests converge into.
    #[allow(dead_code)]
    pub fn config_dir(&self) -> PathBuf {
        self.path("wal-e.d")
    }

    /// Legacy boto config path.
    #[allow(dead_code)]
    pub fn legacy_config(&self) -> PathBuf {
        self.path("boto.cfg")
    }

    /// Write a plain data bag item.
    pub fn write_item(
        &self,
        item: &str,
        access_key_id: &str,
        secret: &str,
        bucket: &str,
    ) -> anyhow::Result<PathBuf> {
        let dir = self.data_bags().join(DATA_BAG);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", item));
        fs::write(&path, item_json(item, access_key_id, secret, bucket))?;
        Ok(path)
    }

    /// Write an age-encrypted data bag item.
    #[allow(dead_code)]
    pub fn write_encrypted_item(
        &self,
        item: &str,
        recipient: &age::x25519::Recipient,
        access_key_id: &str,
        secret: &str,
        bucket: &str,
    ) -> anyhow::Result<PathBuf> {
        let dir = self.data_bags().join(DATA_BAG);
        fs::create_dir_all(&dir)?;

        let plaintext = item_json(item, access_key_id, secret, bucket);
        let encryptor =
            age::Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))?;
        let mut ciphertext = Vec::new();
        let mut writer = encryptor.wrap_output(&mut ciphertext)?;
        writer.write_all(plaintext.as_bytes())?;
        writer.finish()?;

        let path = dir.join(format!("{}.json.age", item));
        fs::write(&path, ciphertext)?;
        Ok(path)
    }

    /// Write a `wal-e.yaml` pointing every path into the temp directory.
    ///
    /// `extra` is appended verbatim and may hold an `s3:` block.
    #[allow(dead_code)]
    pub fn write_config(&self, extra: &str) -> anyhow::Result<PathBuf> {
        let (owner, group) = current_principal();
        let content = format!(
            "node_name: fauxhai.local\n\
             config_dir: {}\n\
             legacy_config_path: {}\n\
             owner: {}\n\
             group: {}\n\
             lock_path: {}\n\
             data_bags:\n  path: {}\n  secret_key_file: {}\n\
             {}",
            self.config_dir().display(),
            self.legacy_config().display(),
            owner,
            group,
            self.path("run/wal-e-provision.lock").display(),
            self.data_bags().display(),
            self.path("data_bag_key.txt").display(),
            extra,
        );

        let path = self.path("wal-e.yaml");
        fs::write(&path, content)?;
        Ok(path)
    }
}

fn item_json(item: &str, access_key_id: &str, secret: &str, bucket: &str) -> String {
    serde_json::json!({
        "id": item,
        "access_key_id": access_key_id,
        "secret_access_key": secret,
        "bucket": bucket,
    })
    .to_string()
}

/// User and primary group names of the test process.
pub fn current_principal() -> (String, String) {
    let user = User::from_uid(getuid())
        .expect("user lookup")
        .expect("current user has a passwd entry");
    let group = Group::from_gid(getgid())
        .expect("group lookup")
        .expect("current group has a group entry");
    (user.name, group.name)
}

/// `(mode, uid, gid)` of a path.
#[allow(dead_code)]
pub fn metadata_of(path: &Path) -> (u32, u32, u32) {
    let meta = fs::metadata(path).expect("metadata");
    (meta.permissions().mode() & 0o7777, meta.uid(), meta.gid())
}

/// Every file under `root` with its contents and metadata, sorted by path.
#[allow(dead_code)]
pub fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>, (u32, u32, u32))> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).expect("read_dir") {
            let path = entry.expect("dir entry").path();
            if path.is_dir() {
                entries.push((path.clone(), Vec::new(), metadata_of(&path)));
                pending.push(path);
            } else {
                let contents = fs::read(&path).expect("read");
                entries.push((path.clone(), contents, metadata_of(&path)));
            }
        }
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_item() {
        let ctx = TestContext::new().unwrap();
        let path = ctx.write_item("wal_e", "AKIA", "secret", "eve").unwrap();

        let json: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(json["bucket"], "eve");
        assert_eq!(json["id"], "wal_e");
    }
}
