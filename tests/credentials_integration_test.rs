//! Integration tests for credential resolution.
//!
//! These tests write data bag items and age key files to a temporary
//! directory and resolve them through the public API.

mod common;

use age::secrecy::ExposeSecret;
use common::{TestContext, DATA_BAG};
use std::fs;
use wale_provision::credentials::{
    ConfigSelector, CredentialError, CredentialSource, DataBagStore, DecryptionContext,
    EncryptedDataBagStore,
};

#[cfg(test)]
mod integration_tests {
    use super::*;

    fn source_with_key_file(ctx: &TestContext, key_file: &str) -> CredentialSource {
        CredentialSource::new(
            DataBagStore::new(ctx.data_bags(), DATA_BAG),
            EncryptedDataBagStore::new(
                ctx.data_bags(),
                DATA_BAG,
                DecryptionContext::key_file(ctx.path(key_file)),
            ),
        )
    }

    fn write_key_file(ctx: &TestContext, name: &str, identity: &age::x25519::Identity) {
        let content = format!(
            "# created: 2024-01-01T00:00:00Z\n# public key: {}\n{}\n",
            identity.to_public(),
            identity.to_string().expose_secret()
        );
        fs::write(ctx.path(name), content).unwrap();
    }

    fn encrypted(identifier: &str) -> ConfigSelector {
        ConfigSelector {
            use_encrypted_source: true,
            source_identifier: identifier.to_string(),
        }
    }

    #[test]
    fn test_resolve_with_key_file() {
        let ctx = TestContext::new().unwrap();
        let identity = age::x25519::Identity::generate();
        write_key_file(&ctx, "keys.txt", &identity);
        ctx.write_encrypted_item(
            "wal_e_encrypted",
            &identity.to_public(),
            "secret_access_key_from_encrypted",
            "secret_from_encrypted",
            "eve_from_encrypted",
        )
        .unwrap();

        let record = source_with_key_file(&ctx, "keys.txt")
            .resolve(&encrypted("wal_e_encrypted"))
            .unwrap();

        assert_eq!(record.access_key_id, "secret_access_key_from_encrypted");
        assert_eq!(record.secret_access_key, "secret_from_encrypted");
        assert_eq!(record.bucket, "eve_from_encrypted");
    }

    #[test]
    fn test_key_file_with_several_identities() {
        let ctx = TestContext::new().unwrap();
        let unrelated = age::x25519::Identity::generate();
        let identity = age::x25519::Identity::generate();
        let content = format!(
            "{}\n{}\n",
            unrelated.to_string().expose_secret(),
            identity.to_string().expose_secret()
        );
        fs::write(ctx.path("keys.txt"), content).unwrap();
        ctx.write_encrypted_item("wal_e", &identity.to_public(), "AKIA", "secret", "eve")
            .unwrap();

        let record = source_with_key_file(&ctx, "keys.txt")
            .resolve(&encrypted("wal_e"))
            .unwrap();

        assert_eq!(record.bucket, "eve");
    }

    #[test]
    fn test_resolve_with_wrong_key_file() {
        let ctx = TestContext::new().unwrap();
        let identity = age::x25519::Identity::generate();
        write_key_file(&ctx, "keys.txt", &age::x25519::Identity::generate());
        ctx.write_encrypted_item("wal_e", &identity.to_public(), "AKIA", "secret", "eve")
            .unwrap();

        let err = source_with_key_file(&ctx, "keys.txt")
            .resolve(&encrypted("wal_e"))
            .unwrap_err();

        assert!(matches!(
            err,
            CredentialError::Decryption { ref identifier, .. } if identifier == "wal_e"
        ));
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn test_plain_and_encrypted_items_are_separate() {
        let ctx = TestContext::new().unwrap();
        ctx.write_item("wal_e", "AKIA", "secret", "eve").unwrap();
        let source = source_with_key_file(&ctx, "keys.txt");

        let plain = source
            .resolve(&ConfigSelector {
                use_encrypted_source: false,
                source_identifier: "wal_e".to_string(),
            })
            .unwrap();
        assert_eq!(plain.bucket, "eve");

        assert!(matches!(
            source.resolve(&encrypted("wal_e")).unwrap_err(),
            CredentialError::NotFound { .. }
        ));
    }

    #[test]
    fn test_yaml_item() {
        let ctx = TestContext::new().unwrap();
        let dir = ctx.data_bags().join(DATA_BAG);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("wal_e.yml"),
            "id: wal_e\naccess_key_id: AKIA\nsecret_access_key: secret\nbucket: eve-yaml\n",
        )
        .unwrap();

        let record = source_with_key_file(&ctx, "keys.txt")
            .resolve(&ConfigSelector {
                use_encrypted_source: false,
                source_identifier: "wal_e".to_string(),
            })
            .unwrap();

        assert_eq!(record.bucket, "eve-yaml");
    }
}
