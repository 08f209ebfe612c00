//! RSA private-key loading and SSH signer derivation (component A).
//!
//! Parses a PEM-encoded PKCS#1 RSA private key, the format the control
//! plane's key-provisioning source hands out, and wraps it as the
//! `russh_keys` keypair every race-task SSH dial in [`crate::selector`]
//! authenticates with.

use std::sync::Arc;

use log::info;
use rsa::pkcs1::DecodeRsaPrivateKey;
use russh_keys::ssh_key::private::{KeypairData, PrivateKey as SshKeyPair, RsaKeypair};
use russh_keys::HashAlg;

use crate::error::GatewayError;

/// The loaded RSA keypair, immutable and shared read-only for the lifetime
/// of the process once constructed.
pub struct Signer {
    key: Arc<SshKeyPair>,
}

impl Signer {
    /// Parse PEM bytes containing a PKCS#1 ("BEGIN RSA PRIVATE KEY") private
    /// key and derive the matching SSH keypair.
    ///
    /// Never logs the raw key bytes; only the SHA-256 fingerprint of the
    /// derived public key, for operator diagnostics.
    pub fn from_pkcs1_pem(pem: &str) -> Result<Self, GatewayError> {
        let rsa_key = rsa::RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| GatewayError::BadKey(format!("PEM/PKCS#1 decode failed: {e}")))?;

        let rsa_keypair = RsaKeypair::try_from(rsa_key)
            .map_err(|e| GatewayError::BadKey(format!("could not derive SSH keypair: {e}")))?;

        let key = SshKeyPair::new(KeypairData::Rsa(rsa_keypair), "")
            .map_err(|e| GatewayError::BadKey(format!("could not marshal public key: {e}")))?;

        info!(
            "loaded RSA signer, fingerprint {}",
            key.public_key().fingerprint(HashAlg::Sha256)
        );

        Ok(Self { key: Arc::new(key) })
    }

    /// Render the public half in one-line authorized-keys form, for operator
    /// diagnostics only.
    pub fn authorized_keys_line(&self) -> String {
        self.key
            .public_key()
            .to_openssh()
            .unwrap_or_else(|_| "<unprintable public key>".to_string())
    }

    /// The shared keypair, cloned cheaply for each race-task's authentication.
    pub fn keypair(&self) -> Arc<SshKeyPair> {
        self.key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A throwaway 2048-bit RSA key generated solely for this test; never used
    // for anything but asserting that PKCS#1 PEM decoding round-trips.
    const TEST_KEY_PEM: &str = include_str!("../tests/fixtures/test_rsa_key.pem");

    #[test]
    fn loads_pkcs1_pem_and_derives_fingerprint() {
        let signer = Signer::from_pkcs1_pem(TEST_KEY_PEM).expect("key should parse");
        assert!(signer.authorized_keys_line().starts_with("ssh-rsa "));
    }

    #[test]
    fn rejects_garbage_pem() {
        let err = Signer::from_pkcs1_pem("not a key").unwrap_err();
        assert!(matches!(err, GatewayError::BadKey(_)));
    }
}
