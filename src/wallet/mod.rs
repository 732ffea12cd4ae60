//! Wallet adapter
//!
//! The engine only ever hands transaction bytes to `sign` and reads back the
//! signed bytes; key material never crosses the boundary. The local signer
//! loads a JSON keypair file (with a permissions check) and signs versioned
//! transactions the standard way: serialize the message, sign, slot the
//! signature in.

use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Signing boundary: address + sign, nothing else
pub trait WalletSigner: Send + Sync {
    /// Base58 public address of the treasury wallet
    fn address(&self) -> String;

    /// Sign serialized transaction bytes, returning the signed serialization
    fn sign(&self, tx_bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Keypair-file backed signer for the treasury wallet
pub struct LocalWallet {
    keypair: Keypair,
}

impl LocalWallet {
    /// Load a keypair from a JSON byte-array file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                return Err(Error::InvalidKeypair(format!(
                    "Keypair {} has insecure permissions {:o}. Run 'chmod 600 {}'",
                    path.display(),
                    mode,
                    path.display()
                )));
            }
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidKeypair(format!("Failed to read keypair: {}", e)))?;
        let bytes: Vec<u8> = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidKeypair(format!("Failed to parse keypair JSON: {}", e)))?;
        let keypair = Keypair::from_bytes(&bytes)
            .map_err(|e| Error::InvalidKeypair(format!("Invalid keypair bytes: {}", e)))?;

        info!("Loaded treasury wallet {}", keypair.pubkey());
        Ok(Self { keypair })
    }

    /// Fresh throwaway keypair. Dry-run sessions without a provisioned
    /// keypair file run against one of these.
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::new(),
        }
    }

    #[cfg(test)]
    pub fn ephemeral() -> Self {
        Self::generate()
    }
}

impl WalletSigner for LocalWallet {
    fn address(&self) -> String {
        self.keypair.pubkey().to_string()
    }

    fn sign(&self, tx_bytes: &[u8]) -> Result<Vec<u8>> {
        let mut tx: VersionedTransaction = bincode::deserialize(tx_bytes)
            .map_err(|e| Error::WalletSign(format!("Failed to deserialize transaction: {}", e)))?;

        let message_bytes = tx.message.serialize();
        let signature = self.keypair.sign_message(&message_bytes);

        if tx.signatures.is_empty() {
            tx.signatures.push(signature);
        } else {
            tx.signatures[0] = signature;
        }
        debug!("Signed transaction ({} bytes)", tx_bytes.len());

        bincode::serialize(&tx)
            .map_err(|e| Error::WalletSign(format!("Failed to serialize transaction: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::message::{v0, VersionedMessage};
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::system_instruction;

    #[test]
    fn test_address_is_base58_pubkey() {
        let wallet = LocalWallet::ephemeral();
        let address = wallet.address();
        assert!(bs58::decode(&address).into_vec().unwrap().len() == 32);
    }

    #[test]
    fn test_sign_versioned_transaction() {
        let wallet = LocalWallet::ephemeral();
        let payer = wallet.keypair.pubkey();

        let instruction = system_instruction::transfer(&payer, &Pubkey::new_unique(), 1);
        let message =
            v0::Message::try_compile(&payer, &[instruction], &[], Hash::default()).unwrap();
        let tx = VersionedTransaction {
            signatures: vec![Default::default()],
            message: VersionedMessage::V0(message),
        };
        let bytes = bincode::serialize(&tx).unwrap();

        let signed_bytes = wallet.sign(&bytes).unwrap();
        let signed: VersionedTransaction = bincode::deserialize(&signed_bytes).unwrap();
        assert_ne!(signed.signatures[0], Default::default());

        // Signature verifies against the message
        let message_bytes = signed.message.serialize();
        assert!(signed.signatures[0].verify(payer.as_ref(), &message_bytes));
    }

    #[test]
    fn test_sign_rejects_garbage() {
        let wallet = LocalWallet::ephemeral();
        assert!(matches!(
            wallet.sign(&[0xde, 0xad, 0xbe, 0xef]),
            Err(Error::WalletSign(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_insecure_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        let keypair = Keypair::new();
        std::fs::write(
            &path,
            serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap(),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(matches!(
            LocalWallet::load(&path),
            Err(Error::InvalidKeypair(_))
        ));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        let loaded = LocalWallet::load(&path).unwrap();
        assert_eq!(loaded.address(), keypair.pubkey().to_string());
    }
}
