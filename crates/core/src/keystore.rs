use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    primitives::Address,
    signers::{local::PrivateKeySigner, SignerSync},
};
use tracing::warn;

use crate::error::KeystoreError;

/// Handle to a key pair held by a [`KeyStore`]. Key material never leaves
/// the store; holders sign through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Account {
    pub address: Address,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.address.fmt(f)
    }
}

/// Wallet backing the run. Accounts must be unlocked before they can sign.
pub trait KeyStore: Send + Sync {
    /// All accounts known to the store at open, in enumeration order.
    fn accounts(&self) -> Vec<Address>;

    /// Creates and persists a new account protected by `passphrase`. The
    /// new account starts unlocked.
    fn create(&self, passphrase: &str) -> Result<Address, KeystoreError>;

    /// Decrypts the account's key so it can sign.
    fn unlock(&self, addr: Address, passphrase: &str) -> Result<(), KeystoreError>;

    /// Signs `tx` with the account's key. The chain id must already be set
    /// on the transaction for replay protection.
    fn sign_tx(&self, addr: Address, tx: TxLegacy) -> Result<TxEnvelope, KeystoreError>;
}

/// Directory of encrypted keystore-v3 files. Unlocked signers are cached in
/// memory for the life of the process.
pub struct DiskKeystore {
    dir: PathBuf,
    order: Vec<Address>,
    files: RwLock<HashMap<Address, PathBuf>>,
    unlocked: RwLock<HashMap<Address, PrivateKeySigner>>,
}

impl DiskKeystore {
    /// Opens `dir`, creating it if missing, and indexes the keystore files
    /// found there. Unreadable files are skipped with a warning.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, KeystoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut entries = fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut order = Vec::new();
        let mut files = HashMap::new();
        for entry in entries {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match read_keystore_address(&path) {
                Ok(addr) => {
                    if files.insert(addr, path).is_none() {
                        order.push(addr);
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable keystore file");
                }
            }
        }

        Ok(Self {
            dir,
            order,
            files: RwLock::new(files),
            unlocked: RwLock::new(HashMap::new()),
        })
    }
}

impl KeyStore for DiskKeystore {
    fn accounts(&self) -> Vec<Address> {
        self.order.clone()
    }

    fn create(&self, passphrase: &str) -> Result<Address, KeystoreError> {
        let (signer, uuid) = PrivateKeySigner::new_keystore(
            &self.dir,
            &mut rand::thread_rng(),
            passphrase,
            None,
        )?;
        let addr = signer.address();
        self.files.write().unwrap().insert(addr, self.dir.join(uuid));
        self.unlocked.write().unwrap().insert(addr, signer);
        Ok(addr)
    }

    fn unlock(&self, addr: Address, passphrase: &str) -> Result<(), KeystoreError> {
        if self.unlocked.read().unwrap().contains_key(&addr) {
            return Ok(());
        }
        let path = self
            .files
            .read()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or(KeystoreError::UnknownAccount(addr))?;
        let signer = PrivateKeySigner::decrypt_keystore(path, passphrase)?;
        self.unlocked.write().unwrap().insert(addr, signer);
        Ok(())
    }

    fn sign_tx(&self, addr: Address, tx: TxLegacy) -> Result<TxEnvelope, KeystoreError> {
        let unlocked = self.unlocked.read().unwrap();
        let signer = match unlocked.get(&addr) {
            Some(signer) => signer,
            None if self.files.read().unwrap().contains_key(&addr) => {
                return Err(KeystoreError::Locked(addr));
            }
            None => return Err(KeystoreError::UnknownAccount(addr)),
        };
        let sig = signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|err| KeystoreError::Sign(err.to_string()))?;
        Ok(TxEnvelope::Legacy(tx.into_signed(sig)))
    }
}

fn read_keystore_address(path: &Path) -> Result<Address, KeystoreError> {
    let raw = fs::read_to_string(path)?;
    let json: serde_json::Value =
        serde_json::from_str(&raw).map_err(|_| KeystoreError::Malformed(path.to_path_buf()))?;
    json.get("address")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Address>().ok())
        .ok_or_else(|| KeystoreError::Malformed(path.to_path_buf()))
}
