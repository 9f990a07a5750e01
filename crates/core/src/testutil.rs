//! Mock chain client and in-memory keystore for worker tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    primitives::{Address, U256},
    signers::{local::PrivateKeySigner, SignerSync},
};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::account::AccountStore;
use crate::error::{ClientError, KeystoreError};
use crate::keystore::KeyStore;
use crate::metrics::Metrics;
use crate::node::{Node, SeedRequest};
use crate::provider::ChainClient;

/// Scriptable [`ChainClient`]. Sends succeed unless an error has been
/// queued; every accepted envelope is recorded. The block number
/// auto-increments so block waits make progress under paused time.
#[derive(Default)]
pub(crate) struct MockClient {
    chain_id: AtomicU64,
    gas_price: Mutex<u128>,
    default_balance: Mutex<U256>,
    balances: Mutex<HashMap<Address, U256>>,
    nonces: Mutex<HashMap<Address, u64>>,
    block: AtomicU64,
    send_errors: Mutex<VecDeque<ClientError>>,
    sent: Mutex<Vec<TxEnvelope>>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        let client = Self::default();
        client.chain_id.store(1234, Ordering::SeqCst);
        *client.gas_price.lock().unwrap() = 100;
        Arc::new(client)
    }

    pub fn set_gas_price(&self, price: u128) {
        *self.gas_price.lock().unwrap() = price;
    }

    pub fn set_balance(&self, addr: Address, balance: U256) {
        self.balances.lock().unwrap().insert(addr, balance);
    }

    /// Balance reported for addresses without an explicit entry.
    pub fn set_default_balance(&self, balance: U256) {
        *self.default_balance.lock().unwrap() = balance;
    }

    pub fn set_nonce(&self, addr: Address, nonce: u64) {
        self.nonces.lock().unwrap().insert(addr, nonce);
    }

    /// Queues an error for the next submission; later sends succeed again.
    pub fn push_send_error(&self, msg: &str) {
        self.send_errors
            .lock()
            .unwrap()
            .push_back(ClientError::new(msg));
    }

    pub fn sent(&self) -> Vec<TxEnvelope> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for MockClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn suggest_gas_price(&self) -> Result<u128, ClientError> {
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn pending_balance_at(&self, addr: Address) -> Result<U256, ClientError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&addr)
            .copied()
            .unwrap_or(*self.default_balance.lock().unwrap()))
    }

    async fn pending_nonce_at(&self, addr: Address) -> Result<u64, ClientError> {
        Ok(self.nonces.lock().unwrap().get(&addr).copied().unwrap_or(0))
    }

    async fn latest_block_number(&self) -> Result<u64, ClientError> {
        Ok(self.block.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<(), ClientError> {
        if let Some(err) = self.send_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(tx.clone());
        Ok(())
    }
}

/// In-memory [`KeyStore`]. Passphrases are accepted as-is; unlocking only
/// flips a flag, like a keystore with cached decryption.
#[derive(Default)]
pub(crate) struct MemoryKeystore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    order: Vec<Address>,
    signers: HashMap<Address, PrivateKeySigner>,
    unlocked: HashSet<Address>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(n: usize) -> Self {
        let ks = Self::new();
        {
            let mut inner = ks.inner.lock().unwrap();
            for _ in 0..n {
                let signer = PrivateKeySigner::random();
                let addr = signer.address();
                inner.order.push(addr);
                inner.signers.insert(addr, signer);
            }
        }
        ks
    }
}

impl KeyStore for MemoryKeystore {
    fn accounts(&self) -> Vec<Address> {
        self.inner.lock().unwrap().order.clone()
    }

    fn create(&self, _passphrase: &str) -> Result<Address, KeystoreError> {
        let signer = PrivateKeySigner::random();
        let addr = signer.address();
        let mut inner = self.inner.lock().unwrap();
        inner.order.push(addr);
        inner.signers.insert(addr, signer);
        inner.unlocked.insert(addr);
        Ok(addr)
    }

    fn unlock(&self, addr: Address, _passphrase: &str) -> Result<(), KeystoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.signers.contains_key(&addr) {
            return Err(KeystoreError::UnknownAccount(addr));
        }
        inner.unlocked.insert(addr);
        Ok(())
    }

    fn sign_tx(&self, addr: Address, tx: TxLegacy) -> Result<TxEnvelope, KeystoreError> {
        let inner = self.inner.lock().unwrap();
        if !inner.signers.contains_key(&addr) {
            return Err(KeystoreError::UnknownAccount(addr));
        }
        if !inner.unlocked.contains(&addr) {
            return Err(KeystoreError::Locked(addr));
        }
        let sig = inner.signers[&addr]
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|err| KeystoreError::Sign(err.to_string()))?;
        Ok(TxEnvelope::Legacy(tx.into_signed(sig)))
    }
}

/// Node 0 over a mock client and an in-memory keystore with `accounts`
/// pre-seeded accounts.
pub(crate) fn test_node(
    accounts: usize,
) -> (Arc<Node>, mpsc::Receiver<SeedRequest>, Arc<MockClient>) {
    let client = MockClient::new();
    let store = Arc::new(AccountStore::new(
        Arc::new(MemoryKeystore::with_accounts(accounts)),
        1234,
        "",
    ));
    let metrics = Arc::new(Metrics::new());
    let (node, seed_rx) = Node::new(0, 10, client.clone(), store, metrics);
    (Arc::new(node), seed_rx, client)
}

pub(crate) fn unwrap_legacy(tx: &TxEnvelope) -> &TxLegacy {
    match tx {
        TxEnvelope::Legacy(signed) => signed.tx(),
        other => panic!("expected legacy tx, got {other:?}"),
    }
}
