use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use alloy::{
    consensus::{TxEnvelope, TxLegacy},
    primitives::Address,
};
use rand::Rng;

use crate::error::KeystoreError;
use crate::keystore::{Account, KeyStore};

/// Shared registry of every account the run knows about. An account is held
/// by at most one worker at a time; checked-in accounts wait in per-node
/// pools together with the nonce their next transaction should use.
pub struct AccountStore {
    keystore: Arc<dyn KeyStore>,
    chain_id: u64,
    passphrase: String,
    pools: RwLock<Pools>,
}

#[derive(Default)]
struct Pools {
    // Initial keystore enumeration and the cursor into it.
    ks_accts: Vec<Address>,
    next_idx: usize,
    // Addresses already surfaced from the enumeration.
    seen: HashSet<Address>,
    // Every address the run knows about, append-only.
    addrs: Vec<Address>,
    // node id -> checked-in accounts.
    pools: HashMap<usize, HashMap<Address, PooledAccount>>,
    // Addresses reserved for seeders, never handed to senders.
    seeds: HashSet<Address>,
}

struct PooledAccount {
    acct: Account,
    nonce: u64,
}

impl AccountStore {
    pub fn new(keystore: Arc<dyn KeyStore>, chain_id: u64, passphrase: impl Into<String>) -> Self {
        let ks_accts = keystore.accounts();
        Self {
            keystore,
            chain_id,
            passphrase: passphrase.into(),
            pools: RwLock::new(Pools {
                ks_accts,
                ..Default::default()
            }),
        }
    }

    /// Up to `n` receiver addresses differing from `send`, taken by a
    /// random rotation over all known addresses. May return fewer than `n`
    /// when the population is small.
    pub fn next_recv(&self, send: Address, n: usize) -> Vec<Address> {
        let pools = self.pools.read().unwrap();
        if pools.addrs.is_empty() {
            return Vec::new();
        }
        let start = rand::thread_rng().gen_range(0..pools.addrs.len());
        let mut addrs = Vec::new();
        for i in 0..pools.addrs.len() {
            if addrs.len() >= n {
                break;
            }
            let addr = pools.addrs[(start + i) % pools.addrs.len()];
            if addr != send {
                addrs.push(addr);
            }
        }
        addrs
    }

    /// Checks out an account for `node`: half the time a previously
    /// returned one (with its last known nonce), otherwise the next unseen
    /// keystore account with nonce 0, which signals "unknown, re-query".
    /// `None` means both sources are exhausted; callers fall back to
    /// [`new_account`](Self::new_account).
    pub fn next(&self, node: usize) -> Result<Option<(Account, u64)>, KeystoreError> {
        let mut pools = self.pools.write().unwrap();
        if pools.pools.values().any(|p| !p.is_empty()) && rand::thread_rng().gen_bool(0.5) {
            if let Some(pool) = pools.pools.get_mut(&node) {
                if let Some(addr) = pool.keys().next().copied() {
                    let entry = pool.remove(&addr).expect("entry just seen");
                    return Ok(Some((entry.acct, entry.nonce)));
                }
            }
        }
        match pools.next_acct() {
            Some(acct) => {
                self.keystore.unlock(acct.address, &self.passphrase)?;
                Ok(Some((acct, 0)))
            }
            None => Ok(None),
        }
    }

    /// Creates a brand new account. Used when the keystore enumeration is
    /// exhausted.
    pub fn new_account(&self) -> Result<Account, KeystoreError> {
        let addr = self.keystore.create(&self.passphrase)?;
        self.pools.write().unwrap().addrs.push(addr);
        self.keystore.unlock(addr, &self.passphrase)?;
        Ok(Account::new(addr))
    }

    /// Checks `acct` back in at `node` with the nonce its next transaction
    /// should use.
    pub fn return_account(&self, acct: Account, node: usize, nonce: u64) {
        self.pools
            .write()
            .unwrap()
            .pools
            .entry(node)
            .or_default()
            .insert(acct.address, PooledAccount { acct, nonce });
    }

    /// Reserves the next unseen keystore account as a seeder account.
    pub fn next_seed(&self) -> Result<Option<Account>, KeystoreError> {
        let mut pools = self.pools.write().unwrap();
        match pools.next_acct() {
            Some(acct) => {
                pools.seeds.insert(acct.address);
                self.keystore.unlock(acct.address, &self.passphrase)?;
                Ok(Some(acct))
            }
            None => Ok(None),
        }
    }

    /// Registers a freshly created account as a seeder account.
    pub fn reserve_seed(&self, acct: Account) {
        self.pools.write().unwrap().seeds.insert(acct.address);
    }

    /// Any seeder address, or `None` if no seeders are registered.
    pub fn rand_seed(&self) -> Option<Address> {
        self.pools.read().unwrap().seeds.iter().next().copied()
    }

    /// Signs `tx` for `acct`, binding the configured chain id.
    pub fn sign_tx(&self, acct: Account, mut tx: TxLegacy) -> Result<TxEnvelope, KeystoreError> {
        tx.chain_id = Some(self.chain_id);
        self.keystore.sign_tx(acct.address, tx)
    }
}

impl Pools {
    /// Next unseen account from the initial enumeration, or `None` when
    /// exhausted.
    fn next_acct(&mut self) -> Option<Account> {
        while self.next_idx < self.ks_accts.len() {
            let addr = self.ks_accts[self.next_idx];
            self.next_idx += 1;
            if !self.seen.insert(addr) {
                continue;
            }
            self.addrs.push(addr);
            return Some(Account::new(addr));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use alloy::primitives::Address;

    use super::AccountStore;
    use crate::keystore::{Account, KeyStore};
    use crate::testutil::MemoryKeystore;

    fn store_with(n: usize) -> AccountStore {
        AccountStore::new(Arc::new(MemoryKeystore::with_accounts(n)), 1234, "")
    }

    #[test]
    fn enumeration_never_repeats() {
        let store = store_with(3);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            // No pool entries yet, so next() always advances the cursor.
            let (acct, nonce) = store.next(0).unwrap().expect("account available");
            assert_eq!(nonce, 0);
            assert!(seen.insert(acct.address), "address handed out twice");
        }
        assert!(store.next(0).unwrap().is_none(), "enumeration exhausted");
    }

    #[test]
    fn returned_accounts_round_trip_with_nonce() {
        let store = store_with(1);
        let (acct, _) = store.next(0).unwrap().expect("account available");
        store.return_account(acct, 0, 42);

        // The coin flip may pick the exhausted enumeration and come back
        // empty; the pooled entry must eventually resurface, exactly once.
        let mut popped = None;
        for _ in 0..200 {
            if let Some(got) = store.next(0).unwrap() {
                popped = Some(got);
                break;
            }
        }
        let (got, nonce) = popped.expect("pooled account never resurfaced");
        assert_eq!(got.address, acct.address);
        assert_eq!(nonce, 42);

        // Checked out again means gone from the pool.
        for _ in 0..200 {
            assert!(store.next(0).unwrap().is_none());
        }
    }

    #[test]
    fn pools_are_per_node() {
        let store = store_with(1);
        let (acct, _) = store.next(0).unwrap().expect("account available");
        store.return_account(acct, 0, 7);
        // Node 1 never sees node 0's pool.
        for _ in 0..200 {
            assert!(store.next(1).unwrap().is_none());
        }
    }

    #[test]
    fn seeds_are_reserved() {
        let store = store_with(2);
        let seed = store.next_seed().unwrap().expect("seed available");
        assert_eq!(store.rand_seed(), Some(seed.address));

        // The seed address is consumed from the enumeration.
        let (other, _) = store.next(0).unwrap().expect("account available");
        assert_ne!(other.address, seed.address);
        assert!(store.next(0).unwrap().is_none());
    }

    #[test]
    fn new_accounts_grow_addrs() {
        let store = store_with(0);
        assert!(store.next(0).unwrap().is_none());
        let acct = store.new_account().unwrap();
        let recv = store.next_recv(Address::ZERO, 10);
        assert_eq!(recv, vec![acct.address]);
    }

    #[test]
    fn next_recv_excludes_sender() {
        let store = store_with(5);
        // Surface all addresses.
        let mut accts = Vec::new();
        while let Some((acct, _)) = store.next(0).unwrap() {
            accts.push(acct);
        }
        let sender = accts[0].address;
        for _ in 0..50 {
            let recv = store.next_recv(sender, 10);
            assert_eq!(recv.len(), 4);
            assert!(!recv.contains(&sender));
        }
    }

    #[test]
    fn rand_seed_empty_without_seeders() {
        let store = store_with(1);
        assert!(store.rand_seed().is_none());
    }

    #[test]
    fn signing_binds_chain_id() {
        use alloy::consensus::{Transaction, TxLegacy};
        use alloy::primitives::TxKind;

        let store = store_with(1);
        let (acct, _) = store.next(0).unwrap().expect("account available");
        let tx = TxLegacy {
            nonce: 1,
            to: TxKind::Call(Address::repeat_byte(0x11)),
            gas_limit: 21_000,
            gas_price: 100,
            ..Default::default()
        };
        let signed = store.sign_tx(acct, tx).unwrap();
        assert_eq!(signed.chain_id(), Some(1234));
    }

    // Exercised via trait object to match how workers hold the store.
    #[test]
    fn works_behind_dyn_keystore() {
        let ks: Arc<dyn KeyStore> = Arc::new(MemoryKeystore::with_accounts(1));
        let store = AccountStore::new(ks, 1, "");
        let (acct, nonce) = store.next(0).unwrap().expect("account available");
        assert_eq!((Account::new(acct.address), nonce), (acct, 0));
    }
}
