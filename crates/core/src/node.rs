use std::sync::Arc;

use alloy::{
    consensus::{TxEnvelope, TxLegacy},
    primitives::{Address, TxKind, U256},
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::account::AccountStore;
use crate::backoff::rand_between;
use crate::error::{ClientError, Error, KeystoreError};
use crate::keystore::Account;
use crate::metrics::{self, Metrics};
use crate::provider::ChainClient;

/// Request from a sender for its account to be topped up. The reply carries
/// the submission result for the funding transaction.
#[derive(Debug)]
pub struct SeedRequest {
    pub addr: Address,
    pub reply: oneshot::Sender<Result<(), ClientError>>,
}

/// One RPC endpoint bound to the shared account store, plus the mailbox
/// senders use to reach the endpoint's seeder.
pub struct Node {
    pub id: usize,
    pub gas: u64,
    pub client: Arc<dyn ChainClient>,
    pub accounts: Arc<AccountStore>,
    pub metrics: Arc<Metrics>,
    seed_tx: mpsc::Sender<SeedRequest>,
}

impl Node {
    /// Builds the node and the receiving end of its seed mailbox. The
    /// mailbox holds a single request so senders rendezvous with the seeder.
    pub fn new(
        id: usize,
        gas: u64,
        client: Arc<dyn ChainClient>,
        accounts: Arc<AccountStore>,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Receiver<SeedRequest>) {
        let (seed_tx, seed_rx) = mpsc::channel(1);
        (
            Self {
                id,
                gas,
                client,
                accounts,
                metrics,
                seed_tx,
            },
            seed_rx,
        )
    }

    pub fn seed_mailbox(&self) -> mpsc::Sender<SeedRequest> {
        self.seed_tx.clone()
    }

    /// Signs `tx` for `acct`, charging the signing timer.
    pub fn sign_tx(&self, acct: Account, tx: TxLegacy) -> Result<TxEnvelope, KeystoreError> {
        let start = Instant::now();
        let signed = self.accounts.sign_tx(acct, tx)?;
        self.metrics.observe(metrics::SIGN_TX, start.elapsed());
        Ok(signed)
    }

    /// Submits `tx`, charging the send timer on success and the error meter
    /// on failure.
    pub async fn send_tx(&self, tx: &TxEnvelope) -> Result<(), ClientError> {
        let start = Instant::now();
        match self.client.send_transaction(tx).await {
            Ok(()) => {
                self.metrics.observe(metrics::SEND_TX, start.elapsed());
                Ok(())
            }
            Err(err) => {
                self.metrics.mark_send_error();
                Err(err)
            }
        }
    }

    /// Drains `acct` into `dest`, leaving just enough for gas. Returns the
    /// amount moved; zero when the balance does not cover the fee.
    pub async fn refund(
        &self,
        acct: Account,
        nonce: u64,
        dest: Address,
    ) -> Result<U256, Error> {
        let start = Instant::now();
        let balance = self.client.pending_balance_at(acct.address).await?;
        self.metrics
            .observe(metrics::PENDING_BALANCE_AT, start.elapsed());

        let start = Instant::now();
        let gas_price = self.client.suggest_gas_price().await?;
        self.metrics
            .observe(metrics::SUGGEST_GAS_PRICE, start.elapsed());

        let gas = rand_between(self.gas, 2 * self.gas);
        let fee = U256::from(gas) * U256::from(gas_price);
        if balance <= fee {
            return Ok(U256::ZERO);
        }
        let amount = balance - fee;

        let tx = TxLegacy {
            nonce,
            to: TxKind::Call(dest),
            value: amount,
            gas_limit: gas,
            gas_price,
            ..Default::default()
        };
        let signed = self.sign_tx(acct, tx)?;
        self.send_tx(&signed).await?;
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use alloy::consensus::Transaction;
    use alloy::primitives::{Address, U256};

    use crate::testutil::{test_node, unwrap_legacy};

    #[tokio::test]
    async fn refund_moves_balance_minus_fee() {
        let (node, _seed_rx, client) = test_node(2);
        let (acct, _) = node.accounts.next(node.id).unwrap().expect("account");
        let dest = Address::repeat_byte(0x55);

        client.set_gas_price(100);
        client.set_balance(acct.address, U256::from(10_000_000u64));

        let moved = node.refund(acct, 3, dest).await.unwrap();
        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        let tx = unwrap_legacy(&sent[0]);
        assert_eq!(tx.nonce(), 3);
        assert_eq!(tx.to(), Some(dest));
        assert_eq!(tx.value(), moved);
        // value + max fee covers the whole balance
        let fee = U256::from(tx.gas_limit()) * U256::from(tx.gas_price().unwrap());
        assert_eq!(moved + fee, U256::from(10_000_000u64));
        assert_eq!(node.metrics.sent_count(), 1);
    }

    #[tokio::test]
    async fn refund_skips_dust_balances() {
        let (node, _seed_rx, client) = test_node(2);
        let (acct, _) = node.accounts.next(node.id).unwrap().expect("account");

        client.set_gas_price(100);
        // Even the lower gas bound costs more than this.
        client.set_balance(acct.address, U256::from(100u64));

        let moved = node
            .refund(acct, 0, Address::repeat_byte(0x55))
            .await
            .unwrap();
        assert_eq!(moved, U256::ZERO);
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn send_failures_hit_the_meter() {
        let (node, _seed_rx, client) = test_node(2);
        let (acct, _) = node.accounts.next(node.id).unwrap().expect("account");

        client.set_gas_price(100);
        client.set_balance(acct.address, U256::from(10_000_000u64));
        client.push_send_error("transaction pool limit reached");

        let res = node.refund(acct, 0, Address::repeat_byte(0x55)).await;
        assert!(res.is_err());
        assert_eq!(node.metrics.error_count(), 1);
        assert_eq!(node.metrics.sent_count(), 0);
    }
}
