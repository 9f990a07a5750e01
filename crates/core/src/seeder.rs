use std::sync::Arc;
use std::time::Duration;

use alloy::{
    consensus::TxLegacy,
    primitives::{TxKind, U256},
};
use prometheus::IntGauge;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::{rand_between, rand_between_dur, Backoff};
use crate::error::{ClientError, Error, TxErrorKind};
use crate::keystore::Account;
use crate::metrics::{self, Metrics, StateTracker};
use crate::node::{Node, SeedRequest};

const COLLECT_DEADLINE: Duration = Duration::from_secs(10);
const COLLECT_EVERY_MIN: Duration = Duration::from_secs(5 * 60);
const COLLECT_EVERY_MAX: Duration = Duration::from_secs(10 * 60);

/// Funds sender accounts on demand and reclaims residual balances from
/// accounts that rotated out.
pub struct Seeder {
    node: Arc<Node>,
    acct: Account,
    nonce: Option<u64>,
    requests: mpsc::Receiver<SeedRequest>,
    tracker: StateTracker,
    states: States,
}

struct States {
    seed: IntGauge,
    ensure_funds: IntGauge,
    collect: IntGauge,
    update_nonce: IntGauge,
}

impl States {
    fn new(metrics: &Metrics) -> Self {
        Self {
            seed: metrics.state(metrics::SEEDER, "seed"),
            ensure_funds: metrics.state(metrics::SEEDER, "ensureFunds"),
            collect: metrics.state(metrics::SEEDER, "collect"),
            update_nonce: metrics.state(metrics::SEEDER, "updateNonce"),
        }
    }
}

enum Wake {
    Cancelled,
    Request(Option<SeedRequest>),
    Collect,
}

impl Seeder {
    pub fn new(node: Arc<Node>, acct: Account, requests: mpsc::Receiver<SeedRequest>) -> Self {
        let states = States::new(&node.metrics);
        Self {
            node,
            acct,
            nonce: None,
            requests,
            tracker: StateTracker::new(),
            states,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(account = %self.acct, "starting seeder");
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut collect_at = Instant::now() + rand_between_dur(COLLECT_EVERY_MIN, COLLECT_EVERY_MAX);

        loop {
            self.tracker.transition(Some(self.states.ensure_funds.clone()));

            let timer = self.node.metrics.timer(metrics::SUGGEST_GAS_PRICE);
            let Some(gas_price) = backoff
                .retry_timed(&cancel, &timer, || self.node.client.suggest_gas_price())
                .await
            else {
                break;
            };
            // Enough to fund a sender for ~1000 transactions.
            let amt = U256::from(gas_price)
                * U256::from(rand_between(self.node.gas, 2 * self.node.gas))
                * U256::from(1000u64);

            if self.ensure_funds(&cancel, &backoff, amt).await.is_none() {
                break;
            }

            self.tracker.transition(Some(self.states.seed.clone()));
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                req = self.requests.recv() => Wake::Request(req),
                _ = tokio::time::sleep_until(collect_at) => Wake::Collect,
            };
            match wake {
                Wake::Cancelled => break,
                // All senders dropped their mailbox handles.
                Wake::Request(None) => break,
                Wake::Request(Some(req)) => {
                    if self
                        .handle_request(&cancel, &backoff, req, gas_price, amt)
                        .await
                        .is_none()
                    {
                        break;
                    }
                }
                Wake::Collect => {
                    let last = self.tracker.transition(Some(self.states.collect.clone()));
                    match tokio::time::timeout(COLLECT_DEADLINE, self.collect(&cancel, amt)).await {
                        Ok(collected) => info!(%collected, "collected refunds"),
                        Err(_) => warn!("refund collection hit deadline"),
                    }
                    self.tracker.transition(last);
                    collect_at =
                        Instant::now() + rand_between_dur(COLLECT_EVERY_MIN, COLLECT_EVERY_MAX);
                }
            }
        }
        self.tracker.transition(None);
    }

    /// Tops the seeder account up to `amt` by collecting refunds when its
    /// balance falls short. Also lazily initializes the nonce. `None` means
    /// the run was cancelled.
    async fn ensure_funds(
        &mut self,
        cancel: &CancellationToken,
        backoff: &Backoff,
        amt: U256,
    ) -> Option<()> {
        let timer = self.node.metrics.timer(metrics::PENDING_BALANCE_AT);
        let balance = backoff
            .retry_timed(cancel, &timer, || {
                self.node.client.pending_balance_at(self.acct.address)
            })
            .await?;
        info!(%balance, "got seeder balance");

        if self.nonce.is_none() {
            let timer = self.node.metrics.timer(metrics::PENDING_NONCE_AT);
            let nonce = backoff
                .retry_timed(cancel, &timer, || {
                    self.node.client.pending_nonce_at(self.acct.address)
                })
                .await?;
            info!(nonce, "initialized nonce");
            self.nonce = Some(nonce);
        }

        if balance < amt {
            let last = self.tracker.transition(Some(self.states.collect.clone()));
            let collected = self.collect(cancel, amt - balance).await;
            info!(%collected, "collected refunds");
            self.tracker.transition(last);
        }
        Some(())
    }

    /// Funds the requesting sender and replies with the submission result.
    /// `None` means the run was cancelled.
    async fn handle_request(
        &mut self,
        cancel: &CancellationToken,
        backoff: &Backoff,
        req: SeedRequest,
        gas_price: u128,
        amt: U256,
    ) -> Option<()> {
        let nonce = self.nonce.unwrap_or_default();
        let tx = TxLegacy {
            nonce,
            to: TxKind::Call(req.addr),
            value: amt,
            gas_limit: rand_between(self.node.gas, 2 * self.node.gas),
            gas_price,
            ..Default::default()
        };
        let signed = match self.node.sign_tx(self.acct, tx) {
            Ok(signed) => signed,
            Err(err) => {
                warn!(%err, "failed to sign seed tx");
                let _ = req.reply.send(Err(ClientError::new(err.to_string())));
                return Some(());
            }
        };

        match self.node.send_tx(&signed).await {
            Ok(()) => {
                self.nonce = Some(nonce + 1);
                let _ = req.reply.send(Ok(()));
                Some(())
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return None;
                }
                warn!(%err, "failed to send seed tx");
                let kind = err.kind();
                let _ = req.reply.send(Err(err));
                match kind {
                    TxErrorKind::NonceTooLow | TxErrorKind::KnownOrUnderpriced => {
                        let last = self
                            .tracker
                            .transition(Some(self.states.update_nonce.clone()));
                        let old = self.nonce;
                        let timer = self.node.metrics.timer(metrics::PENDING_NONCE_AT);
                        let nonce = backoff
                            .retry_timed(cancel, &timer, || {
                                self.node.client.pending_nonce_at(self.acct.address)
                            })
                            .await?;
                        self.nonce = Some(nonce);
                        info!(nonce, ?old, "updated nonce");
                        self.tracker.transition(last);
                    }
                    TxErrorKind::LowFunds => {
                        let last = self.tracker.transition(Some(self.states.collect.clone()));
                        let collected = self.collect(cancel, amt).await;
                        info!(%collected, "collected refunds");
                        self.tracker.transition(last);
                    }
                    TxErrorKind::PoolFull | TxErrorKind::Other => {
                        let wait =
                            rand_between_dur(Duration::from_secs(5), Duration::from_secs(30));
                        info!(?wait, "pausing seeder");
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = cancel.cancelled() => return None,
                        }
                    }
                }
                Some(())
            }
        }
    }

    /// Drains balances from checked-in accounts back to the seeder account
    /// until `amount` has been gathered or the run is cancelled.
    async fn collect(&self, cancel: &CancellationToken, amount: U256) -> U256 {
        let mut collected = U256::ZERO;
        while collected < amount && !cancel.is_cancelled() {
            match self.refund_next_acct().await {
                Ok(c) => collected += c,
                Err(err) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let wait = Duration::from_secs(2);
                    warn!(?wait, %err, "failed to refund account, pausing");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        collected
    }

    /// Checks out one account, drains it into the seeder account, and
    /// checks it back in with an up-to-date nonce.
    async fn refund_next_acct(&self) -> Result<U256, Error> {
        let (acct, mut nonce) = self
            .node
            .accounts
            .next(self.node.id)?
            .ok_or(Error::NoAccounts)?;

        if nonce == 0 {
            let start = Instant::now();
            match self.node.client.pending_nonce_at(acct.address).await {
                Ok(n) => {
                    self.node
                        .metrics
                        .observe(metrics::PENDING_NONCE_AT, start.elapsed());
                    nonce = n;
                }
                Err(err) => {
                    self.node.accounts.return_account(acct, self.node.id, nonce);
                    return Err(err.into());
                }
            }
        }

        match self.node.refund(acct, nonce, self.acct.address).await {
            Ok(amount) => {
                // Only a submitted transfer consumes the nonce.
                let next = if amount > U256::ZERO { nonce + 1 } else { nonce };
                self.node.accounts.return_account(acct, self.node.id, next);
                Ok(amount)
            }
            Err(err) => {
                self.node.accounts.return_account(acct, self.node.id, nonce);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy::consensus::Transaction;
    use alloy::primitives::U256;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use super::Seeder;
    use crate::node::SeedRequest;
    use crate::testutil::{test_node, unwrap_legacy};

    #[tokio::test(start_paused = true)]
    async fn seeds_on_request_and_advances_nonce() {
        let (node, seed_rx, client) = test_node(1);
        let acct = node.accounts.next_seed().unwrap().expect("seed account");
        client.set_balance(acct.address, U256::MAX);
        client.set_nonce(acct.address, 9);

        let mailbox = node.seed_mailbox();
        let cancel = CancellationToken::new();
        let seeder = Seeder::new(node.clone(), acct, seed_rx);
        let handle = tokio::spawn(seeder.run(cancel.clone()));

        for expected_nonce in [9, 10] {
            let (reply_tx, reply_rx) = oneshot::channel();
            mailbox
                .send(SeedRequest {
                    addr: alloy::primitives::Address::repeat_byte(0x77),
                    reply: reply_tx,
                })
                .await
                .unwrap();
            reply_rx.await.unwrap().unwrap();
            let sent = client.sent();
            let tx = unwrap_legacy(sent.last().unwrap());
            assert_eq!(tx.nonce(), expected_nonce);
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_too_low_resyncs_from_chain() {
        let (node, seed_rx, client) = test_node(1);
        let acct = node.accounts.next_seed().unwrap().expect("seed account");
        client.set_balance(acct.address, U256::MAX);
        client.set_nonce(acct.address, 9);

        let mailbox = node.seed_mailbox();
        let cancel = CancellationToken::new();
        let seeder = Seeder::new(node.clone(), acct, seed_rx);
        let handle = tokio::spawn(seeder.run(cancel.clone()));

        // A first successful seed pins the local nonce at 10.
        let (reply_tx, reply_rx) = oneshot::channel();
        mailbox
            .send(SeedRequest {
                addr: alloy::primitives::Address::repeat_byte(0x66),
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap().unwrap();

        // The chain moves ahead; the stale submission is rejected and the
        // seeder must resync to the fresh pending nonce.
        client.set_nonce(acct.address, 31);
        client.push_send_error("nonce too low");

        let (reply_tx, reply_rx) = oneshot::channel();
        mailbox
            .send(SeedRequest {
                addr: alloy::primitives::Address::repeat_byte(0x77),
                reply: reply_tx,
            })
            .await
            .unwrap();
        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.unwrap_err().message, "nonce too low");

        let (reply_tx, reply_rx) = oneshot::channel();
        mailbox
            .send(SeedRequest {
                addr: alloy::primitives::Address::repeat_byte(0x88),
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap().unwrap();

        let sent = client.sent();
        let tx = unwrap_legacy(sent.last().unwrap());
        assert_eq!(tx.nonce(), 31);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn low_funds_triggers_collection() {
        let (node, seed_rx, client) = test_node(2);
        let acct = node.accounts.next_seed().unwrap().expect("seed account");

        // An idle account sits in the pool with a fat balance.
        let (idle, _) = node.accounts.next(node.id).unwrap().expect("idle account");
        node.accounts.return_account(idle, node.id, 5);
        client.set_balance(idle.address, U256::from(10_000_000_000u64));
        // The seeder itself is broke.
        client.set_balance(acct.address, U256::from(1u64));

        let cancel = CancellationToken::new();
        let seeder = Seeder::new(node.clone(), acct, seed_rx);
        let handle = tokio::spawn(seeder.run(cancel.clone()));

        // ensure_funds collects from the idle account before serving.
        for _ in 0..200 {
            tokio::time::advance(Duration::from_millis(500)).await;
            if !client.sent().is_empty() {
                break;
            }
        }
        let sent = client.sent();
        assert!(!sent.is_empty(), "no refund was collected");
        let tx = unwrap_legacy(&sent[0]);
        assert_eq!(tx.to(), Some(acct.address));
        assert_eq!(tx.nonce(), 5);

        cancel.cancel();
        handle.await.unwrap();
    }
}
