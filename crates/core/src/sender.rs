use std::sync::Arc;
use std::time::Duration;

use alloy::{
    consensus::TxLegacy,
    primitives::{Address, TxKind, U256},
};
use prometheus::IntGauge;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{rand_between, rand_between_dur, Backoff};
use crate::dispatcher::wait_blocks;
use crate::error::{ClientError, Error, TxErrorKind};
use crate::keystore::Account;
use crate::metrics::{self, Metrics, StateTracker};
use crate::node::{Node, SeedRequest};

const SEED_WAIT_BLOCKS: u64 = 5;

/// Shared handle to the dispatcher's token stream. Senders compete for
/// tokens; each token authorizes one submission.
pub type TokenStream = Arc<Mutex<mpsc::Receiver<()>>>;

/// Submits value transfers at a rate, cycling through accounts from the
/// shared store.
pub struct Sender {
    node: Arc<Node>,
    id: u64,
    amount: u64,
    cycle: Duration,
    rate_limit: Duration,
    txs: TokenStream,
    acct: Option<Account>,
    nonce: u64,
    gas_price: u128,
    recv: Vec<Address>,
    tracker: StateTracker,
    states: States,
}

struct States {
    assign: IntGauge,
    update_gas: IntGauge,
    send: IntGauge,
    seed: IntGauge,
}

impl States {
    fn new(metrics: &Metrics) -> Self {
        Self {
            assign: metrics.state(metrics::SENDER, "assign"),
            update_gas: metrics.state(metrics::SENDER, "updateGas"),
            send: metrics.state(metrics::SENDER, "send"),
            seed: metrics.state(metrics::SENDER, "seed"),
        }
    }
}

enum Wake {
    Cancelled,
    Cycle,
    UpdateGas,
    Token,
    Closed,
}

impl Sender {
    pub fn new(
        node: Arc<Node>,
        id: u64,
        amount: u64,
        cycle: Duration,
        rate_limit: Duration,
        txs: TokenStream,
    ) -> Self {
        let states = States::new(&node.metrics);
        Self {
            node,
            id,
            amount,
            cycle,
            rate_limit,
            txs,
            acct: None,
            nonce: 0,
            gas_price: 0,
            recv: Vec::new(),
            tracker: StateTracker::new(),
            states,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(sender = self.id, "starting sender");
        self.tracker.transition(Some(self.states.update_gas.clone()));
        self.update_gas_price(&cancel).await;
        if !cancel.is_cancelled() {
            self.tracker.transition(Some(self.states.assign.clone()));
            self.assign_acct(&cancel).await;
        }
        self.tracker.transition(Some(self.states.send.clone()));

        let mut cycle_at = Instant::now() + rand_between_dur(self.cycle, 2 * self.cycle);
        let mut gas_at = Instant::now() + gas_refresh_in();
        while !cancel.is_cancelled() {
            let txs = self.txs.clone();
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(cycle_at) => Wake::Cycle,
                _ = tokio::time::sleep_until(gas_at) => Wake::UpdateGas,
                token = async move { txs.lock().await.recv().await } => match token {
                    Some(()) => Wake::Token,
                    None => Wake::Closed,
                },
            };
            match wake {
                Wake::Cancelled | Wake::Closed => break,
                Wake::Cycle => {
                    self.reassign(&cancel).await;
                    cycle_at = Instant::now() + rand_between_dur(self.cycle, 2 * self.cycle);
                }
                Wake::UpdateGas => {
                    self.tracker.transition(Some(self.states.update_gas.clone()));
                    self.update_gas_price(&cancel).await;
                    self.tracker.transition(Some(self.states.send.clone()));
                    gas_at = Instant::now() + gas_refresh_in();
                }
                Wake::Token => self.send_one(&cancel).await,
            }
        }
        self.drain_tokens().await;
        self.tracker.transition(None);
    }

    async fn update_gas_price(&mut self, cancel: &CancellationToken) {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let timer = self.node.metrics.timer(metrics::SUGGEST_GAS_PRICE);
        if let Some(price) = backoff
            .retry_timed(cancel, &timer, || self.node.client.suggest_gas_price())
            .await
        {
            self.gas_price = price;
        }
    }

    /// Assigns an account from the store, refunding and returning the
    /// current one first. Short accounts are topped up by the node's seeder
    /// before receivers are drawn.
    async fn assign_acct(&mut self, cancel: &CancellationToken) {
        let mut old = None;
        if let Some(acct) = self.acct.take() {
            if let Some(seed) = self.node.accounts.rand_seed() {
                match self.node.refund(acct, self.nonce, seed).await {
                    Ok(amount) => {
                        if amount > U256::ZERO {
                            self.nonce += 1;
                            info!(%amount, "refunded account");
                        }
                    }
                    Err(err) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        warn!(%err, "failed to refund account");
                    }
                }
            }
            self.node.accounts.return_account(acct, self.node.id, self.nonce);
            old = Some(acct.address);
        }

        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        let Some(next) = backoff
            .retry(cancel, || {
                std::future::ready(self.node.accounts.next(self.node.id))
            })
            .await
        else {
            return;
        };
        let acct = match next {
            Some((acct, nonce)) => {
                self.nonce = nonce;
                if nonce == 0 {
                    // Fresh from the keystore; the chain knows better.
                    let addr = acct.address;
                    let timer = self.node.metrics.timer(metrics::PENDING_NONCE_AT);
                    let Some(nonce) = backoff
                        .retry_timed(cancel, &timer, || self.node.client.pending_nonce_at(addr))
                        .await
                    else {
                        return;
                    };
                    self.nonce = nonce;
                }
                acct
            }
            None => {
                let Some(acct) = backoff
                    .retry(cancel, || {
                        std::future::ready(self.node.accounts.new_account())
                    })
                    .await
                else {
                    return;
                };
                self.nonce = 0;
                acct
            }
        };
        self.acct = Some(acct);
        let addr = acct.address;

        let timer = self.node.metrics.timer(metrics::PENDING_BALANCE_AT);
        let Some(balance) = backoff
            .retry_timed(cancel, &timer, || self.node.client.pending_balance_at(addr))
            .await
        else {
            return;
        };
        match old {
            Some(old) => info!(%balance, %old, "changed account"),
            None => info!(%balance, "assigned account"),
        }

        let need = U256::from(self.gas_price) * U256::from(self.node.gas) * U256::from(1000u64);
        if balance < need {
            let diff = need - balance;
            let last = self.tracker.transition(Some(self.states.seed.clone()));
            if backoff
                .retry(cancel, || self.request_seed(cancel, addr))
                .await
                .is_none()
            {
                return;
            }
            // Give the funding tx time to land before spending from it.
            if wait_blocks(&*self.node.client, cancel, SEED_WAIT_BLOCKS, &self.node.metrics)
                .await
                .is_none()
            {
                return;
            }
            info!(amount = %diff, "seeded account");
            self.tracker.transition(last);
        }

        let Some(recv) = backoff
            .retry(cancel, || async {
                let n = rand::thread_rng().gen_range(1..=10);
                let recv = self.node.accounts.next_recv(addr, n);
                if recv.is_empty() {
                    Err(Error::NoReceivers)
                } else {
                    Ok(recv)
                }
            })
            .await
        else {
            return;
        };
        self.recv = recv;
        debug!(receivers = self.recv.len(), "assigned receivers");
    }

    /// Posts a rendezvous request to the node's seeder and waits for the
    /// funding result.
    async fn request_seed(
        &self,
        cancel: &CancellationToken,
        addr: Address,
    ) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = SeedRequest {
            addr,
            reply: reply_tx,
        };
        let mailbox = self.node.seed_mailbox();
        tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::new("cancelled")),
            res = mailbox.send(req) => {
                if res.is_err() {
                    return Err(ClientError::new("seeder is gone"));
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::new("cancelled")),
            res = reply_rx => match res {
                Ok(reply) => reply,
                Err(_) => Err(ClientError::new("seeder dropped the request")),
            },
        }
    }

    /// Submits one transfer for the current token.
    async fn send_one(&mut self, cancel: &CancellationToken) {
        let Some(acct) = self.acct else { return };
        if self.recv.is_empty() {
            return;
        }
        let recv = self.recv[self.nonce as usize % self.recv.len()];
        let mut gas_price = self.gas_price;
        if rand::thread_rng().gen_bool(0.5) && gas_price > 0 {
            gas_price = rand::thread_rng().gen_range(gas_price..2 * gas_price);
        }
        let tx = TxLegacy {
            nonce: self.nonce,
            to: TxKind::Call(recv),
            value: U256::from(rand_between(self.amount, 2 * self.amount)),
            gas_limit: rand_between(self.node.gas, 2 * self.node.gas),
            gas_price,
            ..Default::default()
        };

        let signed = match self.node.sign_tx(acct, tx) {
            Ok(signed) => signed,
            Err(err) => {
                warn!(%err, "failed to sign tx");
                self.reassign(cancel).await;
                return;
            }
        };

        match self.node.send_tx(&signed).await {
            Ok(()) => {
                self.nonce += 1;
                tokio::select! {
                    _ = tokio::time::sleep(self.rate_limit) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                match err.kind() {
                    TxErrorKind::NonceTooLow => {
                        warn!(%err, "failed to send, updating nonce");
                        let old = self.nonce;
                        let addr = acct.address;
                        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
                        let timer = self.node.metrics.timer(metrics::PENDING_NONCE_AT);
                        let Some(nonce) = backoff
                            .retry_timed(cancel, &timer, || {
                                self.node.client.pending_nonce_at(addr)
                            })
                            .await
                        else {
                            return;
                        };
                        self.nonce = nonce;
                        info!(nonce, old, "updated nonce");
                    }
                    TxErrorKind::PoolFull => {
                        let wait =
                            rand_between_dur(Duration::from_secs(5), Duration::from_secs(120));
                        self.pause(cancel, wait, &err).await;
                    }
                    TxErrorKind::KnownOrUnderpriced | TxErrorKind::LowFunds => {
                        info!(%err, "abandoning account");
                        self.reassign(cancel).await;
                    }
                    TxErrorKind::Other => {
                        let wait =
                            rand_between_dur(Duration::from_secs(5), Duration::from_secs(30));
                        self.pause(cancel, wait, &err).await;
                    }
                }
            }
        }
    }

    async fn reassign(&mut self, cancel: &CancellationToken) {
        self.tracker.transition(Some(self.states.assign.clone()));
        self.assign_acct(cancel).await;
        self.tracker.transition(Some(self.states.send.clone()));
    }

    async fn pause(&self, cancel: &CancellationToken, wait: Duration, err: &ClientError) {
        info!(?wait, %err, "pausing sender");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => {}
        }
    }

    /// Consumes leftover tokens so the dispatcher is never left blocked on
    /// a full channel during shutdown.
    async fn drain_tokens(&self) {
        let mut txs = self.txs.lock().await;
        while txs.try_recv().is_ok() {}
    }
}

fn gas_refresh_in() -> Duration {
    rand_between_dur(Duration::from_secs(60), Duration::from_secs(120))
}
