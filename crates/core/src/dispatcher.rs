use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::account::AccountStore;
use crate::backoff::rand_between_dur;
use crate::config::Config;
use crate::error::Error;
use crate::keystore::KeyStore;
use crate::metrics::{self, Metrics};
use crate::node::{Node, SeedRequest};
use crate::provider::ChainClient;
use crate::report::{Reporter, Reports};
use crate::seeder::Seeder;
use crate::sender::Sender;
use crate::Result;

const BATCHES_PER_SEC: u64 = 10;
const REPORT_EVERY: Duration = Duration::from_secs(30);
const BLOCK_POLL: Duration = Duration::from_secs(2);

/// Splits `total` into `n` nearly even buckets: every bucket is within one
/// of `total / n` and the buckets sum to `total`.
pub fn distribute(total: u64, n: usize) -> Vec<u64> {
    let base = total / n as u64;
    let mut buckets = vec![base; n];
    for bucket in buckets.iter_mut().take((total % n as u64) as usize) {
        *bucket += 1;
    }
    buckets
}

/// Minimum interval between submissions for one sender: each sender is
/// allowed 10x its even share of the target rate.
pub(crate) fn rate_limit(tps: u64, senders: u64) -> Duration {
    let cap = (10 * tps / senders).max(1);
    Duration::from_secs(1) / cap as u32
}

/// Polls the chain head until it has advanced `blocks` past the first
/// observation. Returns the head seen last, or `None` when cancelled.
pub async fn wait_blocks(
    client: &dyn ChainClient,
    cancel: &CancellationToken,
    blocks: u64,
    metrics: &Metrics,
) -> Option<u64> {
    let mut first = None;
    loop {
        let start = Instant::now();
        let res = client.latest_block_number().await;
        if cancel.is_cancelled() {
            return None;
        }
        match res {
            Ok(current) => {
                metrics.observe(metrics::LATEST_BLOCK_NUMBER, start.elapsed());
                let first = *first.get_or_insert(current);
                if current >= first + blocks {
                    return Some(current);
                }
            }
            Err(err) => warn!(%err, "failed to get block number"),
        }
        tokio::select! {
            _ = tokio::time::sleep(BLOCK_POLL) => {}
            _ = cancel.cancelled() => return None,
        }
    }
}

/// Drives a full load-generation run: starts one seeder per node and the
/// configured sender fleet, releases rate tokens in 100ms batches, logs
/// rolled-up reports, and unwinds everything on cancellation.
pub struct Dispatcher {
    config: Config,
    nodes: Vec<Arc<Node>>,
    seed_rxs: Vec<mpsc::Receiver<SeedRequest>>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// Wires the shared account store and one node per client.
    pub fn new(
        mut config: Config,
        clients: Vec<Arc<dyn ChainClient>>,
        keystore: Arc<dyn KeyStore>,
    ) -> Result<Self> {
        if config.tps < 1 {
            return Err(Error::Config(format!("illegal tps argument: {}", config.tps)));
        }
        if config.senders < 1 {
            config.senders = config.tps;
        }
        if clients.is_empty() {
            return Err(Error::NoEndpoints);
        }

        let metrics = Arc::new(Metrics::new());
        let accounts = Arc::new(AccountStore::new(
            keystore,
            config.chain_id,
            config.password.clone(),
        ));

        let mut nodes = Vec::with_capacity(clients.len());
        let mut seed_rxs = Vec::with_capacity(clients.len());
        for (id, client) in clients.into_iter().enumerate() {
            let (node, seed_rx) = Node::new(
                id,
                config.gas,
                client,
                accounts.clone(),
                metrics.clone(),
            );
            nodes.push(Arc::new(node));
            seed_rxs.push(seed_rx);
        }

        Ok(Self {
            config,
            nodes,
            seed_rxs,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Runs until `cancel` fires or the configured duration elapses.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut handles = Vec::new();

        // One seeder per node, each with its own reserved account.
        let mut seeders = 0;
        for (node, seed_rx) in self.nodes.iter().zip(self.seed_rxs.drain(..)) {
            let acct = match node.accounts.next_seed() {
                Ok(Some(acct)) => acct,
                other => {
                    if let Err(err) = other {
                        warn!(%err, "failed to get seeder account");
                    }
                    match node.accounts.new_account() {
                        Ok(acct) => {
                            node.accounts.reserve_seed(acct);
                            acct
                        }
                        Err(err) => {
                            warn!(%err, "failed to create seeder account");
                            continue;
                        }
                    }
                }
            };
            let seeder = Seeder::new(node.clone(), acct, seed_rx);
            let span = info_span!("seeder", node = node.id);
            handles.push(tokio::spawn(seeder.run(cancel.clone()).instrument(span)));
            seeders += 1;
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        if seeders == 0 {
            return Err(Error::NoSeeders);
        }
        info!(count = seeders, "started seeders");

        let start_block = wait_blocks(&*self.nodes[0].client, &cancel, 0, &self.metrics).await;
        info!(
            count = self.config.senders,
            block = start_block,
            "starting senders"
        );

        let mut reporter = Reporter::new(self.metrics.clone());
        let mut reports = Reports::default();

        if let Some(duration) = self.config.duration {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                info!(?duration, "duration elapsed");
                cancel.cancel();
            });
        }

        // Token plumbing: a roomy inbound channel, optionally relayed
        // through a jitter stage that sporadically stalls delivery.
        let (txs_in, inbound_rx) = mpsc::channel::<()>((self.config.tps * BATCHES_PER_SEC) as usize);
        let mut relay = None;
        let txs_out = if self.config.variable > Duration::ZERO {
            let (jitter_tx, jitter_rx) = mpsc::channel::<()>(self.config.tps as usize);
            let variable = self.config.variable;
            let mut inbound_rx = inbound_rx;
            let cancel = cancel.clone();
            relay = Some(tokio::spawn(async move {
                let mut next = Instant::now();
                while let Some(()) = inbound_rx.recv().await {
                    if Instant::now() >= next {
                        tokio::select! {
                            _ = tokio::time::sleep(rand_between_dur(Duration::ZERO, variable)) => {}
                            _ = cancel.cancelled() => return,
                        }
                        next = Instant::now() + rand_between_dur(variable / 2, variable);
                    }
                    tokio::select! {
                        res = jitter_tx.send(()) => {
                            if res.is_err() {
                                return;
                            }
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
            }));
            jitter_rx
        } else {
            inbound_rx
        };
        let txs_out = Arc::new(Mutex::new(txs_out));

        let per_sender = rate_limit(self.config.tps, self.config.senders);
        for num in 0..self.config.senders {
            let node = self.nodes[num as usize % self.nodes.len()].clone();
            let node_id = node.id;
            let sender = Sender::new(
                node,
                num,
                self.config.amount,
                self.config.cycle,
                per_sender,
                txs_out.clone(),
            );
            let span = info_span!("sender", node = node_id, sender = num);
            handles.push(tokio::spawn(sender.run(cancel.clone()).instrument(span)));
        }

        // Batch plan: the target rate split over ten 100ms slices, in a
        // shuffled order that repeats every second.
        let mut batches = distribute(self.config.tps, BATCHES_PER_SEC as usize);
        batches.shuffle(&mut rand::thread_rng());

        let mut batch = tokio::time::interval_at(
            Instant::now() + Duration::from_secs(1) / BATCHES_PER_SEC as u32,
            Duration::from_secs(1) / BATCHES_PER_SEC as u32,
        );
        batch.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report = tokio::time::interval_at(Instant::now() + REPORT_EVERY, REPORT_EVERY);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cnt: usize = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = report.tick() => {
                    let status = reports.add(reporter.report());
                    info!("status:\n{status}");
                }
                _ = batch.tick() => {
                    let size = batches[cnt % batches.len()];
                    for _ in 0..size {
                        tokio::select! {
                            res = txs_in.send(()) => {
                                if res.is_err() {
                                    break;
                                }
                            }
                            _ = cancel.cancelled() => break,
                        }
                    }
                    cnt += 1;
                }
            }
        }

        // Closing the inbound stream lets workers drain and exit.
        drop(txs_in);
        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(relay) = relay {
            let _ = relay.await;
        }

        let status = reports.add(reporter.report());
        info!("final status:\n{status}");
        if let (Some(start_block), Ok(end_block)) = (
            start_block,
            self.nodes[0].client.latest_block_number().await,
        ) {
            info!(start = start_block, end = end_block, "ran between blocks");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{distribute, rate_limit};

    #[test]
    fn distribute_splits_evenly() {
        for (v, n, want) in [
            (10, 1, vec![10]),
            (10, 2, vec![5, 5]),
            (10, 3, vec![4, 3, 3]),
            (10, 4, vec![3, 3, 2, 2]),
            (10, 5, vec![2, 2, 2, 2, 2]),
            (2, 3, vec![1, 1, 0]),
        ] {
            let got = distribute(v, n);
            assert_eq!(got, want, "distribute({v}, {n})");
            assert_eq!(got.iter().sum::<u64>(), v);
        }
    }

    #[test]
    fn rate_limit_allows_ten_times_even_share() {
        // 10 tps across one sender: 100 tx/s cap -> 10ms between txs.
        assert_eq!(rate_limit(10, 1), Duration::from_millis(10));
        // 10 tps across 100 senders rounds down to the 1 tx/s floor.
        assert_eq!(rate_limit(10, 100), Duration::from_secs(1));
        assert_eq!(rate_limit(1, 1000), Duration::from_secs(1));
    }
}
