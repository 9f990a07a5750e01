use std::time::Duration;

/// Options for a load-generation run. Endpoint dialing and keystore
/// location are the caller's concern; the dispatcher only sees the
/// resulting clients.
#[derive(Debug, Clone)]
pub struct Config {
    /// Expected chain id, also bound into every signature.
    pub chain_id: u64,
    /// Aggregate target transactions per second.
    pub tps: u64,
    /// Concurrent sender workers. 0 means "same as tps".
    pub senders: u64,
    /// Base account-cycling interval; each cycle lasts U[cycle, 2*cycle].
    pub cycle: Duration,
    /// Total runtime. `None` means unlimited.
    pub duration: Option<Duration>,
    /// Passphrase for keystore accounts.
    pub password: String,
    /// Base gas limit, sampled into [gas, 2*gas] per tx.
    pub gas: u64,
    /// Base transfer value, sampled into [amount, 2*amount] per tx.
    pub amount: u64,
    /// Jitter amplitude for the rate relay. Zero disables it.
    pub variable: Duration,
}
