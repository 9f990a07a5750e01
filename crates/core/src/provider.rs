use alloy::{
    consensus::TxEnvelope,
    eips::eip2718::Encodable2718,
    primitives::{Address, U256},
    providers::{DynProvider, Provider},
};
use async_trait::async_trait;

use crate::error::ClientError;

/// Capability set the engine needs from an RPC endpoint. Implementations
/// must surface the endpoint's error text verbatim so failed submissions
/// can be classified.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ClientError>;
    async fn suggest_gas_price(&self) -> Result<u128, ClientError>;
    async fn pending_balance_at(&self, addr: Address) -> Result<U256, ClientError>;
    async fn pending_nonce_at(&self, addr: Address) -> Result<u64, ClientError>;
    async fn latest_block_number(&self) -> Result<u64, ClientError>;
    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<(), ClientError>;
}

/// Alloy-backed [`ChainClient`]. Balance and nonce queries use the pending
/// block tag; submissions go out as raw EIP-2718 payloads.
pub struct RpcClient {
    url: String,
    provider: DynProvider,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, provider: DynProvider) -> Self {
        Self {
            url: url.into(),
            provider,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn suggest_gas_price(&self) -> Result<u128, ClientError> {
        Ok(self.provider.get_gas_price().await?)
    }

    async fn pending_balance_at(&self, addr: Address) -> Result<U256, ClientError> {
        Ok(self.provider.get_balance(addr).pending().await?)
    }

    async fn pending_nonce_at(&self, addr: Address) -> Result<u64, ClientError> {
        Ok(self.provider.get_transaction_count(addr).pending().await?)
    }

    async fn latest_block_number(&self) -> Result<u64, ClientError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<(), ClientError> {
        self.provider.send_raw_transaction(&tx.encoded_2718()).await?;
        Ok(())
    }
}
