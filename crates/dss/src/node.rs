//! The narrow node interface the transaction manager and run loop need.
//! Everything else goes through the contract bindings.

use {
    alloy::{
        network::TransactionBuilder,
        providers::{DynProvider, Provider},
        rpc::types::TransactionRequest,
    },
    alloy_primitives::{Address, Bytes, B256, U256},
    anyhow::{anyhow, Context, Result},
};

/// A fully specified transaction: the caller owns nonce and gas price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSpec {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_price: U256,
}

/// Submission failures the transaction manager reacts to individually.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The mempool already holds a transaction at this nonce with a gas
    /// price the replacement does not beat.
    #[error("replacement transaction underpriced")]
    Underpriced,
    /// A transaction at this nonce was already mined.
    #[error("nonce too low")]
    NonceTooLow,
    /// The exact same transaction is already pending; not an error for our
    /// purposes, the broadcast stands.
    #[error("transaction already known")]
    AlreadyKnown,
    /// The node predicts the call reverts.
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error(transparent)]
    Node(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub successful: bool,
    pub effective_gas_price: U256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
}

#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait::async_trait]
pub trait Node: Send + Sync {
    async fn latest_block(&self) -> Result<BlockInfo>;
    async fn gas_price(&self) -> Result<U256>;
    async fn eth_balance(&self, address: Address) -> Result<U256>;
    async fn nonce(&self, address: Address) -> Result<u64>;
    async fn send(&self, tx: &TxSpec) -> Result<B256, SendError>;
    async fn receipt(&self, hash: B256) -> Result<Option<Receipt>>;
}

pub struct RpcNode {
    provider: DynProvider,
    /// Node-level timeout applied to every request.
    timeout: std::time::Duration,
}

impl RpcNode {
    pub fn new(provider: DynProvider, timeout: std::time::Duration) -> Self {
        Self { provider, timeout }
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        request: impl std::future::IntoFuture<Output = T>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, request.into_future())
            .await
            .map_err(|_| anyhow!("{what} timed out after {:?}", self.timeout))
    }
}

#[async_trait::async_trait]
impl Node for RpcNode {
    async fn latest_block(&self) -> Result<BlockInfo> {
        let request = self
            .provider
            .get_block_by_number(alloy::rpc::types::BlockNumberOrTag::Latest);
        let block = self
            .bounded("get latest block", request)
            .await?
            .context("get latest block")?
            .ok_or_else(|| anyhow!("node has no latest block"))?;
        Ok(BlockInfo {
            number: block.header.number,
            timestamp: block.header.timestamp,
        })
    }

    async fn gas_price(&self) -> Result<U256> {
        let price = self
            .bounded("gas price", self.provider.get_gas_price())
            .await?
            .context("gas price")?;
        Ok(U256::from(price))
    }

    async fn eth_balance(&self, address: Address) -> Result<U256> {
        self.bounded("eth balance", self.provider.get_balance(address))
            .await?
            .context("eth balance")
    }

    async fn nonce(&self, address: Address) -> Result<u64> {
        self.bounded(
            "transaction count",
            self.provider.get_transaction_count(address),
        )
        .await?
        .context("transaction count")
    }

    async fn send(&self, tx: &TxSpec) -> Result<B256, SendError> {
        let gas_price =
            u128::try_from(tx.gas_price).map_err(|_| anyhow!("gas price exceeds 128 bits"))?;
        let request = TransactionRequest::default()
            .with_from(tx.from)
            .with_to(tx.to)
            .with_value(tx.value)
            .with_input(tx.data.clone())
            .with_nonce(tx.nonce)
            .with_gas_price(gas_price);
        let pending = self
            .bounded("send transaction", self.provider.send_transaction(request))
            .await?
            .map_err(classify_send_error)?;
        Ok(*pending.tx_hash())
    }

    async fn receipt(&self, hash: B256) -> Result<Option<Receipt>> {
        let receipt = self
            .bounded(
                "transaction receipt",
                self.provider.get_transaction_receipt(hash),
            )
            .await?
            .context("transaction receipt")?;
        Ok(receipt.and_then(|receipt| {
            let block_number = receipt.block_number?;
            Some(Receipt {
                transaction_hash: receipt.transaction_hash,
                block_number,
                successful: receipt.status(),
                effective_gas_price: U256::from(receipt.effective_gas_price),
            })
        }))
    }
}

fn classify_send_error(err: alloy::transports::TransportError) -> SendError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("underpriced") {
        SendError::Underpriced
    } else if lowered.contains("nonce too low") {
        SendError::NonceTooLow
    } else if lowered.contains("already known") || lowered.contains("known transaction") {
        SendError::AlreadyKnown
    } else if lowered.contains("revert") {
        SendError::Reverted(message)
    } else {
        SendError::Node(anyhow!(message))
    }
}
