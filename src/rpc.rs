use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use alloy_primitives::{Address, B256, Bytes};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasReceipt {
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// Single-attempt access to one chain's JSON-RPC. Retries belong to the caller.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn endpoint(&self) -> String;

    async fn block_number(&self) -> Result<u64>;

    async fn block_hash(&self, number: u64) -> Result<Option<B256>>;

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<Log>>;

    async fn receipt_gas(&self, tx_hash: B256) -> Result<Option<GasReceipt>>;

    async fn code_at(&self, address: Address, block_number: u64) -> Result<Bytes>;
}

#[derive(Clone)]
pub struct AlloyRpc {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
}

impl AlloyRpc {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(AlloyRpc {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn handle_error(&self, error_str: &str) -> anyhow::Error {
        warn!(
            "RPC error on {}: {}, rotating provider",
            self.get_current_url(),
            error_str
        );
        self.rotate_provider();
        anyhow::anyhow!("{}", error_str)
    }

    fn handle_timeout(&self) -> anyhow::Error {
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            REQUEST_TIMEOUT.as_secs(),
            self.get_current_url()
        );
        self.rotate_provider();
        anyhow::anyhow!(
            "Request timeout after {} seconds",
            REQUEST_TIMEOUT.as_secs()
        )
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    async fn get_logs_once(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> std::result::Result<Vec<Log>, String> {
        let filter = Filter::new()
            .address(addresses.to_vec())
            .event_signature(topics.to_vec())
            .from_block(from_block)
            .to_block(to_block);

        match timeout(REQUEST_TIMEOUT, self.get_provider().get_logs(&filter)).await {
            Ok(Ok(logs)) => Ok(logs),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(self.handle_timeout().to_string()),
        }
    }
}

#[async_trait]
impl ChainRpc for AlloyRpc {
    fn endpoint(&self) -> String {
        self.get_current_url().to_string()
    }

    async fn block_number(&self) -> Result<u64> {
        match timeout(REQUEST_TIMEOUT, self.get_provider().get_block_number()).await {
            Ok(Ok(block_number)) => Ok(block_number),
            Ok(Err(e)) => Err(self.handle_error(&e.to_string())),
            Err(_) => Err(self.handle_timeout()),
        }
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>> {
        let future = self
            .get_provider()
            .get_block_by_number(BlockNumberOrTag::Number(number));

        match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(block)) => Ok(block.map(|b| b.header.hash)),
            Ok(Err(e)) => Err(self.handle_error(&e.to_string())),
            Err(_) => Err(self.handle_timeout()),
        }
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<Log>> {
        let mut all_logs = Vec::new();
        let mut current_from = from_block;

        while current_from <= to_block {
            match self
                .get_logs_once(current_from, to_block, addresses, topics)
                .await
            {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(error_str) if error_str.contains("exceeds max results") => {
                    let Some((suggested_from, suggested_to)) =
                        Self::parse_max_results_error(&error_str)
                    else {
                        return Err(self.handle_error(&error_str));
                    };

                    info!(
                        "Hit max results limit for blocks {}-{}, splitting at block {}",
                        current_from, to_block, suggested_to
                    );

                    let logs = self
                        .get_logs_once(suggested_from, suggested_to, addresses, topics)
                        .await
                        .map_err(|e| self.handle_error(&e))?;
                    all_logs.extend(logs);
                    current_from = suggested_to + 1;
                }
                Err(error_str) => return Err(self.handle_error(&error_str)),
            }
        }

        Ok(all_logs)
    }

    async fn receipt_gas(&self, tx_hash: B256) -> Result<Option<GasReceipt>> {
        let future = self.get_provider().get_transaction_receipt(tx_hash);

        match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(receipt)) => Ok(receipt.map(|r| GasReceipt {
                gas_used: r.gas_used,
                effective_gas_price: r.effective_gas_price,
            })),
            Ok(Err(e)) => Err(self.handle_error(&e.to_string())),
            Err(_) => Err(self.handle_timeout()),
        }
    }

    async fn code_at(&self, address: Address, block_number: u64) -> Result<Bytes> {
        let future = self
            .get_provider()
            .get_code_at(address)
            .block_id(BlockNumberOrTag::Number(block_number).into());

        match timeout(REQUEST_TIMEOUT, future).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(e)) => Err(self.handle_error(&e.to_string())),
            Err(_) => Err(self.handle_timeout()),
        }
    }
}
