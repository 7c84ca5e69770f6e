use alloy_primitives::Address;
use tracing::info;

use crate::chain_client::ChainClient;
use crate::error::MonitorError;

/// Binary-searches the first block at which `address` carries contract code.
pub async fn find_deployment_block(
    client: &ChainClient,
    address: Address,
    latest_block: u64,
) -> Result<u64, MonitorError> {
    info!(
        "[{}] Searching for deployment block of bridge {:?}",
        client.chain(),
        address
    );

    if !client.has_code_at(address, latest_block).await? {
        return Err(MonitorError::Config(format!(
            "address {:?} is not a deployed contract on {}",
            address,
            client.chain()
        )));
    }

    let mut left = 0u64;
    let mut right = latest_block;

    while left < right {
        let mid = left + (right - left) / 2;

        if client.has_code_at(address, mid).await? {
            right = mid;
        } else {
            left = mid + 1;
        }
    }

    info!("[{}] Bridge deployed at block {}", client.chain(), left);
    Ok(left)
}
