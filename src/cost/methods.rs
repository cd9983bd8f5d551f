//! Unit costs of metered RPC methods

use serde::{Deserialize, Serialize};

/// What a method does to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodCategory {
    Read,
    Write,
    Compute,
    Storage,
}

impl MethodCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodCategory::Read => "read",
            MethodCategory::Write => "write",
            MethodCategory::Compute => "compute",
            MethodCategory::Storage => "storage",
        }
    }
}

impl std::fmt::Display for MethodCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMethod {
    pub name: String,
    pub compute_units: u32,
    /// USD per call
    pub dollar_cost: f64,
    pub category: MethodCategory,
}

impl RpcMethod {
    pub fn new(name: impl Into<String>, compute_units: u32, dollar_cost: f64, category: MethodCategory) -> Self {
        Self {
            name: name.into(),
            compute_units,
            dollar_cost,
            category,
        }
    }
}

/// Common Ethereum JSON-RPC, provider-enhanced and IPFS methods, priced per
/// compute-unit tier of a typical hosted node provider
pub fn default_methods() -> Vec<RpcMethod> {
    use MethodCategory::*;

    [
        // Ethereum JSON-RPC
        ("eth_blockNumber", 10, 0.000004, Read),
        ("eth_getBalance", 26, 0.00001, Read),
        ("eth_getTransactionCount", 26, 0.00001, Read),
        ("eth_getBlockByNumber", 16, 0.000007, Read),
        ("eth_getTransactionByHash", 15, 0.000006, Read),
        ("eth_getTransactionReceipt", 15, 0.000006, Read),
        ("eth_call", 26, 0.00001, Compute),
        ("eth_estimateGas", 87, 0.000035, Compute),
        ("eth_gasPrice", 10, 0.000004, Read),
        ("eth_getLogs", 75, 0.00003, Read),
        ("eth_getCode", 26, 0.00001, Read),
        ("eth_getStorageAt", 17, 0.000007, Storage),
        ("eth_sendRawTransaction", 250, 0.0001, Write),
        // Enhanced APIs
        ("alchemy_getTokenBalances", 100, 0.00004, Read),
        ("alchemy_getAssetTransfers", 150, 0.00006, Read),
        ("getNFTs", 100, 0.00004, Read),
        // IPFS
        ("ipfs_pin", 500, 0.0002, Storage),
        ("ipfs_get", 50, 0.00002, Storage),
    ]
    .into_iter()
    .map(|(name, cu, cost, category)| RpcMethod::new(name, cu, cost, category))
    .collect()
}
