//! Minimal Ethereum JSON-RPC client used to probe freshly started nodes.

use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// A response carrying an `error` object is turned into an error.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let body: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    decode_response(body, method)
}

fn decode_response<T: DeserializeOwned>(body: Value, method: &str) -> Result<T, anyhow::Error> {
    if let Some(error) = body.get("error") {
        anyhow::bail!(
            "RPC error: {}",
            error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
        );
    }

    let result = body.get("result").context("No result in response")?.clone();

    serde_json::from_value(result).with_context(|| format!("Failed to deserialize {} result", method))
}

/// Parse a `0x`-prefixed quantity.
pub fn parse_quantity(value: &str) -> Result<u64, anyhow::Error> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid hex quantity: {value}"))
}

/// Query `eth_chainId`.
pub async fn chain_id(client: &reqwest::Client, url: &str) -> Result<u64, anyhow::Error> {
    let raw: String = json_rpc_call(client, url, "eth_chainId", vec![]).await?;
    parse_quantity(&raw)
}
