//! HTTP clients for the balance indexer and the attestation provider

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::bridge::{Attestation, AttestationApi};
use super::{AdapterError, BalanceAggregator};
use crate::quote::{BalanceSnapshot, LedgerId};

fn build_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AdapterError::Rejected(format!("Failed to create HTTP client: {}", e)))
}

fn map_request_error(e: reqwest::Error) -> AdapterError {
    if e.is_decode() {
        AdapterError::InvalidResponse(e.to_string())
    } else {
        AdapterError::Transient(format!("HTTP request failed: {}", e))
    }
}

/// 429 and 5xx are worth retrying; other 4xx are final.
fn map_status(status: StatusCode, body: String) -> AdapterError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        AdapterError::RateLimited(body)
    } else if status.is_server_error() {
        AdapterError::Transient(format!("{}: {}", status, body))
    } else {
        AdapterError::Rejected(format!("{}: {}", status, body))
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Balance indexer over HTTP.
///
/// `GET {base}/balances/{address}` returning
/// `{"ledgers": {"<id>": {"native": "..", "settlement": "..", "native_value": ".."}}}`.
pub struct HttpBalanceAggregator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct BalancesResponse {
    ledgers: BalanceSnapshot,
}

impl HttpBalanceAggregator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl BalanceAggregator for HttpBalanceAggregator {
    async fn scan(&self, address: &str) -> Result<BalanceSnapshot, AdapterError> {
        let url = format!("{}/balances/{}", self.base_url, address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }

        let parsed: BalancesResponse = response.json().await.map_err(map_request_error)?;
        debug!(address = %address, ledgers = parsed.ledgers.len(), "Balances scanned");
        Ok(parsed.ledgers)
    }
}

/// Attestation provider over HTTP.
///
/// `GET {base}/v1/messages/{source_ledger}?transactionHash={burn_tx}`; a 404 or
/// a message whose status is not `complete` means "not yet".
pub struct HttpAttestationApi {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<AttestationMessage>,
}

#[derive(Deserialize)]
struct AttestationMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attestation: Option<String>,
    status: String,
}

impl HttpAttestationApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl AttestationApi for HttpAttestationApi {
    async fn fetch(
        &self,
        source_ledger: &LedgerId,
        burn_tx: &str,
    ) -> Result<Option<Attestation>, AdapterError> {
        let url = format!("{}/v1/messages/{}", self.base_url, source_ledger);
        let response = self
            .client
            .get(&url)
            .query(&[("transactionHash", burn_tx)])
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }

        let parsed: MessagesResponse = response.json().await.map_err(map_request_error)?;
        let Some(first) = parsed.messages.into_iter().next() else {
            return Ok(None);
        };
        if first.status != "complete" {
            debug!(burn_tx = %burn_tx, status = %first.status, "Attestation pending");
            return Ok(None);
        }
        match (first.message, first.attestation) {
            (Some(message), Some(signature)) => Ok(Some(Attestation { message, signature })),
            _ => Err(AdapterError::InvalidResponse(
                "complete attestation without message or signature".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_scan_parses_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/balances/0xabc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ledgers": {
                    "base": { "settlement": "30" },
                    "arbitrum": { "native": "0.02", "native_value": "61.5" }
                }
            })))
            .mount(&server)
            .await;

        let aggregator = HttpBalanceAggregator::new(&server.uri(), timeout()).unwrap();
        let snapshot = aggregator.scan("0xabc").await.unwrap();

        let base = &snapshot[&LedgerId::from("base")];
        assert_eq!(base.settlement, dec!(30));
        assert_eq!(base.native, dec!(0));
        let arb = &snapshot[&LedgerId::from("arbitrum")];
        assert_eq!(arb.native, dec!(0.02));
        assert_eq!(arb.native_value, Some(dec!(61.5)));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/balances/0xlimited"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/balances/0xdown"))
            .respond_with(ResponseTemplate::new(503).set_body_string("indexer syncing"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/balances/0xbad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad address"))
            .mount(&server)
            .await;

        let aggregator = HttpBalanceAggregator::new(&server.uri(), timeout()).unwrap();
        assert_eq!(
            aggregator.scan("0xlimited").await.unwrap_err(),
            AdapterError::RateLimited("slow down".into())
        );
        let down = aggregator.scan("0xdown").await.unwrap_err();
        assert!(down.is_transient());
        assert!(down.to_string().contains("indexer syncing"));
        assert!(matches!(
            aggregator.scan("0xbad").await,
            Err(AdapterError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_attestation_pending_then_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/messages/arbitrum"))
            .and(query_param("transactionHash", "0xpending"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{ "status": "pending_confirmations" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/messages/arbitrum"))
            .and(query_param("transactionHash", "0xdone"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{ "status": "complete", "message": "0xmsg", "attestation": "0xsig" }]
            })))
            .mount(&server)
            .await;

        let api = HttpAttestationApi::new(&server.uri(), timeout()).unwrap();
        let arbitrum = LedgerId::from("arbitrum");
        assert_eq!(api.fetch(&arbitrum, "0xpending").await.unwrap(), None);
        assert_eq!(
            api.fetch(&arbitrum, "0xdone").await.unwrap(),
            Some(Attestation {
                message: "0xmsg".into(),
                signature: "0xsig".into()
            })
        );
    }

    #[tokio::test]
    async fn test_attestation_not_found_is_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = HttpAttestationApi::new(&server.uri(), timeout()).unwrap();
        assert_eq!(
            api.fetch(&LedgerId::from("arbitrum"), "0xunknown").await.unwrap(),
            None
        );
    }
}
