//! Zapupi UPI gateway client
//!
//! Form-encoded POSTs authenticated by `token_key` / `secret_key`. Both
//! endpoints answer `{"status": "success" | "error", ...}`; anything that
//! is not JSON or lacks that envelope is treated as malformed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CreateOrder, GatewayError, PaymentGateway, RemoteState, StatusReport};

pub const DEFAULT_BASE_URL: &str = "https://api.zapupi.com";
const DEFAULT_MOBILE: &str = "9999999999";

#[derive(Debug, Clone)]
pub struct ZapupiConfig {
    pub base_url: String,
    pub token_key: String,
    pub secret_key: String,
    pub timeout: Duration,
}

pub struct ZapupiGateway {
    client: Client,
    config: ZapupiConfig,
}

impl ZapupiGateway {
    pub fn new(config: ZapupiConfig) -> Result<Self> {
        if config.token_key.is_empty() || config.secret_key.is_empty() {
            anyhow::bail!("Zapupi token_key and secret_key are required");
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build Zapupi HTTP client")?;
        Ok(Self { client, config })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    async fn post_form(
        &self,
        endpoint: &str,
        fields: &[(&str, String)],
    ) -> std::result::Result<Value, GatewayError> {
        let mut form: Vec<(&str, String)> = vec![
            ("token_key", self.config.token_key.clone()),
            ("secret_key", self.config.secret_key.clone()),
        ];
        form.extend(fields.iter().cloned());

        let response = self
            .client
            .post(self.url(endpoint))
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let http_status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        debug!(endpoint, %http_status, "Zapupi raw: {}", text);

        if http_status.is_server_error() {
            return Err(GatewayError::Transport(format!("HTTP {http_status}")));
        }
        serde_json::from_str(&text).map_err(|_| GatewayError::Malformed(truncate(&text)))
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(200).collect()
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub(crate) fn parse_create_response(body: Value) -> std::result::Result<Value, GatewayError> {
    match body.get("status").and_then(Value::as_str) {
        Some("success") => Ok(body),
        Some(_) => Err(GatewayError::Rejected(
            string_field(&body, &["message", "msg", "error"]).unwrap_or_else(|| body.to_string()),
        )),
        None => Err(GatewayError::Malformed(truncate(&body.to_string()))),
    }
}

pub(crate) fn parse_status_response(body: &Value) -> std::result::Result<StatusReport, GatewayError> {
    match body.get("status").and_then(Value::as_str) {
        Some("success") => {}
        Some(_) => {
            return Err(GatewayError::Rejected(
                string_field(body, &["message", "msg", "error"]).unwrap_or_else(|| body.to_string()),
            ))
        }
        None => return Err(GatewayError::Malformed(truncate(&body.to_string()))),
    }

    let data = body.get("data").unwrap_or(body);
    let Some(word) = string_field(data, &["order_status", "status", "txn_status"]) else {
        return Err(GatewayError::Malformed("order status missing".to_string()));
    };
    Ok(StatusReport {
        state: RemoteState::from_word(&word),
        txn_id: string_field(data, &["txn_id", "transaction_id", "txnid"]),
        utr: string_field(data, &["utr", "UTR", "bank_ref"]),
    })
}

#[async_trait]
impl PaymentGateway for ZapupiGateway {
    fn name(&self) -> &'static str {
        "zapupi"
    }

    async fn create_order(&self, order: &CreateOrder) -> std::result::Result<Value, GatewayError> {
        let body = self
            .post_form(
                "create-order",
                &[
                    ("amount", order.amount.to_string()),
                    ("order_id", order.order_id.clone()),
                    (
                        "customer_mobile",
                        order
                            .customer_mobile
                            .clone()
                            .unwrap_or_else(|| DEFAULT_MOBILE.to_string()),
                    ),
                    ("remark", order.remark.clone()),
                ],
            )
            .await?;
        parse_create_response(body).map_err(|e| {
            warn!(order_id = %order.order_id, "Zapupi create-order failed: {}", e);
            e
        })
    }

    async fn order_status(&self, order_id: &str) -> std::result::Result<StatusReport, GatewayError> {
        let body = self
            .post_form("order-status", &[("order_id", order_id.to_string())])
            .await?;
        parse_status_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_response_envelope() {
        let ok = json!({"status": "success", "payment_url": "upi://pay?x"});
        assert_eq!(parse_create_response(ok.clone()).unwrap(), ok);

        let rejected = json!({"status": "error", "message": "invalid token"});
        assert!(matches!(
            parse_create_response(rejected),
            Err(GatewayError::Rejected(m)) if m == "invalid token"
        ));

        assert!(matches!(
            parse_create_response(json!({"ok": true})),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn test_status_response_reads_nested_data() {
        let body = json!({
            "status": "success",
            "data": {"order_status": "Success", "txn_id": "T1", "utr": 4321}
        });
        let report = parse_status_response(&body).unwrap();
        assert_eq!(report.state, RemoteState::Success);
        assert_eq!(report.txn_id.as_deref(), Some("T1"));
        assert_eq!(report.utr.as_deref(), Some("4321"));

        let pending = json!({"status": "success", "data": {"status": "Created"}});
        assert_eq!(
            parse_status_response(&pending).unwrap().state,
            RemoteState::Pending
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = ZapupiConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_key: String::new(),
            secret_key: "s".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(ZapupiGateway::new(config).is_err());
    }
}
