//! Outbound side of the payment gateway.
//!
//! The gateway answers a request with a correlation id right away; the
//! actual result arrives later on `/callbacks/payment`.

use crate::config::ValidatedGateway;
use aviator_types::Amount;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error as ThisError;
use tracing::debug;
use url::Url;
use uuid::Uuid;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway refused the request (status {status})")]
    Refused { status: u16 },
    #[error("gateway response had no correlation id")]
    MissingCorrelation,
    #[error("invalid gateway URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("gateway unavailable")]
    Unavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Deposit,
    Payout,
}

/// What the service asks the gateway to do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Normalized `254XXXXXXXXX`.
    pub phone_number: String,
    pub amount: Amount,
    /// Our own reference, shown on the player's statement.
    pub reference: String,
}

pub trait PaymentGateway: Send + Sync + 'static {
    /// Start an STK push. Returns the gateway's id for it. The callback may
    /// carry that id or `request.reference`, and may arrive before this returns.
    fn request_deposit<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>>;

    /// Send money to the player. Returns the gateway's id, as for deposits.
    fn request_payout<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundPayload<'a> {
    #[serde(flatten)]
    request: &'a PaymentRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayReply {
    correlation_id: Option<String>,
}

/// Vendor-agnostic JSON client.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    callback_url: Option<Url>,
}

impl HttpGateway {
    pub fn new(
        base_url: Url,
        api_key: Option<String>,
        callback_url: Option<Url>,
        timeout: std::time::Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            callback_url,
        })
    }

    pub fn from_config(config: &ValidatedGateway) -> Result<Option<Self>, GatewayError> {
        config
            .base_url
            .clone()
            .map(|base_url| {
                Self::new(
                    base_url,
                    config.api_key.clone(),
                    config.callback_url.clone(),
                    config.timeout,
                )
            })
            .transpose()
    }

    fn endpoint(&self, kind: PaymentKind) -> Result<Url, GatewayError> {
        let path = match kind {
            PaymentKind::Deposit => "deposits",
            PaymentKind::Payout => "payouts",
        };
        // `join` drops the last segment unless the base ends with a slash.
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(base.join(path)?)
    }

    async fn send(&self, kind: PaymentKind, request: &PaymentRequest) -> Result<String, GatewayError> {
        let url = self.endpoint(kind)?;
        let payload = OutboundPayload {
            request,
            callback_url: self.callback_url.as_ref().map(Url::as_str),
        };
        let mut builder = self.client.post(url).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Refused {
                status: status.as_u16(),
            });
        }
        let reply: GatewayReply = response.json().await?;
        let correlation_id = reply
            .correlation_id
            .filter(|id| !id.is_empty())
            .ok_or(GatewayError::MissingCorrelation)?;
        debug!(?kind, reference = %request.reference, correlation = %correlation_id, "gateway accepted request");
        Ok(correlation_id)
    }
}

impl PaymentGateway for HttpGateway {
    fn request_deposit<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>> {
        self.send(PaymentKind::Deposit, request).boxed()
    }

    fn request_payout<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>> {
        self.send(PaymentKind::Payout, request).boxed()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxRequest {
    pub kind: PaymentKind,
    pub request: PaymentRequest,
    pub correlation_id: String,
}

/// Local stand-in for demo mode: issues correlation ids and remembers what
/// was asked. Results are posted to the callback route by hand.
#[derive(Default)]
pub struct SandboxGateway {
    issued: Mutex<Vec<SandboxRequest>>,
    failing: AtomicBool,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following request fail as if the vendor were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<SandboxRequest> {
        self.issued
            .lock()
            .map(|issued| issued.clone())
            .unwrap_or_default()
    }

    fn issue(&self, kind: PaymentKind, request: &PaymentRequest) -> Result<String, GatewayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable);
        }
        let correlation_id = format!("sbx-{}", Uuid::new_v4());
        let mut issued = self.issued.lock().map_err(|_| GatewayError::Unavailable)?;
        issued.push(SandboxRequest {
            kind,
            request: request.clone(),
            correlation_id: correlation_id.clone(),
        });
        Ok(correlation_id)
    }
}

impl PaymentGateway for SandboxGateway {
    fn request_deposit<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>> {
        futures_util::future::ready(self.issue(PaymentKind::Deposit, request)).boxed()
    }

    fn request_payout<'a>(&'a self, request: &'a PaymentRequest) -> BoxFuture<'a, Result<String, GatewayError>> {
        futures_util::future::ready(self.issue(PaymentKind::Payout, request)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> PaymentRequest {
        PaymentRequest {
            phone_number: "254712345678".to_string(),
            amount: 500,
            reference: "acct-alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sandbox_issues_unique_ids() {
        let gateway = SandboxGateway::new();
        let a = gateway.request_deposit(&request()).await.unwrap();
        let b = gateway.request_payout(&request()).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("sbx-"));
        let issued = gateway.issued();
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0].kind, PaymentKind::Deposit);
        assert_eq!(issued[1].kind, PaymentKind::Payout);
        assert_eq!(issued[1].correlation_id, b);
    }

    #[tokio::test]
    async fn test_sandbox_failure_switch() {
        let gateway = SandboxGateway::new();
        gateway.set_failing(true);
        assert!(matches!(
            gateway.request_payout(&request()).await,
            Err(GatewayError::Unavailable)
        ));
        assert!(gateway.issued().is_empty());
    }

    #[test]
    fn test_http_endpoints_extend_base_path() {
        let gateway = HttpGateway::new(
            Url::parse("https://pay.example.com/v1").unwrap(),
            None,
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            gateway.endpoint(PaymentKind::Deposit).unwrap().as_str(),
            "https://pay.example.com/v1/deposits"
        );
        assert_eq!(
            gateway.endpoint(PaymentKind::Payout).unwrap().as_str(),
            "https://pay.example.com/v1/payouts"
        );
    }

    #[test]
    fn test_outbound_payload_shape() {
        let request = request();
        let payload = serde_json::to_value(OutboundPayload {
            request: &request,
            callback_url: Some("https://game.example.com/callbacks/payment"),
        })
        .unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "phoneNumber": "254712345678",
                "amount": 500,
                "reference": "acct-alice",
                "callbackUrl": "https://game.example.com/callbacks/payment"
            })
        );
    }
}
