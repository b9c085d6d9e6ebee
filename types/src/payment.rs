//! Vendor-agnostic payment gateway payloads and phone handling.

use crate::Amount;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Gateway result code meaning success.
pub const RESULT_SUCCESS: i32 = 0;

/// Inbound callback from the payment gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCallback {
    pub correlation_id: String,
    pub result_code: i32,
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub receipt_ref: Option<String>,
    #[serde(default)]
    pub result_desc: Option<String>,
}

impl GatewayCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == RESULT_SUCCESS
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("invalid phone number format: {0}")]
    InvalidFormat(String),
}

/// Normalize a Kenyan mobile number to `254XXXXXXXXX`.
///
/// Accepts `07..`/`01..`, `2547..`/`2541..` and the `+254` form, ignoring
/// spaces and dashes.
pub fn normalize_phone(raw: &str) -> Result<String, PhoneError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if cleaned.is_empty() {
        return Err(PhoneError::Empty);
    }
    let subscriber = if let Some(rest) = cleaned.strip_prefix("+254") {
        rest
    } else if let Some(rest) = cleaned.strip_prefix("254") {
        rest
    } else if let Some(rest) = cleaned.strip_prefix('0') {
        rest
    } else {
        return Err(PhoneError::InvalidFormat(raw.to_string()));
    };
    let valid = subscriber.len() == 9
        && subscriber.bytes().all(|b| b.is_ascii_digit())
        && matches!(subscriber.as_bytes()[0], b'7' | b'1');
    if !valid {
        return Err(PhoneError::InvalidFormat(raw.to_string()));
    }
    Ok(format!("254{subscriber}"))
}
