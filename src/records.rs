//! Persisted record types shared by the storage backends.

use serde::{Deserialize, Serialize};

/// A billable account. The `credits` balance is the source of truth;
/// the usage log is a bounded audit trail.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    /// SHA-256 hex of the plaintext API key. The plaintext is never stored.
    pub key_hash: String,
    pub credits: i64,
    pub disabled: bool,
    pub created_at_ms: i64,
    pub last_used_at_ms: Option<i64>,
}

impl std::fmt::Debug for AccountRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("key_hash", &"<redacted>")
            .field("credits", &self.credits)
            .field("disabled", &self.disabled)
            .field("created_at_ms", &self.created_at_ms)
            .field("last_used_at_ms", &self.last_used_at_ms)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageKind {
    #[serde(rename = "CHARGE")]
    Charge,
    #[serde(rename = "TOPUP")]
    Topup,
}

/// Append-only usage event. Positive `cost` is a charge, negative a credit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: i64,
    pub ts_ms: i64,
    pub account_id: String,
    pub cost: i64,
    pub kind: UsageKind,
    pub meta: UsageMeta,
}

/// Free-form metadata attached to a usage event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_chars: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixels: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "CONFIRMED")]
    Confirmed,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Confirmed => "CONFIRMED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(InvoiceStatus::Pending),
            "CONFIRMED" => Some(InvoiceStatus::Confirmed),
            _ => None,
        }
    }
}

/// A pending top-up request. Transitions PENDING -> CONFIRMED exactly once,
/// only through the reconciliation transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopupInvoice {
    pub invoice_ref: String,
    pub account_id: String,
    pub chain: String,
    pub asset: String,
    /// Requested amount as a normalized decimal string.
    pub units: String,
    pub credits: i64,
    pub memo: String,
    pub status: InvoiceStatus,
    pub tx_hash: Option<String>,
    pub created_at_ms: i64,
    pub confirmed_at_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[serde(rename = "UNMATCHED")]
    Unmatched,
    #[serde(rename = "MATCHED")]
    Matched,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unmatched => "UNMATCHED",
            PaymentStatus::Matched => "MATCHED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "UNMATCHED" => Some(PaymentStatus::Unmatched),
            "MATCHED" => Some(PaymentStatus::Matched),
            _ => None,
        }
    }
}

/// An externally observed transfer, keyed by its transaction hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub tx_hash: String,
    pub chain: String,
    pub asset: String,
    pub mint: String,
    pub to_address: String,
    /// Transfer amount as a normalized decimal string.
    pub amount: String,
    pub invoice_ref: Option<String>,
    pub raw: serde_json::Value,
    pub status: PaymentStatus,
    pub created_at_ms: i64,
}

/// Canonical form for decimal amount strings so that "5", "5.0" and "5.00"
/// settle the same invoice.
pub fn normalize_amount(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.contains('.') {
        return trimmed.to_string();
    }
    let stripped = trimmed.trim_end_matches('0').trim_end_matches('.');
    if stripped.is_empty() || stripped == "-" {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}
