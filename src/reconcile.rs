//! Payment reconciliation: memo scanning, webhook transfer extraction, and
//! the auto-match algorithm.
//!
//! Delivery is at-least-once and unordered, so nothing here depends on
//! ordering: correctness rests on the tx-hash dedup at ingestion and on the
//! invoice-state guards re-checked inside the store transaction. When the
//! fallback amount+window search does not produce exactly one candidate, the
//! payment is left unmatched for an operator to adjudicate, never guessed.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::records::{InvoiceStatus, PaymentRecord, TopupInvoice, UsageMeta, normalize_amount};
use crate::store::{LedgerStore, StoreError};
use crate::topup::MEMO_PREFIX;

/// How many fallback candidates to fetch; more than one is already ambiguous.
const CANDIDATE_FETCH_LIMIT: usize = 5;

fn memo_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(&format!(r"{MEMO_PREFIX}:(inv_[A-Za-z0-9_-]{{6,}})"))
            .expect("memo regex is valid")
    })
}

/// Best-effort scan of an opaque webhook payload for our memo pattern.
pub fn extract_invoice_ref(raw: &Value) -> Option<String> {
    let serialized = serde_json::to_string(raw).ok()?;
    memo_regex()
        .captures(&serialized)
        .map(|captures| captures[1].to_string())
}

/// One token transfer pulled out of a webhook delivery. Transfers missing
/// any of these fields are dropped before anything is recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferObservation {
    pub mint: String,
    pub to_address: String,
    pub tx_hash: String,
    /// Normalized decimal string.
    pub amount: String,
}

/// Pull token transfers out of an indexer delivery, which may be a single
/// event or an array of events. Field names vary across indexer versions,
/// hence the fallback chains.
pub fn extract_transfers(payload: &Value) -> Vec<TransferObservation> {
    let events: Vec<&Value> = match payload {
        Value::Array(events) => events.iter().collect(),
        other => vec![other],
    };

    let mut transfers = Vec::new();
    for event in events {
        let Some(event) = event.as_object() else {
            continue;
        };
        let Some(token_transfers) = event.get("tokenTransfers").and_then(Value::as_array) else {
            continue;
        };

        for transfer in token_transfers {
            let Some(transfer) = transfer.as_object() else {
                continue;
            };

            let mint = first_string(transfer, &["mint", "tokenMint", "tokenAddress"]);
            let to_address = first_string(
                transfer,
                &["toUserAccount", "toTokenAccount", "toAccount", "destination", "to"],
            );
            let tx_hash = first_string(event, &["signature", "transactionSignature", "txHash"])
                .or_else(|| first_string(transfer, &["txHash"]));
            let amount = transfer_amount(transfer);

            match (mint, to_address, tx_hash, amount) {
                (Some(mint), Some(to_address), Some(tx_hash), Some(amount)) => {
                    transfers.push(TransferObservation {
                        mint,
                        to_address,
                        tx_hash,
                        amount: normalize_amount(&amount),
                    });
                }
                _ => {
                    tracing::debug!("skipping transfer with missing fields");
                }
            }
        }
    }
    transfers
}

fn first_string(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| obj.get(*key))
        .and_then(value_to_string)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn transfer_amount(transfer: &serde_json::Map<String, Value>) -> Option<String> {
    if let Some(token_amount) = transfer.get("tokenAmount") {
        match token_amount {
            Value::Object(fields) => {
                if let Some(amount) =
                    first_string(fields, &["uiAmountString", "uiAmount", "amount"])
                {
                    return Some(amount);
                }
            }
            Value::Number(n) => return Some(n.to_string()),
            _ => {}
        }
    }
    first_string(transfer, &["amount", "uiAmount", "uiAmountString"])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// Zero or several pending invoices fit; requires operator adjudication.
    AmbiguousOrMissingInvoice,
    InvoiceNotPending,
    InvoiceAlreadyHasTx,
}

#[derive(Clone, Debug)]
pub enum MatchOutcome {
    Matched {
        invoice_ref: String,
        balance: i64,
        /// True when this payment had already settled the invoice earlier.
        already_matched: bool,
    },
    Unmatched { reason: UnmatchedReason },
}

impl MatchOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// Try to settle a stored payment against a pending invoice.
///
/// Resolution order: already-matched short circuit, then the memo-derived
/// invoice hint, then the exact `{chain, asset, amount}` search within the
/// recency window. The confirm+credit+match triple itself runs inside the
/// store; its guards are authoritative under concurrency.
pub async fn match_and_credit(
    store: &dyn LedgerStore,
    payment: &PaymentRecord,
    window_ms: i64,
    now_ms: i64,
    meta: UsageMeta,
) -> Result<MatchOutcome, StoreError> {
    use crate::records::PaymentStatus;

    if payment.status == PaymentStatus::Matched {
        if let Some(invoice_ref) = &payment.invoice_ref {
            return Ok(MatchOutcome::Matched {
                invoice_ref: invoice_ref.clone(),
                balance: balance_for_invoice(store, invoice_ref).await?,
                already_matched: true,
            });
        }
    }

    let mut invoice: Option<TopupInvoice> = None;
    if let Some(hint) = &payment.invoice_ref {
        invoice = store.invoice_by_ref(hint).await?;
    }

    let invoice = match invoice {
        Some(invoice) => invoice,
        None => {
            let since_ms = now_ms.saturating_sub(window_ms);
            let mut candidates = store
                .pending_invoices_matching(
                    &payment.chain,
                    &payment.asset,
                    &normalize_amount(&payment.amount),
                    since_ms,
                    CANDIDATE_FETCH_LIMIT,
                )
                .await?;
            if candidates.len() != 1 {
                tracing::info!(
                    tx_hash = %payment.tx_hash,
                    candidates = candidates.len(),
                    "payment left unmatched: fallback search was not unique"
                );
                return Ok(MatchOutcome::Unmatched {
                    reason: UnmatchedReason::AmbiguousOrMissingInvoice,
                });
            }
            candidates.remove(0)
        }
    };

    if invoice.status != InvoiceStatus::Pending {
        return Ok(MatchOutcome::Unmatched {
            reason: UnmatchedReason::InvoiceNotPending,
        });
    }
    if invoice.tx_hash.is_some() {
        return Ok(MatchOutcome::Unmatched {
            reason: UnmatchedReason::InvoiceAlreadyHasTx,
        });
    }

    match store
        .confirm_and_credit(&invoice.invoice_ref, &payment.tx_hash, meta)
        .await
    {
        Ok(outcome) => {
            if outcome.already_confirmed
                && outcome.invoice.tx_hash.as_deref() != Some(payment.tx_hash.as_str())
            {
                // Lost a race against a different transaction.
                return Ok(MatchOutcome::Unmatched {
                    reason: UnmatchedReason::InvoiceNotPending,
                });
            }
            tracing::info!(
                invoice_ref = %outcome.invoice.invoice_ref,
                tx_hash = %payment.tx_hash,
                credits = outcome.invoice.credits,
                "payment matched and credited"
            );
            Ok(MatchOutcome::Matched {
                invoice_ref: outcome.invoice.invoice_ref,
                balance: outcome.balance,
                already_matched: outcome.already_confirmed,
            })
        }
        Err(StoreError::InvoiceNotPending(_)) => Ok(MatchOutcome::Unmatched {
            reason: UnmatchedReason::InvoiceNotPending,
        }),
        Err(StoreError::InvoiceAlreadyHasTx(_)) => Ok(MatchOutcome::Unmatched {
            reason: UnmatchedReason::InvoiceAlreadyHasTx,
        }),
        Err(err) => Err(err),
    }
}

async fn balance_for_invoice(
    store: &dyn LedgerStore,
    invoice_ref: &str,
) -> Result<i64, StoreError> {
    let Some(invoice) = store.invoice_by_ref(invoice_ref).await? else {
        return Ok(0);
    };
    Ok(store
        .account_by_id(&invoice.account_id)
        .await?
        .map(|account| account.credits)
        .unwrap_or(0))
}
