//! Top-up invoices: pricing, construction, account-scoped lookup rules.
//!
//! The memo embedded in every invoice is the designed correlation key for
//! incoming payments; the fallback matching heuristic in `reconcile` only
//! exists for counterparties that cannot carry memos.

use serde::Serialize;
use thiserror::Error;

use crate::keys::{self, RandomnessError};
use crate::records::{InvoiceStatus, TopupInvoice, normalize_amount};

/// Prefix carried in transfer memos: `BRIEFMETER:<invoiceRef>`.
pub const MEMO_PREFIX: &str = "BRIEFMETER";

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("top-up below minimum of {min_units} units")]
    BelowMinimum { min_units: f64 },
    #[error(transparent)]
    Randomness(#[from] RandomnessError),
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct Pricing {
    pub credits_per_unit: i64,
    pub min_units: f64,
}

/// Deposit instructions returned alongside a fresh invoice.
#[derive(Clone, Debug, Serialize)]
pub struct PayTo {
    pub address: String,
    pub chain: String,
    pub asset: String,
}

/// Build a PENDING invoice for `units` of `asset` on `chain`.
///
/// Credits are floor(units * credits_per_unit); the invoice ref is freshly
/// generated and embedded in the memo.
pub fn build_invoice(
    pricing: Pricing,
    account_id: &str,
    asset: &str,
    chain: &str,
    units: f64,
    now_ms: i64,
) -> Result<TopupInvoice, InvoiceError> {
    if !units.is_finite() || units < pricing.min_units {
        return Err(InvoiceError::BelowMinimum {
            min_units: pricing.min_units,
        });
    }

    let invoice_ref = keys::new_id("inv_", 9)?;
    let memo = format!("{MEMO_PREFIX}:{invoice_ref}");
    let credits = (units * pricing.credits_per_unit as f64).floor() as i64;

    Ok(TopupInvoice {
        invoice_ref,
        account_id: account_id.to_string(),
        chain: chain.to_ascii_uppercase(),
        asset: asset.to_ascii_uppercase(),
        units: normalize_amount(&units.to_string()),
        credits,
        memo,
        status: InvoiceStatus::Pending,
        tx_hash: None,
        created_at_ms: now_ms,
        confirmed_at_ms: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRICING: Pricing = Pricing {
        credits_per_unit: 100,
        min_units: 5.0,
    };

    #[test]
    fn five_units_at_one_hundred_is_five_hundred_credits() {
        let invoice = build_invoice(PRICING, "a1", "usdc", "sol", 5.0, 42).expect("invoice");
        assert_eq!(invoice.credits, 500);
        assert_eq!(invoice.units, "5");
        assert_eq!(invoice.asset, "USDC");
        assert_eq!(invoice.chain, "SOL");
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.memo, format!("BRIEFMETER:{}", invoice.invoice_ref));
        assert!(invoice.invoice_ref.starts_with("inv_"));
        assert_eq!(invoice.created_at_ms, 42);
    }

    #[test]
    fn fractional_units_floor_the_credits() {
        let invoice = build_invoice(PRICING, "a1", "USDT", "SOL", 5.499, 0).expect("invoice");
        assert_eq!(invoice.credits, 549);
        assert_eq!(invoice.units, "5.499");
    }

    #[test]
    fn below_minimum_is_rejected() {
        let err = build_invoice(PRICING, "a1", "USDC", "SOL", 4.99, 0);
        assert!(matches!(
            err,
            Err(InvoiceError::BelowMinimum { min_units }) if min_units == 5.0
        ));
        assert!(build_invoice(PRICING, "a1", "USDC", "SOL", f64::NAN, 0).is_err());
    }
}
