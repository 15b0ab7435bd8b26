//! Storage layer: one contract, two backends.
//!
//! Every mutation that reads state before writing it (charge, credit, the
//! confirm+credit+match triple, payment dedup) executes atomically inside the
//! backend (a SQLite transaction or a held state-file mutex), so no caller
//! ever observes a balance or invoice status mid-update. Unique constraints
//! (`key_hash`, `invoice_ref`, `tx_hash`) are enforced by the backend itself,
//! not by check-then-act in callers.

pub mod sqlite;
pub mod state_file;

use async_trait::async_trait;
use thiserror::Error;

use crate::records::{
    AccountRecord, PaymentRecord, TopupInvoice, UsageEvent, UsageMeta,
};

pub use sqlite::SqliteLedgerStore;
pub use state_file::StateFileLedgerStore;

/// Usage log bound: once it exceeds [`USAGE_LOG_CAP`] events, only the most
/// recent [`USAGE_LOG_KEEP`] survive. A diagnostic trail, not the balance
/// source of truth.
pub const USAGE_LOG_CAP: usize = 5000;
pub const USAGE_LOG_KEEP: usize = 2000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown or disabled account")]
    InvalidAccount,
    #[error("insufficient credits: balance={balance}")]
    InsufficientCredits { balance: i64 },
    #[error("account already exists: {0}")]
    DuplicateAccount(String),
    #[error("invoice not found: {0}")]
    InvoiceNotFound(String),
    #[error("invoice already exists: {0}")]
    DuplicateInvoice(String),
    #[error("invoice is not pending: {0}")]
    InvoiceNotPending(String),
    #[error("invoice already linked to a transaction: {0}")]
    InvoiceAlreadyHasTx(String),
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("state file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct NewAccount {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub credits: i64,
}

#[derive(Clone, Debug)]
pub struct NewPayment {
    pub tx_hash: String,
    pub chain: String,
    pub asset: String,
    pub mint: String,
    pub to_address: String,
    /// Normalized decimal string.
    pub amount: String,
    pub invoice_ref_hint: Option<String>,
    pub raw: serde_json::Value,
}

/// Result of the atomic confirm+credit+match transaction.
#[derive(Clone, Debug)]
pub struct ConfirmOutcome {
    pub invoice: TopupInvoice,
    /// Account balance after crediting (or the current balance when the
    /// invoice was already confirmed).
    pub balance: i64,
    /// True when the invoice was already CONFIRMED and nothing was credited.
    pub already_confirmed: bool,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_account(&self, new: NewAccount) -> Result<AccountRecord, StoreError>;

    async fn account_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<AccountRecord>, StoreError>;

    async fn account_by_id(&self, id: &str) -> Result<Option<AccountRecord>, StoreError>;

    async fn set_account_disabled(&self, id: &str, disabled: bool) -> Result<(), StoreError>;

    /// Atomically debit `cost` and append a usage event. Fails without
    /// mutation on unknown/disabled accounts or insufficient balance.
    /// Returns the balance after the debit.
    async fn charge(
        &self,
        account_id: &str,
        cost: i64,
        meta: UsageMeta,
    ) -> Result<i64, StoreError>;

    /// Atomically credit `amount` (recorded as a negative-cost event).
    /// Returns the balance after the credit.
    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        meta: UsageMeta,
    ) -> Result<i64, StoreError>;

    /// Most recent usage events for an account, newest first.
    async fn list_usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEvent>, StoreError>;

    async fn insert_invoice(&self, invoice: TopupInvoice) -> Result<(), StoreError>;

    async fn invoice_by_ref(
        &self,
        invoice_ref: &str,
    ) -> Result<Option<TopupInvoice>, StoreError>;

    /// PENDING invoices with the given chain/asset and normalized amount,
    /// created at or after `since_ms`, oldest first, at most `limit`.
    async fn pending_invoices_matching(
        &self,
        chain: &str,
        asset: &str,
        amount: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<TopupInvoice>, StoreError>;

    /// Idempotent insert keyed by `tx_hash`. Returns the stored payment and
    /// whether this observation was a duplicate (in which case nothing was
    /// written).
    async fn insert_payment(
        &self,
        payment: NewPayment,
    ) -> Result<(PaymentRecord, bool), StoreError>;

    async fn payment_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<PaymentRecord>, StoreError>;

    /// Attach an invoice hint to a stored payment (admin match path).
    async fn set_payment_invoice_ref(
        &self,
        tx_hash: &str,
        invoice_ref: &str,
    ) -> Result<(), StoreError>;

    /// The reconciliation transaction: mark the invoice CONFIRMED with
    /// `tx_hash`, credit the owning account by the invoice's credit amount,
    /// append the top-up usage event, and mark any stored payment with that
    /// hash MATCHED, all together or not at all.
    ///
    /// An already-CONFIRMED invoice yields `already_confirmed=true` with no
    /// further mutation. A PENDING invoice that already carries a different
    /// transaction hash fails with [`StoreError::InvoiceAlreadyHasTx`].
    async fn confirm_and_credit(
        &self,
        invoice_ref: &str,
        tx_hash: &str,
        meta: UsageMeta,
    ) -> Result<ConfirmOutcome, StoreError>;
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
