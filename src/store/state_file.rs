//! JSON state-file ledger backend.
//!
//! A single async mutex serializes every operation, which gives the same
//! atomicity contract as the SQLite transactions: each mutation validates
//! against a working copy and only replaces the in-memory state after the
//! file write succeeds (tmp file, then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::records::{
    AccountRecord, InvoiceStatus, PaymentRecord, PaymentStatus, TopupInvoice, UsageEvent,
    UsageKind, UsageMeta,
};

use super::{
    ConfirmOutcome, LedgerStore, NewAccount, NewPayment, StoreError, USAGE_LOG_CAP,
    USAGE_LOG_KEEP, now_millis,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    #[serde(default)]
    accounts: BTreeMap<String, AccountRecord>,
    #[serde(default)]
    usage: Vec<UsageEvent>,
    #[serde(default)]
    invoices: BTreeMap<String, TopupInvoice>,
    #[serde(default)]
    payments: BTreeMap<String, PaymentRecord>,
    #[serde(default)]
    next_event_id: i64,
}

pub struct StateFileLedgerStore {
    path: PathBuf,
    state: Mutex<LedgerState>,
    usage_cap: usize,
    usage_keep: usize,
}

impl StateFileLedgerStore {
    /// Open the state file, creating an empty ledger if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LedgerState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
            usage_cap: USAGE_LOG_CAP,
            usage_keep: USAGE_LOG_KEEP,
        })
    }

    pub fn with_usage_bounds(mut self, cap: usize, keep: usize) -> Self {
        self.usage_cap = cap;
        self.usage_keep = keep.min(cap);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a mutation against a working copy; persist and adopt it only if
    /// the mutation succeeds.
    async fn mutate<T>(
        &self,
        work: impl FnOnce(&mut LedgerState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.state.lock().await;
        let mut working = guard.clone();
        let out = work(&mut working)?;
        persist(&self.path, &working).await?;
        *guard = working;
        Ok(out)
    }

    async fn read<T>(&self, work: impl FnOnce(&LedgerState) -> T) -> T {
        let guard = self.state.lock().await;
        work(&guard)
    }

}

fn prune_usage(state: &mut LedgerState, cap: usize, keep: usize) {
    if state.usage.len() > cap {
        let drop = state.usage.len() - keep;
        state.usage.drain(..drop);
    }
}

async fn persist(path: &Path, state: &LedgerState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let payload = serde_json::to_vec_pretty(state)?;
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &payload).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn append_usage(
    state: &mut LedgerState,
    ts_ms: i64,
    account_id: &str,
    cost: i64,
    kind: UsageKind,
    meta: UsageMeta,
) {
    state.next_event_id += 1;
    state.usage.push(UsageEvent {
        id: state.next_event_id,
        ts_ms,
        account_id: account_id.to_string(),
        cost,
        kind,
        meta,
    });
}

fn credit_in_state(
    state: &mut LedgerState,
    ts_ms: i64,
    account_id: &str,
    amount: i64,
    meta: UsageMeta,
) -> Result<i64, StoreError> {
    let account = state
        .accounts
        .get_mut(account_id)
        .filter(|account| !account.disabled)
        .ok_or(StoreError::InvalidAccount)?;
    account.credits += amount;
    let balance = account.credits;
    append_usage(state, ts_ms, account_id, -amount, UsageKind::Topup, meta);
    Ok(balance)
}

#[async_trait]
impl LedgerStore for StateFileLedgerStore {
    async fn create_account(&self, new: NewAccount) -> Result<AccountRecord, StoreError> {
        self.mutate(move |state| {
            if state.accounts.contains_key(&new.id)
                || state
                    .accounts
                    .values()
                    .any(|account| account.key_hash == new.key_hash)
            {
                return Err(StoreError::DuplicateAccount(new.id.clone()));
            }
            let record = AccountRecord {
                id: new.id.clone(),
                name: new.name,
                key_hash: new.key_hash,
                credits: new.credits,
                disabled: false,
                created_at_ms: now_millis(),
                last_used_at_ms: None,
            };
            state.accounts.insert(new.id, record.clone());
            Ok(record)
        })
        .await
    }

    async fn account_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self
            .read(|state| {
                state
                    .accounts
                    .values()
                    .find(|account| account.key_hash == key_hash)
                    .cloned()
            })
            .await)
    }

    async fn account_by_id(&self, id: &str) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self.read(|state| state.accounts.get(id).cloned()).await)
    }

    async fn set_account_disabled(&self, id: &str, disabled: bool) -> Result<(), StoreError> {
        let id = id.to_string();
        self.mutate(move |state| {
            let account = state
                .accounts
                .get_mut(&id)
                .ok_or(StoreError::InvalidAccount)?;
            account.disabled = disabled;
            Ok(())
        })
        .await
    }

    async fn charge(
        &self,
        account_id: &str,
        cost: i64,
        meta: UsageMeta,
    ) -> Result<i64, StoreError> {
        let account_id = account_id.to_string();
        let (cap, keep) = (self.usage_cap, self.usage_keep);
        self.mutate(move |state| {
            let ts_ms = now_millis();
            let account = state
                .accounts
                .get_mut(&account_id)
                .filter(|account| !account.disabled)
                .ok_or(StoreError::InvalidAccount)?;
            if account.credits < cost {
                return Err(StoreError::InsufficientCredits {
                    balance: account.credits,
                });
            }
            account.credits -= cost;
            account.last_used_at_ms = Some(ts_ms);
            let balance = account.credits;
            append_usage(state, ts_ms, &account_id, cost, UsageKind::Charge, meta);
            prune_usage(state, cap, keep);
            Ok(balance)
        })
        .await
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        meta: UsageMeta,
    ) -> Result<i64, StoreError> {
        let account_id = account_id.to_string();
        let (cap, keep) = (self.usage_cap, self.usage_keep);
        self.mutate(move |state| {
            let ts_ms = now_millis();
            let balance = credit_in_state(state, ts_ms, &account_id, amount.abs(), meta)?;
            prune_usage(state, cap, keep);
            Ok(balance)
        })
        .await
    }

    async fn list_usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        Ok(self
            .read(|state| {
                state
                    .usage
                    .iter()
                    .rev()
                    .filter(|event| event.account_id == account_id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn insert_invoice(&self, invoice: TopupInvoice) -> Result<(), StoreError> {
        self.mutate(move |state| {
            if state.invoices.contains_key(&invoice.invoice_ref) {
                return Err(StoreError::DuplicateInvoice(invoice.invoice_ref.clone()));
            }
            state
                .invoices
                .insert(invoice.invoice_ref.clone(), invoice);
            Ok(())
        })
        .await
    }

    async fn invoice_by_ref(
        &self,
        invoice_ref: &str,
    ) -> Result<Option<TopupInvoice>, StoreError> {
        Ok(self
            .read(|state| state.invoices.get(invoice_ref).cloned())
            .await)
    }

    async fn pending_invoices_matching(
        &self,
        chain: &str,
        asset: &str,
        amount: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<TopupInvoice>, StoreError> {
        Ok(self
            .read(|state| {
                let mut candidates: Vec<TopupInvoice> = state
                    .invoices
                    .values()
                    .filter(|invoice| {
                        invoice.status == InvoiceStatus::Pending
                            && invoice.chain == chain
                            && invoice.asset == asset
                            && invoice.units == amount
                            && invoice.created_at_ms >= since_ms
                    })
                    .cloned()
                    .collect();
                candidates.sort_by_key(|invoice| invoice.created_at_ms);
                candidates.truncate(limit);
                candidates
            })
            .await)
    }

    async fn insert_payment(
        &self,
        payment: NewPayment,
    ) -> Result<(PaymentRecord, bool), StoreError> {
        // Dedup reads and the insert happen under the same lock.
        let mut guard = self.state.lock().await;
        if let Some(existing) = guard.payments.get(&payment.tx_hash) {
            return Ok((existing.clone(), true));
        }
        let mut working = guard.clone();
        let record = PaymentRecord {
            tx_hash: payment.tx_hash.clone(),
            chain: payment.chain,
            asset: payment.asset,
            mint: payment.mint,
            to_address: payment.to_address,
            amount: payment.amount,
            invoice_ref: payment.invoice_ref_hint,
            raw: payment.raw,
            status: PaymentStatus::Unmatched,
            created_at_ms: now_millis(),
        };
        working.payments.insert(payment.tx_hash, record.clone());
        persist(&self.path, &working).await?;
        *guard = working;
        Ok((record, false))
    }

    async fn payment_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        Ok(self
            .read(|state| state.payments.get(tx_hash).cloned())
            .await)
    }

    async fn set_payment_invoice_ref(
        &self,
        tx_hash: &str,
        invoice_ref: &str,
    ) -> Result<(), StoreError> {
        let tx_hash = tx_hash.to_string();
        let invoice_ref = invoice_ref.to_string();
        self.mutate(move |state| {
            if let Some(payment) = state.payments.get_mut(&tx_hash) {
                payment.invoice_ref = Some(invoice_ref);
            }
            Ok(())
        })
        .await
    }

    async fn confirm_and_credit(
        &self,
        invoice_ref: &str,
        tx_hash: &str,
        meta: UsageMeta,
    ) -> Result<ConfirmOutcome, StoreError> {
        let invoice_ref = invoice_ref.to_string();
        let tx_hash = tx_hash.to_string();
        let usage_cap = self.usage_cap;
        let usage_keep = self.usage_keep;
        self.mutate(move |state| {
            let ts_ms = now_millis();
            let invoice = state
                .invoices
                .get(&invoice_ref)
                .cloned()
                .ok_or_else(|| StoreError::InvoiceNotFound(invoice_ref.clone()))?;

            if invoice.status == InvoiceStatus::Confirmed {
                let balance = state
                    .accounts
                    .get(&invoice.account_id)
                    .map(|account| account.credits)
                    .unwrap_or(0);
                return Ok(ConfirmOutcome {
                    invoice,
                    balance,
                    already_confirmed: true,
                });
            }
            if invoice.tx_hash.is_some() {
                return Err(StoreError::InvoiceAlreadyHasTx(invoice.invoice_ref));
            }

            let mut confirmed = invoice;
            confirmed.status = InvoiceStatus::Confirmed;
            confirmed.tx_hash = Some(tx_hash.clone());
            confirmed.confirmed_at_ms = Some(ts_ms);

            let mut meta = meta;
            meta.invoice_ref = Some(confirmed.invoice_ref.clone());
            meta.tx_hash = Some(tx_hash.clone());
            meta.chain = Some(confirmed.chain.clone());
            meta.asset = Some(confirmed.asset.clone());
            meta.units = Some(confirmed.units.clone());
            let balance =
                credit_in_state(state, ts_ms, &confirmed.account_id, confirmed.credits, meta)?;
            prune_usage(state, usage_cap, usage_keep);

            state
                .invoices
                .insert(confirmed.invoice_ref.clone(), confirmed.clone());
            if let Some(payment) = state.payments.get_mut(&tx_hash) {
                payment.status = PaymentStatus::Matched;
                payment.invoice_ref = Some(confirmed.invoice_ref.clone());
            }

            Ok(ConfirmOutcome {
                invoice: confirmed,
                balance,
                already_confirmed: false,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_account(id: &str, credits: i64) -> NewAccount {
        NewAccount {
            id: id.to_string(),
            name: "test".to_string(),
            key_hash: format!("hash-{id}"),
            credits,
        }
    }

    #[tokio::test]
    async fn charge_and_credit_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateFileLedgerStore::open(dir.path().join("ledger.json"))
            .await
            .expect("open");
        store
            .create_account(new_account("a1", 10))
            .await
            .expect("create");

        assert_eq!(
            store.charge("a1", 4, UsageMeta::default()).await.expect("charge"),
            6
        );
        assert_eq!(
            store.credit("a1", 100, UsageMeta::default()).await.expect("credit"),
            106
        );

        let events = store.list_usage("a1", 10).await.expect("usage");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].cost, -100);
        assert_eq!(events[1].cost, 4);
    }

    #[tokio::test]
    async fn failed_charge_does_not_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let store = StateFileLedgerStore::open(&path).await.expect("open");
        store
            .create_account(new_account("a1", 3))
            .await
            .expect("create");

        let err = store.charge("a1", 4, UsageMeta::default()).await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientCredits { balance: 3 })
        ));

        // Reload from disk: the balance and log are untouched.
        let reloaded = StateFileLedgerStore::open(&path).await.expect("reopen");
        let account = reloaded
            .account_by_id("a1")
            .await
            .expect("load")
            .expect("some");
        assert_eq!(account.credits, 3);
        assert!(reloaded.list_usage("a1", 10).await.expect("usage").is_empty());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        {
            let store = StateFileLedgerStore::open(&path).await.expect("open");
            store
                .create_account(new_account("a1", 42))
                .await
                .expect("create");
        }
        let store = StateFileLedgerStore::open(&path).await.expect("reopen");
        let account = store
            .account_by_key_hash("hash-a1")
            .await
            .expect("load")
            .expect("some");
        assert_eq!(account.credits, 42);
    }

    #[tokio::test]
    async fn payment_dedup_under_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateFileLedgerStore::open(dir.path().join("ledger.json"))
            .await
            .expect("open");

        let payment = NewPayment {
            tx_hash: "sig1".to_string(),
            chain: "SOL".to_string(),
            asset: "USDT".to_string(),
            mint: "m".to_string(),
            to_address: "addr".to_string(),
            amount: "7.5".to_string(),
            invoice_ref_hint: None,
            raw: serde_json::Value::Null,
        };
        let (_, deduplicated) = store.insert_payment(payment.clone()).await.expect("first");
        assert!(!deduplicated);
        let (_, deduplicated) = store.insert_payment(payment).await.expect("second");
        assert!(deduplicated);
    }

    #[tokio::test]
    async fn usage_log_is_pruned_past_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateFileLedgerStore::open(dir.path().join("ledger.json"))
            .await
            .expect("open")
            .with_usage_bounds(4, 2);
        store
            .create_account(new_account("a1", 100))
            .await
            .expect("create");

        for _ in 0..5 {
            store
                .charge("a1", 1, UsageMeta::default())
                .await
                .expect("charge");
        }
        let events = store.list_usage("a1", 100).await.expect("usage");
        assert_eq!(events.len(), 2);
    }
}
