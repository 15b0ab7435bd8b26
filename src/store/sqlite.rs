//! SQLite ledger backend.
//!
//! Every operation opens its own connection on a blocking thread and runs in
//! a single transaction, so the check-then-mutate sequences (balance guard,
//! invoice guards) are isolated from concurrent callers. WAL and a busy
//! timeout keep concurrent writers from erroring out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior};

use crate::records::{
    AccountRecord, InvoiceStatus, PaymentRecord, PaymentStatus, TopupInvoice, UsageEvent,
    UsageKind, UsageMeta,
};

use super::{
    ConfirmOutcome, LedgerStore, NewAccount, NewPayment, StoreError, USAGE_LOG_CAP,
    USAGE_LOG_KEEP, now_millis,
};

#[derive(Clone, Debug)]
pub struct SqliteLedgerStore {
    path: PathBuf,
    usage_cap: usize,
    usage_keep: usize,
}

impl SqliteLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            usage_cap: USAGE_LOG_CAP,
            usage_keep: USAGE_LOG_KEEP,
        }
    }

    pub fn with_usage_bounds(mut self, cap: usize, keep: usize) -> Self {
        self.usage_cap = cap;
        self.usage_keep = keep.min(cap);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            work(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn create_account(&self, new: NewAccount) -> Result<AccountRecord, StoreError> {
        self.with_conn(move |conn| {
            let ts_ms = now_millis();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO accounts (id, name, key_hash, credits, disabled, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![new.id, new.name, new.key_hash, new.credits, ts_ms],
            )?;
            if inserted == 0 {
                return Err(StoreError::DuplicateAccount(new.id));
            }
            Ok(AccountRecord {
                id: new.id,
                name: new.name,
                key_hash: new.key_hash,
                credits: new.credits,
                disabled: false,
                created_at_ms: ts_ms,
                last_used_at_ms: None,
            })
        })
        .await
    }

    async fn account_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<AccountRecord>, StoreError> {
        let key_hash = key_hash.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE key_hash=?1"),
                rusqlite::params![key_hash],
                account_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn account_by_id(&self, id: &str) -> Result<Option<AccountRecord>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id=?1"),
                rusqlite::params![id],
                account_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn set_account_disabled(&self, id: &str, disabled: bool) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE accounts SET disabled=?2 WHERE id=?1",
                rusqlite::params![id, disabled as i64],
            )?;
            if updated == 0 {
                return Err(StoreError::InvalidAccount);
            }
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
        let usage_cap = self.usage_cap;
        let usage_keep = self.usage_keep;
        self.with_conn(move |conn| {
            let ts_ms = now_millis();
            let tx = write_transaction(conn)?;

            let row: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT credits, disabled FROM accounts WHERE id=?1",
                    rusqlite::params![account_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((balance, disabled)) = row else {
                return Err(StoreError::InvalidAccount);
            };
            if disabled != 0 {
                return Err(StoreError::InvalidAccount);
            }
            if balance < cost {
                return Err(StoreError::InsufficientCredits { balance });
            }

            tx.execute(
                "UPDATE accounts SET credits = credits - ?2, last_used_at_ms = ?3 WHERE id = ?1",
                rusqlite::params![account_id, cost, ts_ms],
            )?;
            append_usage(&tx, ts_ms, &account_id, cost, UsageKind::Charge, &meta)?;
            prune_usage(&tx, usage_cap, usage_keep)?;

            tx.commit()?;
            Ok(balance - cost)
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
        let usage_cap = self.usage_cap;
        let usage_keep = self.usage_keep;
        self.with_conn(move |conn| {
            let ts_ms = now_millis();
            let tx = write_transaction(conn)?;
            let amount = amount.abs();
            let balance = credit_in_tx(&tx, ts_ms, &account_id, amount, &meta)?;
            prune_usage(&tx, usage_cap, usage_keep)?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    async fn list_usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ts_ms, account_id, cost, kind, meta_json
                 FROM usage_events WHERE account_id=?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit as i64], |row| {
                let kind: String = row.get(4)?;
                let meta_json: String = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    kind,
                    meta_json,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, ts_ms, account_id, cost, kind, meta_json) = row?;
                events.push(UsageEvent {
                    id,
                    ts_ms,
                    account_id,
                    cost,
                    kind: if kind == "TOPUP" {
                        UsageKind::Topup
                    } else {
                        UsageKind::Charge
                    },
                    meta: serde_json::from_str(&meta_json)?,
                });
            }
            Ok(events)
        })
        .await
    }

    async fn insert_invoice(&self, invoice: TopupInvoice) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO invoices
                 (invoice_ref, account_id, chain, asset, units, credits, memo, status, tx_hash, created_at_ms, confirmed_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    invoice.invoice_ref,
                    invoice.account_id,
                    invoice.chain,
                    invoice.asset,
                    invoice.units,
                    invoice.credits,
                    invoice.memo,
                    invoice.status.as_str(),
                    invoice.tx_hash,
                    invoice.created_at_ms,
                    invoice.confirmed_at_ms,
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::DuplicateInvoice(invoice.invoice_ref));
            }
            Ok(())
        })
        .await
    }

    async fn invoice_by_ref(
        &self,
        invoice_ref: &str,
    ) -> Result<Option<TopupInvoice>, StoreError> {
        let invoice_ref = invoice_ref.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_ref=?1"),
                rusqlite::params![invoice_ref],
                invoice_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn pending_invoices_matching(
        &self,
        chain: &str,
        asset: &str,
        amount: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<TopupInvoice>, StoreError> {
        let chain = chain.to_string();
        let asset = asset.to_string();
        let amount = amount.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INVOICE_COLUMNS} FROM invoices
                 WHERE status='PENDING' AND chain=?1 AND asset=?2 AND units=?3 AND created_at_ms>=?4
                 ORDER BY created_at_ms ASC LIMIT ?5"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![chain, asset, amount, since_ms, limit as i64],
                invoice_from_row,
            )?;
            let mut invoices = Vec::new();
            for row in rows {
                invoices.push(row?);
            }
            Ok(invoices)
        })
        .await
    }

    async fn insert_payment(
        &self,
        payment: NewPayment,
    ) -> Result<(PaymentRecord, bool), StoreError> {
        self.with_conn(move |conn| {
            let ts_ms = now_millis();
            let tx = write_transaction(conn)?;

            let existing = tx
                .query_row(
                    &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE tx_hash=?1"),
                    rusqlite::params![payment.tx_hash],
                    payment_from_row,
                )
                .optional()?;
            if let Some(existing) = existing {
                return Ok((existing, true));
            }

            let raw_json = serde_json::to_string(&payment.raw)?;
            tx.execute(
                "INSERT INTO payments
                 (tx_hash, chain, asset, mint, to_address, amount, invoice_ref, raw_json, status, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'UNMATCHED', ?9)",
                rusqlite::params![
                    payment.tx_hash,
                    payment.chain,
                    payment.asset,
                    payment.mint,
                    payment.to_address,
                    payment.amount,
                    payment.invoice_ref_hint,
                    raw_json,
                    ts_ms,
                ],
            )?;
            tx.commit()?;

            Ok((
                PaymentRecord {
                    tx_hash: payment.tx_hash,
                    chain: payment.chain,
                    asset: payment.asset,
                    mint: payment.mint,
                    to_address: payment.to_address,
                    amount: payment.amount,
                    invoice_ref: payment.invoice_ref_hint,
                    raw: payment.raw,
                    status: PaymentStatus::Unmatched,
                    created_at_ms: ts_ms,
                },
                false,
            ))
        })
        .await
    }

    async fn payment_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let tx_hash = tx_hash.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE tx_hash=?1"),
                rusqlite::params![tx_hash],
                payment_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn set_payment_invoice_ref(
        &self,
        tx_hash: &str,
        invoice_ref: &str,
    ) -> Result<(), StoreError> {
        let tx_hash = tx_hash.to_string();
        let invoice_ref = invoice_ref.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE payments SET invoice_ref=?2 WHERE tx_hash=?1",
                rusqlite::params![tx_hash, invoice_ref],
            )?;
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
        self.with_conn(move |conn| {
            let ts_ms = now_millis();
            let tx = write_transaction(conn)?;

            let invoice = tx
                .query_row(
                    &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_ref=?1"),
                    rusqlite::params![invoice_ref],
                    invoice_from_row,
                )
                .optional()?;
            let Some(invoice) = invoice else {
                return Err(StoreError::InvoiceNotFound(invoice_ref));
            };

            if invoice.status == InvoiceStatus::Confirmed {
                let balance: i64 = tx
                    .query_row(
                        "SELECT credits FROM accounts WHERE id=?1",
                        rusqlite::params![invoice.account_id],
                        |row| row.get(0),
                    )
                    .optional()?
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

            tx.execute(
                "UPDATE invoices SET status='CONFIRMED', tx_hash=?2, confirmed_at_ms=?3
                 WHERE invoice_ref=?1",
                rusqlite::params![invoice.invoice_ref, tx_hash, ts_ms],
            )?;

            let mut meta = meta;
            meta.invoice_ref = Some(invoice.invoice_ref.clone());
            meta.tx_hash = Some(tx_hash.clone());
            meta.chain = Some(invoice.chain.clone());
            meta.asset = Some(invoice.asset.clone());
            meta.units = Some(invoice.units.clone());
            let balance = credit_in_tx(&tx, ts_ms, &invoice.account_id, invoice.credits, &meta)?;
            prune_usage(&tx, usage_cap, usage_keep)?;

            tx.execute(
                "UPDATE payments SET status='MATCHED', invoice_ref=?2 WHERE tx_hash=?1",
                rusqlite::params![tx_hash, invoice.invoice_ref],
            )?;

            tx.commit()?;

            let mut confirmed = invoice;
            confirmed.status = InvoiceStatus::Confirmed;
            confirmed.tx_hash = Some(tx_hash);
            confirmed.confirmed_at_ms = Some(ts_ms);
            Ok(ConfirmOutcome {
                invoice: confirmed,
                balance,
                already_confirmed: false,
            })
        })
        .await
    }
}

const ACCOUNT_COLUMNS: &str =
    "id, name, key_hash, credits, disabled, created_at_ms, last_used_at_ms";
const INVOICE_COLUMNS: &str =
    "invoice_ref, account_id, chain, asset, units, credits, memo, status, tx_hash, created_at_ms, confirmed_at_ms";
const PAYMENT_COLUMNS: &str =
    "tx_hash, chain, asset, mint, to_address, amount, invoice_ref, raw_json, status, created_at_ms";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRecord> {
    Ok(AccountRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        key_hash: row.get(2)?,
        credits: row.get(3)?,
        disabled: row.get::<_, i64>(4)? != 0,
        created_at_ms: row.get(5)?,
        last_used_at_ms: row.get(6)?,
    })
}

fn invoice_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TopupInvoice> {
    let status: String = row.get(7)?;
    Ok(TopupInvoice {
        invoice_ref: row.get(0)?,
        account_id: row.get(1)?,
        chain: row.get(2)?,
        asset: row.get(3)?,
        units: row.get(4)?,
        credits: row.get(5)?,
        memo: row.get(6)?,
        status: InvoiceStatus::parse(&status).unwrap_or(InvoiceStatus::Pending),
        tx_hash: row.get(8)?,
        created_at_ms: row.get(9)?,
        confirmed_at_ms: row.get(10)?,
    })
}

fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let raw_json: String = row.get(7)?;
    let status: String = row.get(8)?;
    Ok(PaymentRecord {
        tx_hash: row.get(0)?,
        chain: row.get(1)?,
        asset: row.get(2)?,
        mint: row.get(3)?,
        to_address: row.get(4)?,
        amount: row.get(5)?,
        invoice_ref: row.get(6)?,
        raw: serde_json::from_str(&raw_json).unwrap_or(serde_json::Value::Null),
        status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Unmatched),
        created_at_ms: row.get(9)?,
    })
}

fn append_usage(
    tx: &Transaction<'_>,
    ts_ms: i64,
    account_id: &str,
    cost: i64,
    kind: UsageKind,
    meta: &UsageMeta,
) -> Result<(), StoreError> {
    let kind = match kind {
        UsageKind::Charge => "CHARGE",
        UsageKind::Topup => "TOPUP",
    };
    let meta_json = serde_json::to_string(meta)?;
    tx.execute(
        "INSERT INTO usage_events (ts_ms, account_id, cost, kind, meta_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![ts_ms, account_id, cost, kind, meta_json],
    )?;
    Ok(())
}

fn credit_in_tx(
    tx: &Transaction<'_>,
    ts_ms: i64,
    account_id: &str,
    amount: i64,
    meta: &UsageMeta,
) -> Result<i64, StoreError> {
    let row: Option<(i64, i64)> = tx
        .query_row(
            "SELECT credits, disabled FROM accounts WHERE id=?1",
            rusqlite::params![account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((balance, disabled)) = row else {
        return Err(StoreError::InvalidAccount);
    };
    if disabled != 0 {
        return Err(StoreError::InvalidAccount);
    }

    tx.execute(
        "UPDATE accounts SET credits = credits + ?2 WHERE id = ?1",
        rusqlite::params![account_id, amount],
    )?;
    append_usage(tx, ts_ms, account_id, -amount, UsageKind::Topup, meta)?;
    Ok(balance + amount)
}

fn prune_usage(tx: &Transaction<'_>, cap: usize, keep: usize) -> Result<(), StoreError> {
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM usage_events", [], |row| row.get(0))?;
    if count > cap as i64 {
        tx.execute(
            "DELETE FROM usage_events WHERE id NOT IN
             (SELECT id FROM usage_events ORDER BY id DESC LIMIT ?1)",
            rusqlite::params![keep as i64],
        )?;
    }
    Ok(())
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            credits INTEGER NOT NULL DEFAULT 0,
            disabled INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            last_used_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS usage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            account_id TEXT NOT NULL,
            cost INTEGER NOT NULL,
            kind TEXT NOT NULL,
            meta_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_events_account_id
            ON usage_events(account_id, id);

        CREATE TABLE IF NOT EXISTS invoices (
            invoice_ref TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            chain TEXT NOT NULL,
            asset TEXT NOT NULL,
            units TEXT NOT NULL,
            credits INTEGER NOT NULL,
            memo TEXT NOT NULL,
            status TEXT NOT NULL,
            tx_hash TEXT,
            created_at_ms INTEGER NOT NULL,
            confirmed_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_invoices_match
            ON invoices(status, chain, asset, created_at_ms);

        CREATE TABLE IF NOT EXISTS payments (
            tx_hash TEXT PRIMARY KEY NOT NULL,
            chain TEXT NOT NULL,
            asset TEXT NOT NULL,
            mint TEXT NOT NULL,
            to_address TEXT NOT NULL,
            amount TEXT NOT NULL,
            invoice_ref TEXT,
            raw_json TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

// Take the write lock up front so concurrent writers queue on the busy
// timeout. A deferred transaction that starts with a read cannot upgrade
// its lock under WAL once another writer has committed.
fn write_transaction(conn: &mut rusqlite::Connection) -> Result<Transaction<'_>, rusqlite::Error> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str) -> NewAccount {
        NewAccount {
            id: id.to_string(),
            name: "test".to_string(),
            key_hash: format!("hash-{id}"),
            credits: 100,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> SqliteLedgerStore {
        SqliteLedgerStore::new(dir.path().join("ledger.sqlite"))
    }

    #[tokio::test]
    async fn charge_debits_and_appends_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.init().await.expect("init");
        store.create_account(account("a1")).await.expect("create");

        let balance = store
            .charge("a1", 30, UsageMeta::default())
            .await
            .expect("charge");
        assert_eq!(balance, 70);

        let events = store.list_usage("a1", 10).await.expect("usage");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cost, 30);
        assert_eq!(events[0].kind, UsageKind::Charge);
    }

    #[tokio::test]
    async fn insufficient_charge_leaves_no_trace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.init().await.expect("init");
        store.create_account(account("a1")).await.expect("create");

        let err = store.charge("a1", 101, UsageMeta::default()).await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientCredits { balance: 100 })
        ));

        let loaded = store.account_by_id("a1").await.expect("load").expect("some");
        assert_eq!(loaded.credits, 100);
        assert!(store.list_usage("a1", 10).await.expect("usage").is_empty());
    }

    #[tokio::test]
    async fn disabled_account_rejects_charges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.init().await.expect("init");
        store.create_account(account("a1")).await.expect("create");
        store.set_account_disabled("a1", true).await.expect("disable");

        let err = store.charge("a1", 1, UsageMeta::default()).await;
        assert!(matches!(err, Err(StoreError::InvalidAccount)));
    }

    #[tokio::test]
    async fn duplicate_key_hash_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.init().await.expect("init");
        store.create_account(account("a1")).await.expect("create");

        let mut dup = account("a2");
        dup.key_hash = "hash-a1".to_string();
        let err = store.create_account(dup).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn payment_insert_is_idempotent_on_tx_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.init().await.expect("init");

        let payment = NewPayment {
            tx_hash: "sig1".to_string(),
            chain: "SOL".to_string(),
            asset: "USDC".to_string(),
            mint: "mint1".to_string(),
            to_address: "addr".to_string(),
            amount: "5".to_string(),
            invoice_ref_hint: None,
            raw: serde_json::json!({"k": "v"}),
        };
        let (first, deduplicated) = store.insert_payment(payment.clone()).await.expect("insert");
        assert!(!deduplicated);
        assert_eq!(first.status, PaymentStatus::Unmatched);

        let (second, deduplicated) = store.insert_payment(payment).await.expect("insert again");
        assert!(deduplicated);
        assert_eq!(second.tx_hash, "sig1");
    }

    #[tokio::test]
    async fn confirm_and_credit_is_atomic_and_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.init().await.expect("init");
        store.create_account(account("a1")).await.expect("create");

        store
            .insert_invoice(TopupInvoice {
                invoice_ref: "inv_1".to_string(),
                account_id: "a1".to_string(),
                chain: "SOL".to_string(),
                asset: "USDC".to_string(),
                units: "5".to_string(),
                credits: 500,
                memo: "BRIEFMETER:inv_1".to_string(),
                status: InvoiceStatus::Pending,
                tx_hash: None,
                created_at_ms: 0,
                confirmed_at_ms: None,
            })
            .await
            .expect("invoice");

        let outcome = store
            .confirm_and_credit("inv_1", "sig1", UsageMeta::default())
            .await
            .expect("confirm");
        assert!(!outcome.already_confirmed);
        assert_eq!(outcome.balance, 600);
        assert_eq!(outcome.invoice.status, InvoiceStatus::Confirmed);
        assert_eq!(outcome.invoice.tx_hash.as_deref(), Some("sig1"));

        // Second confirmation credits nothing.
        let outcome = store
            .confirm_and_credit("inv_1", "sig1", UsageMeta::default())
            .await
            .expect("confirm again");
        assert!(outcome.already_confirmed);
        assert_eq!(outcome.balance, 600);

        let events = store.list_usage("a1", 10).await.expect("usage");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cost, -500);
        assert_eq!(events[0].kind, UsageKind::Topup);
        assert_eq!(events[0].meta.invoice_ref.as_deref(), Some("inv_1"));
    }

    #[tokio::test]
    async fn concurrent_charges_serialize_instead_of_erroring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.init().await.expect("init");
        let mut new = account("a1");
        new.credits = 40;
        store.create_account(new).await.expect("create");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.charge("a1", 1, UsageMeta::default()).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("every charge succeeds");
        }

        let loaded = store.account_by_id("a1").await.expect("load").expect("some");
        assert_eq!(loaded.credits, 20);
        assert_eq!(store.list_usage("a1", 100).await.expect("usage").len(), 20);
    }

    #[tokio::test]
    async fn usage_log_is_pruned_past_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir).with_usage_bounds(5, 2);
        store.init().await.expect("init");
        let mut new = account("a1");
        new.credits = 1000;
        store.create_account(new).await.expect("create");

        for _ in 0..6 {
            store
                .charge("a1", 1, UsageMeta::default())
                .await
                .expect("charge");
        }
        let events = store.list_usage("a1", 100).await.expect("usage");
        assert_eq!(events.len(), 2);
    }
}
