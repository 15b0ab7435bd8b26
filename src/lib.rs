//! briefmeter: a prepaid credit ledger with on-chain top-up reconciliation.
//!
//! Accounts hold an integer credit balance spent through a deterministic
//! cost model and refilled by stablecoin transfers matched against pending
//! invoices. Self-service signup is gated by a stateless HMAC-signed
//! proof-of-work challenge. Two interchangeable storage backends (SQLite and
//! a JSON state file) carry the same atomicity contract.

pub mod config;
pub mod cost;
pub mod keys;
pub mod limits;
pub mod pow;
pub mod reconcile;
pub mod records;
pub mod service;
pub mod store;
pub mod topup;

pub use config::{ConfigError, MeterConfig, StoreBackend};
pub use service::{Clock, Meter, MeterError, SystemClock};
pub use store::{LedgerStore, SqliteLedgerStore, StateFileLedgerStore, StoreError};
