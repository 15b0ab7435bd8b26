//! Account lifecycle and charging against the SQLite backend, end to end
//! through the service facade.

use std::sync::Arc;

use briefmeter::cost::{CostInput, SourceKind};
use briefmeter::service::{Clock, Meter};
use briefmeter::store::SqliteLedgerStore;
use briefmeter::{MeterConfig, MeterError, StoreBackend};

struct FixedClock(i64);

impl Clock for FixedClock {
    fn now_epoch_millis(&self) -> i64 {
        self.0
    }
}

fn config(dir: &tempfile::TempDir) -> MeterConfig {
    let mut config = MeterConfig::new(
        b"integration-secret".to_vec(),
        "pay-address",
        StoreBackend::Sqlite {
            path: dir.path().join("ledger.sqlite"),
        },
    );
    config.admin_token = Some("admin".to_string());
    config
}

async fn sqlite_meter(dir: &tempfile::TempDir) -> Meter {
    let store = SqliteLedgerStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");
    Meter::with_parts(config(dir), Arc::new(store), Arc::new(FixedClock(1_000)))
}

fn pdf(pages: i64, chars: i64) -> CostInput {
    CostInput {
        source_kind: SourceKind::File,
        mimetype: Some("application/pdf".to_string()),
        pages,
        text_chars: chars,
        ..CostInput::default()
    }
}

#[tokio::test]
async fn key_round_trips_through_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let meter = sqlite_meter(&dir).await;

    let (account, api_key) = meter
        .create_account(Some("admin"), "integration", 50)
        .await
        .expect("create");
    assert!(api_key.starts_with("bm_"));

    // A second Meter over the same file sees the account.
    let meter2 = sqlite_meter(&dir).await;
    let resolved = meter2
        .authenticate(&api_key)
        .await
        .expect("auth")
        .expect("account resolves");
    assert_eq!(resolved.id, account.id);
    assert_eq!(resolved.credits, 50);
}

#[tokio::test]
async fn charges_debit_until_the_balance_runs_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let meter = sqlite_meter(&dir).await;
    let (account, _) = meter
        .create_account(Some("admin"), "integration", 7)
        .await
        .expect("create");

    // 6 pages of pdf: 2 base + 1 page step.
    let receipt = meter
        .charge(&account.id, &pdf(6, 0), Some("brief"))
        .await
        .expect("charge");
    assert_eq!(receipt.cost, 3);
    assert_eq!(receipt.balance, 4);

    let receipt = meter
        .charge(&account.id, &pdf(1, 0), None)
        .await
        .expect("charge 2");
    assert_eq!(receipt.balance, 2);

    let err = meter
        .charge(&account.id, &pdf(6, 0), None)
        .await
        .expect_err("over balance");
    assert!(matches!(
        err,
        MeterError::InsufficientCredits { cost: 3, balance: 2 }
    ));

    // The failed charge left no event behind.
    let events = meter.usage(&account.id, 10).await.expect("usage");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].meta.pages, Some(1));
    assert_eq!(events[1].meta.endpoint.as_deref(), Some("brief"));
}

#[tokio::test]
async fn disabled_accounts_stop_authenticating_and_charging() {
    let dir = tempfile::tempdir().expect("tempdir");
    let meter = sqlite_meter(&dir).await;
    let (account, api_key) = meter
        .create_account(Some("admin"), "integration", 10)
        .await
        .expect("create");

    meter
        .set_account_disabled(Some("admin"), &account.id, true)
        .await
        .expect("disable");

    assert!(meter.authenticate(&api_key).await.expect("auth").is_none());
    assert!(matches!(
        meter.charge(&account.id, &pdf(1, 0), None).await,
        Err(MeterError::Unauthorized)
    ));

    meter
        .set_account_disabled(Some("admin"), &account.id, false)
        .await
        .expect("re-enable");
    assert!(meter.authenticate(&api_key).await.expect("auth").is_some());
}
