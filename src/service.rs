//! The metering service facade.
//!
//! [`Meter`] owns the configuration, the ledger store, the challenge issuer
//! and the request limiter, and exposes every operation a caller can perform:
//! signup, charging, invoicing, webhook ingestion and the operator overrides.
//! Time flows in through a [`Clock`] so expiry and windowing are testable.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::config::{MeterConfig, StoreBackend};
use crate::cost::{self, CostInput};
use crate::keys::{self, RandomnessError};
use crate::limits::{QuotaExceeded, RequestLimiter};
use crate::pow::{Challenge, ChallengeError, ChallengeIssuer, check_solution};
use crate::reconcile::{self, MatchOutcome, UnmatchedReason};
use crate::records::{
    AccountRecord, PaymentStatus, TopupInvoice, UsageEvent, UsageMeta, normalize_amount,
};
use crate::store::{
    ConfirmOutcome, LedgerStore, NewAccount, NewPayment, SqliteLedgerStore, StateFileLedgerStore,
    StoreError,
};
use crate::topup::{self, InvoiceError, PayTo, Pricing};

const MAX_ACCOUNT_NAME_CHARS: usize = 80;
const DEFAULT_ACCOUNT_NAME: &str = "selfserve";

/// Time source. Production uses [`SystemClock`]; tests substitute a fixed one.
pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("invalid or missing credentials")]
    Unauthorized,
    #[error("operator token missing or mismatched")]
    Forbidden,
    #[error("feature not configured: {0}")]
    NotConfigured(&'static str),
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),
    #[error("insufficient credits: cost={cost} balance={balance}")]
    InsufficientCredits { cost: i64, balance: i64 },
    #[error("top-up below minimum of {min_units} units")]
    BelowMinimum { min_units: f64 },
    #[error("asset not accepted: {0}")]
    UnknownAsset(String),
    #[error("invoice not found: {0}")]
    InvoiceNotFound(String),
    #[error("payment not found: {0}")]
    PaymentNotFound(String),
    #[error("payment went to {observed}, expected {expected}")]
    WrongDestination { expected: String, observed: String },
    #[error("payment {tx_hash} already settled invoice {invoice_ref}")]
    PaymentAlreadyMatched {
        tx_hash: String,
        invoice_ref: String,
    },
    #[error("payment {field} does not match the invoice: expected {expected}, got {observed}")]
    TermsMismatch {
        field: &'static str,
        expected: String,
        observed: String,
    },
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error(transparent)]
    Randomness(#[from] RandomnessError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<InvoiceError> for MeterError {
    fn from(err: InvoiceError) -> Self {
        match err {
            InvoiceError::BelowMinimum { min_units } => MeterError::BelowMinimum { min_units },
            InvoiceError::Randomness(err) => MeterError::Randomness(err),
        }
    }
}

/// What a successful charge cost and left behind.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct ChargeReceipt {
    pub cost: i64,
    pub balance: i64,
}

/// A freshly issued invoice plus where to send the funds.
#[derive(Clone, Debug, serde::Serialize)]
pub struct InvoiceQuote {
    pub invoice: TopupInvoice,
    pub pay_to: PayTo,
}

/// Per-transfer outcome of a webhook delivery.
#[derive(Clone, Debug, serde::Serialize)]
pub struct TransferResult {
    pub tx_hash: String,
    /// False when the transfer had been recorded by an earlier delivery.
    pub stored: bool,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnmatchedReason>,
}

pub struct Meter {
    config: MeterConfig,
    store: Arc<dyn LedgerStore>,
    issuer: ChallengeIssuer,
    clock: Arc<dyn Clock>,
    limiter: Mutex<RequestLimiter>,
}

impl Meter {
    /// Open the configured backend and build the service around it.
    pub async fn open(config: MeterConfig) -> Result<Self, MeterError> {
        let store: Arc<dyn LedgerStore> = match &config.backend {
            StoreBackend::Sqlite { path } => {
                let store = SqliteLedgerStore::new(path.clone());
                store.init().await?;
                Arc::new(store)
            }
            StoreBackend::StateFile { path } => {
                Arc::new(StateFileLedgerStore::open(path.clone()).await?)
            }
        };
        Ok(Self::with_parts(config, store, Arc::new(SystemClock)))
    }

    /// Assemble from explicit parts. The test seam.
    pub fn with_parts(
        config: MeterConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let issuer = ChallengeIssuer::new(config.pow_secret.clone());
        Self {
            config,
            store,
            issuer,
            clock,
            limiter: Mutex::new(RequestLimiter::default()),
        }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_epoch_millis()
    }

    /// Count one request for `scope` against the tier its authentication
    /// state earns it.
    pub fn admit(&self, scope: &str, authenticated: bool) -> Result<(), MeterError> {
        let tier = self.config.admission.tier_for(authenticated);
        let mut limiter = self.limiter.lock().unwrap_or_else(|e| e.into_inner());
        limiter.check_and_consume(scope, tier, self.now_ms())?;
        Ok(())
    }

    /// Resolve a presented API key to its account. Unknown keys and disabled
    /// accounts both come back as `None`; callers treat them identically.
    pub async fn authenticate(
        &self,
        api_key: &str,
    ) -> Result<Option<AccountRecord>, MeterError> {
        let key = api_key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        let account = self.store.account_by_key_hash(&keys::hash_key(key)).await?;
        Ok(account.filter(|account| !account.disabled))
    }

    pub fn issue_challenge(&self) -> Result<Challenge, MeterError> {
        let challenge = self.issuer.issue(
            self.config.pow_difficulty,
            self.config.pow_ttl_ms,
            self.now_ms(),
        )?;
        Ok(challenge)
    }

    /// Redeem a solved challenge for a zero-credit account. The plaintext key
    /// is returned exactly once, alongside the stored record.
    pub async fn register_account(
        &self,
        name: &str,
        challenge_token: &str,
        nonce: &str,
    ) -> Result<(AccountRecord, String), MeterError> {
        let verified = self.issuer.verify(challenge_token, self.now_ms())?;
        if !check_solution(&verified.id, nonce, verified.difficulty) {
            return Err(ChallengeError::BadSolution.into());
        }

        let name = sanitize_name(name);
        let api_key = keys::new_api_key()?;
        let account = self
            .store
            .create_account(NewAccount {
                id: keys::new_id("acct_", 9)?,
                name,
                key_hash: keys::hash_key(&api_key),
                credits: 0,
            })
            .await?;
        tracing::info!(account_id = %account.id, "self-service account registered");
        Ok((account, api_key))
    }

    /// Operator path: mint an account with a starting balance.
    pub async fn create_account(
        &self,
        admin_token: Option<&str>,
        name: &str,
        credits: i64,
    ) -> Result<(AccountRecord, String), MeterError> {
        self.require_admin(admin_token)?;
        let api_key = keys::new_api_key()?;
        let account = self
            .store
            .create_account(NewAccount {
                id: keys::new_id("acct_", 9)?,
                name: sanitize_name(name),
                key_hash: keys::hash_key(&api_key),
                credits: credits.max(0),
            })
            .await?;
        tracing::info!(account_id = %account.id, credits = account.credits, "account created");
        Ok((account, api_key))
    }

    pub async fn set_account_disabled(
        &self,
        admin_token: Option<&str>,
        account_id: &str,
        disabled: bool,
    ) -> Result<(), MeterError> {
        self.require_admin(admin_token)?;
        self.store.set_account_disabled(account_id, disabled).await?;
        Ok(())
    }

    /// Price the work and debit it atomically.
    pub async fn charge(
        &self,
        account_id: &str,
        input: &CostInput,
        endpoint: Option<&str>,
    ) -> Result<ChargeReceipt, MeterError> {
        let cost = cost::cost(input);
        let meta = meta_for_charge(input, endpoint);
        match self.store.charge(account_id, cost, meta).await {
            Ok(balance) => Ok(ChargeReceipt { cost, balance }),
            Err(StoreError::InsufficientCredits { balance }) => {
                Err(MeterError::InsufficientCredits { cost, balance })
            }
            Err(StoreError::InvalidAccount) => Err(MeterError::Unauthorized),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEvent>, MeterError> {
        Ok(self.store.list_usage(account_id, limit).await?)
    }

    /// Create a PENDING invoice and return the deposit instructions.
    pub async fn create_invoice(
        &self,
        account_id: &str,
        asset: &str,
        units: f64,
    ) -> Result<InvoiceQuote, MeterError> {
        let asset = asset.trim().to_ascii_uppercase();
        if !self.config.mint_allowlist.is_empty()
            && !self
                .config
                .mint_allowlist
                .values()
                .any(|accepted| accepted.eq_ignore_ascii_case(&asset))
        {
            return Err(MeterError::UnknownAsset(asset));
        }

        let pricing = Pricing {
            credits_per_unit: self.config.credits_per_unit,
            min_units: self.config.min_topup_units,
        };
        let invoice = topup::build_invoice(
            pricing,
            account_id,
            &asset,
            &self.config.chain,
            units,
            self.now_ms(),
        )?;
        self.store.insert_invoice(invoice.clone()).await?;
        tracing::info!(
            invoice_ref = %invoice.invoice_ref,
            account_id,
            units = %invoice.units,
            credits = invoice.credits,
            "invoice created"
        );
        Ok(InvoiceQuote {
            invoice,
            pay_to: PayTo {
                address: self.config.pay_address.clone(),
                chain: self.config.chain.clone(),
                asset,
            },
        })
    }

    /// Look up an invoice owned by `account_id`. Someone else's invoice ref
    /// is indistinguishable from a nonexistent one.
    pub async fn invoice_status(
        &self,
        account_id: &str,
        invoice_ref: &str,
    ) -> Result<TopupInvoice, MeterError> {
        let invoice = self.store.invoice_by_ref(invoice_ref).await?;
        match invoice {
            Some(invoice) if invoice.account_id == account_id => Ok(invoice),
            _ => Err(MeterError::InvoiceNotFound(invoice_ref.to_string())),
        }
    }

    /// Ingest an indexer delivery: record every relevant transfer, then try
    /// to settle each against a pending invoice. Safe to call repeatedly
    /// with the same payload.
    pub async fn ingest_webhook(
        &self,
        presented_secret: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<Vec<TransferResult>, MeterError> {
        let Some(expected) = &self.config.webhook_secret else {
            return Err(MeterError::NotConfigured("TOPUP_WEBHOOK_SECRET"));
        };
        if presented_secret != Some(expected.as_str()) {
            return Err(MeterError::Unauthorized);
        }
        if self.config.mint_allowlist.is_empty() {
            return Err(MeterError::NotConfigured("USDC_MINT or USDT_MINT"));
        }

        let hint = reconcile::extract_invoice_ref(payload);
        let now_ms = self.now_ms();
        let mut results = Vec::new();

        for transfer in reconcile::extract_transfers(payload) {
            let Some(asset) = self.config.asset_for_mint(&transfer.mint) else {
                tracing::debug!(mint = %transfer.mint, "ignoring transfer in unlisted mint");
                continue;
            };
            if transfer.to_address != self.config.pay_address {
                tracing::debug!(tx_hash = %transfer.tx_hash, "ignoring transfer to foreign address");
                continue;
            }

            let (payment, deduplicated) = self
                .store
                .insert_payment(NewPayment {
                    tx_hash: transfer.tx_hash.clone(),
                    chain: self.config.chain.clone(),
                    asset: asset.to_string(),
                    mint: transfer.mint.clone(),
                    to_address: transfer.to_address.clone(),
                    amount: transfer.amount.clone(),
                    invoice_ref_hint: hint.clone(),
                    raw: payload.clone(),
                })
                .await?;

            let outcome = reconcile::match_and_credit(
                self.store.as_ref(),
                &payment,
                self.config.match_window_ms,
                now_ms,
                UsageMeta::default(),
            )
            .await?;

            results.push(match outcome {
                MatchOutcome::Matched { invoice_ref, .. } => TransferResult {
                    tx_hash: payment.tx_hash,
                    stored: !deduplicated,
                    matched: true,
                    invoice_ref: Some(invoice_ref),
                    reason: None,
                },
                MatchOutcome::Unmatched { reason } => TransferResult {
                    tx_hash: payment.tx_hash,
                    stored: !deduplicated,
                    matched: false,
                    invoice_ref: None,
                    reason: Some(reason),
                },
            });
        }
        Ok(results)
    }

    /// Operator override: confirm an invoice against a transaction hash with
    /// no payment-record checks. Idempotent on an already-confirmed invoice.
    pub async fn manual_confirm(
        &self,
        admin_token: Option<&str>,
        invoice_ref: &str,
        tx_hash: &str,
    ) -> Result<ConfirmOutcome, MeterError> {
        self.require_admin(admin_token)?;
        let outcome = self
            .store
            .confirm_and_credit(invoice_ref, tx_hash, UsageMeta::default())
            .await
            .map_err(|err| match err {
                StoreError::InvoiceNotFound(invoice_ref) => {
                    MeterError::InvoiceNotFound(invoice_ref)
                }
                other => MeterError::Store(other),
            })?;
        tracing::info!(invoice_ref, tx_hash, "invoice manually confirmed");
        Ok(outcome)
    }

    /// Operator override: link a stored payment to an invoice after checking
    /// the payment actually pays it (destination, chain, asset, amount).
    pub async fn manual_match(
        &self,
        admin_token: Option<&str>,
        invoice_ref: &str,
        tx_hash: &str,
    ) -> Result<ConfirmOutcome, MeterError> {
        self.require_admin(admin_token)?;

        let payment = self
            .store
            .payment_by_tx_hash(tx_hash)
            .await?
            .ok_or_else(|| MeterError::PaymentNotFound(tx_hash.to_string()))?;

        // A settled payment funds exactly one invoice. Repeating the match
        // against that invoice is an idempotent no-op; any other invoice is
        // refused.
        if payment.status == PaymentStatus::Matched {
            if payment.invoice_ref.as_deref() == Some(invoice_ref) {
                let outcome = self
                    .store
                    .confirm_and_credit(invoice_ref, tx_hash, UsageMeta::default())
                    .await?;
                return Ok(outcome);
            }
            return Err(MeterError::PaymentAlreadyMatched {
                tx_hash: tx_hash.to_string(),
                invoice_ref: payment.invoice_ref.clone().unwrap_or_default(),
            });
        }

        let invoice = self
            .store
            .invoice_by_ref(invoice_ref)
            .await?
            .ok_or_else(|| MeterError::InvoiceNotFound(invoice_ref.to_string()))?;

        if payment.to_address != self.config.pay_address {
            return Err(MeterError::WrongDestination {
                expected: self.config.pay_address.clone(),
                observed: payment.to_address,
            });
        }
        check_terms("chain", &invoice.chain, &payment.chain)?;
        check_terms("asset", &invoice.asset, &payment.asset)?;
        check_terms(
            "amount",
            &normalize_amount(&invoice.units),
            &normalize_amount(&payment.amount),
        )?;

        self.store
            .set_payment_invoice_ref(tx_hash, invoice_ref)
            .await?;
        let outcome = self
            .store
            .confirm_and_credit(invoice_ref, tx_hash, UsageMeta::default())
            .await?;
        tracing::info!(invoice_ref, tx_hash, "payment manually matched");
        Ok(outcome)
    }

    fn require_admin(&self, presented: Option<&str>) -> Result<(), MeterError> {
        let Some(expected) = &self.config.admin_token else {
            return Err(MeterError::NotConfigured("ADMIN_TOKEN"));
        };
        if presented != Some(expected.as_str()) {
            return Err(MeterError::Forbidden);
        }
        Ok(())
    }
}

fn sanitize_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_ACCOUNT_NAME.to_string();
    }
    trimmed.chars().take(MAX_ACCOUNT_NAME_CHARS).collect()
}

fn meta_for_charge(input: &CostInput, endpoint: Option<&str>) -> UsageMeta {
    UsageMeta {
        endpoint: endpoint.map(String::from),
        source_kind: Some(input.source_kind.as_str().to_string()),
        mimetype: input.mimetype.clone(),
        bytes: (input.bytes > 0).then_some(input.bytes),
        pages: (input.pages > 0).then_some(input.pages),
        text_chars: (input.text_chars > 0).then_some(input.text_chars),
        pixels: (input.pixels > 0).then_some(input.pixels),
        ..UsageMeta::default()
    }
}

fn check_terms(
    field: &'static str,
    expected: &str,
    observed: &str,
) -> Result<(), MeterError> {
    if expected != observed {
        return Err(MeterError::TermsMismatch {
            field,
            expected: expected.to_string(),
            observed: observed.to_string(),
        });
    }
    Ok(())
}
