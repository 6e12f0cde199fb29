//! Clearing-to-bank transfers for settled deposits

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::SettlementSettings;
use crate::ledger::{LedgerPort, LedgerResult};
use crate::models::{round2, Posting, TransferRequest};
use crate::retry::retry_locked;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferSummary {
    pub created: Vec<String>,
    pub already_transferred: usize,
    pub not_due: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ClearingTransferService {
    ledger: Arc<dyn LedgerPort>,
    settings: Arc<SettlementSettings>,
}

impl ClearingTransferService {
    pub fn new(ledger: Arc<dyn LedgerPort>, settings: Arc<SettlementSettings>) -> Self {
        Self { ledger, settings }
    }

    /// Transfer request for a final posting whose clearing line is a deposit
    pub fn transfer_for(&self, posting: &Posting) -> Option<TransferRequest> {
        let clearing = posting
            .lines
            .iter()
            .find(|l| self.settings.accounts.is_clearing_account(&l.account))?;
        if !clearing.is_debit() {
            return None;
        }

        let received = if clearing.currency.eq_ignore_ascii_case(&self.settings.base_currency) {
            clearing.debit
        } else {
            round2(clearing.debit * clearing.exchange_rate)
        };

        Some(TransferRequest {
            reference: posting.report_id.clone(),
            posting_date: posting.posting_date,
            from_account: clearing.account.clone(),
            to_account: self.settings.accounts.bank.clone(),
            currency: clearing.currency.clone(),
            paid_amount: clearing.debit,
            received_amount: received,
            exchange_rate: clearing.exchange_rate,
        })
    }

    /// Create transfers for every due deposit in the lookback window
    pub async fn run(&self, now: DateTime<Utc>) -> LedgerResult<TransferSummary> {
        let since = (now - ChronoDuration::days(self.settings.clearing_lookback_days)).date_naive();
        let postings = self.ledger.list_final_postings_since(since).await?;
        let mut summary = TransferSummary::default();

        for posting in &postings {
            let Some(request) = self.transfer_for(posting) else {
                continue;
            };
            if posting.deposit_at.map(|at| at > now).unwrap_or(false) {
                summary.not_due += 1;
                continue;
            }

            match self.create_once(&request).await {
                Ok(Some(id)) => {
                    tracing::info!(
                        report_id = %posting.report_id,
                        transfer = %id,
                        amount = %request.paid_amount,
                        currency = %request.currency,
                        "Created clearing transfer"
                    );
                    summary.created.push(id);
                }
                Ok(None) => summary.already_transferred += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        report_id = %posting.report_id,
                        category = %e.category(),
                        error = %e,
                        "Clearing transfer failed"
                    );
                }
            }
        }

        Ok(summary)
    }

    async fn create_once(&self, request: &TransferRequest) -> LedgerResult<Option<String>> {
        if request.paid_amount <= Decimal::ZERO || self.ledger.transfer_exists(&request.reference).await? {
            return Ok(None);
        }
        let context = format!("create_transfer {}", request.reference);
        let id = retry_locked(|| self.ledger.create_transfer(request), &context).await?;
        Ok(Some(id))
    }
}
