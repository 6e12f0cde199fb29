//! Finalize and confirm a provisional posting
//!
//! Runs as a queued job. The posting is reloaded on every attempt, its
//! base-currency balance recomputed from per-line rounded amounts, and a
//! rounding correction added, adjusted or removed before confirmation.

use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::SettlementSettings;
use crate::error::ErrorCategory;
use crate::ledger::{LedgerError, LedgerPort, LedgerResult};
use crate::models::{round_money, PostingId, PostingLine, PostingStatus, FINALIZE_ROUNDING_REMARK};
use crate::retry::retry_locked;

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl FinalizeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FinalizeError::Ledger(e) => e.category(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// Confirmed; carries the rounding correction if one was booked
    Confirmed { rounding: Option<Decimal> },
    AlreadyFinal,
    Cancelled,
    NotFound,
}

#[derive(Clone)]
pub struct FinalizeService {
    ledger: Arc<dyn LedgerPort>,
    settings: Arc<SettlementSettings>,
}

impl FinalizeService {
    pub fn new(ledger: Arc<dyn LedgerPort>, settings: Arc<SettlementSettings>) -> Self {
        Self { ledger, settings }
    }

    pub async fn finalize(&self, posting_id: PostingId) -> Result<FinalizeOutcome, FinalizeError> {
        let context = format!("finalize_posting {}", posting_id);
        let outcome = retry_locked(|| self.finalize_once(posting_id), &context).await?;

        match &outcome {
            FinalizeOutcome::Confirmed { rounding } => tracing::info!(
                posting_id = %posting_id,
                rounding = ?rounding,
                "Posting confirmed"
            ),
            FinalizeOutcome::NotFound => tracing::error!(posting_id = %posting_id, "Posting to finalize not found"),
            other => tracing::info!(posting_id = %posting_id, outcome = ?other, "Finalize skipped"),
        }
        Ok(outcome)
    }

    async fn finalize_once(&self, posting_id: PostingId) -> LedgerResult<FinalizeOutcome> {
        let Some(posting) = self.ledger.get_posting(posting_id).await? else {
            return Ok(FinalizeOutcome::NotFound);
        };
        match posting.status {
            PostingStatus::Final => return Ok(FinalizeOutcome::AlreadyFinal),
            PostingStatus::Cancelled => return Ok(FinalizeOutcome::Cancelled),
            PostingStatus::Provisional => {}
        }

        let (lines, rounding, changed) = self.balance_lines(posting.lines);
        if changed {
            self.ledger.update_posting_lines(posting_id, lines).await?;
        }
        self.ledger.confirm_posting(posting_id).await?;
        Ok(FinalizeOutcome::Confirmed { rounding })
    }

    fn is_rounding_line(&self, line: &PostingLine) -> bool {
        line.account == self.settings.accounts.round_off
            && line.remark.as_deref() == Some(FINALIZE_ROUNDING_REMARK)
    }

    /// Apply the rounding correction; returns the new lines, the signed
    /// correction (positive is a credit) and whether anything changed
    pub fn balance_lines(&self, lines: Vec<PostingLine>) -> (Vec<PostingLine>, Option<Decimal>, bool) {
        let precision = self.settings.currency_precision;
        let (existing, mut others): (Vec<PostingLine>, Vec<PostingLine>) =
            lines.into_iter().partition(|l| self.is_rounding_line(l));

        let debit: Decimal = others
            .iter()
            .map(|l| round_money(l.base_debit(), precision))
            .sum();
        let credit: Decimal = others
            .iter()
            .map(|l| round_money(l.base_credit(), precision))
            .sum();
        let diff = round_money(debit - credit, precision);

        if diff.abs() < self.settings.finalize_threshold() {
            let changed = !existing.is_empty();
            if changed {
                renumber(&mut others);
            }
            return (others, None, changed);
        }

        let mut existing = existing.into_iter();
        let (mut line, is_new) = match existing.next() {
            Some(line) => (line, false),
            None => {
                let mut line = PostingLine::new(
                    &self.settings.accounts.round_off,
                    &self.settings.base_currency,
                    Decimal::ONE,
                )
                .with_remark(FINALIZE_ROUNDING_REMARK);
                line.line_no = others.iter().map(|l| l.line_no).max().unwrap_or(0) + 1;
                (line, true)
            }
        };
        let duplicates = existing.next().is_some();

        let (debit, credit) = if diff > Decimal::ZERO {
            (Decimal::ZERO, diff)
        } else {
            (-diff, Decimal::ZERO)
        };
        let changed = is_new || duplicates || line.debit != debit || line.credit != credit;
        line.debit = debit;
        line.credit = credit;

        others.push(line);
        others.sort_by_key(|l| l.line_no);
        if duplicates {
            renumber(&mut others);
        }
        (others, Some(diff), changed)
    }
}

fn renumber(lines: &mut [PostingLine]) {
    for (idx, line) in lines.iter_mut().enumerate() {
        line.line_no = (idx + 1) as u32;
    }
}
