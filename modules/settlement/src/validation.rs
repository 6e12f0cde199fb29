//! Validation of posting drafts before they reach the ledger

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{noise_threshold, round_money, PostingDraft, PostingLine};

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Posting for report {0} has no lines")]
    NoLines(String),

    #[error("Line {0}: account cannot be empty")]
    EmptyAccount(u32),

    #[error("Line {0}: currency must be a 3-letter uppercase code, got: {1}")]
    InvalidCurrency(u32, String),

    #[error("Line {0}: exchange rate must be positive, got {1}")]
    InvalidExchangeRate(u32, Decimal),

    #[error("Line {0}: debit and credit must be non-negative")]
    NegativeAmount(u32),

    #[error("Line {0}: debit and credit cannot both be set")]
    BothSides(u32),

    #[error("Base-currency debits ({0}) must equal credits ({1})")]
    Unbalanced(Decimal, Decimal),
}

/// Validate a draft built from a settlement report
///
/// - at least one line
/// - every line has an account, a currency code and a positive rate
/// - debit/credit non-negative and not both set
/// - base-currency totals agree within 0.01
pub fn validate_draft(draft: &PostingDraft, precision: u32) -> Result<(), ValidationError> {
    if draft.lines.is_empty() {
        return Err(ValidationError::NoLines(draft.report_id.clone()));
    }

    let mut debits = Decimal::ZERO;
    let mut credits = Decimal::ZERO;
    for line in &draft.lines {
        validate_line(line)?;
        debits += line.base_debit();
        credits += line.base_credit();
    }

    let debits = round_money(debits, precision);
    let credits = round_money(credits, precision);
    if (debits - credits).abs() > noise_threshold() {
        return Err(ValidationError::Unbalanced(debits, credits));
    }

    Ok(())
}

fn validate_line(line: &PostingLine) -> Result<(), ValidationError> {
    if line.account.trim().is_empty() {
        return Err(ValidationError::EmptyAccount(line.line_no));
    }
    if !is_valid_currency(&line.currency) {
        return Err(ValidationError::InvalidCurrency(line.line_no, line.currency.clone()));
    }
    if line.exchange_rate <= Decimal::ZERO {
        return Err(ValidationError::InvalidExchangeRate(line.line_no, line.exchange_rate));
    }
    if line.debit < Decimal::ZERO || line.credit < Decimal::ZERO {
        return Err(ValidationError::NegativeAmount(line.line_no));
    }
    if line.debit > Decimal::ZERO && line.credit > Decimal::ZERO {
        return Err(ValidationError::BothSides(line.line_no));
    }
    Ok(())
}

fn is_valid_currency(currency: &str) -> bool {
    currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase())
}
