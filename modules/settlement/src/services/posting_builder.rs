//! Posting builder
//!
//! Turns one settlement report into a balanced provisional posting. Lines
//! are emitted in a fixed order:
//!
//! 1. clearing line sized to the net transfer
//! 2. one AR credit per order with sales
//! 3. one AR debit per order with refunds
//! 4. reimbursements
//! 5. special fee buckets
//! 6. miscellaneous fees (the balancing remainder)
//! 7. rounding
//!
//! Reference lookups and credit-note creation are per order: a failure is
//! recorded in [`BuildDiagnostics::failures`] and the AR line is left
//! unreferenced, the posting is still built.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use super::aggregation::OrderAggregates;
use super::credit_note_service::{CreditNoteService, RefundContext};
use super::fx_service::{FxError, FxService};
use crate::config::{title_case, ConfigError, CurrencyAccounts, SettlementSettings};
use crate::error::ErrorCategory;
use crate::ledger::{LedgerError, LedgerPort};
use crate::models::{
    noise_threshold, round_money, DocumentKind, DocumentRef, MarketplaceStamp, Party, PartyKind,
    PostingDraft, PostingLine, SettlementReport, SettlementRow, BUILD_ROUNDING_REMARK,
};

/// Descriptions always booked to the reimbursement account
pub const REIMBURSEMENT_WHITELIST: &[&str] = &[
    "REVERSAL_REIMBURSEMENT",
    "FREE_REPLACEMENT_REFUND_ITEMS",
    "WAREHOUSE_DAMAGE",
    "WAREHOUSE_LOST",
    "COMPENSATED_CLAWBACK",
    "MISSING_FROM_INBOUND_CLAWBACK",
    "REFUNDCOMMISSION",
    "SHIPPINGCHARGEBACK",
    "MISSING_FROM_INBOUND",
];

#[derive(Debug, thiserror::Error)]
pub enum PostingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fx(#[from] FxError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl PostingError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PostingError::Config(_) => ErrorCategory::Fatal,
            PostingError::Fx(e) => e.category(),
            PostingError::Ledger(e) => e.category(),
        }
    }
}

pub type PostingResult<T> = Result<T, PostingError>;

/// A per-order problem that left an AR line unreferenced
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFailure {
    pub order_id: String,
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildDiagnostics {
    /// Balancing remainder in base currency; positive is a debit
    pub misc_fees: Decimal,
    pub misc_fee_alert: bool,
    /// Base-currency imbalance the rounding line absorbed
    pub imbalance: Decimal,
    pub large_imbalance: bool,
    pub failures: Vec<OrderFailure>,
}

/// Everything derived from a report before any line is built
///
/// Shared by the first pass and the late-allocation pass.
#[derive(Debug, Clone)]
pub struct PreparedReport {
    pub report_id: String,
    pub posting_date: NaiveDate,
    pub settlement_currency: String,
    /// Signed net transfer in settlement currency
    pub native_total: Decimal,
    /// Settlement currency -> base currency
    pub rate: Decimal,
    pub aggregates: OrderAggregates,
}

#[derive(Debug, Clone)]
pub struct BuiltPosting {
    pub draft: PostingDraft,
    pub diagnostics: BuildDiagnostics,
    pub prepared: PreparedReport,
}

/// Whether the row is the report's net-transfer line
pub fn is_transfer_row(row: &SettlementRow) -> bool {
    if row.has_order() {
        return false;
    }
    let kind = row.transaction_type.trim().to_lowercase();
    let desc = row.amount_description.trim().to_lowercase();
    kind == "transfer" || desc == "amazon proceeds" || desc == "transfer" || (kind.is_empty() && desc.is_empty())
}

pub fn find_transfer_row(rows: &[SettlementRow]) -> Option<&SettlementRow> {
    rows.iter()
        .find(|r| is_transfer_row(r) && r.amount.abs() > Decimal::new(1, 4))
}

pub fn is_reimbursement_row(row: &SettlementRow) -> bool {
    let desc = row.description_upper();
    REIMBURSEMENT_WHITELIST.contains(&desc.as_str())
        || desc.contains("REIMBURSEMENT")
        || (row.amount_type.trim().to_uppercase().contains("REIMBURSEMENT") && row.amount > Decimal::ZERO)
}

/// Native-currency reimbursement total
pub fn reimbursement_total(rows: &[SettlementRow]) -> Decimal {
    rows.iter()
        .filter(|r| is_reimbursement_row(r))
        .map(|r| r.amount)
        .sum()
}

/// Order-less negative fees whose description has its own account,
/// as positive native magnitudes in first-appearance order
pub fn special_fee_buckets(
    rows: &[SettlementRow],
    settings: &SettlementSettings,
) -> Vec<(String, Decimal)> {
    let mut buckets: Vec<(String, Decimal)> = Vec::new();
    for row in rows.iter().filter(|r| r.amount < Decimal::ZERO && !r.has_order()) {
        let desc = row.description_upper();
        if !settings.accounts.special_fees.contains_key(&desc) {
            continue;
        }
        match buckets.iter_mut().find(|(d, _)| *d == desc) {
            Some((_, total)) => *total += row.amount.abs(),
            None => buckets.push((desc, row.amount.abs())),
        }
    }
    buckets
}

/// Mark unreferenced party lines as advances where the polarity allows it
pub fn flag_advances(lines: &mut [PostingLine]) {
    for line in lines.iter_mut() {
        let Some(party) = &line.party else {
            line.is_advance = false;
            continue;
        };
        line.is_advance = line.reference.is_none()
            && match party.kind {
                PartyKind::Customer => line.is_credit(),
                PartyKind::Supplier => line.is_debit(),
                PartyKind::Other => false,
            };
    }
}

pub fn is_base_currency_only(lines: &[PostingLine], base_currency: &str) -> bool {
    lines
        .iter()
        .all(|l| l.currency.eq_ignore_ascii_case(base_currency) && l.exchange_rate == Decimal::ONE)
}

/// Signed base-currency imbalance, debit minus credit
pub fn base_imbalance(lines: &[PostingLine]) -> Decimal {
    lines.iter().map(|l| l.base_debit() - l.base_credit()).sum()
}

#[derive(Clone)]
pub struct PostingBuilder {
    settings: Arc<SettlementSettings>,
    ledger: Arc<dyn LedgerPort>,
    fx: Arc<FxService>,
    credit_notes: CreditNoteService,
}

impl PostingBuilder {
    pub fn new(settings: Arc<SettlementSettings>, ledger: Arc<dyn LedgerPort>, fx: Arc<FxService>) -> Self {
        let credit_notes = CreditNoteService::new(ledger.clone(), settings.accounts.clone());
        Self {
            settings,
            ledger,
            fx,
            credit_notes,
        }
    }

    /// Locate the transfer, aggregate orders and resolve the rate
    ///
    /// `Ok(None)` when the report has no net transfer, which is a no-op.
    pub async fn prepare(&self, report: &SettlementReport) -> PostingResult<Option<PreparedReport>> {
        let Some(transfer) = find_transfer_row(&report.rows) else {
            tracing::info!(report_id = %report.report_id(), "Nothing to post, no net transfer");
            return Ok(None);
        };

        let settlement_currency = transfer
            .currency
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.settings.base_currency.clone())
            .to_uppercase();
        let posting_date = report.posting_date_or(Utc::now().date_naive());
        let aggregates = OrderAggregates::from_rows(&report.rows);

        tracing::debug!(
            report_id = %report.report_id(),
            rows = report.rows.len(),
            sales = %aggregates.total_sales(),
            refunds = %aggregates.total_refunds(),
            "Aggregated settlement orders"
        );

        let rate = self
            .fx
            .get_rate(&settlement_currency, &self.settings.base_currency, posting_date)
            .await?;

        Ok(Some(PreparedReport {
            report_id: report.report_id().to_string(),
            posting_date,
            settlement_currency,
            native_total: transfer.amount,
            rate,
            aggregates,
        }))
    }

    /// Build the first-pass provisional posting for a report
    pub async fn build(&self, report: &SettlementReport) -> PostingResult<Option<BuiltPosting>> {
        let Some(prepared) = self.prepare(report).await? else {
            return Ok(None);
        };
        let accounts = self.settings.accounts.for_currency(&prepared.settlement_currency)?.clone();
        let precision = self.settings.currency_precision;
        let base = self.settings.base_currency.clone();
        let rate = prepared.rate;
        let round = |amount: Decimal| round_money(amount, precision);

        let mut diagnostics = BuildDiagnostics::default();
        let mut lines = Vec::new();

        // (a) clearing
        lines.push(
            PostingLine::new(&accounts.clearing, &prepared.settlement_currency, rate)
                .with_signed_debit(prepared.native_total),
        );

        // (b) sales
        for (order_id, sales) in &prepared.aggregates.sales_totals {
            let mut line = self.ar_line(&accounts, &prepared, order_id, false).with_signed_debit(-*sales);
            match self.open_invoice_reference(order_id).await {
                Ok(reference) => line.reference = reference,
                Err(e) => diagnostics.failures.push(self.order_failure(&prepared, order_id, e.category(), e.to_string())),
            }
            lines.push(line);
        }

        // (c) refunds
        for (order_id, refunds) in &prepared.aggregates.refund_totals {
            let mut line = self.ar_line(&accounts, &prepared, order_id, true).with_signed_debit(*refunds);
            match self.refund_reference(&prepared, order_id).await {
                Ok(reference) => line.reference = reference,
                Err((category, message)) => {
                    diagnostics.failures.push(self.order_failure(&prepared, order_id, category, message))
                }
            }
            lines.push(line);
        }

        // (d) reimbursements
        let reimbursement = round(reimbursement_total(&report.rows) * rate);
        if reimbursement.abs() >= noise_threshold() {
            lines.push(
                PostingLine::new(&self.settings.accounts.reimbursement, &base, Decimal::ONE)
                    .with_signed_debit(-reimbursement),
            );
        }

        // (e) special fees
        let mut special_total = Decimal::ZERO;
        for (desc, native) in special_fee_buckets(&report.rows, &self.settings) {
            let amount = round(native * rate);
            special_total += amount;
            if amount < noise_threshold() {
                continue;
            }
            let Some(account) = self.settings.accounts.special_fees.get(&desc) else {
                continue;
            };
            lines.push(
                PostingLine::new(account, &base, Decimal::ONE)
                    .with_debit(amount)
                    .with_remark(title_case(&desc)),
            );
        }

        // (f) misc fees
        let transfer_base = round(prepared.native_total * rate);
        let order_net_base = round(prepared.aggregates.order_net() * rate);
        let misc = round((order_net_base + reimbursement) - (transfer_base + special_total));
        diagnostics.misc_fees = misc;
        if misc.abs() >= noise_threshold() {
            lines.push(
                PostingLine::new(&self.settings.accounts.misc_fees, &base, Decimal::ONE).with_signed_debit(misc),
            );
        }
        if misc.abs() > self.settings.misc_fee_alert_threshold {
            diagnostics.misc_fee_alert = true;
            tracing::warn!(
                report_id = %prepared.report_id,
                misc_fees = %misc,
                threshold = %self.settings.misc_fee_alert_threshold,
                "Miscellaneous fees exceed alert threshold"
            );
        }

        // (g) rounding
        let diff = round(base_imbalance(&lines));
        diagnostics.imbalance = diff;
        if !diff.is_zero() {
            if diff.abs() > self.settings.large_imbalance_threshold {
                diagnostics.large_imbalance = true;
                tracing::warn!(
                    report_id = %prepared.report_id,
                    imbalance = %diff,
                    category = %ErrorCategory::BusinessRule,
                    "Large imbalance in base currency, manual review needed"
                );
            }
            lines.push(
                PostingLine::new(&self.settings.accounts.round_off, &base, Decimal::ONE)
                    .with_signed_debit(-diff)
                    .with_remark(BUILD_ROUNDING_REMARK),
            );
        }

        flag_advances(&mut lines);

        let deposit_at = report.header.deposit_at.or_else(|| {
            prepared
                .posting_date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
        });
        let multi_currency = !is_base_currency_only(&lines, &base);
        let mut draft = PostingDraft {
            report_id: prepared.report_id.clone(),
            posting_date: prepared.posting_date,
            deposit_at,
            remark: report.header.period_remark(),
            multi_currency,
            lines,
        };
        draft.renumber();

        tracing::info!(
            report_id = %prepared.report_id,
            lines = draft.lines.len(),
            currency = %prepared.settlement_currency,
            rate = %rate,
            misc_fees = %misc,
            failures = diagnostics.failures.len(),
            "Built provisional posting"
        );

        Ok(Some(BuiltPosting {
            draft,
            diagnostics,
            prepared,
        }))
    }

    fn ar_line(&self, accounts: &CurrencyAccounts, prepared: &PreparedReport, order_id: &str, refund: bool) -> PostingLine {
        let (marketplace, merchant_order_id) = prepared.aggregates.marketplace_fields(order_id);
        let stamp = MarketplaceStamp::for_order(&marketplace, &merchant_order_id, refund);
        let mut line = PostingLine::new(&accounts.debtors, &prepared.settlement_currency, prepared.rate);
        line.party = Some(Party::customer(&accounts.customer));
        line.order_id = Some(order_id.to_string());
        line.merchant_order_id = stamp.merchant_order_id;
        line.remark = stamp.remark;
        line
    }

    async fn open_invoice_reference(&self, order_id: &str) -> Result<Option<DocumentRef>, LedgerError> {
        let open = self
            .ledger
            .query_open_documents(order_id, DocumentKind::SalesInvoice)
            .await?;
        Ok(open.first().map(|doc| doc.to_ref()))
    }

    async fn refund_reference(
        &self,
        prepared: &PreparedReport,
        order_id: &str,
    ) -> Result<Option<DocumentRef>, (ErrorCategory, String)> {
        let invoice = self
            .ledger
            .latest_sales_invoice(order_id)
            .await
            .map_err(|e| (e.category(), e.to_string()))?;
        let Some(invoice) = invoice else {
            return Ok(None);
        };

        let refund_rows = prepared.aggregates.refund_rows(order_id);
        if refund_rows.is_empty() {
            return Ok(None);
        }
        let (marketplace, merchant_order_id) = prepared.aggregates.marketplace_fields(order_id);
        let ctx = RefundContext {
            report_id: &prepared.report_id,
            order_id,
            posting_date: prepared.posting_date,
            marketplace_name: &marketplace,
            merchant_order_id: &merchant_order_id,
            refund_rows: &refund_rows,
        };

        self.credit_notes
            .ensure_credit_note(&invoice, &ctx)
            .await
            .map(|doc| doc.map(|d| d.to_ref()))
            .map_err(|e| (e.category(), e.to_string()))
    }

    fn order_failure(&self, prepared: &PreparedReport, order_id: &str, category: ErrorCategory, message: String) -> OrderFailure {
        tracing::error!(
            report_id = %prepared.report_id,
            order_id = %order_id,
            category = %category,
            error = %message,
            "Order reference failed, leaving AR line unreferenced"
        );
        OrderFailure {
            order_id: order_id.to_string(),
            category,
            message,
        }
    }
}
