//! Credit notes for refunded orders
//!
//! A credit note is raised against the order's sales invoice the first time
//! a report carries refund rows for that order. Lookups are keyed by
//! (original invoice, report id), so replaying a report never creates a
//! second one.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::AccountMap;
use crate::error::ErrorCategory;
use crate::ledger::{LedgerError, LedgerPort};
use crate::models::{
    noise_threshold, CreditNoteCharge, CreditNoteItem, CreditNoteRequest, Document, MarketplaceStamp,
    SettlementRow,
};
use crate::retry::retry_locked;

#[derive(Debug, thiserror::Error)]
pub enum CreditNoteError {
    #[error("Cannot raise a credit note against credit note {0}")]
    ReturnAgainstReturn(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CreditNoteError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CreditNoteError::ReturnAgainstReturn(_) => ErrorCategory::BusinessRule,
            CreditNoteError::Ledger(e) => e.category(),
        }
    }
}

/// Refund context for one order in one report
#[derive(Debug, Clone)]
pub struct RefundContext<'a> {
    pub report_id: &'a str,
    pub order_id: &'a str,
    pub posting_date: NaiveDate,
    pub marketplace_name: &'a str,
    pub merchant_order_id: &'a str,
    pub refund_rows: &'a [SettlementRow],
}

fn add_to(bucket: &mut Vec<(String, Decimal)>, key: &str, amount: Decimal) {
    match bucket.iter_mut().find(|(k, _)| k == key) {
        Some((_, total)) => *total += amount,
        None => bucket.push((key.to_string(), amount)),
    }
}

/// Assemble credit note contents from an order's refund rows
///
/// Principal rows become one item per SKU; every other non-noise row is a
/// charge keyed by its upper-cased description, sign preserved. Returns
/// `None` when no SKU has a positive refunded principal.
pub fn build_credit_note_request(
    accounts: &AccountMap,
    invoice: &Document,
    ctx: &RefundContext<'_>,
) -> Option<CreditNoteRequest> {
    let mut by_sku: Vec<(String, Vec<&SettlementRow>)> = Vec::new();
    for row in ctx.refund_rows {
        let sku = row.sku.as_deref().map(str::trim).unwrap_or_default();
        match by_sku.iter_mut().find(|(s, _)| s == sku) {
            Some((_, rows)) => rows.push(row),
            None => by_sku.push((sku.to_string(), vec![row])),
        }
    }

    let mut items = Vec::new();
    let mut charges: Vec<(String, Decimal)> = Vec::new();
    let mut remark_details = Vec::new();

    for (sku, rows) in by_sku.iter().filter(|(sku, _)| !sku.is_empty()) {
        let principal: Decimal = -rows
            .iter()
            .filter(|r| r.is_principal())
            .map(|r| r.amount)
            .sum::<Decimal>();
        if principal <= Decimal::ZERO {
            continue;
        }
        items.push(CreditNoteItem {
            sku: sku.clone(),
            amount: principal,
        });

        let mut sku_charges: Vec<(String, Decimal)> = Vec::new();
        for row in rows.iter().filter(|r| !r.is_principal() && r.amount.abs() >= noise_threshold()) {
            let desc = row.description_upper();
            add_to(&mut sku_charges, &desc, row.amount);
            add_to(&mut charges, &desc, row.amount);
        }
        let breakdown: Vec<String> = sku_charges
            .iter()
            .filter(|(_, amount)| amount.abs() >= noise_threshold())
            .map(|(desc, amount)| format!("{} {:.2}", desc, amount))
            .collect();
        if !breakdown.is_empty() {
            remark_details.push(format!("Refund for SKU {}: {}", sku, breakdown.join(", ")));
        }
    }

    if items.is_empty() {
        return None;
    }

    if let Some((_, rows)) = by_sku.iter().find(|(sku, _)| sku.is_empty()) {
        for row in rows.iter().filter(|r| !r.is_principal() && r.amount.abs() >= noise_threshold()) {
            add_to(&mut charges, &row.description_upper(), row.amount);
        }
    }

    let charges = charges
        .into_iter()
        .filter(|(_, amount)| amount.abs() >= noise_threshold())
        .map(|(description, amount)| CreditNoteCharge {
            account: accounts.charge_account(&description),
            description,
            amount,
        })
        .collect();

    let stamp = MarketplaceStamp::for_order(ctx.marketplace_name, ctx.merchant_order_id, true);
    let remark = match (stamp.remark, remark_details.is_empty()) {
        (Some(base), false) => Some(format!("{}\n{}", base, remark_details.join("\n"))),
        (Some(base), true) => Some(base),
        (None, false) => Some(remark_details.join("\n")),
        (None, true) => None,
    };

    Some(CreditNoteRequest {
        original_invoice_id: invoice.id.clone(),
        order_id: ctx.order_id.to_string(),
        report_id: ctx.report_id.to_string(),
        customer: invoice.customer.clone(),
        posting_date: ctx.posting_date,
        merchant_order_id: stamp.merchant_order_id,
        remark,
        items,
        charges,
    })
}

#[derive(Clone)]
pub struct CreditNoteService {
    ledger: Arc<dyn LedgerPort>,
    accounts: AccountMap,
}

impl CreditNoteService {
    pub fn new(ledger: Arc<dyn LedgerPort>, accounts: AccountMap) -> Self {
        Self { ledger, accounts }
    }

    /// Existing credit note for (invoice, report), or a new one
    ///
    /// `Ok(None)` means there was nothing to credit.
    pub async fn ensure_credit_note(
        &self,
        invoice: &Document,
        ctx: &RefundContext<'_>,
    ) -> Result<Option<Document>, CreditNoteError> {
        if invoice.is_return() {
            return Err(CreditNoteError::ReturnAgainstReturn(invoice.id.clone()));
        }
        if ctx.refund_rows.is_empty() {
            return Ok(None);
        }

        if let Some(existing) = self.ledger.find_credit_note(&invoice.id, ctx.report_id).await? {
            tracing::debug!(
                report_id = %ctx.report_id,
                order_id = %ctx.order_id,
                credit_note = %existing.id,
                "Credit note already exists"
            );
            return Ok(Some(existing));
        }

        let Some(request) = build_credit_note_request(&self.accounts, invoice, ctx) else {
            tracing::info!(
                report_id = %ctx.report_id,
                order_id = %ctx.order_id,
                "No refunded principal, skipping credit note"
            );
            return Ok(None);
        };

        let context = format!("create_credit_note {}", ctx.order_id);
        let doc = retry_locked(|| self.ledger.create_credit_note(&request), &context).await?;

        tracing::info!(
            report_id = %ctx.report_id,
            order_id = %ctx.order_id,
            invoice = %invoice.id,
            credit_note = %doc.id,
            total = %doc.grand_total,
            "Created credit note"
        );
        Ok(Some(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::models::DocumentKind;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::{BTreeMap, HashMap};

    fn accounts() -> AccountMap {
        AccountMap {
            currencies: HashMap::new(),
            reimbursement: "Reimbursements".into(),
            misc_fees: "Misc Fees".into(),
            round_off: "Round Off".into(),
            bank: "Bank".into(),
            special_fees: BTreeMap::new(),
            charge_account_prefix: "Amazon".into(),
        }
    }

    fn refund(sku: Option<&str>, desc: &str, amount: Decimal) -> SettlementRow {
        SettlementRow {
            transaction_type: "refund".into(),
            order_id: Some("O1".into()),
            sku: sku.map(str::to_string),
            amount_type: "ItemPrice".into(),
            amount_description: desc.into(),
            amount,
            ..Default::default()
        }
    }

    fn invoice() -> Document {
        Document {
            id: "SI-1".into(),
            kind: DocumentKind::SalesInvoice,
            order_id: "O1".into(),
            customer: Some("Amazon US".into()),
            posting_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            grand_total: dec!(100),
            outstanding: dec!(0),
            return_against: None,
            source_report_id: None,
            created_at: Utc::now(),
        }
    }

    fn ctx<'a>(rows: &'a [SettlementRow]) -> RefundContext<'a> {
        RefundContext {
            report_id: "R1",
            order_id: "O1",
            posting_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            marketplace_name: "amazon.com",
            merchant_order_id: "",
            refund_rows: rows,
        }
    }

    #[test]
    fn groups_principal_by_sku_and_aggregates_charges() {
        let rows = vec![
            refund(Some("SKU-A"), "Principal", dec!(-40.00)),
            refund(Some("SKU-A"), "Shipping", dec!(-5.00)),
            refund(Some("SKU-B"), "Principal", dec!(-10.00)),
            refund(Some("SKU-B"), "Shipping", dec!(-2.00)),
            refund(Some("SKU-B"), "Commission", dec!(0.004)),
            refund(None, "RefundCommission", dec!(3.00)),
        ];
        let request = build_credit_note_request(&accounts(), &invoice(), &ctx(&rows)).unwrap();

        assert_eq!(request.items.len(), 2);
        assert_eq!(request.items[0].amount, dec!(40.00));
        assert_eq!(request.charges.len(), 2);
        assert_eq!(request.charges[0].description, "SHIPPING");
        assert_eq!(request.charges[0].amount, dec!(-7.00));
        assert_eq!(request.charges[0].account, "Amazon Shipping");
        assert_eq!(request.charges[1].description, "REFUNDCOMMISSION");
        assert_eq!(request.total(), dec!(54.00));

        let remark = request.remark.unwrap();
        assert!(remark.starts_with("Fulfillment by Amazon (FBA) Order Refund"));
        assert!(remark.contains("Refund for SKU SKU-A: SHIPPING -5.00"));
    }

    #[test]
    fn no_principal_means_no_credit_note() {
        let rows = vec![refund(Some("SKU-A"), "Shipping", dec!(-5.00))];
        assert!(build_credit_note_request(&accounts(), &invoice(), &ctx(&rows)).is_none());
    }

    #[tokio::test]
    async fn ensure_is_idempotent_per_report() {
        let ledger = Arc::new(InMemoryLedger::new());
        let si = ledger
            .add_sales_invoice("SI-1", "O1", NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), dec!(100))
            .await;
        let service = CreditNoteService::new(ledger.clone(), accounts());
        let rows = vec![refund(Some("SKU-A"), "Principal", dec!(-40.00))];

        let first = service.ensure_credit_note(&si, &ctx(&rows)).await.unwrap().unwrap();
        let second = service.ensure_credit_note(&si, &ctx(&rows)).await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.credit_notes().await.len(), 1);
        assert_eq!(first.return_against.as_deref(), Some("SI-1"));
    }

    #[tokio::test]
    async fn rejects_credit_note_against_credit_note() {
        let ledger = Arc::new(InMemoryLedger::new());
        let service = CreditNoteService::new(ledger, accounts());
        let mut cn = invoice();
        cn.kind = DocumentKind::CreditNote;

        let rows = vec![refund(Some("SKU-A"), "Principal", dec!(-40.00))];
        let err = service.ensure_credit_note(&cn, &ctx(&rows)).await.unwrap_err();
        assert!(matches!(err, CreditNoteError::ReturnAgainstReturn(_)));
        assert_eq!(err.category(), ErrorCategory::BusinessRule);
    }
}
