//! Late allocation
//!
//! When a report already has a final posting, later passes only attach
//! references to the AR lines that were left unreferenced: invoices that
//! did not exist yet, or credit notes that could not be created at the time.
//! Every attach is preceded by the report-level reference check, so running
//! the pass repeatedly is a no-op once everything is allocated.

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;

use super::credit_note_service::{CreditNoteService, RefundContext};
use super::posting_builder::{OrderFailure, PreparedReport};
use crate::error::ErrorCategory;
use crate::ledger::{LedgerError, LedgerPort};
use crate::models::{noise_threshold, Document, DocumentKind, Posting, PostingStatus};
use crate::retry::retry_locked;

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("Posting {0} is not final")]
    NotFinal(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AllocationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AllocationError::NotFinal(_) => ErrorCategory::BusinessRule,
            AllocationError::Ledger(e) => e.category(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub order_id: String,
    pub line_no: u32,
    pub document_id: String,
    pub applied: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationSummary {
    pub attached: Vec<Attachment>,
    pub credit_notes: Vec<String>,
    pub failures: Vec<OrderFailure>,
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Credit,
    Debit,
}

/// Mutable view of the posting while lines get referenced
struct Allocation<'a> {
    posting: &'a Posting,
    taken: HashSet<u32>,
}

impl<'a> Allocation<'a> {
    fn new(posting: &'a Posting) -> Self {
        Self {
            posting,
            taken: HashSet::new(),
        }
    }

    /// Amount this posting already applies to documents for the order
    fn already_applied(&self, order_id: &str, side: Side) -> Decimal {
        self.posting
            .lines
            .iter()
            .filter(|l| l.order_id.as_deref() == Some(order_id))
            .filter(|l| l.reference.is_some() || self.taken.contains(&l.line_no))
            .map(|l| match side {
                Side::Credit => l.credit,
                Side::Debit => l.debit,
            })
            .sum()
    }

    fn free_line(&self, order_id: &str, side: Side) -> Option<u32> {
        self.posting
            .lines
            .iter()
            .find(|l| {
                l.order_id.as_deref() == Some(order_id)
                    && l.reference.is_none()
                    && !self.taken.contains(&l.line_no)
                    && match side {
                        Side::Credit => l.is_credit(),
                        Side::Debit => l.is_debit(),
                    }
            })
            .map(|l| l.line_no)
    }
}

#[derive(Clone)]
pub struct AllocationService {
    ledger: Arc<dyn LedgerPort>,
    credit_notes: CreditNoteService,
}

impl AllocationService {
    pub fn new(ledger: Arc<dyn LedgerPort>, credit_notes: CreditNoteService) -> Self {
        Self { ledger, credit_notes }
    }

    /// Attach late documents to the unreferenced AR lines of a final posting
    pub async fn allocate_late(
        &self,
        posting: &Posting,
        prepared: &PreparedReport,
    ) -> Result<AllocationSummary, AllocationError> {
        if posting.status != PostingStatus::Final {
            return Err(AllocationError::NotFinal(posting.id.to_string()));
        }

        let mut state = Allocation::new(posting);
        let mut summary = AllocationSummary::default();

        for (order_id, sales) in &prepared.aggregates.sales_totals {
            if let Err(e) = self
                .allocate_sales(&mut state, &mut summary, prepared, order_id, *sales)
                .await
            {
                summary.failures.push(failure(prepared, order_id, e.category(), e.to_string()));
            }
        }

        for (order_id, refunds) in &prepared.aggregates.refund_totals {
            if let Err((category, message)) = self
                .allocate_refunds(&mut state, &mut summary, prepared, order_id, *refunds)
                .await
            {
                summary.failures.push(failure(prepared, order_id, category, message));
            }
        }

        if !summary.attached.is_empty() {
            tracing::info!(
                report_id = %prepared.report_id,
                attached = summary.attached.len(),
                credit_notes = summary.credit_notes.len(),
                "Late allocation attached documents"
            );
        }
        Ok(summary)
    }

    async fn allocate_sales(
        &self,
        state: &mut Allocation<'_>,
        summary: &mut AllocationSummary,
        prepared: &PreparedReport,
        order_id: &str,
        sales: Decimal,
    ) -> Result<(), LedgerError> {
        let mut remaining = sales - state.already_applied(order_id, Side::Credit);
        if remaining < noise_threshold() {
            return Ok(());
        }

        let invoices = self
            .ledger
            .query_open_documents(order_id, DocumentKind::SalesInvoice)
            .await?;
        for invoice in invoices {
            let applied = self
                .try_attach(state, summary, prepared, order_id, &invoice, remaining, Side::Credit)
                .await?;
            remaining -= applied;
            if remaining < noise_threshold() {
                break;
            }
        }
        Ok(())
    }

    async fn allocate_refunds(
        &self,
        state: &mut Allocation<'_>,
        summary: &mut AllocationSummary,
        prepared: &PreparedReport,
        order_id: &str,
        refunds: Decimal,
    ) -> Result<(), (ErrorCategory, String)> {
        let ledger_err = |e: LedgerError| (e.category(), e.to_string());

        let mut remaining = refunds - state.already_applied(order_id, Side::Debit);
        if remaining < noise_threshold() {
            return Ok(());
        }

        let invoice = self.ledger.latest_sales_invoice(order_id).await.map_err(ledger_err)?;
        let refund_rows = prepared.aggregates.refund_rows(order_id);
        if let (Some(invoice), false) = (invoice, refund_rows.is_empty()) {
            let (marketplace, merchant_order_id) = prepared.aggregates.marketplace_fields(order_id);
            let ctx = RefundContext {
                report_id: &prepared.report_id,
                order_id,
                posting_date: prepared.posting_date,
                marketplace_name: &marketplace,
                merchant_order_id: &merchant_order_id,
                refund_rows: &refund_rows,
            };
            let credit_note = self
                .credit_notes
                .ensure_credit_note(&invoice, &ctx)
                .await
                .map_err(|e| (e.category(), e.to_string()))?;

            if let Some(credit_note) = credit_note {
                if !summary.credit_notes.contains(&credit_note.id) {
                    summary.credit_notes.push(credit_note.id.clone());
                }
                remaining -= self
                    .try_attach(state, summary, prepared, order_id, &credit_note, remaining, Side::Debit)
                    .await
                    .map_err(ledger_err)?;
                if remaining < noise_threshold() {
                    return Ok(());
                }
            }
        }

        let open = self
            .ledger
            .query_open_documents(order_id, DocumentKind::CreditNote)
            .await
            .map_err(ledger_err)?;
        for credit_note in open {
            remaining -= self
                .try_attach(state, summary, prepared, order_id, &credit_note, remaining, Side::Debit)
                .await
                .map_err(ledger_err)?;
            if remaining < noise_threshold() {
                break;
            }
        }
        Ok(())
    }

    /// Attach `document` to a free line on `side`; returns the amount applied
    async fn try_attach(
        &self,
        state: &mut Allocation<'_>,
        summary: &mut AllocationSummary,
        prepared: &PreparedReport,
        order_id: &str,
        document: &Document,
        remaining: Decimal,
        side: Side,
    ) -> Result<Decimal, LedgerError> {
        if self
            .ledger
            .is_referenced_by_report(&prepared.report_id, &document.id)
            .await?
        {
            tracing::debug!(
                report_id = %prepared.report_id,
                order_id = %order_id,
                document = %document.id,
                "Document already referenced by this report"
            );
            return Ok(Decimal::ZERO);
        }

        let outstanding = self.ledger.query_outstanding_amount(&document.id).await?;
        let apply = remaining.min(outstanding);
        if apply < noise_threshold() {
            return Ok(Decimal::ZERO);
        }

        let Some(line_no) = state.free_line(order_id, side) else {
            return Ok(Decimal::ZERO);
        };

        let posting_id = state.posting.id;
        let reference = document.to_ref();
        let context = format!("attach_reference {} line {}", prepared.report_id, line_no);
        retry_locked(
            || self.ledger.attach_reference(posting_id, line_no, reference.clone()),
            &context,
        )
        .await?;

        state.taken.insert(line_no);
        summary.attached.push(Attachment {
            order_id: order_id.to_string(),
            line_no,
            document_id: document.id.clone(),
            applied: apply,
        });
        tracing::info!(
            report_id = %prepared.report_id,
            order_id = %order_id,
            document = %document.id,
            line_no,
            applied = %apply,
            "Allocated late document"
        );
        Ok(apply)
    }
}

fn failure(prepared: &PreparedReport, order_id: &str, category: ErrorCategory, message: String) -> OrderFailure {
    tracing::error!(
        report_id = %prepared.report_id,
        order_id = %order_id,
        category = %category,
        error = %message,
        "Late allocation failed for order"
    );
    OrderFailure {
        order_id: order_id.to_string(),
        category,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentRef, PostingLine};
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn ar(order: &str, debit: Decimal, credit: Decimal, referenced: bool) -> PostingLine {
        let mut line = PostingLine::new("Debtors", "USD", Decimal::ONE)
            .with_debit(debit)
            .with_credit(credit);
        line.order_id = Some(order.to_string());
        if referenced {
            line.reference = Some(DocumentRef {
                kind: DocumentKind::SalesInvoice,
                id: "SI-1".into(),
            });
        }
        line
    }

    fn posting(lines: Vec<PostingLine>) -> Posting {
        let mut lines = lines;
        for (i, line) in lines.iter_mut().enumerate() {
            line.line_no = i as u32 + 1;
        }
        Posting {
            id: Uuid::new_v4(),
            report_id: "R1".into(),
            status: PostingStatus::Final,
            posting_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            deposit_at: None,
            remark: String::new(),
            multi_currency: false,
            lines,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn applied_amounts_are_split_by_polarity() {
        let posting = posting(vec![
            ar("O1", dec!(0), dec!(30), true),
            ar("O1", dec!(12), dec!(0), true),
            ar("O1", dec!(0), dec!(5), false),
            ar("O2", dec!(0), dec!(99), true),
        ]);
        let mut state = Allocation::new(&posting);

        assert_eq!(state.already_applied("O1", Side::Credit), dec!(30));
        assert_eq!(state.already_applied("O1", Side::Debit), dec!(12));
        assert_eq!(state.free_line("O1", Side::Credit), Some(3));
        assert_eq!(state.free_line("O1", Side::Debit), None);

        state.taken.insert(3);
        assert_eq!(state.already_applied("O1", Side::Credit), dec!(35));
        assert_eq!(state.free_line("O1", Side::Credit), None);
    }
}
