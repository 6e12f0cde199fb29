//! In-memory implementation of the ledger port for tests and local runs

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerError, LedgerPort, LedgerResult};
use crate::models::{
    CreditNoteRequest, Document, DocumentKind, DocumentRef, Posting, PostingDraft, PostingId,
    PostingLine, PostingStatus, TransferRequest,
};
use crate::services::fx_service::ManualRateBook;

#[derive(Default)]
struct State {
    postings: Vec<Posting>,
    documents: Vec<Document>,
    credit_note_requests: Vec<CreditNoteRequest>,
    transfers: Vec<(String, TransferRequest)>,
    manual_rates: Vec<(String, String, NaiveDate, Decimal)>,
    /// Remaining simulated lock failures per posting
    locks: HashMap<PostingId, u32>,
    next_document: u64,
}

impl State {
    fn posting_mut(&mut self, id: PostingId) -> LedgerResult<&mut Posting> {
        self.postings
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("posting {}", id)))
    }

    fn check_lock(&mut self, id: PostingId) -> LedgerResult<()> {
        if let Some(remaining) = self.locks.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LedgerError::Locked(format!("posting {}", id)));
            }
        }
        Ok(())
    }

    fn settle(&mut self, line: &PostingLine) {
        let Some(reference) = &line.reference else {
            return;
        };
        if let Some(doc) = self.documents.iter_mut().find(|d| d.id == reference.id) {
            let applied = line.amount().min(doc.outstanding);
            doc.outstanding -= applied;
        }
    }
}

/// Ledger held entirely in process memory
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_sales_invoice(
        &self,
        id: &str,
        order_id: &str,
        posting_date: NaiveDate,
        grand_total: Decimal,
    ) -> Document {
        let doc = Document {
            id: id.to_string(),
            kind: DocumentKind::SalesInvoice,
            order_id: order_id.to_string(),
            customer: None,
            posting_date,
            grand_total,
            outstanding: grand_total,
            return_against: None,
            source_report_id: None,
            created_at: Utc::now(),
        };
        self.state.lock().await.documents.push(doc.clone());
        doc
    }

    pub async fn add_credit_note(
        &self,
        id: &str,
        order_id: &str,
        posting_date: NaiveDate,
        grand_total: Decimal,
        return_against: Option<&str>,
    ) -> Document {
        let doc = Document {
            id: id.to_string(),
            kind: DocumentKind::CreditNote,
            order_id: order_id.to_string(),
            customer: None,
            posting_date,
            grand_total,
            outstanding: grand_total,
            return_against: return_against.map(str::to_string),
            source_report_id: None,
            created_at: Utc::now(),
        };
        self.state.lock().await.documents.push(doc.clone());
        doc
    }

    pub async fn add_manual_rate(&self, from: &str, to: &str, date: NaiveDate, rate: Decimal) {
        self.state
            .lock()
            .await
            .manual_rates
            .push((from.to_uppercase(), to.to_uppercase(), date, rate));
    }

    /// Make the next `attempts` writes to the posting fail with `Locked`
    pub async fn lock_posting(&self, id: PostingId, attempts: u32) {
        self.state.lock().await.locks.insert(id, attempts);
    }

    pub async fn set_posting_status(&self, id: PostingId, status: PostingStatus) -> LedgerResult<()> {
        self.state.lock().await.posting_mut(id)?.status = status;
        Ok(())
    }

    pub async fn document(&self, id: &str) -> Option<Document> {
        self.state.lock().await.documents.iter().find(|d| d.id == id).cloned()
    }

    pub async fn credit_notes(&self) -> Vec<Document> {
        self.state
            .lock()
            .await
            .documents
            .iter()
            .filter(|d| d.kind == DocumentKind::CreditNote)
            .cloned()
            .collect()
    }

    pub async fn credit_note_requests(&self) -> Vec<CreditNoteRequest> {
        self.state.lock().await.credit_note_requests.clone()
    }

    pub async fn postings(&self) -> Vec<Posting> {
        self.state.lock().await.postings.clone()
    }

    pub async fn transfers(&self) -> Vec<TransferRequest> {
        self.state
            .lock()
            .await
            .transfers
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl LedgerPort for InMemoryLedger {
    async fn find_posting(&self, report_id: &str, status: PostingStatus) -> LedgerResult<Option<Posting>> {
        let state = self.state.lock().await;
        Ok(state
            .postings
            .iter()
            .rev()
            .find(|p| p.report_id == report_id && p.status == status)
            .cloned())
    }

    async fn create_posting(&self, draft: PostingDraft) -> LedgerResult<PostingId> {
        let id = Uuid::new_v4();
        let posting = Posting {
            id,
            report_id: draft.report_id,
            status: PostingStatus::Provisional,
            posting_date: draft.posting_date,
            deposit_at: draft.deposit_at,
            remark: draft.remark,
            multi_currency: draft.multi_currency,
            lines: draft.lines,
            created_at: Utc::now(),
        };
        self.state.lock().await.postings.push(posting);
        Ok(id)
    }

    async fn get_posting(&self, id: PostingId) -> LedgerResult<Option<Posting>> {
        let state = self.state.lock().await;
        Ok(state.postings.iter().find(|p| p.id == id).cloned())
    }

    async fn update_posting_lines(&self, id: PostingId, lines: Vec<PostingLine>) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.check_lock(id)?;
        let posting = state.posting_mut(id)?;
        if posting.status != PostingStatus::Provisional {
            return Err(LedgerError::InvalidState(format!(
                "posting {} is {}",
                id,
                posting.status.as_str()
            )));
        }
        posting.lines = lines;
        Ok(())
    }

    async fn confirm_posting(&self, id: PostingId) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.check_lock(id)?;
        let posting = state.posting_mut(id)?;
        if posting.status != PostingStatus::Provisional {
            return Err(LedgerError::InvalidState(format!(
                "posting {} is {}",
                id,
                posting.status.as_str()
            )));
        }
        posting.status = PostingStatus::Final;
        let lines = posting.lines.clone();
        for line in &lines {
            state.settle(line);
        }
        Ok(())
    }

    async fn attach_reference(&self, id: PostingId, line_no: u32, reference: DocumentRef) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.check_lock(id)?;
        let posting = state.posting_mut(id)?;
        let is_final = posting.status == PostingStatus::Final;
        let line = posting
            .lines
            .iter_mut()
            .find(|l| l.line_no == line_no)
            .ok_or_else(|| LedgerError::NotFound(format!("line {} of posting {}", line_no, id)))?;
        if line.reference.is_some() {
            return Err(LedgerError::InvalidState(format!(
                "line {} of posting {} is already referenced",
                line_no, id
            )));
        }
        line.reference = Some(reference);
        line.is_advance = false;
        let line = line.clone();
        if is_final {
            state.settle(&line);
        }
        Ok(())
    }

    async fn latest_sales_invoice(&self, order_id: &str) -> LedgerResult<Option<Document>> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .iter()
            .filter(|d| d.kind == DocumentKind::SalesInvoice && d.order_id == order_id)
            .fold(None::<&Document>, |latest, d| match latest {
                Some(l) if l.posting_date > d.posting_date => Some(l),
                _ => Some(d),
            })
            .cloned())
    }

    async fn query_open_documents(&self, order_id: &str, kind: DocumentKind) -> LedgerResult<Vec<Document>> {
        let state = self.state.lock().await;
        let mut docs: Vec<Document> = state
            .documents
            .iter()
            .filter(|d| d.kind == kind && d.order_id == order_id && d.is_open())
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.posting_date.cmp(&b.posting_date).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn query_outstanding_amount(&self, document_id: &str) -> LedgerResult<Decimal> {
        let state = self.state.lock().await;
        state
            .documents
            .iter()
            .find(|d| d.id == document_id)
            .map(|d| d.outstanding)
            .ok_or_else(|| LedgerError::NotFound(format!("document {}", document_id)))
    }

    async fn find_credit_note(&self, original_invoice_id: &str, report_id: &str) -> LedgerResult<Option<Document>> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .iter()
            .find(|d| {
                d.kind == DocumentKind::CreditNote
                    && d.return_against.as_deref() == Some(original_invoice_id)
                    && d.source_report_id.as_deref() == Some(report_id)
            })
            .cloned())
    }

    async fn create_credit_note(&self, request: &CreditNoteRequest) -> LedgerResult<Document> {
        let mut state = self.state.lock().await;
        let original = state
            .documents
            .iter()
            .find(|d| d.id == request.original_invoice_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {}", request.original_invoice_id)))?;

        state.next_document += 1;
        let total = request.total();
        let doc = Document {
            id: format!("CN-{:05}", state.next_document),
            kind: DocumentKind::CreditNote,
            order_id: request.order_id.clone(),
            customer: request.customer.clone().or(original.customer),
            posting_date: request.posting_date,
            grand_total: total,
            outstanding: total,
            return_against: Some(request.original_invoice_id.clone()),
            source_report_id: Some(request.report_id.clone()),
            created_at: Utc::now(),
        };
        state.documents.push(doc.clone());
        state.credit_note_requests.push(request.clone());
        Ok(doc)
    }

    async fn is_referenced_by_report(&self, report_id: &str, document_id: &str) -> LedgerResult<bool> {
        let state = self.state.lock().await;
        let Some(order_id) = state
            .documents
            .iter()
            .find(|d| d.id == document_id)
            .map(|d| d.order_id.clone())
        else {
            return Ok(false);
        };

        Ok(state
            .postings
            .iter()
            .filter(|p| p.status == PostingStatus::Final && p.report_id.starts_with(report_id))
            .flat_map(|p| p.lines.iter())
            .any(|l| {
                l.reference.as_ref().map(|r| r.id.as_str()) == Some(document_id)
                    && l.order_id.as_deref() == Some(order_id.as_str())
            }))
    }

    async fn list_final_postings_since(&self, since: NaiveDate) -> LedgerResult<Vec<Posting>> {
        let state = self.state.lock().await;
        Ok(state
            .postings
            .iter()
            .filter(|p| p.status == PostingStatus::Final && p.posting_date >= since)
            .cloned()
            .collect())
    }

    async fn transfer_exists(&self, reference: &str) -> LedgerResult<bool> {
        let state = self.state.lock().await;
        Ok(state.transfers.iter().any(|(_, t)| t.reference == reference))
    }

    async fn create_transfer(&self, request: &TransferRequest) -> LedgerResult<String> {
        let mut state = self.state.lock().await;
        let id = format!("XFER-{:05}", state.transfers.len() + 1);
        state.transfers.push((id.clone(), request.clone()));
        Ok(id)
    }
}

#[async_trait]
impl ManualRateBook for InMemoryLedger {
    async fn latest_manual_rate(&self, from: &str, to: &str, on_or_before: NaiveDate) -> LedgerResult<Option<Decimal>> {
        let state = self.state.lock().await;
        Ok(state
            .manual_rates
            .iter()
            .filter(|(f, t, d, _)| f == &from.to_uppercase() && t == &to.to_uppercase() && *d <= on_or_before)
            .max_by_key(|(_, _, d, _)| *d)
            .map(|(_, _, _, rate)| *rate))
    }
}
