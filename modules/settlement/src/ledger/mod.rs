//! Ledger port
//!
//! The engine never talks to the accounting system directly. Postings,
//! invoices, credit notes and transfers are reached through [`LedgerPort`];
//! `inmemory` backs tests and local runs, `postgres` backs production.

pub mod inmemory;
pub mod postgres;

pub use inmemory::InMemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::error::ErrorCategory;
use crate::models::{
    CreditNoteRequest, Document, DocumentKind, DocumentRef, Posting, PostingDraft, PostingId,
    PostingLine, PostingStatus, TransferRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Document locked: {0}")]
    Locked(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn is_locked(&self) -> bool {
        matches!(self, LedgerError::Locked(_))
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::Locked(_) | LedgerError::Database(_) => ErrorCategory::Transient,
            LedgerError::NotFound(_) | LedgerError::InvalidState(_) => ErrorCategory::BusinessRule,
        }
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[async_trait]
pub trait LedgerPort: Send + Sync {
    /// Posting for `report_id` in the given status, if any
    async fn find_posting(&self, report_id: &str, status: PostingStatus) -> LedgerResult<Option<Posting>>;

    /// Store a draft as a provisional posting
    async fn create_posting(&self, draft: PostingDraft) -> LedgerResult<PostingId>;

    async fn get_posting(&self, id: PostingId) -> LedgerResult<Option<Posting>>;

    /// Replace the lines of a provisional posting
    async fn update_posting_lines(&self, id: PostingId, lines: Vec<PostingLine>) -> LedgerResult<()>;

    /// Provisional -> final; referenced documents are settled
    async fn confirm_posting(&self, id: PostingId) -> LedgerResult<()>;

    /// Point an unreferenced line at a document
    async fn attach_reference(&self, id: PostingId, line_no: u32, reference: DocumentRef) -> LedgerResult<()>;

    /// Most recent non-return invoice for an order
    async fn latest_sales_invoice(&self, order_id: &str) -> LedgerResult<Option<Document>>;

    /// Open documents of `kind` for an order, oldest first
    async fn query_open_documents(&self, order_id: &str, kind: DocumentKind) -> LedgerResult<Vec<Document>>;

    async fn query_outstanding_amount(&self, document_id: &str) -> LedgerResult<Decimal>;

    /// Credit note raised against `original_invoice_id` by `report_id`
    async fn find_credit_note(&self, original_invoice_id: &str, report_id: &str) -> LedgerResult<Option<Document>>;

    async fn create_credit_note(&self, request: &CreditNoteRequest) -> LedgerResult<Document>;

    /// Whether a final posting whose report id starts with `report_id`
    /// already references `document_id` on a line for the document's order
    async fn is_referenced_by_report(&self, report_id: &str, document_id: &str) -> LedgerResult<bool>;

    async fn list_final_postings_since(&self, since: NaiveDate) -> LedgerResult<Vec<Posting>>;

    async fn transfer_exists(&self, reference: &str) -> LedgerResult<bool>;

    async fn create_transfer(&self, request: &TransferRequest) -> LedgerResult<String>;
}
