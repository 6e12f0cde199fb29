//! Postgres ledger adapter
//!
//! Row locks are taken with `FOR UPDATE NOWAIT`; a lock conflict surfaces as
//! SQLSTATE 55P03 and is reported as [`LedgerError::Locked`] so callers can
//! go through the lock-retry wrapper.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{LedgerError, LedgerPort, LedgerResult};
use crate::models::{
    CreditNoteRequest, Document, DocumentKind, DocumentRef, Party, PartyKind, Posting, PostingDraft,
    PostingId, PostingLine, PostingStatus, TransferRequest,
};
use crate::services::fx_service::ManualRateBook;

const LOCK_NOT_AVAILABLE: &str = "55P03";

type PostingRow = (Uuid, String, String, NaiveDate, Option<DateTime<Utc>>, String, bool, DateTime<Utc>);

type LineRow = (
    i32,
    String,
    String,
    Decimal,
    Decimal,
    Decimal,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    bool,
    Option<String>,
);

type DocumentRow = (
    String,
    String,
    String,
    Option<String>,
    NaiveDate,
    Decimal,
    Decimal,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

const POSTING_COLUMNS: &str =
    "id, report_id, status, posting_date, deposit_at, remark, multi_currency, created_at";

const DOCUMENT_COLUMNS: &str = "id, kind, order_id, customer, posting_date, grand_total, outstanding, \
     return_against, source_report_id, created_at";

fn lock_error(err: sqlx::Error, what: impl Into<String>) -> LedgerError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return LedgerError::Locked(what.into());
        }
    }
    LedgerError::Database(err)
}

fn document_from_row(row: DocumentRow) -> LedgerResult<Document> {
    let kind = DocumentKind::from_str(&row.1)
        .ok_or_else(|| LedgerError::InvalidState(format!("document {} has kind {}", row.0, row.1)))?;
    Ok(Document {
        id: row.0,
        kind,
        order_id: row.2,
        customer: row.3,
        posting_date: row.4,
        grand_total: row.5,
        outstanding: row.6,
        return_against: row.7,
        source_report_id: row.8,
        created_at: row.9,
    })
}

fn line_from_row(row: LineRow) -> PostingLine {
    let party = match (row.6, row.7) {
        (Some(kind), Some(id)) => Some(Party {
            kind: PartyKind::from_str(&kind),
            id,
        }),
        _ => None,
    };
    let reference = match (row.10, row.11) {
        (Some(kind), Some(id)) => DocumentKind::from_str(&kind).map(|kind| DocumentRef { kind, id }),
        _ => None,
    };
    PostingLine {
        line_no: row.0.max(0) as u32,
        account: row.1,
        currency: row.2,
        debit: row.3,
        credit: row.4,
        exchange_rate: row.5,
        party,
        order_id: row.8,
        merchant_order_id: row.9,
        reference,
        is_advance: row.12,
        remark: row.13,
    }
}

/// Ledger backed by the settlement tables in Postgres
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert an invoice or credit note created outside the engine
    pub async fn insert_document(&self, doc: &Document) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_documents
                (id, kind, order_id, customer, posting_date, grand_total, outstanding,
                 return_against, source_report_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&doc.id)
        .bind(doc.kind.as_str())
        .bind(&doc.order_id)
        .bind(&doc.customer)
        .bind(doc.posting_date)
        .bind(doc.grand_total)
        .bind(doc.outstanding)
        .bind(&doc.return_against)
        .bind(&doc.source_report_id)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_manual_rate(&self, from: &str, to: &str, date: NaiveDate, rate: Decimal) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_exchange_rates (from_currency, to_currency, rate_date, rate)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (from_currency, to_currency, rate_date) DO UPDATE SET rate = EXCLUDED.rate
            "#,
        )
        .bind(from.to_uppercase())
        .bind(to.to_uppercase())
        .bind(date)
        .bind(rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_lines(&self, posting_id: PostingId) -> LedgerResult<Vec<PostingLine>> {
        let rows = sqlx::query_as::<_, LineRow>(
            r#"
            SELECT line_no, account, currency, debit, credit, exchange_rate,
                   party_kind, party_id, order_id, merchant_order_id,
                   reference_kind, reference_id, is_advance, remark
            FROM settlement_posting_lines
            WHERE posting_id = $1
            ORDER BY line_no
            "#,
        )
        .bind(posting_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(line_from_row).collect())
    }

    async fn hydrate(&self, row: PostingRow) -> LedgerResult<Posting> {
        let status = PostingStatus::from_str(&row.2)
            .ok_or_else(|| LedgerError::InvalidState(format!("posting {} has status {}", row.0, row.2)))?;
        let lines = self.load_lines(row.0).await?;
        Ok(Posting {
            id: row.0,
            report_id: row.1,
            status,
            posting_date: row.3,
            deposit_at: row.4,
            remark: row.5,
            multi_currency: row.6,
            lines,
            created_at: row.7,
        })
    }

    /// Lock the posting row and return its status
    async fn lock_posting(tx: &mut Transaction<'_, Postgres>, id: PostingId) -> LedgerResult<PostingStatus> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM settlement_postings WHERE id = $1 FOR UPDATE NOWAIT")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| lock_error(e, format!("posting {}", id)))?;

        let (status,) = status.ok_or_else(|| LedgerError::NotFound(format!("posting {}", id)))?;
        PostingStatus::from_str(&status)
            .ok_or_else(|| LedgerError::InvalidState(format!("posting {} has status {}", id, status)))
    }

    async fn insert_lines(
        tx: &mut Transaction<'_, Postgres>,
        posting_id: PostingId,
        lines: &[PostingLine],
    ) -> LedgerResult<()> {
        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO settlement_posting_lines
                    (posting_id, line_no, account, currency, debit, credit, exchange_rate,
                     party_kind, party_id, order_id, merchant_order_id,
                     reference_kind, reference_id, is_advance, remark)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(posting_id)
            .bind(line.line_no as i32)
            .bind(&line.account)
            .bind(&line.currency)
            .bind(line.debit)
            .bind(line.credit)
            .bind(line.exchange_rate)
            .bind(line.party.as_ref().map(|p| p.kind.as_str()))
            .bind(line.party.as_ref().map(|p| p.id.as_str()))
            .bind(&line.order_id)
            .bind(&line.merchant_order_id)
            .bind(line.reference.as_ref().map(|r| r.kind.as_str()))
            .bind(line.reference.as_ref().map(|r| r.id.as_str()))
            .bind(line.is_advance)
            .bind(&line.remark)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Reduce a document's outstanding by what the line applies to it
    async fn settle(tx: &mut Transaction<'_, Postgres>, document_id: &str, amount: Decimal) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE ledger_documents
            SET outstanding = outstanding - LEAST(outstanding, $2)
            WHERE id = $1
            "#,
        )
        .bind(document_id)
        .bind(amount)
        .execute(&mut **tx)
        .await
        .map_err(|e| lock_error(e, format!("document {}", document_id)))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerPort for PgLedger {
    async fn find_posting(&self, report_id: &str, status: PostingStatus) -> LedgerResult<Option<Posting>> {
        let row = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {} FROM settlement_postings WHERE report_id = $1 AND status = $2 \
             ORDER BY created_at DESC LIMIT 1",
            POSTING_COLUMNS
        ))
        .bind(report_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn create_posting(&self, draft: PostingDraft) -> LedgerResult<PostingId> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO settlement_postings
                (id, report_id, status, posting_date, deposit_at, remark, multi_currency)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(&draft.report_id)
        .bind(PostingStatus::Provisional.as_str())
        .bind(draft.posting_date)
        .bind(draft.deposit_at)
        .bind(&draft.remark)
        .bind(draft.multi_currency)
        .execute(&mut *tx)
        .await?;

        Self::insert_lines(&mut tx, id, &draft.lines).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_posting(&self, id: PostingId) -> LedgerResult<Option<Posting>> {
        let row = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {} FROM settlement_postings WHERE id = $1",
            POSTING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn update_posting_lines(&self, id: PostingId, lines: Vec<PostingLine>) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        let status = Self::lock_posting(&mut tx, id).await?;
        if status != PostingStatus::Provisional {
            return Err(LedgerError::InvalidState(format!("posting {} is {}", id, status.as_str())));
        }

        sqlx::query("DELETE FROM settlement_posting_lines WHERE posting_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        Self::insert_lines(&mut tx, id, &lines).await?;
        sqlx::query("UPDATE settlement_postings SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn confirm_posting(&self, id: PostingId) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        let status = Self::lock_posting(&mut tx, id).await?;
        if status != PostingStatus::Provisional {
            return Err(LedgerError::InvalidState(format!("posting {} is {}", id, status.as_str())));
        }

        sqlx::query("UPDATE settlement_postings SET status = 'final', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let referenced: Vec<(String, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT reference_id, debit, credit
            FROM settlement_posting_lines
            WHERE posting_id = $1 AND reference_id IS NOT NULL
            ORDER BY line_no
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        for (document_id, debit, credit) in referenced {
            let amount = if debit > Decimal::ZERO { debit } else { credit };
            Self::settle(&mut tx, &document_id, amount).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn attach_reference(&self, id: PostingId, line_no: u32, reference: DocumentRef) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        let status = Self::lock_posting(&mut tx, id).await?;

        let line: Option<(Option<String>, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT reference_id, debit, credit
            FROM settlement_posting_lines
            WHERE posting_id = $1 AND line_no = $2
            "#,
        )
        .bind(id)
        .bind(line_no as i32)
        .fetch_optional(&mut *tx)
        .await?;

        let (existing, debit, credit) =
            line.ok_or_else(|| LedgerError::NotFound(format!("line {} of posting {}", line_no, id)))?;
        if existing.is_some() {
            return Err(LedgerError::InvalidState(format!(
                "line {} of posting {} is already referenced",
                line_no, id
            )));
        }

        sqlx::query(
            r#"
            UPDATE settlement_posting_lines
            SET reference_kind = $3, reference_id = $4, is_advance = FALSE
            WHERE posting_id = $1 AND line_no = $2
            "#,
        )
        .bind(id)
        .bind(line_no as i32)
        .bind(reference.kind.as_str())
        .bind(&reference.id)
        .execute(&mut *tx)
        .await?;

        if status == PostingStatus::Final {
            let amount = if debit > Decimal::ZERO { debit } else { credit };
            Self::settle(&mut tx, &reference.id, amount).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn latest_sales_invoice(&self, order_id: &str) -> LedgerResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {} FROM ledger_documents WHERE order_id = $1 AND kind = 'sales_invoice' \
             ORDER BY posting_date DESC, created_at DESC LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(document_from_row).transpose()
    }

    async fn query_open_documents(&self, order_id: &str, kind: DocumentKind) -> LedgerResult<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {} FROM ledger_documents WHERE order_id = $1 AND kind = $2 AND outstanding >= 0.01 \
             ORDER BY posting_date ASC, id ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(order_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(document_from_row).collect()
    }

    async fn query_outstanding_amount(&self, document_id: &str) -> LedgerResult<Decimal> {
        let row: Option<(Decimal,)> = sqlx::query_as("SELECT outstanding FROM ledger_documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(amount,)| amount)
            .ok_or_else(|| LedgerError::NotFound(format!("document {}", document_id)))
    }

    async fn find_credit_note(&self, original_invoice_id: &str, report_id: &str) -> LedgerResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {} FROM ledger_documents WHERE kind = 'credit_note' \
             AND return_against = $1 AND source_report_id = $2 LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(original_invoice_id)
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(document_from_row).transpose()
    }

    async fn create_credit_note(&self, request: &CreditNoteRequest) -> LedgerResult<Document> {
        let mut tx = self.pool.begin().await?;

        let original: Option<(Option<String>,)> =
            sqlx::query_as("SELECT customer FROM ledger_documents WHERE id = $1")
                .bind(&request.original_invoice_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (original_customer,) = original
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {}", request.original_invoice_id)))?;

        let (seq,): (i64,) = sqlx::query_as("SELECT nextval('credit_note_number_seq')")
            .fetch_one(&mut *tx)
            .await?;

        let total = request.total();
        let doc = Document {
            id: format!("CN-{:05}", seq),
            kind: DocumentKind::CreditNote,
            order_id: request.order_id.clone(),
            customer: request.customer.clone().or(original_customer),
            posting_date: request.posting_date,
            grand_total: total,
            outstanding: total,
            return_against: Some(request.original_invoice_id.clone()),
            source_report_id: Some(request.report_id.clone()),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO ledger_documents
                (id, kind, order_id, customer, posting_date, grand_total, outstanding,
                 return_against, source_report_id, created_at)
            VALUES ($1, 'credit_note', $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.order_id)
        .bind(&doc.customer)
        .bind(doc.posting_date)
        .bind(doc.grand_total)
        .bind(doc.outstanding)
        .bind(&doc.return_against)
        .bind(&doc.source_report_id)
        .bind(doc.created_at)
        .execute(&mut *tx)
        .await?;

        let mut line_no = 0i32;
        for item in &request.items {
            line_no += 1;
            sqlx::query(
                r#"
                INSERT INTO credit_note_lines (credit_note_id, line_no, line_kind, sku, amount)
                VALUES ($1, $2, 'item', $3, $4)
                "#,
            )
            .bind(&doc.id)
            .bind(line_no)
            .bind(&item.sku)
            .bind(item.amount)
            .execute(&mut *tx)
            .await?;
        }
        for charge in &request.charges {
            line_no += 1;
            sqlx::query(
                r#"
                INSERT INTO credit_note_lines (credit_note_id, line_no, line_kind, description, account, amount)
                VALUES ($1, $2, 'charge', $3, $4, $5)
                "#,
            )
            .bind(&doc.id)
            .bind(line_no)
            .bind(&charge.description)
            .bind(&charge.account)
            .bind(charge.amount)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(doc)
    }

    async fn is_referenced_by_report(&self, report_id: &str, document_id: &str) -> LedgerResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM settlement_posting_lines l
                JOIN settlement_postings p ON p.id = l.posting_id
                JOIN ledger_documents d ON d.id = l.reference_id
                WHERE p.status = 'final'
                  AND LEFT(p.report_id, LENGTH($1)) = $1
                  AND l.reference_id = $2
                  AND l.order_id = d.order_id
            )
            "#,
        )
        .bind(report_id)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_final_postings_since(&self, since: NaiveDate) -> LedgerResult<Vec<Posting>> {
        let rows = sqlx::query_as::<_, PostingRow>(&format!(
            "SELECT {} FROM settlement_postings WHERE status = 'final' AND posting_date >= $1 \
             ORDER BY posting_date ASC, created_at ASC",
            POSTING_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut postings = Vec::with_capacity(rows.len());
        for row in rows {
            postings.push(self.hydrate(row).await?);
        }
        Ok(postings)
    }

    async fn transfer_exists(&self, reference: &str) -> LedgerResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM clearing_transfers WHERE reference = $1)")
                .bind(reference)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn create_transfer(&self, request: &TransferRequest) -> LedgerResult<String> {
        let id = format!("XFER-{}", Uuid::new_v4().simple());
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO clearing_transfers
                (id, reference, posting_date, from_account, to_account, currency,
                 paid_amount, received_amount, exchange_rate)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (reference) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&id)
        .bind(&request.reference)
        .bind(request.posting_date)
        .bind(&request.from_account)
        .bind(&request.to_account)
        .bind(&request.currency)
        .bind(request.paid_amount)
        .bind(request.received_amount)
        .bind(request.exchange_rate)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(id);
        }

        let (existing,): (String,) = sqlx::query_as("SELECT id FROM clearing_transfers WHERE reference = $1")
            .bind(&request.reference)
            .fetch_one(&self.pool)
            .await?;
        Ok(existing)
    }
}

#[async_trait]
impl ManualRateBook for PgLedger {
    async fn latest_manual_rate(&self, from: &str, to: &str, on_or_before: NaiveDate) -> LedgerResult<Option<Decimal>> {
        let row: Option<(Decimal,)> = sqlx::query_as(
            r#"
            SELECT rate
            FROM manual_exchange_rates
            WHERE from_currency = $1 AND to_currency = $2 AND rate_date <= $3
            ORDER BY rate_date DESC
            LIMIT 1
            "#,
        )
        .bind(from.to_uppercase())
        .bind(to.to_uppercase())
        .bind(on_or_before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(rate,)| rate))
    }
}
