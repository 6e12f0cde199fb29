//! Postgres ledger adapter
//!
//! Needs a reachable database at DATABASE_URL; run with
//! `cargo test --test pg_ledger_test -- --ignored`.

mod common;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serial_test::serial;
use uuid::Uuid;

use common::{date, get_test_pool};
use settlement_rs::ledger::{LedgerError, LedgerPort, PgLedger};
use settlement_rs::models::{
    CreditNoteItem, CreditNoteRequest, Document, DocumentKind, Party, PostingDraft, PostingLine,
    PostingStatus, TransferRequest,
};
use settlement_rs::services::fx_service::ManualRateBook;

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

fn invoice(id: &str, order_id: &str, day: u32, total: Decimal) -> Document {
    Document {
        id: id.to_string(),
        kind: DocumentKind::SalesInvoice,
        order_id: order_id.to_string(),
        customer: Some("Amazon USD".into()),
        posting_date: date(2025, 3, day),
        grand_total: total,
        outstanding: total,
        return_against: None,
        source_report_id: None,
        created_at: Utc::now(),
    }
}

fn sale_draft(report_id: &str, order_id: &str, amount: Decimal) -> PostingDraft {
    let mut ar = PostingLine::new("Debtors USD", "USD", Decimal::ONE).with_credit(amount);
    ar.party = Some(Party::customer("Amazon USD"));
    ar.order_id = Some(order_id.to_string());
    ar.is_advance = true;

    let mut draft = PostingDraft {
        report_id: report_id.to_string(),
        posting_date: date(2025, 3, 17),
        deposit_at: None,
        remark: "Settlement Period: 2025-03-01 - 2025-03-15".into(),
        multi_currency: false,
        lines: vec![
            PostingLine::new("Amazon Clearing USD", "USD", Decimal::ONE).with_debit(amount),
            ar,
        ],
    };
    draft.renumber();
    draft
}

async fn cleanup(ledger: &PgLedger, report_id: &str, document_ids: &[String]) {
    sqlx::query("DELETE FROM settlement_postings WHERE report_id = $1")
        .bind(report_id)
        .execute(ledger.pool())
        .await
        .expect("Failed to cleanup postings");
    sqlx::query("DELETE FROM ledger_documents WHERE return_against = ANY($1)")
        .bind(document_ids)
        .execute(ledger.pool())
        .await
        .expect("Failed to cleanup credit notes");
    sqlx::query("DELETE FROM ledger_documents WHERE id = ANY($1)")
        .bind(document_ids)
        .execute(ledger.pool())
        .await
        .expect("Failed to cleanup documents");
}

#[tokio::test]
#[serial]
#[ignore = "Requires a Postgres database"]
async fn test_posting_lifecycle_settles_references() {
    let ledger = PgLedger::new(get_test_pool().await);
    let report_id = unique("R");
    let order_id = unique("O");
    let invoice_id = unique("SI");

    ledger
        .insert_document(&invoice(&invoice_id, &order_id, 5, dec!(50)))
        .await
        .expect("Failed to insert invoice");

    let posting_id = ledger
        .create_posting(sale_draft(&report_id, &order_id, dec!(50)))
        .await
        .expect("Failed to create posting");

    let draft = ledger
        .find_posting(&report_id, PostingStatus::Provisional)
        .await
        .unwrap()
        .expect("provisional posting");
    assert_eq!(draft.id, posting_id);
    assert_eq!(draft.lines.len(), 2);
    assert_eq!(draft.lines[1].line_no, 2);

    ledger.confirm_posting(posting_id).await.expect("Failed to confirm");
    let err = ledger.confirm_posting(posting_id).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    let open = ledger
        .query_open_documents(&order_id, DocumentKind::SalesInvoice)
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert!(!ledger.is_referenced_by_report(&report_id, &invoice_id).await.unwrap());

    let reference = open[0].to_ref();
    ledger
        .attach_reference(posting_id, 2, reference.clone())
        .await
        .expect("Failed to attach reference");
    assert!(ledger.is_referenced_by_report(&report_id, &invoice_id).await.unwrap());
    assert_eq!(ledger.query_outstanding_amount(&invoice_id).await.unwrap(), Decimal::ZERO);

    let err = ledger.attach_reference(posting_id, 2, reference).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    cleanup(&ledger, &report_id, &[invoice_id.clone()]).await;
}

#[tokio::test]
#[serial]
#[ignore = "Requires a Postgres database"]
async fn test_credit_note_is_keyed_by_invoice_and_report() {
    let ledger = PgLedger::new(get_test_pool().await);
    let report_id = unique("R");
    let order_id = unique("O");
    let invoice_id = unique("SI");

    ledger
        .insert_document(&invoice(&invoice_id, &order_id, 2, dec!(80)))
        .await
        .expect("Failed to insert invoice");
    assert_eq!(
        ledger.latest_sales_invoice(&order_id).await.unwrap().map(|d| d.id),
        Some(invoice_id.clone())
    );
    assert!(ledger.find_credit_note(&invoice_id, &report_id).await.unwrap().is_none());

    let request = CreditNoteRequest {
        original_invoice_id: invoice_id.clone(),
        order_id: order_id.clone(),
        report_id: report_id.clone(),
        customer: None,
        posting_date: date(2025, 3, 17),
        merchant_order_id: Some(String::new()),
        remark: Some("Fulfillment by Amazon (FBA) Order Refund".into()),
        items: vec![CreditNoteItem {
            sku: "SKU-2".into(),
            amount: dec!(80),
        }],
        charges: Vec::new(),
    };
    let created = ledger.create_credit_note(&request).await.expect("Failed to create credit note");
    assert!(created.id.starts_with("CN-"));
    assert_eq!(created.customer.as_deref(), Some("Amazon USD"));
    assert_eq!(created.grand_total, dec!(80));

    let found = ledger
        .find_credit_note(&invoice_id, &report_id)
        .await
        .unwrap()
        .expect("credit note by invoice and report");
    assert_eq!(found.id, created.id);

    cleanup(&ledger, &report_id, &[invoice_id.clone()]).await;
}

#[tokio::test]
#[serial]
#[ignore = "Requires a Postgres database"]
async fn test_transfers_and_manual_rates() {
    let ledger = PgLedger::new(get_test_pool().await);
    let reference = unique("R");

    let request = TransferRequest {
        reference: reference.clone(),
        posting_date: date(2025, 3, 17),
        from_account: "Amazon Clearing CAD".into(),
        to_account: "Operating Bank".into(),
        currency: "CAD".into(),
        paid_amount: dec!(100),
        received_amount: dec!(73.33),
        exchange_rate: dec!(0.7333),
    };
    assert!(!ledger.transfer_exists(&reference).await.unwrap());
    let first = ledger.create_transfer(&request).await.expect("Failed to create transfer");
    let second = ledger.create_transfer(&request).await.expect("Failed to replay transfer");
    assert_eq!(first, second);
    assert!(ledger.transfer_exists(&reference).await.unwrap());

    ledger
        .record_manual_rate("cad", "usd", date(2025, 3, 1), dec!(0.72))
        .await
        .expect("Failed to record rate");
    ledger
        .record_manual_rate("CAD", "USD", date(2025, 3, 10), dec!(0.74))
        .await
        .expect("Failed to record rate");
    assert_eq!(
        ledger.latest_manual_rate("CAD", "USD", date(2025, 3, 5)).await.unwrap(),
        Some(dec!(0.72))
    );
    assert_eq!(
        ledger.latest_manual_rate("CAD", "USD", date(2025, 3, 20)).await.unwrap(),
        Some(dec!(0.74))
    );

    sqlx::query("DELETE FROM clearing_transfers WHERE reference = $1")
        .bind(&reference)
        .execute(ledger.pool())
        .await
        .expect("Failed to cleanup transfers");
}
