//! Late allocation sweep
//!
//! Documents that appear after a report's posting was finalized get attached
//! to the still-unreferenced AR lines, oldest document first, at most once.

mod common;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{date, Harness, ReportFile, StubRates};
use settlement_rs::ledger::LedgerPort;
use settlement_rs::models::{DocumentKind, PostingStatus};
use settlement_rs::services::settlement_service::ReportOutcome;

fn late_outcome(outcome: &ReportOutcome) -> &settlement_rs::services::allocation_service::AllocationSummary {
    match outcome {
        ReportOutcome::LateAllocated(summary) => summary,
        other => panic!("expected late allocation, got {:?}", other),
    }
}

#[tokio::test]
async fn sweep_attaches_the_oldest_invoice_once() {
    let mut h = Harness::new(StubRates::default());
    h.source.add(
        "R1",
        &ReportFile::new("USD", "60.00").order_row("Order", "O-L1", "SKU-1", "Principal", "60.00"),
    );

    h.service.run_daily_sync(Utc::now()).await.unwrap();
    h.drain_finalize().await;
    let posting = h
        .ledger
        .find_posting("R1", PostingStatus::Final)
        .await
        .unwrap()
        .expect("final posting");
    assert!(posting.lines[1].reference.is_none());
    assert!(posting.lines[1].is_advance);

    h.ledger.add_sales_invoice("SI-B", "O-L1", date(2025, 3, 10), dec!(60)).await;
    h.ledger.add_sales_invoice("SI-A", "O-L1", date(2025, 3, 5), dec!(60)).await;

    let sweep = h.service.run_late_allocation_sweep(Utc::now()).await.unwrap();
    assert_eq!(sweep.listed, 1);
    let allocated = late_outcome(&sweep.outcomes[0].1);
    assert_eq!(allocated.attached.len(), 1);
    assert_eq!(allocated.attached[0].document_id, "SI-A");
    assert_eq!(allocated.attached[0].applied, dec!(60.00));

    assert!(h.ledger.is_referenced_by_report("R1", "SI-A").await.unwrap());
    assert!(!h.ledger.is_referenced_by_report("R1", "SI-B").await.unwrap());
    assert_eq!(h.ledger.document("SI-A").await.unwrap().outstanding, Decimal::ZERO);
    assert_eq!(h.ledger.document("SI-B").await.unwrap().outstanding, dec!(60));

    let again = h.service.run_late_allocation_sweep(Utc::now()).await.unwrap();
    assert!(late_outcome(&again.outcomes[0].1).attached.is_empty());
}

#[tokio::test]
async fn late_refund_creates_one_credit_note() {
    let mut h = Harness::new(StubRates::default());
    h.source.add(
        "R2",
        &ReportFile::new("USD", "-40.00").order_row("Refund", "O-L2", "SKU-2", "Principal", "-40.00"),
    );

    h.service.run_daily_sync(Utc::now()).await.unwrap();
    h.drain_finalize().await;
    assert!(h.ledger.credit_notes().await.is_empty());

    h.ledger.add_sales_invoice("SI-R", "O-L2", date(2025, 3, 2), dec!(40)).await;

    let sweep = h.service.run_late_allocation_sweep(Utc::now()).await.unwrap();
    let allocated = late_outcome(&sweep.outcomes[0].1);
    assert_eq!(allocated.credit_notes.len(), 1);
    assert_eq!(allocated.attached.len(), 1);

    let credit_notes = h.ledger.credit_notes().await;
    assert_eq!(credit_notes.len(), 1);
    assert_eq!(credit_notes[0].return_against.as_deref(), Some("SI-R"));
    assert_eq!(credit_notes[0].outstanding, Decimal::ZERO);

    let posting = h
        .ledger
        .find_posting("R2", PostingStatus::Final)
        .await
        .unwrap()
        .expect("final posting");
    let refund_line = posting
        .lines
        .iter()
        .find(|l| l.order_id.as_deref() == Some("O-L2"))
        .expect("refund line");
    let reference = refund_line.reference.as_ref().expect("attached credit note");
    assert_eq!(reference.kind, DocumentKind::CreditNote);
    assert_eq!(reference.id, credit_notes[0].id);

    h.service.run_late_allocation_sweep(Utc::now()).await.unwrap();
    assert_eq!(h.ledger.credit_notes().await.len(), 1);
}

#[tokio::test]
async fn sweep_skips_reports_without_a_final_posting() {
    let h = Harness::new(StubRates::default());
    h.source.add(
        "R3",
        &ReportFile::new("USD", "10.00").order_row("Order", "O-L3", "SKU-3", "Principal", "10.00"),
    );

    h.service.run_daily_sync(Utc::now()).await.unwrap();

    let sweep = h.service.run_late_allocation_sweep(Utc::now()).await.unwrap();
    assert_eq!(sweep.listed, 0);
    assert!(sweep.outcomes.is_empty());
}
