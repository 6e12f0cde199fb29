//! Domain types shared across ingest, posting and ledger adapters

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Report type requested from the marketplace reports API
pub const SETTLEMENT_REPORT_TYPE: &str = "GET_V2_SETTLEMENT_REPORT_DATA_FLAT_FILE_V2";

/// Remark used by the finalize job for its balancing line
pub const FINALIZE_ROUNDING_REMARK: &str = "Rounding adjustment for exchange rate variations";

/// Remark used by the builder for its balancing line
pub const BUILD_ROUNDING_REMARK: &str = "Rounding adjustment";

/// Amounts below this magnitude are treated as noise
pub fn noise_threshold() -> Decimal {
    Decimal::new(1, 2)
}

/// Round a money amount half-away-from-zero
pub fn round_money(amount: Decimal, precision: u32) -> Decimal {
    amount.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round2(amount: Decimal) -> Decimal {
    round_money(amount, 2)
}

// ============================================================================
// Reports
// ============================================================================

/// Report metadata as returned by the listing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub report_id: String,
    #[serde(rename = "reportDocumentId", default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub report_type: Option<String>,
    #[serde(default)]
    pub processing_status: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub report_date: Option<DateTime<Utc>>,
}

impl ReportSummary {
    pub fn new(report_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            document_id: Some(document_id.into()),
            report_type: Some(SETTLEMENT_REPORT_TYPE.to_string()),
            processing_status: Some("DONE".to_string()),
            created_time: None,
            data_start_time: None,
            data_end_time: None,
            report_date: None,
        }
    }

    /// Newest-first ordering key: report date, then created time, then data end
    pub fn sort_key(&self) -> Option<DateTime<Utc>> {
        self.report_date.or(self.created_time).or(self.data_end_time)
    }

    /// Posting date derived from the same timestamps as [`Self::sort_key`]
    pub fn posting_date(&self) -> Option<NaiveDate> {
        self.sort_key().map(|dt| dt.date_naive())
    }

    pub fn is_done(&self) -> bool {
        self.processing_status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("DONE"))
            .unwrap_or(false)
            && self.document_id.is_some()
    }
}

/// Download descriptor for a report document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDocument {
    #[serde(rename = "reportDocumentId")]
    pub document_id: String,
    pub url: String,
    #[serde(default)]
    pub encryption_details: Option<EncryptionDetails>,
    #[serde(default)]
    pub compression_algorithm: Option<String>,
}

impl ReportDocument {
    pub fn is_gzip(&self) -> bool {
        self.compression_algorithm
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case("GZIP"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionDetails {
    #[serde(default)]
    pub standard: Option<String>,
    pub initialization_vector: String,
    pub key: String,
}

/// One normalized settlement report line
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SettlementRow {
    /// Lower-cased, trimmed transaction type
    pub transaction_type: String,
    pub order_id: Option<String>,
    pub merchant_order_id: Option<String>,
    /// Lower-cased marketplace name
    pub marketplace_name: Option<String>,
    pub sku: Option<String>,
    pub amount_type: String,
    pub amount_description: String,
    pub amount: Decimal,
    /// Upper-cased currency code
    pub currency: Option<String>,
    /// Columns the engine does not interpret
    pub extra: BTreeMap<String, String>,
}

impl SettlementRow {
    pub fn description_upper(&self) -> String {
        self.amount_description.trim().to_uppercase()
    }

    pub fn is_principal(&self) -> bool {
        self.amount_description.to_lowercase().contains("principal")
            || self.amount_type.to_lowercase().contains("principal")
    }

    pub fn has_order(&self) -> bool {
        self.order_id.is_some()
    }

    pub fn extra_value(&self, column: &str) -> Option<&str> {
        self.extra
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Settlement period and deposit information read from the first row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportHeader {
    /// Date part of `settlement-start-date` as printed in the report
    pub start_text: Option<String>,
    pub end_text: Option<String>,
    pub settlement_start: Option<NaiveDate>,
    pub settlement_end: Option<NaiveDate>,
    pub deposit_at: Option<DateTime<Utc>>,
}

impl ReportHeader {
    pub fn period_remark(&self) -> String {
        match (&self.start_text, &self.end_text) {
            (Some(start), Some(end)) => format!("Settlement Period: {} - {}", start, end),
            _ => "Settlement Period: Unknown".to_string(),
        }
    }
}

/// A fetched and normalized report; immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReport {
    pub summary: ReportSummary,
    pub header: ReportHeader,
    pub rows: Vec<SettlementRow>,
}

impl SettlementReport {
    pub fn report_id(&self) -> &str {
        &self.summary.report_id
    }

    pub fn posting_date_or(&self, today: NaiveDate) -> NaiveDate {
        self.summary.posting_date().unwrap_or(today)
    }
}

// ============================================================================
// Postings
// ============================================================================

pub type PostingId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingStatus {
    Provisional,
    Final,
    Cancelled,
}

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostingStatus::Provisional => "provisional",
            PostingStatus::Final => "final",
            PostingStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "provisional" => Some(PostingStatus::Provisional),
            "final" => Some(PostingStatus::Final),
            "cancelled" => Some(PostingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    Customer,
    Supplier,
    Other,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Customer => "customer",
            PartyKind::Supplier => "supplier",
            PartyKind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "customer" => PartyKind::Customer,
            "supplier" => PartyKind::Supplier,
            _ => PartyKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub kind: PartyKind,
    pub id: String,
}

impl Party {
    pub fn customer(id: impl Into<String>) -> Self {
        Self {
            kind: PartyKind::Customer,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    SalesInvoice,
    CreditNote,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::SalesInvoice => "sales_invoice",
            DocumentKind::CreditNote => "credit_note",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sales_invoice" => Some(DocumentKind::SalesInvoice),
            "credit_note" => Some(DocumentKind::CreditNote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: DocumentKind,
    pub id: String,
}

/// Merchant order id and remark derived from the marketplace an order came through
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarketplaceStamp {
    pub merchant_order_id: Option<String>,
    pub remark: Option<String>,
}

impl MarketplaceStamp {
    /// `marketplace_name` is expected lower-cased
    pub fn for_order(marketplace_name: &str, merchant_order_id: &str, refund: bool) -> Self {
        let suffix = if refund { " Refund" } else { "" };
        match marketplace_name {
            "non-amazon us" => Self {
                merchant_order_id: Some(merchant_order_id.chars().filter(char::is_ascii_digit).collect()),
                remark: Some(format!("Multi-Channel Fulfillment (MCF) Order{}", suffix)),
            },
            "amazon.com" => Self {
                merchant_order_id: Some(String::new()),
                remark: Some(format!("Fulfillment by Amazon (FBA) Order{}", suffix)),
            },
            _ => Self::default(),
        }
    }
}

/// One line of a posting; amounts are in the line currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingLine {
    pub line_no: u32,
    pub account: String,
    pub currency: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub exchange_rate: Decimal,
    pub party: Option<Party>,
    pub order_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub reference: Option<DocumentRef>,
    pub is_advance: bool,
    pub remark: Option<String>,
}

impl PostingLine {
    pub fn new(account: impl Into<String>, currency: impl Into<String>, exchange_rate: Decimal) -> Self {
        Self {
            line_no: 0,
            account: account.into(),
            currency: currency.into(),
            debit: Decimal::ZERO,
            credit: Decimal::ZERO,
            exchange_rate,
            party: None,
            order_id: None,
            merchant_order_id: None,
            reference: None,
            is_advance: false,
            remark: None,
        }
    }

    /// Debit when `amount` is positive, credit of the magnitude otherwise
    pub fn with_signed_debit(mut self, amount: Decimal) -> Self {
        if amount >= Decimal::ZERO {
            self.debit = amount;
        } else {
            self.credit = -amount;
        }
        self
    }

    pub fn with_debit(mut self, amount: Decimal) -> Self {
        self.debit = amount;
        self
    }

    pub fn with_credit(mut self, amount: Decimal) -> Self {
        self.credit = amount;
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    pub fn base_debit(&self) -> Decimal {
        self.debit * self.exchange_rate
    }

    pub fn base_credit(&self) -> Decimal {
        self.credit * self.exchange_rate
    }

    /// Line amount in line currency, regardless of side
    pub fn amount(&self) -> Decimal {
        if self.debit > Decimal::ZERO {
            self.debit
        } else {
            self.credit
        }
    }

    pub fn is_debit(&self) -> bool {
        self.debit > Decimal::ZERO
    }

    pub fn is_credit(&self) -> bool {
        self.credit > Decimal::ZERO
    }
}

/// Posting as built, before the ledger assigns an id
#[derive(Debug, Clone, PartialEq)]
pub struct PostingDraft {
    pub report_id: String,
    pub posting_date: NaiveDate,
    pub deposit_at: Option<DateTime<Utc>>,
    pub remark: String,
    pub multi_currency: bool,
    pub lines: Vec<PostingLine>,
}

impl PostingDraft {
    /// Renumber lines 1..=n in their current order
    pub fn renumber(&mut self) {
        for (idx, line) in self.lines.iter_mut().enumerate() {
            line.line_no = (idx + 1) as u32;
        }
    }
}

/// Stored posting
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub id: PostingId,
    pub report_id: String,
    pub status: PostingStatus,
    pub posting_date: NaiveDate,
    pub deposit_at: Option<DateTime<Utc>>,
    pub remark: String,
    pub multi_currency: bool,
    pub lines: Vec<PostingLine>,
    pub created_at: DateTime<Utc>,
}

impl Posting {
    pub fn line(&self, line_no: u32) -> Option<&PostingLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }
}

// ============================================================================
// Ledger documents
// ============================================================================

/// Sales invoice or credit note held by the ledger
///
/// `outstanding` is the open magnitude, never negative, for both kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub kind: DocumentKind,
    pub order_id: String,
    pub customer: Option<String>,
    pub posting_date: NaiveDate,
    pub grand_total: Decimal,
    pub outstanding: Decimal,
    pub return_against: Option<String>,
    pub source_report_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn is_return(&self) -> bool {
        self.kind == DocumentKind::CreditNote
    }

    pub fn is_open(&self) -> bool {
        self.outstanding >= noise_threshold()
    }

    pub fn to_ref(&self) -> DocumentRef {
        DocumentRef {
            kind: self.kind,
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreditNoteItem {
    pub sku: String,
    /// Refunded principal, positive
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreditNoteCharge {
    /// Upper-cased amount description
    pub description: String,
    pub account: String,
    /// Report sign preserved, typically negative
    pub amount: Decimal,
}

/// Everything the ledger needs to book a credit note
#[derive(Debug, Clone, PartialEq)]
pub struct CreditNoteRequest {
    pub original_invoice_id: String,
    pub order_id: String,
    pub report_id: String,
    pub customer: Option<String>,
    pub posting_date: NaiveDate,
    pub merchant_order_id: Option<String>,
    pub remark: Option<String>,
    pub items: Vec<CreditNoteItem>,
    pub charges: Vec<CreditNoteCharge>,
}

impl CreditNoteRequest {
    /// Refund magnitude: principal plus the refunded charges
    pub fn total(&self) -> Decimal {
        let items: Decimal = self.items.iter().map(|i| i.amount).sum();
        let charges: Decimal = self.charges.iter().map(|c| c.amount).sum();
        items - charges
    }
}

/// Internal transfer from a clearing account to the bank
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    /// Report id of the originating posting
    pub reference: String,
    pub posting_date: NaiveDate,
    pub from_account: String,
    pub to_account: String,
    pub currency: String,
    pub paid_amount: Decimal,
    pub received_amount: Decimal,
    pub exchange_rate: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn round_money_is_half_away_from_zero() {
        assert_eq!(round2(dec!(2.345)), dec!(2.35));
        assert_eq!(round2(dec!(-2.345)), dec!(-2.35));
        assert_eq!(round2(dec!(2.344)), dec!(2.34));
    }

    #[test]
    fn sort_key_prefers_report_date() {
        let mut summary = ReportSummary::new("R1", "D1");
        summary.created_time = Some(Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap());
        summary.data_end_time = Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(summary.posting_date(), NaiveDate::from_ymd_opt(2025, 3, 2));

        summary.report_date = Some(Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap());
        assert_eq!(summary.posting_date(), NaiveDate::from_ymd_opt(2025, 3, 5));
    }

    #[test]
    fn period_remark_falls_back_to_unknown() {
        let header = ReportHeader {
            start_text: Some("01.03.2025".into()),
            ..Default::default()
        };
        assert_eq!(header.period_remark(), "Settlement Period: Unknown");

        let header = ReportHeader {
            start_text: Some("01.03.2025".into()),
            end_text: Some("15.03.2025".into()),
            ..Default::default()
        };
        assert_eq!(header.period_remark(), "Settlement Period: 01.03.2025 - 15.03.2025");
    }

    #[test]
    fn signed_debit_picks_side() {
        let line = PostingLine::new("Clearing", "USD", Decimal::ONE).with_signed_debit(dec!(-5.00));
        assert_eq!(line.debit, Decimal::ZERO);
        assert_eq!(line.credit, dec!(5.00));
        assert!(line.is_credit());
    }

    #[test]
    fn marketplace_stamp_strips_non_digits_for_mcf() {
        let stamp = MarketplaceStamp::for_order("non-amazon us", "#US-1001-7", true);
        assert_eq!(stamp.merchant_order_id.as_deref(), Some("10017"));
        assert_eq!(
            stamp.remark.as_deref(),
            Some("Multi-Channel Fulfillment (MCF) Order Refund")
        );

        let stamp = MarketplaceStamp::for_order("amazon.com", "1001", false);
        assert_eq!(stamp.merchant_order_id.as_deref(), Some(""));
        assert_eq!(stamp.remark.as_deref(), Some("Fulfillment by Amazon (FBA) Order"));

        assert_eq!(MarketplaceStamp::for_order("amazon.ca", "1", false), MarketplaceStamp::default());
    }

    #[test]
    fn credit_note_total_adds_refunded_charges() {
        let request = CreditNoteRequest {
            original_invoice_id: "SI-1".into(),
            order_id: "O1".into(),
            report_id: "R1".into(),
            customer: None,
            posting_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            merchant_order_id: None,
            remark: None,
            items: vec![CreditNoteItem { sku: "SKU".into(), amount: dec!(50.00) }],
            charges: vec![CreditNoteCharge {
                description: "SHIPPING".into(),
                account: "Amazon Shipping".into(),
                amount: dec!(-5.00),
            }],
        };
        assert_eq!(request.total(), dec!(55.00));
    }
}
