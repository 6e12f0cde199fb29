pub mod aggregation;
pub mod allocation_service;
pub mod clearing_transfer_service;
pub mod credit_note_service;
pub mod finalize_service;
pub mod fx_service;
pub mod posting_builder;
pub mod settlement_service;

pub use allocation_service::AllocationService;
pub use clearing_transfer_service::ClearingTransferService;
pub use credit_note_service::CreditNoteService;
pub use finalize_service::FinalizeService;
pub use fx_service::{FxService, HttpRateProvider};
pub use posting_builder::PostingBuilder;
pub use settlement_service::{SettlementService, SyncSummary};
