pub mod decode;
pub mod fetcher;
pub mod normalize;

pub use fetcher::{FetchError, FetchSettings, ReportFetcher};
pub use normalize::{extract_header, parse_report_text};
