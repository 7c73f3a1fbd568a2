pub mod config;
pub mod dates;
pub mod document;
pub mod extract;
pub mod history;
pub mod scraper;
pub mod store;
pub mod summary;
pub mod types;

pub use config::ExtractorConfig;
pub use document::{StagedDocument, load_documents, transform_documents};
pub use extract::Extractor;
pub use history::{HistoricalImport, read_workbook};
pub use scraper::{FetchOptions, WebScraper};
pub use store::Store;

pub const DEFAULT_URL: &str = "https://permtimeline.com";
pub const DEFAULT_DATABASE: &str = "perm_tracker.db";
