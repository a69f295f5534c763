//! Site crawler: bounded-concurrency frontier expansion over a `Fetcher`.

mod budget;
mod crawl;
mod fetch;
mod links;
mod script;
mod tech;

pub use budget::{CrawlBudget, FetchPermit};
pub use crawl::{crawl, CrawlError, CrawlEvent, CrawlRequest, CrawlStream};
pub use fetch::{FetchError, FetchRequest, FetchedPage, Fetcher, Method, ReqwestFetcher};
pub use links::{extract_links, extract_title};
pub use script::ScriptedFetcher;
pub use tech::{compute_fingerprints, fingerprint_page};
