pub mod http;
pub mod provider;

pub use http::{HttpFetcherFactory, HttpLister};
pub use provider::{Fetcher, FetcherFactory, MatchLister};
