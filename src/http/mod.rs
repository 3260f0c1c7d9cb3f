pub mod client;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use client::{fetch_with_timeout, FetchError, HttpClient, Network, OfflineNetwork};
pub use types::{Destination, Request, Response, Source};
