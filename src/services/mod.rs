// src/services/mod.rs

//! Network-facing services: the API client seam, wire decoding, and the
//! recursive interaction fetcher.

mod api;
mod decode;
mod fetcher;

#[cfg(test)]
pub(crate) mod mock;

pub use api::{ApiClient, AtpClient, Page};
pub use fetcher::RecursiveFetcher;
