//! Feed transport. The client is a trait seam so cycles can be driven from a
//! canned feed in tests; retries live at the transport layer, not here.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use bytes::Bytes;

use crate::error::FetchError;

/// Performs one GET against the feed URL and returns the raw envelope bytes.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Bytes, FetchError> {
    let url = url
        .parse()
        .map_err(|e| FetchError::BadUrl(format!("{url}: {e}")))?;
    let req = reqwest::Request::new(reqwest::Method::GET, url);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?)
}
