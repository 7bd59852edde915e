use async_trait::async_trait;
use reqwest::{Request, Response};

/// Minimal HTTP execution seam. Production uses [`super::BasicClient`];
/// tests substitute a double that serves canned feed bytes.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
