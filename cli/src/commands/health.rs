use crate::util::{Target, api_request};

pub async fn health(target: &Target<'_>) -> i32 {
    api_request(target, reqwest::Method::GET, "/health", None, &[]).await
}

/// Exits 2 when the API reports its counter store as degraded.
pub async fn readiness(target: &Target<'_>) -> i32 {
    api_request(target, reqwest::Method::GET, "/readiness", None, &[]).await
}
