use std::time::Duration;

use reqwest::{ClientBuilder, StatusCode};
use thiserror::Error;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum WebSeedError {
    #[error("web seed answered with an unexpected status: {0}")]
    UnexpectedStatus(StatusCode),
    #[error("web seed answered with {got} bytes instead of {expected}")]
    WrongBodyLength { expected: u64, got: u64 },
    #[error("web seed transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Resolves the URL the payload is served at. Bases that already end with the
/// payload name are used as-is, directory-style bases get the name appended.
pub fn piece_url(base_url: &str, name: &str) -> String {
    if base_url.is_empty() || base_url.ends_with(name) {
        return base_url.to_string();
    }
    if base_url.ends_with('/') {
        return format!("{base_url}{name}");
    }
    format!("{base_url}/{name}")
}

/// Fetches one piece with an HTTP range request. The server must answer 206,
/// or 200 with exactly the requested body length (a 200 carrying the whole
/// payload means the seed ignored the Range header and is unusable).
pub async fn fetch_piece(
    base_url: &str,
    name: &str,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, WebSeedError> {
    let url = piece_url(base_url, name);
    let range_value = format!("bytes={}-{}", offset, offset + length - 1);
    log::debug!("fetching {url} with range {range_value}");

    let response = ClientBuilder::new()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(HTTP_REQUEST_TIMEOUT)
        .build()?
        .get(url)
        .header(reqwest::header::RANGE, range_value)
        .send()
        .await?;

    let status = response.status();
    if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
        return Err(WebSeedError::UnexpectedStatus(status));
    }

    let body = response.bytes().await?;
    if body.len() as u64 != length {
        return Err(WebSeedError::WrongBodyLength {
            expected: length,
            got: body.len() as u64,
        });
    }
    Ok(body.to_vec())
}
