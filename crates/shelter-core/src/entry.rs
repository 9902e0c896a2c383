//! Conversion between network responses and stored cache entries

use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use shelter_fetch::{FetchResponse, ResponseType};
use shelter_storage::StoredResponse;

use crate::error::CoreError;

/// Copy a network response into its stored form
///
/// Fails with `Unstorable` if a header value is not visible ASCII; such a
/// response is not cached rather than stored without the header.
pub fn to_stored(response: &FetchResponse) -> Result<StoredResponse, CoreError> {
    let headers = response
        .headers
        .iter()
        .map(|(name, value)| {
            value
                .to_str()
                .map(|v| (name.as_str().to_string(), v.to_string()))
                .map_err(|_| CoreError::Unstorable(format!("non-text value for header {}", name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StoredResponse {
        status: response.status.as_u16(),
        response_type: response.response_type.as_str().to_string(),
        headers,
        body: response.body.clone(),
        stored_at: Utc::now(),
    })
}

/// Rebuild a response from a stored entry
pub fn from_stored(stored: StoredResponse) -> Result<FetchResponse, CoreError> {
    let status = StatusCode::from_u16(stored.status)
        .map_err(|_| CoreError::CorruptEntry(format!("invalid status {}", stored.status)))?;

    let response_type: ResponseType = stored
        .response_type
        .parse()
        .map_err(|e| CoreError::CorruptEntry(format!("{}", e)))?;

    let mut headers = HeaderMap::with_capacity(stored.headers.len());
    for (name, value) in &stored.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| CoreError::CorruptEntry(format!("invalid header name {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| CoreError::CorruptEntry(format!("invalid value for header {}", name)))?;
        headers.append(name, value);
    }

    Ok(FetchResponse {
        status,
        headers,
        body: stored.body,
        response_type,
    })
}
