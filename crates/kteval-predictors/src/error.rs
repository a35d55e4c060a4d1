//! Predictor error types and HTTP status mapping.

use reqwest::header::HeaderMap;

pub use kteval_core::error::PredictorError;

/// Seconds assumed when a 429 response carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Maps an unsuccessful HTTP response to a classified error.
pub fn from_status(status: u16, headers: &HeaderMap, body: String, model: &str) -> PredictorError {
    match status {
        401 | 403 => PredictorError::AuthenticationFailed(body),
        404 => PredictorError::ModelNotFound(model.to_string()),
        429 => {
            let secs = headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            PredictorError::RateLimited {
                retry_after_ms: secs * 1000,
            }
        }
        _ => PredictorError::ApiError {
            status,
            message: body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn status_mapping() {
        let none = HeaderMap::new();
        assert!(matches!(
            from_status(401, &none, "nope".into(), "m"),
            PredictorError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            from_status(403, &none, String::new(), "m"),
            PredictorError::AuthenticationFailed(_)
        ));
        match from_status(404, &none, String::new(), "dkt-assist09") {
            PredictorError::ModelNotFound(m) => assert_eq!(m, "dkt-assist09"),
            other => panic!("unexpected: {other}"),
        }
        assert!(matches!(
            from_status(502, &none, "bad gateway".into(), "m"),
            PredictorError::ApiError { status: 502, .. }
        ));
    }

    #[test]
    fn retry_after_header_is_honoured() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(
            from_status(429, &headers, String::new(), "m").retry_after_ms(),
            Some(7000)
        );
        assert_eq!(
            from_status(429, &HeaderMap::new(), String::new(), "m").retry_after_ms(),
            Some(5000)
        );
    }
}
