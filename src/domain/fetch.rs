//! Input handed over by the fetch layer.
//!
//! The engine never performs network I/O; it receives the complete
//! as-fetched bytes and stores them.

use super::manifest::{FetchFailure, FailureKind, Header, Relation, RunId};

/// An asset discovered while fetching a page, with its bytes
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub url: String,
    pub relation: Relation,
    pub bytes: Vec<u8>,
}

impl FetchedAsset {
    pub fn new(url: impl Into<String>, relation: Relation, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            relation,
            bytes: bytes.into(),
        }
    }
}

/// One fetch outcome, successful or not
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub run_id: RunId,
    pub status: Option<u16>,
    pub headers: Vec<Header>,
    pub body: Option<Vec<u8>>,
    pub assets: Vec<FetchedAsset>,
    pub fetch_duration_ms: u64,
    pub failure: Option<FetchFailure>,
}

impl FetchResult {
    /// A response with a status and body. Non-2xx statuses are recorded
    /// as an `HttpStatus` failure automatically.
    pub fn new(run_id: RunId, url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        let failure = if (200..300).contains(&status) {
            None
        } else {
            Some(FetchFailure::new(
                FailureKind::HttpStatus,
                format!("HTTP {}", status),
            ))
        };

        Self {
            url: url.into(),
            run_id,
            status: Some(status),
            headers: Vec::new(),
            body: Some(body.into()),
            assets: Vec::new(),
            fetch_duration_ms: 0,
            failure,
        }
    }

    /// A fetch that produced no response at all
    pub fn failed(run_id: RunId, url: impl Into<String>, failure: FetchFailure) -> Self {
        Self {
            url: url.into(),
            run_id,
            status: None,
            headers: Vec::new(),
            body: None,
            assets: Vec::new(),
            fetch_duration_ms: 0,
            failure: Some(failure),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_asset(mut self, asset: FetchedAsset) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.fetch_duration_ms = duration_ms;
        self
    }

    pub fn with_failure(mut self, failure: FetchFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_2xx_records_failure() {
        let run = RunId::new("r").unwrap();
        let ok = FetchResult::new(run.clone(), "https://a.example/", 204, Vec::new());
        assert!(ok.failure.is_none());

        let err = FetchResult::new(run, "https://a.example/", 500, b"oops".to_vec());
        assert_eq!(err.failure.unwrap().kind, FailureKind::HttpStatus);
    }

    #[test]
    fn test_failed_fetch_has_no_body() {
        let run = RunId::new("r").unwrap();
        let result = FetchResult::failed(
            run,
            "https://a.example/",
            FetchFailure::new(FailureKind::Timeout, "30s elapsed"),
        )
        .with_duration(30_000);

        assert!(result.status.is_none());
        assert!(result.body.is_none());
        assert_eq!(result.fetch_duration_ms, 30_000);
    }
}
