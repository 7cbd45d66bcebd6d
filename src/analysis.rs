// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Client for the jswzl analysis service.
//!
//! One `POST /burp` per enriched response. The service answers with the
//! chunk file paths it found referenced by the script or page.

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE, REFERER};
use hyper::{Method, Request, Uri};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::classify::AssetKind;
use crate::connector::{build_client, HttpsClient};
use crate::flow::ResponseInfo;
use crate::headers::{get_header_str, to_header_list};
use crate::snapshot::OriginalRequest;

pub const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(60);
const INGEST_PATH: &str = "/burp";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid analysis service URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to encode analysis payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to build analysis request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("analysis service unreachable: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read analysis response: {0}")]
    Body(#[from] hyper::Error),

    #[error("analysis service answered with status {0}")]
    Status(u16),

    #[error("analysis response is not a list of paths: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("analysis service did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Serialize, Debug, Clone)]
pub struct AnalysisRequest {
    pub request: RequestPart,
    pub response: ResponsePart,
    pub timestamp: String,
    pub sourcemap: Option<String>,
    pub scope: ScopeFlags,
}

#[derive(Serialize, Debug, Clone)]
pub struct RequestPart {
    pub method: String,
    pub url: String,
    pub headers: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ResponsePart {
    pub status: u16,
    pub body: String,
    pub headers: Vec<String>,
    pub mimetype: AssetKind,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeFlags {
    pub url_in_scope: bool,
    pub referer_in_scope: bool,
}

impl ScopeFlags {
    /// Evaluate the configured host-suffix scope against the original request.
    /// An empty scope list puts everything in scope.
    pub fn evaluate(scope: &[String], snapshot: &OriginalRequest) -> Self {
        if scope.is_empty() {
            return Self {
                url_in_scope: true,
                referer_in_scope: true,
            };
        }
        let referer_host = get_header_str(snapshot.headers(), REFERER.as_str())
            .and_then(|r| r.parse::<Uri>().ok())
            .and_then(|u| u.host().map(str::to_string));

        Self {
            url_in_scope: snapshot.uri().host().is_some_and(|h| host_in_scope(scope, h)),
            referer_in_scope: referer_host.is_some_and(|h| host_in_scope(scope, &h)),
        }
    }
}

fn host_in_scope(scope: &[String], host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    scope.iter().any(|entry| {
        let entry = entry.trim_start_matches('.').to_ascii_lowercase();
        host == entry || host.ends_with(&format!(".{}", entry))
    })
}

impl AnalysisRequest {
    pub fn build(
        snapshot: &OriginalRequest,
        response: &ResponseInfo,
        mimetype: AssetKind,
        body: String,
        sourcemap: Option<String>,
        scope: ScopeFlags,
    ) -> Self {
        let mut request_headers = to_header_list(snapshot.headers());
        // The service ignores source maps unless it sees a host header, which
        // HTTP/2 and later do not carry.
        request_headers.push(format!("host: {}", snapshot.host_header()));

        Self {
            request: RequestPart {
                method: snapshot.method().to_string(),
                url: snapshot.uri().to_string(),
                headers: request_headers,
            },
            response: ResponsePart {
                status: response.status,
                body,
                headers: to_header_list(&response.headers),
                mimetype,
            },
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            sourcemap,
            scope,
        }
    }
}

#[derive(Clone)]
pub struct AnalysisClient {
    client: HttpsClient,
    endpoint: Uri,
    timeout: Duration,
}

impl AnalysisClient {
    pub fn new(base_url: &str) -> Result<Self, AnalysisError> {
        let endpoint = ingest_endpoint(base_url)?;
        Ok(Self {
            client: build_client(),
            endpoint,
            timeout: ANALYSIS_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    /// Send one request/response pair and return the chunk paths reported.
    pub async fn analyze(&self, payload: &AnalysisRequest) -> Result<Vec<String>, AnalysisError> {
        let body = serde_json::to_vec(payload).map_err(AnalysisError::Encode)?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let exchange = async {
            let resp = self.client.request(req).await?;
            let status = resp.status();
            let bytes = resp.into_body().collect().await?.to_bytes();
            if !status.is_success() {
                return Err(AnalysisError::Status(status.as_u16()));
            }
            parse_chunk_list(&bytes)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::Timeout(self.timeout)),
        }
    }
}

/// Parse the service answer. An empty body or `null` means no chunks.
pub fn parse_chunk_list(bytes: &[u8]) -> Result<Vec<String>, AnalysisError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let paths: Option<Vec<String>> = serde_json::from_slice(bytes).map_err(AnalysisError::Decode)?;
    Ok(paths.unwrap_or_default())
}

fn ingest_endpoint(base_url: &str) -> Result<Uri, AnalysisError> {
    let invalid = |reason: &str| AnalysisError::InvalidUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };
    let base: Uri = base_url
        .trim_end_matches('/')
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;
    match base.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(invalid("scheme must be http or https")),
    }
    if base.authority().is_none() {
        return Err(invalid("missing host"));
    }
    let prefix = base.path().trim_end_matches('/');
    format!(
        "{}://{}{}{}",
        base.scheme_str().unwrap_or("http"),
        base.authority().map(|a| a.as_str()).unwrap_or_default(),
        prefix,
        INGEST_PATH
    )
    .parse()
    .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))
}
