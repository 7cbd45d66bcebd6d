// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Snapshot of a request as first observed by the proxy.
//!
//! Later pipeline stages may rewrite the live request (header suppression,
//! forced identity encoding, ...). Anything sent to the analysis service or
//! used to synthesize sub-requests is taken from this snapshot instead.

use bytes::Bytes;
use hyper::header::HOST;
use hyper::{HeaderMap, Method, Uri};
use std::sync::OnceLock;

use crate::flow::RequestInfo;

#[derive(Debug)]
pub struct OriginalRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    host_header: String,
    body: OnceLock<Bytes>,
}

impl OriginalRequest {
    /// Copy method, URL and headers of a request whose body may not have arrived yet.
    pub fn capture(request: &RequestInfo) -> Self {
        // HTTP/2 and later carry the host in the :authority pseudo-header only.
        let host_header = request
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| request.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        Self {
            method: request.method.clone(),
            uri: request.uri.clone(),
            headers: request.headers.clone(),
            host_header,
            body: OnceLock::new(),
        }
    }

    /// Store the finalized request body. Only the first call has an effect.
    pub fn fill_body(&self, body: Bytes) -> bool {
        self.body.set(body).is_ok()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn host_header(&self) -> &str {
        &self.host_header
    }

    /// The request body, empty until `fill_body` has run.
    pub fn body(&self) -> Bytes {
        self.body.get().cloned().unwrap_or_default()
    }

    pub fn has_body(&self) -> bool {
        self.body.get().is_some()
    }

    /// Directory part of the path, up to and including the last `/`.
    pub fn directory(&self) -> &str {
        let path = self.uri.path();
        match path.rfind('/') {
            Some(idx) => &path[..=idx],
            None => "/",
        }
    }

    /// Trailing path segment, or `None` when the path ends in `/`.
    pub fn last_segment(&self) -> Option<&str> {
        let path = self.uri.path();
        let last = &path[path.rfind('/').map(|i| i + 1).unwrap_or(0)..];
        if last.is_empty() {
            None
        } else {
            Some(last)
        }
    }

    /// Same scheme and authority with the trailing path segment replaced by
    /// `target`. The query string is not carried over.
    pub fn with_last_segment(&self, target: &str) -> anyhow::Result<Uri> {
        let path = format!("{}{}", self.directory(), target.trim_start_matches('/'));
        let mut parts = self.uri.clone().into_parts();
        parts.path_and_query = Some(path.parse()?);
        Ok(Uri::from_parts(parts)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_headers_from_pairs, make_request};
    use rstest::rstest;

    #[test]
    fn capture_prefers_host_header() -> anyhow::Result<()> {
        let mut req = make_request("GET", "https://cdn.example.com/app.js")?;
        req.headers = make_headers_from_pairs(&[("host", "example.com")]);
        let snap = OriginalRequest::capture(&req);
        assert_eq!(snap.host_header(), "example.com");
        Ok(())
    }

    #[test]
    fn capture_falls_back_to_authority() -> anyhow::Result<()> {
        let req = make_request("GET", "https://example.com:8443/app.js")?;
        let snap = OriginalRequest::capture(&req);
        assert_eq!(snap.host_header(), "example.com:8443");
        Ok(())
    }

    #[test]
    fn snapshot_is_independent_of_later_rewrites() -> anyhow::Result<()> {
        let mut req = make_request("GET", "http://example.com/app.js")?;
        req.headers = make_headers_from_pairs(&[("accept-encoding", "gzip")]);
        let snap = OriginalRequest::capture(&req);

        req.headers.insert("accept-encoding", "identity".parse()?);
        req.uri = "http://elsewhere.test/other.js".parse()?;

        assert_eq!(
            snap.headers()
                .get("accept-encoding")
                .and_then(|v| v.to_str().ok()),
            Some("gzip")
        );
        assert_eq!(snap.uri().to_string(), "http://example.com/app.js");
        Ok(())
    }

    #[test]
    fn body_is_filled_once() -> anyhow::Result<()> {
        let snap = OriginalRequest::capture(&make_request("POST", "http://a/form")?);
        assert!(!snap.has_body());
        assert!(snap.body().is_empty());
        assert!(snap.fill_body(Bytes::from_static(b"first")));
        assert!(!snap.fill_body(Bytes::from_static(b"second")));
        assert_eq!(snap.body(), Bytes::from_static(b"first"));
        Ok(())
    }

    #[rstest]
    #[case("http://a/static/js/app.js", "/static/js/", Some("app.js"))]
    #[case("http://a/app.js?v=1", "/", Some("app.js"))]
    #[case("http://a/static/", "/static/", None)]
    #[case("http://a/", "/", None)]
    fn directory_and_last_segment(
        #[case] uri: &str,
        #[case] dir: &str,
        #[case] last: Option<&str>,
    ) -> anyhow::Result<()> {
        let snap = OriginalRequest::capture(&make_request("GET", uri)?);
        assert_eq!(snap.directory(), dir);
        assert_eq!(snap.last_segment(), last);
        Ok(())
    }

    #[rstest]
    #[case("https://a.test/static/js/app.js?v=1", "app.js.map", "https://a.test/static/js/app.js.map")]
    #[case("https://a.test/app.js", "maps/app.js.map", "https://a.test/maps/app.js.map")]
    #[case("http://a.test:8080/", "main.js.map", "http://a.test:8080/main.js.map")]
    #[case("http://a.test/x/y.js", "/z.js", "http://a.test/x/z.js")]
    fn with_last_segment_cases(
        #[case] uri: &str,
        #[case] target: &str,
        #[case] expected: &str,
    ) -> anyhow::Result<()> {
        let snap = OriginalRequest::capture(&make_request("GET", uri)?);
        assert_eq!(snap.with_last_segment(target)?.to_string(), expected);
        Ok(())
    }

    #[test]
    fn with_last_segment_rejects_invalid_path() -> anyhow::Result<()> {
        let snap = OriginalRequest::capture(&make_request("GET", "http://a/app.js")?);
        assert!(snap.with_last_segment("bad segment").is_err());
        Ok(())
    }
}
