// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Header helpers shared by the proxy, the capture log and the analysis client.

use hyper::HeaderMap;

/// Retrieve a header value as a string, if it exists and is valid visible ASCII.
pub fn get_header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Render headers as `"name: value"` lines, preserving order and repeated names.
///
/// Values that are not valid UTF-8 are converted lossily rather than dropped,
/// so the analysis service sees every header the client actually sent.
pub fn to_header_list(headers: &HeaderMap) -> Vec<String> {
    headers
        .iter()
        .map(|(k, v)| format!("{}: {}", k.as_str(), String::from_utf8_lossy(v.as_bytes())))
        .collect()
}

/// Parse a comma-separated header value into lowercased, non-empty tokens.
pub fn parse_list_header(val: &str) -> impl Iterator<Item = String> + '_ {
    val.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}
