// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Coarse asset classification of intercepted responses.

use hyper::Uri;
use serde::{Deserialize, Serialize};

/// Path prefixes reserved by infrastructure in front of the origin.
///
/// `/cdn-cgi/` is Cloudflare's, used for challenge and management pages.
static SKIP_PATH_PREFIXES: &[&str] = &["/cdn-cgi/"];

/// Asset kind as understood by the analysis service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetKind {
    Script,
    Html,
    Json,
    Unrecognized,
}

impl AssetKind {
    /// Only scripts and pages are worth sending for analysis.
    pub fn is_enrichable(self) -> bool {
        matches!(self, AssetKind::Script | AssetKind::Html)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Script => "SCRIPT",
            AssetKind::Html => "HTML",
            AssetKind::Json => "JSON",
            AssetKind::Unrecognized => "UNRECOGNIZED",
        }
    }

    fn from_mime(mime: &str) -> Self {
        match mime {
            "application/javascript" | "text/javascript" => AssetKind::Script,
            "text/html" => AssetKind::Html,
            "application/json" => AssetKind::Json,
            _ => AssetKind::Unrecognized,
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the lowercased media type from a `Content-Type` value, dropping parameters.
pub fn parse_content_type(value: &str) -> Option<String> {
    let media = value.split(';').next()?.trim();
    if media.is_empty() {
        None
    } else {
        Some(media.to_ascii_lowercase())
    }
}

/// Guess a media type from the extension of the URL path.
pub fn guess_from_path(path: &str) -> Option<&'static str> {
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "js" | "mjs" | "cjs" => Some("text/javascript"),
        "html" | "htm" => Some("text/html"),
        "json" => Some("application/json"),
        _ => None,
    }
}

/// Classify a response by its `Content-Type`, falling back to the request URL.
pub fn classify(content_type: Option<&str>, uri: &Uri) -> AssetKind {
    if let Some(mime) = content_type.and_then(parse_content_type) {
        return AssetKind::from_mime(&mime);
    }
    match guess_from_path(uri.path()) {
        Some(mime) => AssetKind::from_mime(mime),
        None => AssetKind::Unrecognized,
    }
}

/// Returns true for request paths that must never be analysed or enriched.
pub fn should_skip(path: &str) -> bool {
    SKIP_PATH_PREFIXES.iter().any(|p| path.starts_with(p))
}
