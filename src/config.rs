// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading and validation.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:8080
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Optional JSONL file recording flows; acts as the proxy's view
    #[serde(default)]
    pub captures: Option<String>,

    /// Force `accept-encoding: identity` upstream so bodies arrive uncompressed
    #[serde(default = "default_anticomp")]
    pub anticomp: bool,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_anticomp() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            captures: None,
            anticomp: default_anticomp(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    #[serde(default)]
    pub passthrough_domains: Vec<String>,
    #[serde(default)]
    pub suppress_headers: Vec<String>,
}

impl TlsConfig {
    pub fn cert_path(&self) -> &str {
        self.ca_cert_path.as_deref().unwrap_or("ca.crt")
    }

    pub fn key_path(&self) -> &str {
        self.ca_key_path.as_deref().unwrap_or("ca.key")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichConfig {
    /// Base URL of the jswzl analysis service
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Responses with a larger body are not analysed (bytes, default 100 MiB)
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,

    /// Host suffixes considered in scope; empty means everything
    #[serde(default)]
    pub scope: Vec<String>,
}

fn default_api_url() -> String {
    "http://localhost:37232".to_string()
}

fn default_max_response_size() -> usize {
    100 * 1024 * 1024
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            max_response_size: default_max_response_size(),
            scope: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub enrich: EnrichConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// ```toml
    /// [general]
    /// listen = "127.0.0.1:8080"
    /// captures = "flows.jsonl"
    ///
    /// [tls]
    /// enabled = true
    ///
    /// [enrich]
    /// api_url = "http://localhost:37232"
    /// max_response_size = 104857600
    /// scope = ["example.com"]
    /// ```
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.general
            .listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid general.listen {:?}: {}", self.general.listen, e))?;

        let api: hyper::Uri = self
            .enrich
            .api_url
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid enrich.api_url {:?}: {}", self.enrich.api_url, e))?;
        if !matches!(api.scheme_str(), Some("http") | Some("https")) || api.host().is_none() {
            anyhow::bail!(
                "invalid enrich.api_url {:?}: expected an http(s) URL with a host",
                self.enrich.api_url
            );
        }

        if self.enrich.max_response_size == 0 {
            anyhow::bail!("enrich.max_response_size must be greater than zero");
        }
        Ok(())
    }
}
