// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Local certificate authority minting leaf certificates for intercepted hosts.

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::fs;
use tracing::{debug, info};

const CA_COMMON_NAME: &str = "jswzl-proxy CA";
const CA_ORGANIZATION: &str = "jswzl";

pub struct CertificateAuthority {
    cert_pem: String,
    key_pair: KeyPair,
    /// Leaf certificates by host name.
    leaves: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

/// Parameters of the CA certificate. Regenerated identically on load since
/// rcgen signs with parameters, not with the parsed certificate.
fn ca_params() -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![]).context("failed to create CA params")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORGANIZATION);
    Ok(params)
}

impl CertificateAuthority {
    /// Load the CA from disk, generating and persisting a new one when either
    /// file is missing.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        if cert_path.exists() && key_path.exists() {
            info!(path = ?cert_path, "loading CA");
            Self::load(cert_path, key_path).await
        } else {
            info!(path = ?cert_path, "generating CA");
            Self::generate_and_save(cert_path, key_path).await
        }
    }

    async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .context("failed to read CA cert")?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .context("failed to read CA key")?;
        let key_pair = KeyPair::from_pem(&key_pem).context("failed to parse CA key")?;
        Ok(Arc::new(Self::from_parts(cert_pem, key_pair)))
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = ca_params()?.self_signed(&key_pair)?;
        let cert_pem = cert.pem();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, key_pair.serialize_pem()).await?;

        Ok(Arc::new(Self::from_parts(cert_pem, key_pair)))
    }

    fn from_parts(cert_pem: String, key_pair: KeyPair) -> Self {
        Self {
            cert_pem,
            key_pair,
            leaves: RwLock::new(HashMap::new()),
        }
    }

    /// Leaf certificate for `host`, signed by this CA and cached per host.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        {
            let leaves = self
                .leaves
                .read()
                .map_err(|e| anyhow::anyhow!("leaf cache poisoned: {}", e))?;
            if let Some(leaf) = leaves.get(host) {
                return Ok(leaf.clone());
            }
        }

        debug!(%host, "minting leaf certificate");
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let issuer = Issuer::new(ca_params()?, &self.key_pair);
        let cert = params.signed_by(&key_pair, &issuer)?;

        let cert_pem = cert.pem();
        let leaf_cert = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow::anyhow!("no certificate in generated PEM"))??;

        let key_pem = key_pair.serialize_pem();
        let leaf_key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow::anyhow!("no private key in generated PEM"))??;

        let signer = any_supported_type(&PrivateKeyDer::from(leaf_key))
            .map_err(|e| anyhow::anyhow!("unsupported leaf key: {}", e))?;
        let certified = Arc::new(CertifiedKey::new(vec![leaf_cert], signer));

        self.leaves
            .write()
            .map_err(|e| anyhow::anyhow!("leaf cache poisoned: {}", e))?
            .insert(host.to_string(), certified.clone());
        Ok(certified)
    }

    /// PEM of the CA certificate, served to clients for installation.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}
