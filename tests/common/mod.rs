// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use jswzl_proxy::capture::CaptureWriter;
use jswzl_proxy::config::Config;
use jswzl_proxy::proxy::run_proxy;

pub struct RunningProxy {
    pub handle: tokio::task::JoinHandle<()>,
    pub addr: SocketAddr,
    pub captures: PathBuf,
}

impl RunningProxy {
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
        let _ = tokio::fs::remove_file(&self.captures).await;
    }
}

/// Config with TLS interception on and a CA under a fresh temp path.
pub fn tls_config() -> (Config, PathBuf, PathBuf) {
    let id = uuid::Uuid::new_v4();
    let cert_path = std::env::temp_dir().join(format!("jswzl_ca_{}.crt", id));
    let key_path = std::env::temp_dir().join(format!("jswzl_ca_{}.key", id));
    let mut cfg = Config::default();
    cfg.tls.enabled = true;
    cfg.tls.ca_cert_path = Some(cert_path.to_string_lossy().to_string());
    cfg.tls.ca_key_path = Some(key_path.to_string_lossy().to_string());
    (cfg, cert_path, key_path)
}

/// Start `run_proxy` in the background and wait until it accepts connections
/// and, with TLS enabled, the CA files exist.
pub async fn start_run_proxy_and_wait(cfg: Config) -> anyhow::Result<RunningProxy> {
    let captures =
        std::env::temp_dir().join(format!("jswzl_integ_{}.jsonl", uuid::Uuid::new_v4()));
    let cw = CaptureWriter::new(&captures).await?;

    // Choose a free port by binding then dropping
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let cfg = Arc::new(cfg);
    let cfg_for_spawn = cfg.clone();
    let handle = tokio::spawn(async move {
        let _ = run_proxy(addr, cfg_for_spawn, Some(cw)).await;
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout waiting for proxy to start");
        }
        if let Ok(mut s) = tokio::net::TcpStream::connect(addr).await {
            let _ = s.shutdown().await;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    if cfg.tls.enabled {
        let cert_path = PathBuf::from(cfg.tls.cert_path());
        let key_path = PathBuf::from(cfg.tls.key_path());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !(cert_path.exists() && key_path.exists()) {
            if Instant::now() > deadline {
                anyhow::bail!("timeout waiting for CA files");
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    Ok(RunningProxy {
        handle,
        addr,
        captures,
    })
}

/// Read until the end of an HTTP head.
pub async fn read_http_head<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(3);
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        if Instant::now() > deadline {
            anyhow::bail!("timeout reading response head");
        }
        let n = match timeout(Duration::from_millis(500), stream.read(&mut tmp)).await {
            Ok(Ok(0)) => anyhow::bail!("unexpected EOF before complete response head"),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        };
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Plain HTTP GET of an absolute URL through the proxy. Returns the raw response.
pub async fn proxy_get(proxy: SocketAddr, url: &str) -> anyhow::Result<String> {
    let uri: hyper::Uri = url.parse()?;
    let host = uri
        .authority()
        .ok_or_else(|| anyhow::anyhow!("url without authority: {}", url))?;

    let mut stream = tokio::net::TcpStream::connect(proxy).await?;
    let req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
        url, host
    );
    stream.write_all(req.as_bytes()).await?;

    let mut resp = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut resp)).await??;
    Ok(String::from_utf8_lossy(&resp).to_string())
}

/// Poll `mock` until `cond` holds on its received requests or a few seconds pass.
pub async fn wait_for_requests<F>(mock: &wiremock::MockServer, cond: F) -> Vec<wiremock::Request>
where
    F: Fn(&[wiremock::Request]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let received = mock.received_requests().await.unwrap_or_default();
        if cond(&received) || Instant::now() > deadline {
            return received;
        }
        sleep(Duration::from_millis(50)).await;
    }
}
