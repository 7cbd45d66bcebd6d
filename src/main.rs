// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use jswzl_proxy::{capture, config, proxy};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "jswzl-proxy")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080 (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Optional TOML config path
    #[arg(long)]
    config: Option<String>,

    /// Base URL of the jswzl analysis service
    #[arg(long)]
    api_url: Option<String>,

    /// Largest response body sent for analysis, in bytes
    #[arg(long)]
    max_response_size: Option<usize>,

    /// Path to append flow records as JSONL
    #[arg(long)]
    captures: Option<String>,
}

/// Load the config file when given and apply command-line overrides.
async fn resolve_config(args: &Args) -> anyhow::Result<config::Config> {
    let mut cfg = match &args.config {
        Some(p) => config::Config::load_from_path(p).await?,
        None => config::Config::default(),
    };
    if let Some(listen) = &args.listen {
        cfg.general.listen = listen.clone();
    }
    if let Some(captures) = &args.captures {
        cfg.general.captures = Some(captures.clone());
    }
    if let Some(api_url) = &args.api_url {
        cfg.enrich.api_url = api_url.clone();
    }
    if let Some(max) = args.max_response_size {
        cfg.enrich.max_response_size = max;
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let cfg = resolve_config(&args).await?;
    let addr: SocketAddr = cfg.general.listen.parse()?;

    let captures = match &cfg.general.captures {
        Some(p) => Some(capture::CaptureWriter::new(p).await?),
        None => None,
    };

    let server = proxy::run_proxy(addr, Arc::new(cfg), captures);

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
