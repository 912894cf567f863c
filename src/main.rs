//! azure-objectstore - command-line front end for the blob gateway
//!
//! Loads the configuration map, initializes the gateway and runs a single
//! command against it:
//!
//! ```text
//! azure-objectstore list     <container> [prefix]
//! azure-objectstore prefixes <container> [prefix] [delimiter]
//! azure-objectstore exists   <container> <key>
//! azure-objectstore get      <container> <key>        (writes to stdout)
//! azure-objectstore put      <container> <key>        (reads from stdin)
//! azure-objectstore delete   <container> <key>
//! azure-objectstore sign     <container> <key> [ttl-seconds]
//! ```

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use azure_objectstore::config::load_config_map;
use azure_objectstore::BlobGateway;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SIGN_TTL_SECS: u64 = 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // JSON logs on stderr so stdout stays clean for `get`
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    azure_objectstore::metrics::init_metrics();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        bail!("usage: azure-objectstore <list|prefixes|exists|get|put|delete|sign> <container> [args]");
    };

    let config = load_config_map().map_err(|e| anyhow!("failed to load configuration: {}", e))?;
    let mut gateway = BlobGateway::new();
    gateway.init(&config).await.context("gateway initialization failed")?;
    info!(command = %command, "Running command");

    let result = run(&gateway, command, rest).await;
    gateway.shutdown();
    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn run(gateway: &BlobGateway, command: &str, args: &[String]) -> anyhow::Result<()> {
    let arg = |i: usize, name: &str| {
        args.get(i)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("{} requires <{}>", command, name))
    };
    let optional = |i: usize| args.get(i).map(String::as_str);

    let mut stdout = tokio::io::stdout();
    match command {
        "list" => {
            for key in gateway.list_objects(arg(0, "container")?, optional(1)).await? {
                stdout.write_all(format!("{}\n", key).as_bytes()).await?;
            }
        }
        "prefixes" => {
            let delimiter = optional(2).unwrap_or("/");
            for prefix in gateway
                .list_common_prefixes(arg(0, "container")?, optional(1), delimiter)
                .await?
            {
                stdout.write_all(format!("{}\n", prefix).as_bytes()).await?;
            }
        }
        "exists" => {
            let exists = gateway.object_exists(arg(0, "container")?, arg(1, "key")?).await?;
            stdout.write_all(format!("{}\n", exists).as_bytes()).await?;
        }
        "get" => {
            let reader = gateway.get_object(arg(0, "container")?, arg(1, "key")?).await?;
            let mut body = reader.into_async_read();
            tokio::io::copy(&mut body, &mut stdout).await?;
        }
        "put" => {
            let written = gateway
                .put_object(arg(0, "container")?, arg(1, "key")?, tokio::io::stdin())
                .await?;
            info!(bytes = written, "Upload complete");
        }
        "delete" => {
            gateway.delete_object(arg(0, "container")?, arg(1, "key")?).await?;
        }
        "sign" => {
            let ttl = match optional(2) {
                Some(raw) => raw.parse().with_context(|| format!("invalid ttl {:?}", raw))?,
                None => DEFAULT_SIGN_TTL_SECS,
            };
            let url = gateway.create_signed_url(
                arg(0, "container")?,
                arg(1, "key")?,
                Duration::from_secs(ttl),
            )?;
            stdout.write_all(format!("{}\n", url).as_bytes()).await?;
        }
        other => bail!("unknown command {:?}", other),
    }
    stdout.flush().await?;
    Ok(())
}
