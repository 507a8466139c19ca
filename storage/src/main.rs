use anyhow::Context;
use clap::{Arg, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

use storage::{Config, Dstore};

fn positional<T>(matches: &clap::ArgMatches, name: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = matches
        .get_one::<String>(name)
        .with_context(|| format!("missing argument {}", name))?;
    raw.parse::<T>()
        .with_context(|| format!("invalid {}: {:?}", name, raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("dstore")
        .version("0.1.0")
        .about("Storage node of a replicated file store")
        .arg(Arg::new("port").help("Port to accept client and peer connections on").required(true))
        .arg(Arg::new("cport").help("Controller port").required(true))
        .arg(Arg::new("timeout").help("Timeout in milliseconds").required(true))
        .arg(Arg::new("folder").help("Folder holding this node's files").required(true))
        .arg(
            Arg::new("controller-host")
                .long("controller-host")
                .help("Host the controller and peer nodes run on")
                .default_value("127.0.0.1"),
        )
        .get_matches();

    let mut config = Config::new(
        positional(&matches, "port")?,
        positional(&matches, "cport")?,
        positional(&matches, "timeout")?,
        positional::<String>(&matches, "folder")?,
    );
    config.controller_host = positional(&matches, "controller-host")?;

    info!("storage node configuration: {:?}", config);

    let dstore = Dstore::bind(config).await.context("starting storage node")?;
    dstore.run().await.context("storage node stopped")?;

    Ok(())
}
