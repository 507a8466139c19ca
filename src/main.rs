use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

use replistore::{Config, Controller};

fn parse_positional<T>(matches: &ArgMatches, name: &str) -> anyhow::Result<T>
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

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    if let Some(path) = matches.get_one::<String>("config") {
        return Config::from_file(path).with_context(|| format!("loading {}", path));
    }

    let config = Config::new(
        parse_positional(matches, "cport")?,
        parse_positional(matches, "replication")?,
        parse_positional(matches, "timeout")?,
        parse_positional(matches, "rebalance_period")?,
    );
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("controller")
        .version("0.1.0")
        .about("Controller of a replicated file store")
        .arg(Arg::new("cport").help("Port to listen on").required_unless_present("config"))
        .arg(
            Arg::new("replication")
                .help("Number of storage nodes each file is kept on")
                .required_unless_present("config"),
        )
        .arg(
            Arg::new("timeout")
                .help("Timeout in milliseconds for node acknowledgements")
                .required_unless_present("config"),
        )
        .arg(
            Arg::new("rebalance_period")
                .help("Milliseconds between periodic rebalances")
                .required_unless_present("config"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("JSON configuration file, used instead of the positional arguments"),
        )
        .get_matches();

    let config = load_config(&matches)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("controller configuration: {:?}", config);

    let controller = Controller::bind(config).await.context("starting controller")?;
    controller.start().await.context("controller stopped")?;

    Ok(())
}
