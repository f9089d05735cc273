use clap::Parser;
use privat_rates::{Cli, Config, RateCollector, USAGE_HINT, sort_results};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "privat_rates=warn".into()),
        )
        .init();

    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) if Cli::wants_usage_hint(&err) => {
            println!("{USAGE_HINT}");
            return Ok(());
        }
        // Help, version, and bad values for the named flags
        Err(err) => err.exit(),
    };

    let collector = RateCollector::new(Config::from(&args));
    tracing::debug!(base_url = %collector.config().base_url, days = args.days, "starting batch");

    let mut results = collector.collect(args.days).await?;
    if args.sort {
        sort_results(&mut results);
    }

    for result in results {
        println!("{result}");
    }

    Ok(())
}
