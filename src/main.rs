use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use devframe::cli::Cli;
use devframe::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Connection-level chatter from hyper and reqwest is only useful when asked for
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{},hyper=warn,hyper_util=warn,reqwest=warn", level))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    cli.run().await
}
