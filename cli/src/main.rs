use clap::Parser;
use helpdesk_cli::Cli;

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

#[tokio::main]
async fn run(cli: Cli) -> i32 {
    // Diagnostics go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::debug!("helpdesk-recovery v{} starting", env!("CARGO_PKG_VERSION"));
    cli.run().await
}
