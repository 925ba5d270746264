use anyhow::Result;
use clap::Parser;
use schedprobe::{SchedProbeEngine, Settings};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if opt.verbose { "info" } else { "warn" },
    ))
    .init();

    let settings = Settings::new()?;
    SchedProbeEngine::new(settings)?.run().await
}
