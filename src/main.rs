use clap::Parser as _;
use pool_ocp_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Valuemaps(commands::valuemaps::Args),
    Ranges(commands::ranges::Args),
    Simulate(commands::simulate::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter = std::env::var("POOL_OCP_TOOLS_LOG")
        .ok()
        .and_then(|desc| desc.parse::<tracing_subscriber::filter::targets::Targets>().ok())
        .unwrap_or_default();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Valuemaps(args) => end(commands::valuemaps::run(args)),
        Commands::Ranges(args) => end(commands::ranges::run(args)),
        Commands::Simulate(args) => end(commands::simulate::run(args)),
    }
}
