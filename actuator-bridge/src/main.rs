use std::time::Duration;

use clap::Parser;

use actuator_bridge::{config::Cli, daemon::Daemon, tracing};

/// How long to wait for stray blocking work (stdin reads) at exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing::init_journald_or_stdout();

    let config = cli.into_config()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(Daemon::new(config).run());
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    result?;
    Ok(())
}
