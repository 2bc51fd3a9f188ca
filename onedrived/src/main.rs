use onedrived::config::DaemonConfig;
use onedrived::daemon::{DaemonRuntime, RunMode};
use onedrived::storage::TokenStorage;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: onedrived [--once | --logout]");
        println!("  --once     Run one full sync pass and exit");
        println!("  --logout   Remove the saved token state and exit");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::Logout => {
            TokenStorage::new(&config.token_file).delete_token().await?;
            tracing::info!(path = %config.token_file.display(), "saved token removed");
            Ok(())
        }
        CliMode::Once => DaemonRuntime::bootstrap(config).await?.run(RunMode::Once).await,
        CliMode::Run | CliMode::Help => {
            DaemonRuntime::bootstrap(config)
                .await?
                .run(RunMode::Continuous)
                .await
        }
    }
}
