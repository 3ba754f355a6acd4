use std::path::PathBuf;

use catalogd::daemon::{MirrorConfig, MirrorRuntime};
use catalogd::sync::{JobOutcome, SyncMode};

const DEFAULT_EXPORT_PATH: &str = "catalog-export.csv";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Sync(SyncMode),
    Status,
    Search { query: String, page: u32 },
    Export { path: PathBuf },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Run);
    };
    let rest: Vec<String> = args.collect();

    let mode = match command.as_str() {
        "run" => CliMode::Run,
        "full" => CliMode::Sync(SyncMode::Full),
        "quick" => CliMode::Sync(SyncMode::Quick),
        "status" => CliMode::Status,
        "search" => return parse_search(rest),
        "export" => {
            if rest.len() > 1 {
                anyhow::bail!("export takes at most one path");
            }
            let path = rest
                .into_iter()
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_PATH));
            return Ok(CliMode::Export { path });
        }
        "--help" | "-h" | "help" => CliMode::Help,
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = rest.first() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn parse_search(args: Vec<String>) -> anyhow::Result<CliMode> {
    let mut page = 1;
    let mut words = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--page" {
            let value = args.next().ok_or_else(|| anyhow::anyhow!("--page needs a value"))?;
            page = value
                .parse::<u32>()
                .ok()
                .filter(|page| *page > 0)
                .ok_or_else(|| anyhow::anyhow!("invalid page: {value}"))?;
        } else {
            words.push(arg);
        }
    }
    let query = words.join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("search needs a query");
    }
    Ok(CliMode::Search { query, page })
}

fn print_usage() {
    println!("Usage: catalogd [COMMAND]");
    println!("  run                        Mirror continuously until Ctrl-C (default)");
    println!("  full                       Run one full sync and exit");
    println!("  quick                      Run one quick sync and exit");
    println!("  status                     Print sync status as JSON");
    println!("  search <query> [--page N]  Search the mirror, falling back to the API");
    println!("  export [path]              Write mirrored items as CSV");
}

fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    setup_logging();
    let config = MirrorConfig::from_env()?;
    let runtime = MirrorRuntime::bootstrap(config).await?;

    match mode {
        CliMode::Run => runtime.run().await?,
        CliMode::Sync(sync_mode) => {
            let Some(result) = runtime.run_sync(sync_mode).await? else {
                anyhow::bail!("another sync is already running");
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.outcome == JobOutcome::Failed {
                anyhow::bail!("{sync_mode} sync failed");
            }
        }
        CliMode::Status => {
            let status = runtime.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        CliMode::Search { query, page } => {
            let hits = runtime.search(&query, page).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        CliMode::Export { path } => {
            let rows = runtime.export(&path).await?;
            println!("exported {rows} items to {}", path.display());
        }
        CliMode::Help => {}
    }
    Ok(())
}
