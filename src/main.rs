use anyhow::Context;
use clap::Parser;
use riptide::manager::Manager;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "riptide", about = "BitTorrent download client")]
struct Cli {
    /// Path to a *.torrent file
    file: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("riptide=info")),
        )
        .init();

    let args = Cli::parse();
    let data = std::fs::read(&args.file)
        .with_context(|| format!("failed to read torrent file {}", args.file))?;

    let manager = Manager::new();
    manager
        .add_torrent(&data)
        .await
        .context("failed to add torrent")?;

    // The download runs in the background; poll the same stats surface a
    // UI would until it reports completion.
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = manager.get_stats().await;
        let Some(stats) = stats.first() else {
            break;
        };
        println!(
            "{}: {:.2}% ({}/{} bytes, {} peers)",
            stats.name, stats.percent, stats.downloaded, stats.total_length, stats.peers
        );
        if stats.percent >= 100.0 {
            println!("done");
            break;
        }
    }
    Ok(())
}
