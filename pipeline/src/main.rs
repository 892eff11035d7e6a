use anyhow::Result;
use clap::Parser;
use factstore::info;
use pipeline::launcher;
use pipeline::settings::AppConfig;
use pipeline::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run => {
            let report = launcher::launch(&cli.config).await?;
            if report.loaded() < report.jobs.len() {
                info!("{} of {} jobs did not load, see log above", report.jobs.len() - report.loaded(), report.jobs.len());
            }
        }
        Commands::Recompute { all } => {
            let config = AppConfig::new(&cli.config)?;
            launcher::recompute(&config, all)?;
        }
        Commands::Publish => {
            let config = AppConfig::new(&cli.config)?;
            launcher::publish(&config)?;
        }
        Commands::Summary => {
            let config = AppConfig::new(&cli.config)?;
            launcher::summary(&config)?;
        }
        Commands::Read { geo_id, metric_id, from, to } => {
            let config = AppConfig::new(&cli.config)?;
            for (date, value) in launcher::read(&config, &geo_id, &metric_id, from, to)? {
                match value {
                    Some(v) => println!("{date}\t{v}"),
                    None => println!("{date}\t"),
                }
            }
        }
    }
    Ok(())
}
