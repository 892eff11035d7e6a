//! Batch runner over the fact store: loads settings, seeds dimensions, runs extraction jobs,
//! recomputes derived metrics and publishes snapshots.

pub mod api;
pub mod catalog;
pub mod err;
pub mod geo;
pub mod launcher;
pub mod settings;
pub mod snapshot;

use clap::{Parser, Subcommand};
use factstore::chrono::NaiveDate;

pub use err::PipelineError;

#[derive(Debug, Parser)]
#[command(name = "pipeline")]
#[command(about = "Housing market indicator pipeline", long_about = None)]
pub struct Cli {
    /// Settings file, extension optional.
    #[arg(long, env = "FACTSTORE_CONFIG", default_value = "config/settings")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every configured job, then recompute the derived metrics they affect.
    Run,
    /// Recompute derived metrics.
    Recompute {
        /// Recompute every derived metric, not only the unmaterialized ones.
        #[arg(long)]
        all: bool,
    },
    /// Write the snapshot database.
    Publish,
    /// Print first date, last date and row count of every series.
    Summary,
    /// Print one series.
    Read {
        geo_id: String,
        metric_id: String,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read_with_bounds() {
        let cli = Cli::parse_from(["pipeline", "read", "dc_city", "fred_gs10", "--from", "2024-01-01"]);
        assert_eq!(cli.config, "config/settings");
        match cli.command {
            Commands::Read { geo_id, metric_id, from, to } => {
                assert_eq!(geo_id, "dc_city");
                assert_eq!(metric_id, "fred_gs10");
                assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert_eq!(to, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn recompute_all_flag() {
        let cli = Cli::parse_from(["pipeline", "--config", "other", "recompute", "--all"]);
        assert_eq!(cli.config, "other");
        assert!(matches!(cli.command, Commands::Recompute { all: true }));
    }
}
