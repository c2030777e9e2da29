//! Command-line interface built on clap.
//!
//! Flags given here override `send_detections.toml` and the environment.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::SubmitterConfig;

/// Submit detections to the Recorded Future Collective Insights API.
#[derive(Debug, Parser)]
#[command(name = "send-detections", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Records per request.
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// Requests in flight at once.
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Total attempts per batch.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Make a single attempt per batch.
    #[arg(long, global = true, default_value_t = false)]
    pub no_retry: bool,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit the records in a JSON file.
    Submit {
        /// JSON array of detections, or an object with a `data` array.
        file: PathBuf,

        /// Ask the API to validate without storing.
        #[arg(long, default_value_t = false)]
        debug: bool,

        /// Organization to submit on behalf of. Repeatable.
        #[arg(long = "org-id")]
        org_ids: Vec<String>,

        /// Write the summary JSON here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Cancel the run after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

impl Cli {
    /// Apply CLI overrides on top of file and environment settings.
    pub fn apply(&self, config: &mut SubmitterConfig) {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if self.no_retry {
            config.max_retries = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_submit_subcommand() {
        let cli = Cli::parse_from([
            "send-detections",
            "submit",
            "detections.json",
            "--org-id",
            "uhash:a",
            "--org-id",
            "uhash:b",
            "--debug",
            "--timeout-secs",
            "90",
        ]);
        let Command::Submit {
            file,
            debug,
            org_ids,
            output,
            timeout_secs,
        } = cli.command;
        assert_eq!(file, PathBuf::from("detections.json"));
        assert!(debug);
        assert_eq!(org_ids, vec!["uhash:a", "uhash:b"]);
        assert!(output.is_none());
        assert_eq!(timeout_secs, Some(90));
    }

    #[test]
    fn global_flags_override_config() {
        let cli = Cli::parse_from([
            "send-detections",
            "--batch-size",
            "50",
            "--concurrency",
            "8",
            "--max-retries",
            "5",
            "--verbose",
            "submit",
            "in.json",
        ]);
        assert!(cli.verbose);

        let mut config = SubmitterConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn no_retry_wins_over_max_retries() {
        let cli = Cli::parse_from([
            "send-detections",
            "submit",
            "in.json",
            "--max-retries",
            "4",
            "--no-retry",
        ]);
        let mut config = SubmitterConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
