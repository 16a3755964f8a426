use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};

/// Scan repositories for critical vulnerabilities
#[derive(Parser)]
#[command(name = "critscan", version)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true, env = "CRITSCAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Job database URL, overriding the config file
    #[arg(long, global = true, env = "CRITSCAN_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Directory staged clones and reports are confined to, overriding the config file
    #[arg(long, global = true, env = "CRITSCAN_SANDBOX_ROOT")]
    pub sandbox_root: Option<PathBuf>,

    /// Output format for results on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Format of log lines on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a job for a repository and scan it right away
    Scan {
        /// HTTPS URL of the repository, e.g. https://github.com/owner/repo
        repository: String,
    },

    /// Queue a job for a later `work` run and print its id
    Submit { repository: String },

    /// Process every queued job
    Work {
        /// Jobs processed at the same time
        #[arg(long, env = "CRITSCAN_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Keep polling for newly queued jobs until interrupted
        #[arg(long)]
        follow: bool,
    },

    /// Print a job record
    Show { job_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "critscan",
            "show",
            "job-1",
            "--format",
            "json",
            "--database-url",
            "sqlite::memory:",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.database_url.as_deref(), Some("sqlite::memory:"));
        assert!(matches!(cli.command, Command::Show { ref job_id } if job_id == "job-1"));
    }

    #[test]
    fn work_flags() {
        let cli = Cli::try_parse_from(["critscan", "work", "--concurrency", "4", "--follow"]).unwrap();
        match cli.command {
            Command::Work { concurrency, follow } => {
                assert_eq!(concurrency, Some(4));
                assert!(follow);
            }
            _ => panic!("expected work"),
        }
    }

    #[test]
    fn scan_requires_repository() {
        assert!(Cli::try_parse_from(["critscan", "scan"]).is_err());
    }
}
