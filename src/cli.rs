//! Command line interface.
//!
//! [`Cli`] holds the [`Command`] (run, classify, status) and the global flags
//! that override `autoapply.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::platform::PlatformId;

/// autoapply: submits job applications across ATS platforms.
#[derive(Debug, Parser)]
#[command(name = "autoapply", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (defaults to ./autoapply.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Maximum attempts running at once.
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Ceiling on jobs dispatched in this campaign.
    #[arg(long, global = true)]
    pub max_total: Option<usize>,

    /// Click the final submit button instead of stopping for review.
    #[arg(long, global = true, default_value_t = false)]
    pub auto_submit: bool,

    /// Verbose logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a campaign over a list of jobs.
    Run {
        /// JSON file with an array of jobs (`id`, `url`, optional `company`, `title`).
        #[arg(long)]
        jobs: PathBuf,

        /// JSON or TOML file with the candidate profile.
        #[arg(long)]
        profile: PathBuf,
    },

    /// Show which platform and strategy a URL routes to.
    Classify {
        url: String,
    },

    /// Summarise recorded outcomes and the circuit state they imply.
    Status {
        #[arg(long, value_parser = parse_platform)]
        platform: Option<PlatformId>,

        /// How far back to look, in minutes.
        #[arg(long, default_value_t = 24 * 60)]
        window_mins: u64,
    },
}

fn parse_platform(s: &str) -> Result<PlatformId, String> {
    s.parse()
}
