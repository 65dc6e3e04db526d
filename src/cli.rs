//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// drift - GitOps reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "drift")]
#[command(version)]
#[command(about = "Keep live resources converged on the state declared in version control")]
#[command(
    long_about = "drift reads manifests from a desired-state source, compares them with the live resources it manages, and applies the difference. It can keep watching for drift and promote freshly built image tags into the source."
)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "drift.toml")]
    pub config: PathBuf,

    /// Directory holding the desired-state manifests
    #[arg(short, long, global = true, default_value = ".")]
    pub source: PathBuf,

    /// File persisting live state between runs
    #[arg(long, global = true, default_value = ".drift/live.json")]
    pub state: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and source manifests
    CheckConfig,

    /// Show what a sync would change, without changing anything
    Plan {
        /// Only this application
        #[arg(short, long)]
        app: Option<String>,

        /// Print plans as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Reconcile applications
    Run {
        /// Run one cycle per application and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Write a new image tag into the source manifests
    Promote {
        /// Image repository, e.g. registry.example.com/web
        #[arg(short, long)]
        image: String,

        /// Tag to promote
        #[arg(short, long)]
        tag: String,
    },
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn promote_takes_image_and_tag() {
        let cli = Cli::try_parse_from([
            "drift",
            "promote",
            "--image",
            "registry.example.com/web",
            "--tag",
            "v2",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Promote { ref image, ref tag } if image == "registry.example.com/web" && tag == "v2"
        ));
        assert_eq!(cli.config, PathBuf::from("drift.toml"));
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["drift", "run", "--once", "--source", "deploy"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { once: true }));
        assert_eq!(cli.source, PathBuf::from("deploy"));
    }
}
