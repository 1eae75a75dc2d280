//! goapi-infra CLI
//!
//! Command-line interface for the go-api deployment.
//!
//! # Usage
//!
//! ```bash
//! goapi-infra init --env production > prod.toml
//! goapi-infra validate --config prod.toml
//! goapi-infra plan --env staging --format json
//! goapi-infra synth --out cdk.out
//! goapi-infra deploy --env production --profile ops
//! goapi-infra destroy --env staging --yes
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use goapi_infra::Environment;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod output;

#[derive(Parser)]
#[command(name = "goapi-infra")]
#[command(version)]
#[command(about = "Synthesize and deploy the go-api infrastructure", long_about = None)]
struct Cli {
    /// Target environment
    #[arg(long, short, env = "GOAPI_ENV", default_value = "staging", global = true)]
    env: EnvArg,

    /// Deployment configuration file (defaults to the environment preset)
    #[arg(long, short, env = "GOAPI_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// AWS profile passed to the engine
    #[arg(long, env = "AWS_PROFILE", global = true)]
    profile: Option<String>,

    /// AWS region override
    #[arg(long, env = "AWS_REGION", global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EnvArg {
    Staging,
    Production,
}

impl From<EnvArg> for Environment {
    fn from(env: EnvArg) -> Self {
        match env {
            EnvArg::Staging => Environment::Staging,
            EnvArg::Production => Environment::Production,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the environment preset as TOML
    Init {
        /// Write to a file instead of stdout
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Check the configuration without declaring anything
    Validate,
    /// List the resources that would be declared
    Plan,
    /// Write the template and dependency manifest
    Synth {
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Synthesize and hand the template to the engine
    Deploy {
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Delete the stack
    Destroy {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let settings = config::Settings::load().unwrap_or_else(|e| {
        tracing::warn!("ignoring unreadable settings: {:#}", e);
        config::Settings::default()
    });

    let ctx = commands::Context {
        environment: cli.env.into(),
        config_path: cli.config,
        format: cli.format,
        profile: cli.profile.or_else(|| settings.aws_profile.clone()),
        region: cli.region.or_else(|| settings.region.clone()),
        settings,
    };

    let result = match cli.command {
        Commands::Init { out } => commands::init::handle(&ctx, out),
        Commands::Validate => commands::validate::handle(&ctx),
        Commands::Plan => commands::plan::handle(&ctx),
        Commands::Synth { out } => commands::synth::handle(&ctx, out).map(|_| ()),
        Commands::Deploy { out } => commands::deploy::handle(&ctx, out).await,
        Commands::Destroy { yes } => commands::destroy::handle(&ctx, yes).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["goapi-infra", "validate", "--env", "production"]).unwrap();
        assert!(matches!(cli.env, EnvArg::Production));
        assert!(matches!(cli.command, Commands::Validate));

        let cli = Cli::try_parse_from(["goapi-infra", "init", "--env", "production"]).unwrap();
        assert!(matches!(cli.env, EnvArg::Production));
        assert!(matches!(cli.command, Commands::Init { out: None }));

        let cli = Cli::try_parse_from(["goapi-infra", "validate", "--config", "prod.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("prod.toml")));
    }

    #[test]
    fn test_global_flags_before_subcommand() {
        let cli = Cli::try_parse_from([
            "goapi-infra",
            "--env",
            "production",
            "--region",
            "eu-west-1",
            "plan",
        ])
        .unwrap();
        assert!(matches!(cli.env, EnvArg::Production));
        assert_eq!(cli.region.as_deref(), Some("eu-west-1"));
    }
}
