use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use commands::distill::DistillArgs;
use config::load_config;

/// cad0: distil a CAD "Compact IR" teacher model into a small student
#[derive(Debug, Parser)]
#[command(name = "cad0", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Distil a teacher model into a smaller student model.
    ///
    /// Flags override values from the configuration file and `CAD0_*`
    /// environment variables.
    Distill(DistillArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    let cfg = load_config(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Distill(args) => commands::distill::run(args, &cfg).await?,
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(fmt::layer().json())
            .init();
    } else {
        registry
            .with(fmt::layer().pretty())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distill_flags_parse() {
        let cli = Cli::try_parse_from([
            "cad0",
            "--log-format",
            "json",
            "distill",
            "--teacher",
            "/m/t",
            "--student",
            "/m/s",
            "--epochs",
            "2",
            "--temperature",
            "3.5",
            "--cpu",
        ])
        .unwrap();
        assert_eq!(cli.log_format, "json");
        let Commands::Distill(args) = cli.command;
        assert_eq!(args.teacher, Some(PathBuf::from("/m/t")));
        assert_eq!(args.epochs, Some(2));
        assert_eq!(args.temperature, Some(3.5));
        assert!(args.cpu);
        assert!(!args.no_metrics);
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["cad0"]).is_err());
    }
}
