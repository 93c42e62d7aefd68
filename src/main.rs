use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use health_orchestrator::application::*;
use health_orchestrator::monitoring::ReportFormat;
use health_orchestrator::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "health-orchestrator")]
#[command(about = "Health-check and auto-remediation orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run scheduled checks
    Serve,
    /// Run the checks once and print the summary
    Check {
        /// Only check this module
        #[arg(long)]
        module: Option<String>,
    },
    /// Generate a report for a date range (default: the last 7 days)
    Report {
        /// Period start (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_datetime)]
        from: Option<DateTime<Utc>>,
        /// Period end (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_datetime)]
        to: Option<DateTime<Utc>>,
        #[arg(long, default_value = "json")]
        format: ReportFormat,
    },
    /// List registered modules
    Modules,
}

fn parse_datetime(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("expected RFC 3339 timestamp or YYYY-MM-DD, got {raw}"))
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.operational.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.operational.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config);

    let app = Application::new(config).await?;
    app.initialize().await?;

    match cli.command {
        Some(Commands::Check { module }) => {
            CheckCommandHandler::new(app.container.clone())
                .run_check(module)
                .await
        }
        Some(Commands::Report { from, to, format }) => {
            ReportCommandHandler::new(app.container.clone())
                .generate(from, to, format)
                .await
        }
        Some(Commands::Modules) => ModulesCommandHandler::new(app.container.clone()).list_modules(),
        Some(Commands::Serve) | None => {
            ServerCommandHandler::new(app.container.clone()).serve().await
        }
    }
}
