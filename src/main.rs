use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use smart_context_bridge::broadcast::{ContextBus, HttpContextBus};
use smart_context_bridge::launch::Navigator;
use smart_context_bridge::patient::PatientIdentity;
use smart_context_bridge::smart::SmartAuthorizer;
use smart_context_bridge::storage::FileStore;
use smart_context_bridge::{Config, LaunchPipeline, RunOutcome};

/// Complete a SMART on FHIR launch and broadcast the patient's context over FDC3
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Page URL the EHR opened, including its query (iss/launch or code/state)
    url: Url,

    /// FDC3 bus endpoint to POST contexts to (overrides config)
    #[arg(long)]
    bus_endpoint: Option<String>,

    /// Path to config file (default: ~/.smartbridge/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Clear the session and restart the standalone launch
    #[arg(long)]
    reset: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Prints the destination; the user's browser takes it from there
struct StdoutNavigator;

impl Navigator for StdoutNavigator {
    fn navigate(&self, url: &Url) {
        println!("Navigate to: {}", url);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        print_error(&e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    if args.bus_endpoint.is_some() {
        config.bus_endpoint = args.bus_endpoint.clone();
    }

    let store_path = Config::session_store_path()?;
    let store = Arc::new(FileStore::open(&store_path).context("Failed to open session storage")?);
    let helper = Arc::new(SmartAuthorizer::with_timeout(config.request_timeout())?);
    let bus = match &config.bus_endpoint {
        Some(endpoint) => {
            let bus = HttpContextBus::with_timeout(endpoint, config.request_timeout())?;
            Some(Arc::new(bus) as Arc<dyn ContextBus>)
        }
        None => {
            info!("No FDC3 bus configured, contexts will not be broadcast");
            None
        }
    };

    let mut pipeline = LaunchPipeline::from_config(
        args.url,
        &config,
        helper,
        store,
        Arc::new(StdoutNavigator),
        bus,
    );

    if args.reset {
        pipeline.reset_session()?;
        return Ok(());
    }

    match pipeline.run().await? {
        RunOutcome::Redirected(_) => {}
        RunOutcome::Ready(report) => {
            print_banner(&report.identity);
            println!("Launch context:");
            println!("{}", serde_json::to_string_pretty(&report.launch_context)?);
            if let Err(e) = &report.pass {
                println!();
                println!("Clinical data was only partly broadcast: {}", e);
            }
        }
    }

    Ok(())
}

fn print_banner(identity: &PatientIdentity) {
    let or_na = |v: Option<&str>| v.filter(|s| !s.is_empty()).unwrap_or("N/A").to_string();

    println!("==============================================");
    println!("  SMART on FHIR Patient Information");
    println!("==============================================");
    println!("  Name:       {}", identity.display_name);
    println!("  Gender:     {}", or_na(identity.gender.as_deref()));
    println!("  Birth Date: {}", or_na(identity.birth_date.as_deref()));
    println!("  FHIR ID:    {}", or_na(Some(identity.id.as_str())));
    println!("==============================================");
}

fn print_error(e: &anyhow::Error) {
    eprintln!();
    eprintln!("----------------------------------------------");
    eprintln!("  Error");
    eprintln!("----------------------------------------------");
    for cause in e.chain() {
        eprintln!("  {}", cause);
    }
    eprintln!("----------------------------------------------");
}
