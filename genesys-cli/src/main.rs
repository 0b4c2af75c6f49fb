use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{debug, info};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use genesys_core::provider::Provider;
use genesys_core::resource::{ResourceId, State};
use genesys_platform::{PlatformDetector, PlatformInfo};
use genesys_provider::{
    GenesysProvider, ProviderConfig, ProviderMeta, SdkClientPool, region, with_pooled_client,
};

/// Version reported in the user agent and used for registry selection
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "genesys")]
#[command(about = "Genesys Cloud provider runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the host platform binary
    Platform,
    /// Run an allow-listed command against the detected platform binary
    Exec {
        /// Arguments passed to the binary (e.g. `version`)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Seconds before the command is killed
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Initialize the client pool from GENESYSCLOUD_* environment variables
    Pool {
        /// Run this many concurrent acquire/release cycles
        #[arg(long)]
        exercise: Option<usize>,
    },
    /// Read one resource
    Read {
        /// Resource type (e.g. routing_wrapupcode)
        resource_type: String,
        /// Remote identifier
        id: String,
    },
    /// List every resource of a type
    List {
        /// Resource type (e.g. routing_wrapupcode)
        resource_type: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let pools = Arc::new(SdkClientPool::new());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, cancelling...".yellow());
            interrupt.cancel();
        }
    });

    let result = match cli.command {
        Commands::Platform => run_platform().await,
        Commands::Exec { args, timeout } => {
            run_exec(&args, Duration::from_secs(timeout), &cancel).await
        }
        Commands::Pool { exercise } => run_pool(&pools, exercise, &cancel).await,
        Commands::Read { resource_type, id } => {
            run_read(&pools, &resource_type, &id, &cancel).await
        }
        Commands::List { resource_type } => run_list(&pools, &resource_type, &cancel).await,
    };

    pools.close();

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn detect_platform() -> PlatformInfo {
    PlatformDetector::new().get().await
}

async fn run_platform() -> Result<(), String> {
    let info = detect_platform().await;
    let platform = info.platform.to_string();
    let platform = if info.platform.is_valid() {
        platform.green().bold()
    } else {
        platform.yellow().bold()
    };

    println!("{} {}", "Platform:".cyan(), platform);
    match &info.binary_path {
        Some(path) => println!("{} {}", "Binary:  ".cyan(), path.display()),
        None => println!("{} {}", "Binary:  ".cyan(), "not found".yellow()),
    }
    println!("{} {}", "Registry:".cyan(), info.provider_registry());
    if info.platform.is_development_platform() {
        println!("{}", "Running under a development platform.".yellow());
    }
    Ok(())
}

async fn run_exec(args: &[String], timeout: Duration, cancel: &CancellationToken) -> Result<(), String> {
    let info = detect_platform().await;
    let output = info
        .execute(args, timeout, cancel)
        .await
        .map_err(|e| e.to_string())?;

    print!("{}", output.stdout);
    if !output.stderr.is_empty() {
        eprint!("{}", output.stderr);
    }
    if !output.success() {
        return Err(format!("{} exited with code {}", info.binary(), output.exit_code));
    }
    Ok(())
}

/// Load configuration, detect the platform, and initialize the pool.
///
/// Ctrl-C abandons a pre-fill that is still authorizing clients.
async fn provision(
    pools: &SdkClientPool,
    cancel: &CancellationToken,
) -> Result<(ProviderConfig, ProviderMeta), String> {
    let config = ProviderConfig::from_env().map_err(|e| e.to_string())?;
    debug!("Loaded configuration: {:?}", config);

    let info = detect_platform().await;
    let domain = region::domain(&config.region).unwrap_or_default();
    let meta = ProviderMeta::new(VERSION, info.platform, domain)
        .with_max_clients(config.pool.max_clients);

    println!("{}", "Initializing client pool...".cyan());
    init_pool(pools, &config, cancel).await?;
    info!("Client pool ready (registry {})", meta.registry);
    Ok((config, meta))
}

/// Pre-fill the pool unless `cancel` fires first.
async fn init_pool(
    pools: &SdkClientPool,
    config: &ProviderConfig,
    cancel: &CancellationToken,
) -> Result<(), String> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err("client pool initialization cancelled".to_string()),
        result = pools.init(config, VERSION) => result.map(|_| ()).map_err(|e| e.to_string()),
    }
}

async fn provider(
    pools: &SdkClientPool,
    cancel: &CancellationToken,
) -> Result<GenesysProvider, String> {
    let (_, meta) = provision(pools, cancel).await?;
    let pool = pools.pool().map_err(|e| e.to_string())?;
    Ok(GenesysProvider::new(pool, meta).with_cancellation(cancel.clone()))
}

async fn run_pool(
    pools: &SdkClientPool,
    exercise: Option<usize>,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let (config, meta) = provision(pools, cancel).await?;
    let pool = pools.pool().map_err(|e| e.to_string())?;
    println!(
        "{} {} clients ({})",
        "Pool initialized:".green().bold(),
        config.pool.max_clients,
        pool.metrics()
    );

    let Some(operations) = exercise else {
        return Ok(());
    };

    println!("{}", format!("Running {} pooled operations...", operations).cyan());
    let mut tasks = JoinSet::new();
    for i in 0..operations {
        let pool = pool.clone();
        let meta = meta.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            with_pooled_client(&pool, &cancel, &meta, |scoped| async move {
                let client = scoped.client()?;
                debug!("operation {} using client {}", i, client.id());
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await
        });
    }

    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                println!("  {} {}", "✗".red(), e);
            }
            Err(e) => {
                failures += 1;
                println!("  {} task failed: {}", "✗".red(), e);
            }
        }
    }

    println!("{} {}", "Metrics:".cyan().bold(), pool.metrics());
    if failures > 0 {
        return Err(format!("{} of {} operations failed", failures, operations));
    }
    println!("{}", "All operations completed.".green().bold());
    Ok(())
}

fn print_state(state: &State) {
    let identifier = state.identifier.as_deref().unwrap_or("-");
    println!("{} ({})", state.id.to_string().bold(), identifier);
    let mut keys: Vec<&String> = state.attributes.keys().collect();
    keys.sort();
    for key in keys {
        println!("  {} = {}", key, state.attributes[key]);
    }
}

async fn run_read(
    pools: &SdkClientPool,
    resource_type: &str,
    id: &str,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let provider = provider(pools, cancel).await?;
    let state = provider
        .read(&ResourceId::new(resource_type, id), Some(id))
        .await
        .map_err(|e| e.to_string())?;

    if !state.exists {
        println!("{}", format!("{} {} not found.", resource_type, id).yellow());
        return Ok(());
    }
    print_state(&state);
    Ok(())
}

async fn run_list(
    pools: &SdkClientPool,
    resource_type: &str,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let provider = provider(pools, cancel).await?;
    let states = provider
        .list(resource_type)
        .await
        .map_err(|e| e.to_string())?;

    if states.is_empty() {
        println!("{}", format!("No {} resources found.", resource_type).yellow());
        return Ok(());
    }
    for state in &states {
        print_state(state);
    }
    println!(
        "{}",
        format!("{} {} resources.", states.len(), resource_type).green()
    );
    Ok(())
}
