use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gateway_proxy::config::{load_catalog, load_config, Catalog, ConfigError};
use gateway_proxy::dispatch::{DispatchTable, Mutation};
use gateway_proxy::observability::Analysis;
use gateway_proxy::timer::TimingWheel;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Offline checks and probes for the API gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a gateway configuration file
    CheckConfig { path: PathBuf },
    /// Apply a catalog file to an empty dispatch table and report rejected records
    CheckCatalog { path: PathBuf },
    /// Show which API a request would hit
    Route {
        catalog: PathBuf,
        method: String,
        path: String,
    },
    /// Send one request through a running gateway
    Probe {
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => match load_config(&path) {
            Ok(config) => {
                println!("ok: {} filters, listening on {}", config.filters.len(), config.addr);
            }
            Err(ConfigError::Validation(errors)) => {
                for e in &errors {
                    eprintln!("error: {e}");
                }
                std::process::exit(1);
            }
            Err(e) => return Err(e.into()),
        },
        Commands::CheckCatalog { path } => {
            let (table, rejected) = build_table(&path)?;
            let snapshot = table.snapshot();
            println!(
                "{} apis, {} clusters, {} servers, {} routings",
                snapshot.apis.len(),
                snapshot.clusters.len(),
                snapshot.servers.len(),
                snapshot.routings.len()
            );
            if rejected > 0 {
                eprintln!("{rejected} record(s) rejected");
                std::process::exit(1);
            }
        }
        Commands::Route { catalog, method, path } => {
            let (table, _) = build_table(&catalog)?;
            match table.snapshot().route(&path, &method.to_ascii_uppercase()) {
                Ok((api, params)) => {
                    println!("api {} ({}) {} {}", api.id, api.name, api.method, api.url_pattern);
                    for (name, value) in params.iter() {
                        println!("  {name} = {value}");
                    }
                }
                Err(e) => {
                    eprintln!("no match: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Probe { url, headers } => {
            let client = reqwest::Client::builder().no_proxy().build()?;
            let mut request = client.get(&url);
            for header in &headers {
                if let Some((name, value)) = header.split_once(':') {
                    request = request.header(name.trim(), value.trim());
                }
            }
            let res = request.send().await?;
            println!("{} {}", res.status(), url);
            for (name, value) in res.headers() {
                println!("{name}: {}", value.to_str().unwrap_or("<binary>"));
            }
            println!();
            println!("{}", res.text().await?);
        }
    }

    Ok(())
}

/// Apply every record of the catalog in dependency order.
fn build_table(path: &Path) -> Result<(Arc<DispatchTable>, usize), ConfigError> {
    let Catalog {
        clusters,
        servers,
        binds,
        apis,
        routings,
    } = load_catalog(path)?;

    let wheel = TimingWheel::new(Duration::from_secs(1), 60, 1);
    let analysis = Arc::new(Analysis::new(wheel.clone()));
    let table = DispatchTable::new(wheel, analysis, Duration::from_secs(60), 16);

    let mutations = clusters
        .into_iter()
        .map(Mutation::AddCluster)
        .chain(servers.into_iter().map(Mutation::AddServer))
        .chain(binds.into_iter().map(Mutation::AddBind))
        .chain(apis.into_iter().map(Mutation::AddApi))
        .chain(routings.into_iter().map(Mutation::AddRouting));

    let mut rejected = 0;
    for mutation in mutations {
        let name = mutation.name();
        if let Err(e) = table.apply(mutation) {
            eprintln!("rejected {name}: {e}");
            rejected += 1;
        }
    }
    Ok((table, rejected))
}
