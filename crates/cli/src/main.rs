use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cairn_core::EntityRef;
use cairn_ingest::{LocationReaders, YamlDescriptorParser};
use cairn_persist::{EntityStore, SqliteStore};
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cairnctl", version, about = "Cairn catalog CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path (default: ~/.cairn/cairn.db)
    #[arg(long = "db", global = true, env = "CAIRN_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage registered locations
    Location {
        #[command(subcommand)]
        command: LocationCmd,
    },
    /// Refresh all locations once, or periodically with --interval
    Refresh {
        /// Seconds between sweeps; runs until Ctrl-C
        #[arg(long = "interval")]
        interval: Option<u64>,
    },
    /// Inspect catalog entities
    Entity {
        #[command(subcommand)]
        command: EntityCmd,
    },
    /// Show the update log of a location, newest first
    Log {
        location_id: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum LocationCmd {
    /// Register a location
    Add {
        #[arg(long = "type", default_value = "file")]
        kind: String,
        #[arg(long = "target")]
        target: String,
    },
    /// List locations
    Ls,
    /// Remove a location (its entities stay in the catalog)
    Rm { id: String },
}

#[derive(Subcommand, Debug)]
enum EntityCmd {
    /// List entities
    Ls,
    /// Show one entity by `name` or `namespace/name`
    Get { entity: String },
}

/// Non-empty `CAIRN_<name>` environment variable.
fn cairn_env(name: &str) -> Option<String> {
    std::env::var(format!("CAIRN_{}", name)).ok().filter(|v| !v.trim().is_empty())
}

fn init_tracing() {
    let directives = cairn_env("LOG").unwrap_or_else(|| "info".to_string());
    let (filter, rejected) = match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new("info"), true),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
    if rejected {
        warn!(directives = %directives, "ignoring malformed CAIRN_LOG; using info");
    }
}

/// Serve Prometheus metrics when `CAIRN_METRICS_ADDR` is set. Failure to bind
/// is logged and the command carries on without an exporter.
fn init_metrics() {
    let Some(addr) = cairn_env("METRICS_ADDR") else { return };
    let sock = match addr.parse::<SocketAddr>() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %addr, error = %e, "invalid CAIRN_METRICS_ADDR; expected host:port");
            return;
        }
    };
    match PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "metrics exporter listening"),
        Err(e) => warn!(addr = %sock, error = %e, "failed to install metrics exporter"),
    }
}

fn open_store(path: Option<&str>) -> Result<SqliteStore> {
    let path = path.map(|s| s.to_string()).unwrap_or_else(cairn_persist::default_db_path);
    SqliteStore::open(&path).with_context(|| format!("opening catalog db at {}", path))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = open_store(cli.db.as_deref())?;

    match cli.command {
        Commands::Location { command } => match command {
            LocationCmd::Add { kind, target } => {
                let readers = LocationReaders::with_defaults();
                if !readers.types().contains(&kind.as_str()) {
                    return Err(anyhow!("unsupported location type {:?} (known: {})", kind, readers.types().join(", ")));
                }
                let loc = store.add_location(&kind, &target).context("adding location")?;
                info!(location_id = %loc.id, kind = %loc.kind, target = %loc.target, "location added");
                match cli.output {
                    Output::Human => println!("{}", loc.id),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&loc)?),
                }
            }
            LocationCmd::Ls => {
                let locations = store.locations().context("listing locations")?;
                match cli.output {
                    Output::Human => {
                        println!("{:<36}  {:<6}  TARGET", "ID", "TYPE");
                        for l in locations {
                            println!("{:<36}  {:<6}  {}", l.id, l.kind, l.target);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&locations)?),
                }
            }
            LocationCmd::Rm { id } => {
                if !store.remove_location(&id).context("removing location")? {
                    return Err(anyhow!("no such location: {}", id));
                }
                info!(location_id = %id, "location removed");
            }
        },
        Commands::Refresh { interval } => {
            let readers = LocationReaders::with_defaults();
            let parser = YamlDescriptorParser::new();
            match interval {
                None => cairn_refresh::refresh_locations(&store, &readers, &parser).await.context("refresh sweep")?,
                Some(0) => return Err(anyhow!("--interval must be at least 1 second")),
                Some(secs) => {
                    info!(interval_secs = secs, "starting periodic refresh; Ctrl-C to stop");
                    let shutdown = async {
                        let _ = tokio::signal::ctrl_c().await;
                    };
                    cairn_refresh::run_periodic(&store, &readers, &parser, Duration::from_secs(secs), shutdown).await;
                }
            }
        }
        Commands::Entity { command } => match command {
            EntityCmd::Ls => {
                let entities = store.entities().context("listing entities")?;
                match cli.output {
                    Output::Human => {
                        println!("{:<16}  {:<32}  {:<4}  UID", "KIND", "NAMESPACE/NAME", "GEN");
                        for e in entities {
                            let key = e.entity_ref().map(|r| r.to_string()).unwrap_or_default();
                            let generation = e.metadata.generation.map(|g| g.to_string()).unwrap_or_else(|| "-".into());
                            println!("{:<16}  {:<32}  {:<4}  {}", e.kind, key, generation, e.metadata.uid.unwrap_or_default());
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&entities)?),
                }
            }
            EntityCmd::Get { entity } => {
                let r = EntityRef::parse(&entity).ok_or_else(|| anyhow!("invalid entity reference {:?}", entity))?;
                let found = store.entity_by_ref(&r).context("reading entity")?.ok_or_else(|| anyhow!("entity not found: {}", r))?;
                match cli.output {
                    Output::Human => print!("{}", serde_yaml::to_string(&found)?),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&found)?),
                }
            }
        },
        Commands::Log { location_id, limit } => {
            let events = store.location_update_log(&location_id, limit).context("reading update log")?;
            match cli.output {
                Output::Human => {
                    for ev in events {
                        println!(
                            "{}  {:<7}  {:<24}  {}",
                            ev.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
                            ev.status,
                            ev.component_name.as_deref().unwrap_or("-"),
                            ev.message.as_deref().unwrap_or(""),
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&events)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cairn_env_reads_prefixed_and_skips_blank() {
        std::env::set_var("CAIRN_CLI_TEST_SET", "127.0.0.1:9000");
        std::env::set_var("CAIRN_CLI_TEST_BLANK", "  ");
        assert_eq!(cairn_env("CLI_TEST_SET").as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(cairn_env("CLI_TEST_BLANK"), None);
        assert_eq!(cairn_env("CLI_TEST_UNSET"), None);
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cairnctl", "entity", "get", "prod/api", "-o", "json", "--db", "/tmp/x.db"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.db.as_deref(), Some("/tmp/x.db"));
        assert!(matches!(cli.command, Commands::Entity { command: EntityCmd::Get { ref entity } } if entity == "prod/api"));
    }
}
