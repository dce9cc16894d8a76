//! Operator CLI for Stockroom.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stockroom_core::config::AppConfig;
use stockroom_core::inventory::split_listing;
use stockroom_core::{BackupType, Inventory};
use stockroom_metadata::models::{DatastoreRow, HostRow};
use stockroom_metadata::{InventoryStore, ReconcileOptions, ReconcileStats, ScanReport};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "stockroom")]
#[command(about = "Inventory of backup datastores")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(
        long,
        env = "STOCKROOM_CONFIG",
        default_value = "stockroom.toml",
        global = true
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the inventory schema if it does not exist
    Migrate,
    /// Reconcile a captured discovery into the inventory
    Scan(ScanArgs),
    /// Show inventory contents
    List {
        #[command(subcommand)]
        command: ListCommands,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// NUL-delimited chunk listing (`<path>` or `<size> <path>` entries)
    #[arg(long)]
    chunk_list: Option<PathBuf>,
    /// NUL-delimited listing of index file paths
    #[arg(long)]
    index_list: PathBuf,
    /// Local copy of the host's index files, laid out under their remote paths
    #[arg(long)]
    mirror: Option<PathBuf>,
    /// Scan time as RFC 3339 (defaults to now)
    #[arg(long)]
    as_of: Option<String>,
    /// Print the scan report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args)]
struct ListArgs {
    /// Host name (defaults to scan.host)
    #[arg(long)]
    host: Option<String>,
    /// Include soft-deleted entries
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Subcommand)]
enum ListCommands {
    /// Hosts seen by any scan
    Hosts,
    /// Datastores of a host
    Datastores {
        #[command(flatten)]
        list: ListArgs,
    },
    /// Backup groups of a datastore
    Groups {
        /// Datastore name or mountpoint
        datastore: String,
        #[command(flatten)]
        list: ListArgs,
    },
    /// Snapshots of one backup group
    Snapshots {
        /// Datastore name or mountpoint
        datastore: String,
        /// Group as `<type>/<id>`, e.g. `vm/100`
        group: String,
        /// Namespace path, e.g. `prod/web`
        #[arg(long)]
        namespace: Option<String>,
        #[command(flatten)]
        list: ListArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&config)?;
    let store = stockroom_metadata::from_config(&config.metadata)
        .await
        .context("failed to open inventory store")?;

    match command {
        Commands::Migrate => {
            store.migrate().await.context("migration failed")?;
            println!("Schema is up to date.");
            Ok(())
        }
        Commands::Scan(args) => handle_scan_command(&config, store, args).await,
        Commands::List { command } => handle_list_command(&config, store, command).await,
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("STOCKROOM_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

fn parse_as_of(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(value) => OffsetDateTime::parse(value, &Rfc3339)
            .with_context(|| format!("--as-of is not an RFC 3339 timestamp: {value}")),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

/// Read the mirrored bytes of every listed index file that has a local copy.
async fn read_mirror(listing: &[u8], mirror: &Path) -> Result<HashMap<String, Vec<u8>>> {
    let mut contents = HashMap::new();
    for path in split_listing(listing)? {
        let local = mirror.join(path.trim_start_matches('/'));
        match tokio::fs::read(&local).await {
            Ok(bytes) => {
                contents.insert(path.to_string(), bytes);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path, "index file not mirrored");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", local.display()));
            }
        }
    }
    Ok(contents)
}

async fn build_inventory(config: &AppConfig, args: &ScanArgs) -> Result<Inventory> {
    let datastores = config.scan.datastore_records();
    if datastores.is_empty() {
        anyhow::bail!("no datastores configured; set [[scan.datastores]] in the config file");
    }

    let mut builder = Inventory::builder(datastores);
    if let Some(path) = &args.chunk_list {
        let listing = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read chunk listing {}", path.display()))?;
        builder
            .add_chunk_listing(&listing)
            .context("invalid chunk listing")?;
    }

    let listing = tokio::fs::read(&args.index_list)
        .await
        .with_context(|| format!("failed to read index listing {}", args.index_list.display()))?;
    let contents = match &args.mirror {
        Some(mirror) => read_mirror(&listing, mirror).await?,
        None => HashMap::new(),
    };
    builder
        .add_index_listing(&listing, |path| contents.get(path).map(Vec::as_slice))
        .context("invalid index listing")?;
    Ok(builder.build())
}

async fn handle_scan_command(
    config: &AppConfig,
    store: Arc<dyn InventoryStore>,
    args: ScanArgs,
) -> Result<()> {
    let as_of = parse_as_of(args.as_of.as_deref())?;
    let inventory = build_inventory(config, &args).await?;
    let options = ReconcileOptions {
        batch_size: config.scan.insert_batch_size,
        ..ReconcileOptions::default()
    };

    let report = store
        .apply_scan(&config.scan.host, &inventory, as_of, &options)
        .await
        .context("scan failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render_report(&report);
    }
    Ok(())
}

fn render_report(report: &ScanReport) {
    let as_of = report.as_of.map(format_time).unwrap_or_default();
    println!("Scan of {} as of {}", report.host, as_of);
    println!(
        "{:<16} {:>9} {:>9} {:>9} {:>10} {:>9}",
        "Level", "Inserted", "Updated", "Revived", "Unchanged", "Swept"
    );
    println!("{}", "-".repeat(67));
    let rows: [(&str, &ReconcileStats); 7] = [
        ("datastores", &report.datastores),
        ("namespaces", &report.namespaces),
        ("groups", &report.groups),
        ("snapshots", &report.snapshots),
        ("file archives", &report.file_archives),
        ("image archives", &report.image_archives),
        ("chunks", &report.chunks),
    ];
    for (level, stats) in rows {
        println!(
            "{:<16} {:>9} {:>9} {:>9} {:>10} {:>9}",
            level, stats.inserted, stats.updated, stats.revived, stats.unchanged, stats.swept
        );
    }
    println!();
    println!("  Rewired namespaces: {}", report.rewired_namespaces);
    println!("  Linked archives: {}", report.linked_archives);
    println!("  Archive chunk links: {}", report.archive_chunk_links);
    if report.missing_chunks > 0 {
        println!("  Missing chunks: {}", report.missing_chunks);
    }
}

async fn handle_list_command(
    config: &AppConfig,
    store: Arc<dyn InventoryStore>,
    command: ListCommands,
) -> Result<()> {
    match command {
        ListCommands::Hosts => {
            let hosts = store.list_hosts().await?;
            if hosts.is_empty() {
                println!("No hosts found.");
            } else {
                println!("{:<30} {:<8} First seen", "Name", "ID");
                println!("{}", "-".repeat(60));
                for host in hosts {
                    println!(
                        "{:<30} {:<8} {}",
                        host.name,
                        host.id,
                        format_time(host.created_at)
                    );
                }
            }
        }
        ListCommands::Datastores { list } => {
            let host = resolve_host(config, store.as_ref(), list.host.as_deref()).await?;
            let datastores = store.list_datastores(host.id, list.all).await?;
            if datastores.is_empty() {
                println!("No datastores found.");
            } else {
                println!("{:<20} {:<32} {:<22} Deleted", "Name", "Mountpoint", "Last seen");
                println!("{}", "-".repeat(90));
                for ds in datastores {
                    println!(
                        "{:<20} {:<32} {:<22} {}",
                        ds.name,
                        ds.mountpoint,
                        format_time(ds.meta.updated_at),
                        ds.meta.deleted_at.map(format_time).unwrap_or_default()
                    );
                }
            }
        }
        ListCommands::Groups { datastore, list } => {
            let host = resolve_host(config, store.as_ref(), list.host.as_deref()).await?;
            let ds = resolve_datastore(store.as_ref(), &host, &datastore).await?;
            let ds_id = ds.id.context("datastore row has no id")?;
            let namespaces: HashMap<i64, String> = store
                .list_namespaces(ds_id, true)
                .await?
                .into_iter()
                .filter_map(|ns| ns.id.map(|id| (id, ns.path)))
                .collect();
            let groups = store.list_groups(ds_id, list.all).await?;
            if groups.is_empty() {
                println!("No groups found.");
            } else {
                println!(
                    "{:<24} {:<6} {:<16} {:<22} Version",
                    "Namespace", "Type", "ID", "Last seen"
                );
                println!("{}", "-".repeat(80));
                for group in groups {
                    let namespace = group
                        .namespace_id
                        .and_then(|id| namespaces.get(&id))
                        .map(String::as_str)
                        .unwrap_or("/");
                    println!(
                        "{:<24} {:<6} {:<16} {:<22} {}",
                        namespace,
                        group.backup_type,
                        group.backup_id,
                        format_time(group.meta.updated_at),
                        group.meta.version
                    );
                }
            }
        }
        ListCommands::Snapshots {
            datastore,
            group,
            namespace,
            list,
        } => {
            let (backup_type, backup_id) = parse_group_selector(&group)?;
            let host = resolve_host(config, store.as_ref(), list.host.as_deref()).await?;
            let ds = resolve_datastore(store.as_ref(), &host, &datastore).await?;
            let ds_id = ds.id.context("datastore row has no id")?;

            let namespace_id = match &namespace {
                None => None,
                Some(path) => Some(
                    store
                        .list_namespaces(ds_id, false)
                        .await?
                        .into_iter()
                        .find(|ns| &ns.path == path)
                        .and_then(|ns| ns.id)
                        .with_context(|| format!("namespace not found: {path}"))?,
                ),
            };
            let group_id = store
                .list_groups(ds_id, false)
                .await?
                .into_iter()
                .find(|g| {
                    g.namespace_id == namespace_id
                        && g.backup_type == backup_type.as_str()
                        && g.backup_id == backup_id
                })
                .and_then(|g| g.id)
                .with_context(|| format!("group not found: {group}"))?;

            let snapshots = store.list_snapshots(group_id, list.all).await?;
            if snapshots.is_empty() {
                println!("No snapshots found.");
            } else {
                println!("{:<22} {:<10} {:<22} Deleted", "Backup time", "Archives", "Last seen");
                println!("{}", "-".repeat(70));
                for snapshot in snapshots {
                    let archives = match snapshot.id {
                        Some(id) => store.list_archives(id, false).await?.len(),
                        None => 0,
                    };
                    println!(
                        "{:<22} {:<10} {:<22} {}",
                        format_time(snapshot.backup_time),
                        archives,
                        format_time(snapshot.meta.updated_at),
                        snapshot.meta.deleted_at.map(format_time).unwrap_or_default()
                    );
                }
            }
        }
    }
    Ok(())
}

async fn resolve_host(
    config: &AppConfig,
    store: &dyn InventoryStore,
    name: Option<&str>,
) -> Result<HostRow> {
    let name = name.unwrap_or(&config.scan.host);
    store
        .get_host(name)
        .await?
        .with_context(|| format!("host not found: {name}"))
}

async fn resolve_datastore(
    store: &dyn InventoryStore,
    host: &HostRow,
    selector: &str,
) -> Result<DatastoreRow> {
    let selector = selector.trim_end_matches('/');
    store
        .list_datastores(host.id, false)
        .await?
        .into_iter()
        .find(|ds| ds.name == selector || ds.mountpoint == selector)
        .with_context(|| format!("datastore not found on {}: {selector}", host.name))
}

fn parse_group_selector(selector: &str) -> Result<(BackupType, String)> {
    let (backup_type, backup_id) = selector
        .split_once('/')
        .with_context(|| format!("group must be <type>/<id>, got {selector}"))?;
    if backup_id.is_empty() || backup_id.contains('/') {
        anyhow::bail!("group must be <type>/<id>, got {selector}");
    }
    Ok((backup_type.parse()?, backup_id.to_string()))
}

fn format_time(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.to_string())
}
