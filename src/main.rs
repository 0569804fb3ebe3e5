use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ursa_lite::config::{
    CoordinatorConfig, NodeConfig, ProcessorConfig, RegionConfig, RetryConfig, SchedulerConfig,
    StoreConfig,
};
use ursa_lite::node::Node;
use ursa_lite::region::ReadRoutingPolicy;
use ursa_lite::scheduler::{AffinityPolicy, ClusterCapacity, WorksetRequirements};
use ursa_lite::shutdown::install_shutdown_handler;
use ursa_lite::store::{
    AffinityReason, InMemoryStateStore, NewWorkset, Priority, StateStore, Workset, WorksetState,
};

#[derive(Parser, Debug)]
#[command(name = "ursa-lite")]
#[command(version)]
#[command(about = "Workset coordinator for shared genomics compute clusters")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a coordinator process
    Server(ServerArgs),

    /// Inspect or register worksets in a state file (server must be stopped)
    Workset {
        /// Path to the JSON state file
        #[arg(long)]
        state_file: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: WorksetCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Number of polling workers in this process
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Maximum worksets in flight across all workers
    #[arg(long, default_value = "4")]
    max_concurrent: usize,

    #[arg(long, default_value = "5000")]
    poll_interval_ms: u64,

    /// Random delay added to each idle poll
    #[arg(long, default_value = "500")]
    poll_jitter_ms: u64,

    #[arg(long, default_value = "3600")]
    lock_ttl_secs: u64,

    /// How long in-flight worksets may finish after SIGTERM
    #[arg(long, default_value = "30000")]
    shutdown_grace_ms: u64,

    #[arg(long, default_value = "2")]
    retry_base_secs: u64,

    #[arg(long, default_value = "3600")]
    retry_max_secs: u64,

    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Clusters (comma-separated, format: "name:az:vcpus:memory_gb:slots:cost[:latency_ms]")
    /// Example: "c1:us-east-1a:256:1024:4:0.048,c2:us-east-1b:128:512:2:0.052"
    #[arg(long, default_value = "")]
    clusters: String,

    /// Only place worksets on their affine cluster
    #[arg(long)]
    strict_affinity: bool,

    /// Regions (comma-separated). Enables multi-region routing.
    #[arg(long, default_value = "")]
    regions: String,

    /// Primary region; defaults to the first in --regions
    #[arg(long)]
    primary_region: Option<String>,

    /// Preferred region for reads
    #[arg(long)]
    read_region: Option<String>,

    #[arg(long, default_value = "10000")]
    health_interval_ms: u64,

    #[arg(long, default_value = "60000")]
    failover_grace_ms: u64,

    /// Shell command run per workset. Placeholders, substituted as quoted
    /// words: {workset_id}, {storage_location}, {cluster}
    #[arg(long)]
    provisioner_command: String,

    /// Persist state to this JSON file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Register new worksets directly as READY
    #[arg(long)]
    register_as_ready: bool,

    /// Port for the monitoring dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Workset Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WorksetCommands {
    /// Register a new workset
    Register {
        workset_id: String,

        /// Where pipeline inputs and outputs live
        storage_location: String,

        #[arg(long, default_value = "normal")]
        priority: String,

        #[arg(long)]
        customer: Option<String>,

        /// Preferred cluster (data locality)
        #[arg(long)]
        affinity: Option<String>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        vcpus: Option<u32>,

        #[arg(long)]
        memory_gb: Option<u32>,

        /// Register directly as READY
        #[arg(long)]
        ready: bool,
    },
    /// Show one workset with its history
    Show { workset_id: String },
    /// List worksets in a state
    List {
        #[arg(long, default_value = "READY")]
        state: String,

        #[arg(long)]
        priority: Option<String>,

        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

/// Parse cluster specs from a comma-separated string.
/// Format: "name:az:vcpus:memory_gb:slots:cost[:latency_ms]"
fn parse_clusters(clusters_str: &str) -> Vec<ClusterCapacity> {
    if clusters_str.is_empty() {
        return Vec::new();
    }

    clusters_str
        .split(',')
        .filter_map(|spec| {
            let parts: Vec<&str> = spec.trim().split(':').collect();
            if parts.len() != 6 && parts.len() != 7 {
                tracing::warn!(
                    cluster = spec,
                    "Invalid cluster format, expected name:az:vcpus:memory_gb:slots:cost[:latency_ms]"
                );
                return None;
            }
            let vcpus: u32 = parts[2].parse().ok()?;
            let memory_gb: u32 = parts[3].parse().ok()?;
            let slots: u32 = parts[4].parse().ok()?;
            let cost: f64 = parts[5].parse().ok()?;
            let mut cluster = ClusterCapacity::new(parts[0], parts[1], vcpus, memory_gb, slots, cost);
            if let Some(latency) = parts.get(6) {
                cluster = cluster.with_latency_ms(latency.parse().ok()?);
            }
            Some(cluster)
        })
        .collect()
}

/// Parse region ids from a comma-separated string, marking the primary.
fn parse_regions(regions_str: &str, primary: Option<&str>) -> Vec<RegionConfig> {
    let ids: Vec<&str> = regions_str
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect();
    let primary = primary.or(ids.first().copied());
    ids.into_iter()
        .map(|id| RegionConfig::new(id, Some(id) == primary))
        .collect()
}

fn build_node_config(args: ServerArgs) -> NodeConfig {
    let processor = ProcessorConfig {
        worker_count: args.workers,
        max_concurrent_worksets: args.max_concurrent,
        poll_interval_ms: args.poll_interval_ms,
        poll_jitter_ms: args.poll_jitter_ms,
        lock_ttl_seconds: args.lock_ttl_secs,
        shutdown_grace_ms: args.shutdown_grace_ms,
        ..ProcessorConfig::default()
    };
    let retry = RetryConfig {
        backoff_base_secs: args.retry_base_secs,
        backoff_max_secs: args.retry_max_secs,
        default_max_retries: args.max_retries,
    };
    let store = StoreConfig {
        register_as_ready: args.register_as_ready,
        state_file: args.state_file,
    };
    let scheduler = SchedulerConfig {
        affinity_policy: if args.strict_affinity {
            AffinityPolicy::Strict
        } else {
            AffinityPolicy::Advisory
        },
    };

    let regions = parse_regions(&args.regions, args.primary_region.as_deref());
    let coordinator = (!regions.is_empty()).then(|| CoordinatorConfig {
        regions,
        health_check_interval_ms: args.health_interval_ms,
        failover_grace_ms: args.failover_grace_ms,
        read_policy: ReadRoutingPolicy {
            preferred: args.read_region.clone(),
            ..ReadRoutingPolicy::default()
        },
        ..CoordinatorConfig::default()
    });

    NodeConfig {
        processor,
        retry,
        store,
        scheduler,
        coordinator,
        clusters: parse_clusters(&args.clusters),
        provisioner_command: Some(args.provisioner_command),
        dashboard_addr: args
            .dashboard_port
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port))),
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_node_config(args);

    tracing::info!(
        workers = config.processor.worker_count,
        max_concurrent = config.processor.max_concurrent_worksets,
        clusters = config.clusters.len(),
        state_file = ?config.store.state_file,
        dashboard = ?config.dashboard_addr,
        "Starting ursa-lite"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::from_config(config).await?;
    node.run(shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Workset Command Handlers
// =============================================================================

fn print_workset(ws: &Workset, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(ws)?),
        OutputFormat::Table => {
            println!("Workset:      {}", ws.workset_id);
            println!("State:        {}", ws.state);
            println!("Priority:     {}", ws.priority);
            println!("Location:     {}", ws.storage_location);
            if let Some(customer) = &ws.customer_id {
                println!("Customer:     {}", customer);
            }
            if let Some(cluster) = &ws.cluster_affinity {
                println!("Affinity:     {}", cluster);
            }
            println!("Retries:      {}/{}", ws.retry_count, ws.max_retries);
            if let Some(owner) = &ws.lock_owner {
                println!("Locked by:    {}", owner);
            }
            if let Some(error) = &ws.error_details {
                println!(
                    "Last error:   [{}] {}",
                    ws.error_category.map(|c| c.to_string()).unwrap_or_default(),
                    error
                );
            }
            println!();
            println!("{:<32} {:<14} {:<14} {:<20} REASON", "TIME", "FROM", "TO", "ACTOR");
            for t in &ws.state_history {
                println!(
                    "{:<32} {:<14} {:<14} {:<20} {}",
                    t.timestamp.to_rfc3339(),
                    t.from_state.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    t.to_state.to_string(),
                    t.actor,
                    t.reason
                );
            }
        }
    }
    Ok(())
}

async fn handle_workset(
    state_file: PathBuf,
    output: OutputFormat,
    command: WorksetCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let ready = matches!(command, WorksetCommands::Register { ready: true, .. });
    let store = InMemoryStateStore::open(
        StoreConfig {
            register_as_ready: ready,
            state_file: Some(state_file),
        },
        &RetryConfig::default(),
    )
    .await?;

    match command {
        WorksetCommands::Register {
            workset_id,
            storage_location,
            priority,
            customer,
            affinity,
            max_retries,
            vcpus,
            memory_gb,
            ready: _,
        } => {
            let priority: Priority = priority.parse()?;
            let mut new = NewWorkset::new(workset_id, storage_location, priority);
            if let Some(customer) = customer {
                new = new.with_customer(customer);
            }
            if let Some(cluster) = affinity {
                new = new.with_affinity(cluster, AffinityReason::Manual);
            }
            if let Some(max_retries) = max_retries {
                new = new.with_max_retries(max_retries);
            }
            if vcpus.is_some() || memory_gb.is_some() {
                let default = WorksetRequirements::default();
                new = new.with_requirements(WorksetRequirements::new(
                    vcpus.unwrap_or(default.vcpus),
                    memory_gb.unwrap_or(default.memory_gb),
                ));
            }
            let ws = store.register(new).await?;
            print_workset(&ws, &output)?;
        }
        WorksetCommands::Show { workset_id } => {
            let ws = store.get(&workset_id).await?;
            print_workset(&ws, &output)?;
        }
        WorksetCommands::List {
            state,
            priority,
            limit,
        } => {
            let state: WorksetState = state.parse()?;
            let priority = priority.as_deref().map(str::parse::<Priority>).transpose()?;
            let page = store.list_by_state(state, priority, limit, None).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&page)?),
                OutputFormat::Table => {
                    println!(
                        "{:<24} {:<12} {:<8} {:<8} {:<32}",
                        "WORKSET", "STATE", "PRIORITY", "RETRIES", "CREATED"
                    );
                    for ws in &page.items {
                        println!(
                            "{:<24} {:<12} {:<8} {:<8} {:<32}",
                            ws.workset_id,
                            ws.state.to_string(),
                            ws.priority.to_string(),
                            format!("{}/{}", ws.retry_count, ws.max_retries),
                            ws.created_at.to_rfc3339()
                        );
                    }
                    if page.next_cursor.is_some() {
                        println!("... more results, raise --limit");
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Workset {
            state_file,
            output,
            command,
        } => {
            handle_workset(state_file, output, command).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_clusters_skips_invalid_entries() {
        let clusters = parse_clusters("c1:az-a:64:256:4:0.05,bad:entry,c2:az-b:32:128:2:0.04:12");
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].cluster_name, "c1");
        assert_eq!(clusters[0].max_concurrent_worksets, 4);
        assert_eq!(clusters[1].latency_ms, 12);
        assert!(parse_clusters("").is_empty());
    }

    #[test]
    fn parse_regions_marks_primary() {
        let regions = parse_regions("us-east-1, us-west-2", None);
        assert_eq!(regions.len(), 2);
        assert!(regions[0].is_primary);
        assert!(!regions[1].is_primary);

        let regions = parse_regions("us-east-1,us-west-2", Some("us-west-2"));
        assert!(!regions[0].is_primary);
        assert!(regions[1].is_primary);

        assert!(parse_regions("", None).is_empty());
    }
}
