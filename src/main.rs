use chordal::{
    balancer::{rebalance, BalancerKind},
    chord::{
        hash::{generate_keys, hash_key, HashFunction},
        routing::LookupStrategy,
        simulation::{Arrivals, Simulation},
        types::{Digest, VirtualNodeSpec},
        workers::FingerSelection,
    },
    error::{ChordError, ChordalError, MessageError, NetworkError},
    logging::{init_logging, DEFAULT_LOG_FILE},
    network::{client::Client, node::ChordPeer, PeerConfig},
    verify::parse_log,
};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(name = "chordal")]
#[command(about = "A Chord DHT with virtual nodes")]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: LevelFilter,

    /// Also write logs to this file
    #[arg(long = "log-file", global = true, num_args = 0..=1, default_missing_value = DEFAULT_LOG_FILE)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct NodeArgs {
    /// Node name; its hash is the node's ring position
    #[arg(short = 'n', long = "name")]
    name: String,
    /// Explicit ring position instead of the name hash
    #[arg(long = "digest")]
    digest: Option<Digest>,
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,
    /// Port for peer traffic (0 picks one)
    #[arg(short = 'i', long = "internal-port", default_value_t = 0)]
    internal_port: u16,
    /// Port for client traffic (0 picks one)
    #[arg(short = 'e', long = "external-port", default_value_t = 0)]
    external_port: u16,
    #[arg(long = "stabilize-interval-ms", default_value_t = 15_000)]
    stabilize_interval_ms: u64,
    #[arg(long = "fix-fingers-interval-ms", default_value_t = 10_000)]
    fix_fingers_interval_ms: u64,
    /// Extra ring identity as name:digest (repeatable)
    #[arg(short = 'v', long = "virtual-node")]
    virtual_nodes: Vec<VirtualNodeSpec>,
    #[arg(long = "strategy", value_enum, default_value_t = LookupStrategy::Finger)]
    strategy: LookupStrategy,
    #[arg(long = "finger-selection", value_enum, default_value_t = FingerSelection::RoundRobin)]
    finger_selection: FingerSelection,
    #[arg(long = "hash", value_enum, default_value_t = HashFunction::Md5)]
    hash: HashFunction,
}

impl NodeArgs {
    fn config(&self) -> PeerConfig {
        let mut config = PeerConfig::new(self.name.clone());
        config.digest = self.digest;
        config.host = self.host.clone();
        config.internal_port = self.internal_port;
        config.external_port = self.external_port;
        config.stabilize_interval = Duration::from_millis(self.stabilize_interval_ms);
        config.fix_fingers_interval = Duration::from_millis(self.fix_fingers_interval_ms);
        config.virtual_nodes = self.virtual_nodes.clone();
        config.strategy = self.strategy;
        config.finger_selection = self.finger_selection;
        config.hash = self.hash;
        config
    }
}

/// Names a remote node by name or by digest
#[derive(Args, Clone)]
struct TargetArgs {
    /// Node address (host:port)
    #[arg(short = 'a', long = "address")]
    address: String,
    #[arg(long = "node-name", conflicts_with = "node_digest")]
    node_name: Option<String>,
    #[arg(long = "node-digest")]
    node_digest: Option<Digest>,
}

impl TargetArgs {
    fn digest(&self, hash: HashFunction) -> Result<Digest, ChordError> {
        match (&self.node_name, self.node_digest) {
            (_, Some(digest)) => Ok(digest),
            (Some(name), None) => Ok(hash_key(name, hash)),
            (None, None) => Err(ChordError::InvalidRequest(
                "either --node-name or --node-digest is required".to_string(),
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum SimAction {
    /// Average hops to find each key
    Hops,
    /// List the nodes of the ring
    Network,
    /// Print finger tables
    Fingers,
    /// Add nodes and print the tables they changed
    Join,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum FingerTables {
    All,
    /// First and last node only
    Sample,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(default_value_t = 50)]
    num_nodes: usize,
    #[arg(default_value_t = 100)]
    num_keys: usize,
    #[arg(short = 'k', long = "key-prefix", default_value = "data")]
    key_prefix: String,
    #[arg(short = 'n', long = "node-prefix", default_value = "node")]
    node_prefix: String,
    #[arg(short = 'a', long = "action", value_enum, value_delimiter = ',', num_args = 1.., default_value = "hops")]
    actions: Vec<SimAction>,
    /// Routing to simulate; hops compares both when omitted
    #[arg(long = "strategy", value_enum)]
    strategy: Option<LookupStrategy>,
    #[arg(short = 'f', long = "finger-tables", value_enum, default_value_t = FingerTables::Sample)]
    finger_tables: FingerTables,
    /// Nodes to add for the join action
    #[arg(short = 'j', long = "joining", default_value_t = 1)]
    joining: usize,
    /// Print compact JSON
    #[arg(long = "no-formatting")]
    no_formatting: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the first node of a new network
    Create {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Join an existing network through a known node
    Join {
        #[command(flatten)]
        node: NodeArgs,
        // internal address and identity of a node already in the ring
        #[command(flatten)]
        known: TargetArgs,
        /// Join attempts before giving up
        #[arg(long = "retries", default_value_t = 3)]
        retries: u32,
        #[arg(long = "join-timeout-ms", default_value_t = 5_000)]
        join_timeout_ms: u64,
    },
    /// Ask a running node to exit
    Shutdown {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long = "hash", value_enum, default_value_t = HashFunction::Md5)]
        hash: HashFunction,
    },
    /// Find the node that owns a key
    Lookup {
        #[command(flatten)]
        target: TargetArgs,
        /// Key to look up
        #[arg(short = 'k', long = "key", conflicts_with = "digest")]
        key: Option<String>,
        /// Ring position to look up
        #[arg(long = "digest")]
        digest: Option<Digest>,
        /// Physical node hosting the target when it is a virtual node
        #[arg(long = "owner-digest")]
        owner_digest: Option<Digest>,
        /// Address the reply listener binds to; must be reachable from the ring
        #[arg(long = "reply-host", default_value = "127.0.0.1")]
        reply_host: String,
        #[arg(long = "timeout-ms", default_value_t = 5_000)]
        timeout_ms: u64,
        #[arg(long = "hash", value_enum, default_value_t = HashFunction::Md5)]
        hash: HashFunction,
    },
    /// Show how keys move when servers are added to a consistent-hash ring
    Balance {
        num_servers: usize,
        num_keys: usize,
        #[arg(short = 'a', long = "additional", default_value_t = 1)]
        additional: usize,
        #[arg(long = "kind", value_enum, default_value_t = BalancerKind::Consistent)]
        kind: BalancerKind,
        /// Print compact JSON
        #[arg(long = "no-formatting")]
        no_formatting: bool,
    },
    /// Experiment with an in-memory ring
    Simulate {
        #[command(flatten)]
        args: SimulateArgs,
    },
    /// Check finger tables and load from node logs
    Verify {
        /// Log written with --log-file by the nodes
        #[arg(value_name = "LOG")]
        path: PathBuf,
        #[arg(short = 'f', long = "finger-errors")]
        finger_errors: bool,
        #[arg(short = 'l', long = "load-statistics")]
        load_statistics: bool,
        /// List every wrong finger and per-node load
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
}

fn to_json<T: Serialize>(value: &T, compact: bool) -> Result<String, ChordalError> {
    let json = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    json.map_err(|e| MessageError::SerializationFailed(e.to_string()).into())
}

async fn run_join(
    node: NodeArgs,
    known: TargetArgs,
    retries: u32,
    join_timeout: Duration,
) -> Result<(), ChordalError> {
    let known_digest = known.digest(node.hash)?;
    let mut config = node.config();
    config.join_timeout = join_timeout;

    for attempt in 1..=retries.max(1) {
        let mut peer = ChordPeer::new(config.clone()).await?;

        match peer.join(&known.address, known_digest).await {
            Ok(()) => {
                info!("Successfully joined the network as {}", peer.routing_info());
                peer.run().await?;
                info!("Node shut down gracefully");
                return Ok(());
            }
            Err(NetworkError::Chord(ChordError::Collision(digest))) if config.digest.is_none() => {
                peer.close().await;
                config.name = format!("{}_{}", node.name, attempt);
                warn!(
                    "Digest {} is taken (attempt {}/{}), retrying as {}",
                    digest, attempt, retries, config.name
                );
            }
            Err(e) => {
                peer.close().await;
                warn!("Join attempt {}/{} failed: {}", attempt, retries, e);
            }
        }
    }

    error!("Failed to join network after {} attempts", retries);
    Err(ChordError::JoinFailed(format!("gave up after {} attempts", retries)).into())
}

fn run_simulation(args: SimulateArgs) -> Result<(), ChordalError> {
    let keys = generate_keys(args.num_keys, &args.key_prefix);
    let compact = args.no_formatting;

    if args.actions.contains(&SimAction::Hops) {
        let strategies = match args.strategy {
            Some(strategy) => vec![strategy],
            None => vec![LookupStrategy::Naive, LookupStrategy::Finger],
        };
        for strategy in strategies {
            let sim = Simulation::build(args.num_nodes, strategy, &args.node_prefix);
            let hops = sim.average_hops(&keys)?;
            println!("Average hops with {} {:?} nodes is {:.2}", sim.len(), strategy, hops);
        }
    }

    let mut sim = Simulation::build(
        args.num_nodes,
        args.strategy.unwrap_or_default(),
        &args.node_prefix,
    );

    if args.actions.contains(&SimAction::Network) {
        println!("Nodes in the network: ");
        println!("{}", to_json(&serde_json::json!({ "network": sim.node_table() }), compact)?);
    }

    if args.actions.contains(&SimAction::Fingers) {
        let digests = sim.digests();
        let mut shown: Vec<Digest> = match args.finger_tables {
            FingerTables::All => digests,
            FingerTables::Sample => digests.first().into_iter().chain(digests.last()).copied().collect(),
        };
        shown.dedup();
        for digest in shown {
            let table = sim.finger_table(digest)?;
            println!("Finger table for node \"{}\": ", table.name);
            println!("{}", to_json(&table, compact)?);
        }
    }

    if args.actions.contains(&SimAction::Join) {
        let original: Vec<u32> = sim.digests().iter().map(Digest::value).collect();
        println!("Original node ids: {:?}", original);
        let Arrivals { added, updated } = sim.add_nodes(args.joining, "node_added")?;

        println!("\nFinger table(s) for new nodes:");
        for digest in added {
            println!("{}", to_json(&sim.finger_table_links(digest)?, compact)?);
        }
        println!("\nFinger table(s) for key updated nodes:");
        for digest in updated {
            println!("{}", to_json(&sim.finger_table_links(digest)?, compact)?);
        }
    }
    Ok(())
}

fn run_verify(path: &Path, finger_errors: bool, load_statistics: bool, verbose: bool) -> Result<(), ChordalError> {
    let report = parse_log(BufReader::new(File::open(path)?))?;
    if report.is_empty() {
        return Err(MessageError::InvalidFormat(format!("no node state found in {}", path.display())).into());
    }
    println!("{} virtual nodes, {} identities", report.nodes.len(), report.owners.len());

    // fingers are the default check
    if finger_errors || !load_statistics {
        let errors = report.finger_errors();
        if verbose {
            for e in &errors {
                let actual = e.actual.map_or("none".to_string(), |d| d.to_string());
                println!("node {} finger {}: {} (expected {})", e.node, e.index, actual, e.expected);
            }
        }
        println!("{} finger errors", errors.len());
    }

    if load_statistics {
        if verbose {
            for (owner, load) in report.load_by_owner() {
                println!("node {}: {}", owner, load);
            }
        }
        match report.load_statistics() {
            Some(stats) => println!("load mean {:.2}, std dev {:.2}", stats.mean, stats.std_dev),
            None => println!("load statistics need at least two physical nodes"),
        }
    }
    Ok(())
}

async fn run(command: Commands) -> Result<(), ChordalError> {
    match command {
        Commands::Create { node } => {
            let mut peer = ChordPeer::new(node.config()).await?;
            peer.create();
            info!(
                "Other nodes can join using: chordal join -n <NAME> -a {} --node-digest {}",
                peer.internal_addr(),
                peer.routing_info().digest
            );
            peer.run().await?;
            info!("Node shut down gracefully");
            Ok(())
        }
        Commands::Join {
            node,
            known,
            retries,
            join_timeout_ms,
        } => run_join(node, known, retries, Duration::from_millis(join_timeout_ms)).await,
        Commands::Shutdown { target, hash } => {
            let digest = target.digest(hash)?;
            Client::new(Duration::from_secs(5))
                .shutdown(&target.address, digest)
                .await?;
            Ok(())
        }
        Commands::Lookup {
            target,
            key,
            digest,
            owner_digest,
            reply_host,
            timeout_ms,
            hash,
        } => {
            let node = target.digest(hash)?;
            let search = match (key, digest) {
                (_, Some(digest)) => digest,
                (Some(key), None) => hash_key(&key, hash),
                (None, None) => {
                    return Err(ChordError::InvalidRequest("either --key or --digest is required".to_string()).into())
                }
            };

            let result = Client::new(Duration::from_millis(timeout_ms))
                .with_host(reply_host)
                .lookup(&target.address, owner_digest.unwrap_or(node), node, search)
                .await?;
            println!(
                "{} is owned by {} ({} hops, {:.3} ms)",
                search,
                result.owner,
                result.hops,
                result.elapsed.as_secs_f64() * 1000.0
            );
            Ok(())
        }
        Commands::Balance {
            num_servers,
            num_keys,
            additional,
            kind,
            no_formatting,
        } => {
            let keys = generate_keys(num_keys, "cached_data");
            let result = rebalance(kind, num_servers, &keys, additional, HashFunction::Md5)?;
            println!("{}", to_json(&result, no_formatting)?);
            println!("{} of {} keys moved", result.moved.len(), keys.len());
            Ok(())
        }
        Commands::Simulate { args } => run_simulation(args),
        Commands::Verify {
            path,
            finger_errors,
            load_statistics,
            verbose,
        } => run_verify(&path, finger_errors, load_statistics, verbose),
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.log_file.as_deref())
        .map_err(|e| format!("Failed to initialise logging: {}", e))?;
    run(cli.command).await.map_err(|e| e.to_string())
}
