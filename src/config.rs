//! The single configuration surface for a node: one sub-struct per
//! concern, each with a `Default` impl and a `validate()`, loaded from (and
//! writable back to) one TOML file.

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The config file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The config file could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// The config could not be serialized back out.
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// The root configuration for a `meridian` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's bind address for the peer API.
    pub peer_addr: SocketAddr,
    /// This node's bind address for the client-facing request API.
    pub request_addr: SocketAddr,
    /// Content-addressed store configuration.
    pub cas: CasConfig,
    /// Replicated log configuration.
    pub raft: RaftConfig,
    /// Peer membership (gossip) configuration.
    pub membership: MembershipConfig,
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
    /// Chaos harness configuration.
    pub chaos: ChaosConfig,
    /// Chunk transfer configuration.
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &std::path::Path) -> ConfigResult<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate cross-field invariants that a single sub-struct can't check
    /// on its own.
    pub fn validate(&self) -> ConfigResult<()> {
        self.raft.validate()?;
        self.cas.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Chunking mode for the content-addressed store. The mode is fixed
/// store-wide at creation; an existing store never switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkMode {
    /// Fixed-size chunks, default 1 MiB.
    Fixed,
    /// Content-defined rolling-hash chunking.
    Variable,
}

/// Compression algorithm applied per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    /// No compression; the chunk is stored raw.
    None,
    /// DEFLATE via `flate2`.
    Gzip,
    /// LZ4 block compression.
    Lz4,
    /// Zstandard.
    Zstd,
    /// Brotli.
    Brotli,
}

/// Content-addressed store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasConfig {
    /// Root directory for blob and chunk data.
    pub root: std::path::PathBuf,
    /// Chunking mode.
    pub chunk_mode: ChunkMode,
    /// Minimum chunk size for variable chunking.
    pub min_chunk_size: usize,
    /// Target average chunk size for variable chunking, and the fixed chunk
    /// size when `chunk_mode == Fixed`.
    pub avg_chunk_size: usize,
    /// Maximum chunk size for variable chunking.
    pub max_chunk_size: usize,
    /// Compression algorithm.
    pub compression: CompressionKind,
    /// Minimum raw chunk size before compression is attempted.
    pub compression_threshold: usize,
    /// Maximum total store size in bytes, 0 meaning unbounded.
    pub max_total_size: u64,
    /// Interval between GC passes.
    pub gc_interval: Duration,
    /// Minimum age since last access before a zero-refcount blob is eligible
    /// for GC.
    pub gc_max_age: Duration,
    /// Refcount at or below which a blob is eligible for GC once aged out.
    pub gc_min_refcount: u32,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            root: std::path::PathBuf::from("./data/cas"),
            chunk_mode: ChunkMode::Fixed,
            min_chunk_size: 64 * 1024,
            avg_chunk_size: 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            compression: CompressionKind::Zstd,
            compression_threshold: 1024,
            max_total_size: 0,
            gc_interval: Duration::from_secs(24 * 3600),
            gc_max_age: Duration::from_secs(30 * 24 * 3600),
            gc_min_refcount: 1,
        }
    }
}

impl CasConfig {
    /// Validate chunk size ordering.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_chunk_size > self.avg_chunk_size || self.avg_chunk_size > self.max_chunk_size {
            return Err(ConfigError::Invalid(
                "chunk sizes must satisfy min <= avg <= max".to_string(),
            ));
        }
        Ok(())
    }
}

/// Replicated log (control plane) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Directory for the log segments and snapshots.
    pub data_dir: std::path::PathBuf,
    /// Voting-set member addresses at bootstrap, keyed by node id hex.
    pub voters: HashMap<String, SocketAddr>,
    /// Heartbeat interval sent by the leader.
    pub heartbeat_interval: Duration,
    /// Minimum randomized election timeout.
    pub election_timeout_min: Duration,
    /// Maximum randomized election timeout.
    pub election_timeout_max: Duration,
    /// Maximum entries appended per `AppendEntries` RPC.
    pub max_append_entries: usize,
    /// Log size (entry count) at which a snapshot is taken and the prefix
    /// truncated.
    pub snapshot_threshold: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            data_dir: std::path::PathBuf::from("./data/raft"),
            voters: HashMap::new(),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            max_append_entries: 64,
            snapshot_threshold: 10_000,
        }
    }
}

impl RaftConfig {
    /// Validate timeout ordering and voting-set size (3-7 voters).
    pub fn validate(&self) -> ConfigResult<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::Invalid(
                "election_timeout_min must be < election_timeout_max".to_string(),
            ));
        }
        if !self.voters.is_empty() && !(3..=7).contains(&self.voters.len()) {
            return Err(ConfigError::Invalid(
                "voting set should have 3-7 members".to_string(),
            ));
        }
        Ok(())
    }

    /// Strict-majority quorum size for the current voting set.
    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

/// Chunk transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum concurrent chunk requests per transfer.
    pub max_concurrent_chunks: usize,
    /// Outstanding-chunks window the destination advertises to the source.
    pub window_size: usize,
    /// Retries allowed per chunk before the transfer fails: one retry,
    /// then give up on that source.
    pub chunk_retry_limit: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 8,
            window_size: 8,
            chunk_retry_limit: 1,
        }
    }
}

/// Peer membership (gossip) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Interval between gossip rounds.
    pub gossip_interval: Duration,
    /// Number of peers contacted per gossip round.
    pub gossip_fanout: usize,
    /// Time without contact before `live -> suspect`.
    pub suspect_timeout: Duration,
    /// Time in `suspect` before `suspect -> dead`.
    pub dead_timeout: Duration,
    /// Time a `dead` entry lingers before being forgotten.
    pub forget_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(500),
            gossip_fanout: 3,
            suspect_timeout: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(15),
            forget_timeout: Duration::from_secs(300),
        }
    }
}

/// Weights used to score candidate nodes. Deliberately configuration, not
/// constants: the right balance shifts with workload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight applied to inverse recent latency.
    pub latency: f64,
    /// Weight applied to inverse queue depth.
    pub queue_depth: f64,
    /// Weight applied to inverse recent error rate.
    pub error_rate: f64,
    /// Bonus applied for prior successful routing of the same model.
    pub affinity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            queue_depth: 0.3,
            error_rate: 0.2,
            affinity: 0.1,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bounded queue size per shard.
    pub queue_size: usize,
    /// Number of queue shards.
    pub shard_count: usize,
    /// Default retry budget for a request.
    pub default_retry_budget: u32,
    /// Per-node maximum concurrent inferences, used when a node does not
    /// declare its own limit.
    pub default_node_concurrency: usize,
    /// Token-bucket capacity per priority class.
    pub admission_burst: u64,
    /// Token-bucket refill rate (tokens/sec) per priority class.
    pub admission_refill_per_sec: f64,
    /// Scoring weights.
    pub scoring_weights: ScoringWeights,
    /// Interval between rebalance passes.
    pub rebalance_interval: Duration,
    /// Minimum replica count maintained per registered model.
    pub min_replicas_per_model: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            shard_count: 8,
            default_retry_budget: 3,
            default_node_concurrency: 4,
            admission_burst: 256,
            admission_refill_per_sec: 100.0,
            scoring_weights: ScoringWeights::default(),
            rebalance_interval: Duration::from_secs(30),
            min_replicas_per_model: 1,
        }
    }
}

impl SchedulerConfig {
    /// Validate shard and queue sizing.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.shard_count == 0 {
            return Err(ConfigError::Invalid("shard_count must be > 0".to_string()));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::Invalid("queue_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Chaos harness configuration. Everything here defaults to off; fault
/// injection in production is an explicit operator decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Master enable switch for the harness API.
    pub enabled: bool,
    /// Whether randomized, continuously-running experiments are permitted.
    /// Defaults to `false`: an operator must opt in explicitly.
    pub continuous_enabled: bool,
    /// Interval between automatically-triggered experiments when continuous
    /// mode is enabled.
    pub experiment_interval: Duration,
    /// Maximum number of concurrently running experiments.
    pub max_concurrent_experiments: usize,
    /// Safety monitor sampling window.
    pub monitoring_window: Duration,
    /// Default safety thresholds applied when an experiment doesn't override
    /// them.
    pub max_error_rate: f64,
    /// Maximum tolerated latency increase ratio before auto-abort.
    pub max_latency_increase: f64,
    /// Maximum tolerated throughput drop ratio before auto-abort.
    pub max_throughput_drop: f64,
    /// Whether to automatically reverse injected faults on a safety
    /// violation.
    pub auto_rollback: bool,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            continuous_enabled: false,
            experiment_interval: Duration::from_secs(3600),
            max_concurrent_experiments: 1,
            monitoring_window: Duration::from_secs(30),
            max_error_rate: 0.05,
            max_latency_increase: 2.0,
            max_throughput_drop: 0.5,
            auto_rollback: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_addr: "127.0.0.1:7420".parse().unwrap(),
            request_addr: "127.0.0.1:7421".parse().unwrap(),
            cas: CasConfig::default(),
            raft: RaftConfig::default(),
            membership: MembershipConfig::default(),
            scheduler: SchedulerConfig::default(),
            chaos: ChaosConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// A resolved voting-set member: identity plus address, used at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoterEntry {
    /// The member's node id.
    pub node_id: NodeId,
    /// The member's peer-API address.
    pub addr: SocketAddr,
}
