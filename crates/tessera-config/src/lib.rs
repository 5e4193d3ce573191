//! Configuration management for Tessera
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TESSERA_* prefix, `__` between sections)
//! 2. tessera.local.toml (per-machine overrides)
//! 3. tessera.toml (shared deployment config, carries the roster)
//! 4. ~/.config/tessera/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The roster is static: every replica and client must load the same
//! `[[roster.nodes]]` and `[[roster.clients]]` tables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tessera_consensus::ConsensusSettings;
use tessera_crypto::{SigningKey, VerifyingKey};
use tessera_link::LinkSettings;
use tessera_types::{ClientId, NodeId, Roster, RosterEntry};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Tessera configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub node: NodeConfig,
    pub link: LinkConfig,
    pub consensus: ConsensusConfig,
    pub service: ServiceConfig,
    pub client: ClientConfig,
    pub roster: RosterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding `<id>.key` files, one base64 Ed25519 seed each.
    pub keys_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            keys_dir: PathBuf::from(".tessera/keys"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub retransmit_initial_ms: u64,
    pub retransmit_max_ms: u64,
    /// Zero retransmits until acknowledged.
    pub max_retransmissions: u32,
    pub receive_queue_capacity: usize,
    pub max_datagram_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retransmit_initial_ms: 200,
            retransmit_max_ms: 3_000,
            max_retransmissions: 0,
            receive_queue_capacity: 1024,
            max_datagram_size: 65_507,
        }
    }
}

impl LinkConfig {
    pub fn settings(&self) -> LinkSettings {
        LinkSettings {
            retransmit_initial: Duration::from_millis(self.retransmit_initial_ms),
            retransmit_max: Duration::from_millis(self.retransmit_max_ms),
            max_retransmissions: (self.max_retransmissions > 0).then_some(self.max_retransmissions),
            receive_queue_capacity: self.receive_queue_capacity,
            max_datagram_size: self.max_datagram_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub round_timeout_ms: u64,
    pub max_round_timeout_ms: u64,
    pub max_pending_instances: u64,
    pub max_round_lookahead: u64,
    pub round_change_warn_threshold: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_timeout_ms: 2_000,
            max_round_timeout_ms: 30_000,
            max_pending_instances: 64,
            max_round_lookahead: 256,
            round_change_warn_threshold: 5,
        }
    }
}

impl ConsensusConfig {
    pub fn settings(&self) -> ConsensusSettings {
        ConsensusSettings {
            round_timeout: Duration::from_millis(self.round_timeout_ms),
            max_round_timeout: Duration::from_millis(self.max_round_timeout_ms),
            max_pending_instances: self.max_pending_instances,
            max_round_lookahead: self.max_round_lookahead,
            round_change_warn_threshold: self.round_change_warn_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Client requests handled concurrently by one replica.
    pub worker_permits: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { worker_permits: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Resend an unanswered request after this long.
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One roster line: identity, UDP address, base64 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
    pub public_key: String,
}

impl PeerConfig {
    fn address(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                id: self.id.clone(),
                address: self.address.clone(),
            })
    }

    fn public_key(&self) -> Result<VerifyingKey, ConfigError> {
        let bytes = STANDARD
            .decode(self.public_key.trim())
            .map_err(|e| ConfigError::InvalidKey {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        VerifyingKey::from_slice(&bytes).map_err(|e| ConfigError::InvalidKey {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub nodes: Vec<PeerConfig>,
    pub clients: Vec<PeerConfig>,
}

impl RosterConfig {
    /// Parses addresses and keys and builds the shared [`Roster`].
    pub fn build(&self) -> Result<Roster, ConfigError> {
        let nodes = self
            .nodes
            .iter()
            .map(|p| Ok(RosterEntry::new(NodeId::new(&p.id), p.address()?, p.public_key()?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let clients = self
            .clients
            .iter()
            .map(|p| Ok(RosterEntry::new(ClientId::new(&p.id), p.address()?, p.public_key()?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Roster::new(nodes, clients)?)
    }
}

impl TesseraConfig {
    /// Load configuration from the current directory
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));
        if self.consensus.round_timeout_ms == 0 {
            return fail("consensus.round_timeout_ms must be positive");
        }
        if self.consensus.max_round_timeout_ms < self.consensus.round_timeout_ms {
            return fail("consensus.max_round_timeout_ms must be at least round_timeout_ms");
        }
        if self.consensus.max_pending_instances == 0 {
            return fail("consensus.max_pending_instances must be positive");
        }
        if self.consensus.max_round_lookahead == 0 {
            return fail("consensus.max_round_lookahead must be positive");
        }
        if self.link.retransmit_initial_ms == 0 {
            return fail("link.retransmit_initial_ms must be positive");
        }
        if self.link.retransmit_max_ms < self.link.retransmit_initial_ms {
            return fail("link.retransmit_max_ms must be at least retransmit_initial_ms");
        }
        if self.link.max_datagram_size == 0 {
            return fail("link.max_datagram_size must be positive");
        }
        if self.link.receive_queue_capacity == 0 {
            return fail("link.receive_queue_capacity must be positive");
        }
        if self.service.worker_permits == 0 {
            return fail("service.worker_permits must be positive");
        }
        if self.client.request_timeout_ms == 0 {
            return fail("client.request_timeout_ms must be positive");
        }
        Ok(())
    }

    /// Validated roster.
    pub fn roster(&self) -> Result<Roster, ConfigError> {
        self.roster.build()
    }

    /// Path of the key file for `id`.
    pub fn key_path(&self, id: &str) -> PathBuf {
        self.node.keys_dir.join(format!("{id}.key"))
    }

    /// Reads the signing key of `id` from the keys directory.
    pub fn signing_key(&self, id: &str) -> Result<SigningKey, ConfigError> {
        load_signing_key(id, &self.key_path(id))
    }

    /// Renders the effective configuration, e.g. for `--print-config`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve relative paths against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();
        if self.node.keys_dir.is_relative() {
            self.node.keys_dir = base.join(&self.node.keys_dir);
        }
    }
}

/// Reads a base64 Ed25519 seed from `path`.
pub fn load_signing_key(id: &str, path: &Path) -> Result<SigningKey, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| ConfigError::InvalidKey {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
    SigningKey::from_slice(&bytes).map_err(|e| ConfigError::InvalidKey {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Base64 form of a signing key seed, as stored in key files.
pub fn encode_signing_key(key: &SigningKey) -> String {
    STANDARD.encode(key.to_bytes())
}

/// Base64 form of a public key, as written in roster tables.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.to_bytes())
}
