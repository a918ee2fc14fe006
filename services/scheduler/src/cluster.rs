//! Cluster state and snapshot persistence.
//!
//! The cluster is the ordered set of declared brokers plus its durable
//! snapshot location. Operators declare brokers by editing the snapshot
//! file; the scheduler only reads the declaration and writes back runtime
//! and failover state.
//!
//! Saves use the write-to-temp + rename pattern so a crash never leaves a
//! torn snapshot. Save failures are non-fatal (the next event retries);
//! a bad snapshot at startup is fatal.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::broker::Broker;

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Errors from cluster persistence and mutation.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("snapshot io on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid snapshot {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("duplicate broker id {0}")]
    DuplicateBroker(String),

    #[error("invalid broker {id}: {reason}")]
    InvalidBroker { id: String, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    brokers: Vec<Broker>,
}

/// The declared broker set.
///
/// Iteration order is insertion order and stays stable across save/load;
/// the reconciler's matching tie-break depends on it.
pub struct Cluster {
    path: PathBuf,
    brokers: Vec<Broker>,
}

impl Cluster {
    /// A cluster persisted at `path`, initially empty.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            brokers: Vec::new(),
        }
    }

    pub fn get_broker(&self, id: &str) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.id == id)
    }

    pub fn get_broker_mut(&mut self, id: &str) -> Option<&mut Broker> {
        self.brokers.iter_mut().find(|b| b.id == id)
    }

    /// Brokers in stable insertion order.
    pub fn get_brokers(&self) -> &[Broker] {
        &self.brokers
    }

    /// Add a broker; ids must be unique and well-formed.
    pub fn add_broker(&mut self, broker: Broker) -> Result<(), ClusterError> {
        validate_broker(&broker)?;
        if self.get_broker(&broker.id).is_some() {
            return Err(ClusterError::DuplicateBroker(broker.id));
        }
        self.brokers.push(broker);
        Ok(())
    }

    pub fn remove_broker(&mut self, id: &str) -> Option<Broker> {
        let index = self.brokers.iter().position(|b| b.id == id)?;
        Some(self.brokers.remove(index))
    }

    /// Write the snapshot atomically.
    pub fn save(&self) -> Result<(), ClusterError> {
        let io = |source| ClusterError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io)?;
            }
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            brokers: self.brokers.clone(),
        };
        let content = serde_json::to_string_pretty(&snapshot).map_err(|e| ClusterError::Invalid {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &content).map_err(io)?;
        fs::rename(&tmp_path, &self.path).map_err(io)?;

        debug!(
            path = %self.path.display(),
            brokers = self.brokers.len(),
            "Saved cluster snapshot"
        );
        Ok(())
    }

    /// Load the snapshot, replacing the in-memory broker set.
    ///
    /// A missing file is an empty cluster. `clear_tasks` discards runtime
    /// task handles, which are stale across scheduler restarts.
    pub fn load(&mut self, clear_tasks: bool) -> Result<(), ClusterError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No cluster snapshot, starting fresh");
            self.brokers.clear();
            return Ok(());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| ClusterError::Io {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: Snapshot =
            serde_json::from_str(&content).map_err(|e| ClusterError::Invalid {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ClusterError::Invalid {
                path: self.path.clone(),
                reason: format!(
                    "version {} (expected {})",
                    snapshot.version, SNAPSHOT_VERSION
                ),
            });
        }

        let mut brokers = snapshot.brokers;
        for (index, broker) in brokers.iter().enumerate() {
            validate_broker(broker)?;
            if brokers[..index].iter().any(|b| b.id == broker.id) {
                return Err(ClusterError::DuplicateBroker(broker.id.clone()));
            }
        }

        if clear_tasks {
            for broker in &mut brokers {
                broker.task = None;
            }
        }

        info!(
            path = %self.path.display(),
            brokers = brokers.len(),
            clear_tasks,
            "Loaded cluster snapshot"
        );
        self.brokers = brokers;
        Ok(())
    }
}

fn validate_broker(broker: &Broker) -> Result<(), ClusterError> {
    let invalid = |reason: &str| ClusterError::InvalidBroker {
        id: broker.id.clone(),
        reason: reason.to_string(),
    };

    if broker.id.is_empty() {
        return Err(invalid("empty id"));
    }
    // Task ids embed the broker id before the first dash.
    if broker.id.contains('-') {
        return Err(invalid("id must not contain '-'"));
    }
    if broker.cpus <= 0.0 {
        return Err(invalid("cpus must be positive"));
    }
    if broker.mem == 0 {
        return Err(invalid("mem must be positive"));
    }
    if broker.heap == 0 || broker.heap > broker.mem {
        return Err(invalid("heap must be positive and at most mem"));
    }
    Ok(())
}
