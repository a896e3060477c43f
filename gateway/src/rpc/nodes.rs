//! Registry of the peer nodes the gateway talks to.
//!
//! An owned `NodeRepository` is constructed once at startup and handed to
//! whoever needs it. Reads are served from an in-memory cache; every change
//! is written through to a sled tree so the registry survives restarts.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no such node")]
    NotFound(String),

    #[error("node {0} already exists")]
    AlreadyExists(String),

    #[error("invalid node: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sled::Error> for NodeError {
    fn from(e: sled::Error) -> Self {
        NodeError::Storage(e.to_string())
    }
}

/// A registered peer node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub zmq_endpoint: Option<String>,
    pub remarks: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            zmq_endpoint: None,
            remarks: None,
            last_error: None,
            last_error_at: None,
        }
    }

    /// `host:port`, the registry key.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Lock-guarded, persisted node registry.
pub struct NodeRepository {
    tree: Tree,
    cache: RwLock<BTreeMap<String, Node>>,
}

impl NodeRepository {
    /// Load every node stored in `tree`.
    pub fn open(tree: Tree) -> Result<Self, NodeError> {
        let mut cache = BTreeMap::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            let node: Node =
                bincode::deserialize(&value).map_err(|e| NodeError::Storage(e.to_string()))?;
            cache.insert(node.id(), node);
        }
        Ok(Self {
            tree,
            cache: RwLock::new(cache),
        })
    }

    pub fn list(&self) -> Vec<Node> {
        self.cache.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<Node, NodeError> {
        self.cache
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(id.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    pub fn add(&self, node: Node) -> Result<Node, NodeError> {
        if node.host.trim().is_empty() {
            return Err(NodeError::Invalid("host must not be empty".into()));
        }
        if node.port == 0 {
            return Err(NodeError::Invalid("port must not be zero".into()));
        }
        let id = node.id();
        let mut cache = self.cache.write();
        if cache.contains_key(&id) {
            return Err(NodeError::AlreadyExists(id));
        }
        self.persist(&node)?;
        cache.insert(id, node.clone());
        Ok(node)
    }

    pub fn remove(&self, id: &str) -> Result<Node, NodeError> {
        let mut cache = self.cache.write();
        let node = cache
            .remove(id)
            .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
        self.tree.remove(id.as_bytes())?;
        Ok(node)
    }

    /// Remember the latest failure talking to a node.
    pub fn record_error(&self, id: &str, message: &str) -> Result<(), NodeError> {
        let mut cache = self.cache.write();
        let node = cache
            .get_mut(id)
            .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
        node.last_error = Some(message.to_string());
        node.last_error_at = Some(Utc::now());
        let snapshot = node.clone();
        self.persist(&snapshot)
    }

    fn persist(&self, node: &Node) -> Result<(), NodeError> {
        let bytes = bincode::serialize(node).map_err(|e| NodeError::Storage(e.to_string()))?;
        self.tree.insert(node.id().as_bytes(), bytes)?;
        Ok(())
    }
}
