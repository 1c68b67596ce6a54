//! In-process coordination service.
//!
//! A [`MemoryTree`] plays the role of the shared service; every
//! [`MemoryCoordinator`] connected to it is one client session. Used by tests
//! and by single-host deployments where all nodes share one process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::client::{CoordinationClient, CreateOutcome, LockSlot};
use crate::error::{GovernorError, Result};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes, `None` for persistent ones.
    owner: Option<u64>,
    created_at: DateTime<Utc>,
}

/// Shared node tree. Cheap to clone via `Arc`.
#[derive(Debug)]
pub struct MemoryTree {
    nodes: DashMap<String, Node>,
    sequence: AtomicU64,
    sessions: AtomicU64,
    online: AtomicBool,
}

impl MemoryTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            sequence: AtomicU64::new(0),
            sessions: AtomicU64::new(1),
            online: AtomicBool::new(true),
        })
    }

    /// Simulate the service becoming (un)reachable for every session.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GovernorError::Connectivity(
                "coordination service is offline".to_string(),
            ))
        }
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            Some(("", _)) | None => true,
            Some((parent, _)) => self.nodes.contains_key(parent),
        }
    }
}

/// One client session against a [`MemoryTree`].
#[derive(Debug)]
pub struct MemoryCoordinator {
    tree: Arc<MemoryTree>,
    session: u64,
    closed: AtomicBool,
}

impl MemoryCoordinator {
    pub fn connect(tree: &Arc<MemoryTree>) -> Self {
        let session = tree.sessions.fetch_add(1, Ordering::SeqCst);
        debug!(session, "coordination session opened");
        Self {
            tree: Arc::clone(tree),
            session,
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GovernorError::Connectivity(format!(
                "session {} is closed",
                self.session
            )));
        }
        self.tree.check_online()
    }

    fn insert_ephemeral(&self, path: &str, data: &[u8]) -> Result<CreateOutcome> {
        if !self.tree.parent_exists(path) {
            return Err(GovernorError::Coordination(format!(
                "parent of {path} does not exist"
            )));
        }
        match self.tree.nodes.entry(path.to_string()) {
            Entry::Occupied(_) => Ok(CreateOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(Node {
                    data: data.to_vec(),
                    owner: Some(self.session),
                    created_at: Utc::now(),
                });
                Ok(CreateOutcome::Created)
            }
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        self.check()?;
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.tree.nodes.entry(current.clone()).or_insert_with(|| Node {
                data: Vec::new(),
                owner: None,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<CreateOutcome> {
        self.check()?;
        self.insert_ephemeral(path, data)
    }

    async fn create_sequential(&self, prefix: &str, data: &[u8]) -> Result<String> {
        self.check()?;
        loop {
            let seq = self.tree.sequence.fetch_add(1, Ordering::SeqCst);
            let path = format!("{prefix}{seq:010}");
            if self.insert_ephemeral(&path, data)? == CreateOutcome::Created {
                return Ok(path);
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.check()?;
        Ok(self.tree.nodes.remove(path).is_some())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check()?;
        if !self.tree.exists(path) {
            return Err(GovernorError::Coordination(format!("{path} does not exist")));
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .tree
            .nodes
            .iter()
            .filter_map(|entry| {
                let rest = entry.key().strip_prefix(&prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn slot(&self, path: &str) -> Result<Option<LockSlot>> {
        self.check()?;
        Ok(self.tree.nodes.get(path).map(|node| LockSlot {
            path: path.to_string(),
            holder: String::from_utf8_lossy(&node.data).into_owned(),
            created_at: node.created_at,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session;
        let before = self.tree.nodes.len();
        self.tree.nodes.retain(|_, node| node.owner != Some(session));
        debug!(
            session,
            dropped = before.saturating_sub(self.tree.nodes.len()),
            "coordination session closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_path_is_idempotent() {
        let tree = MemoryTree::new();
        let client = MemoryCoordinator::connect(&tree);
        client.ensure_path("/jobgate/locks/backup").await.unwrap();
        client.ensure_path("/jobgate/locks/backup").await.unwrap();
        assert!(tree.exists("/jobgate"));
        assert!(tree.exists("/jobgate/locks/backup"));
        assert!(client.children("/jobgate/locks/backup").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_reports_existing_node() {
        let tree = MemoryTree::new();
        let client = MemoryCoordinator::connect(&tree);
        client.ensure_path("/l").await.unwrap();
        assert_eq!(
            client.create_ephemeral("/l/a", b"a").await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            client.create_ephemeral("/l/a", b"a").await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        let slot = client.slot("/l/a").await.unwrap().unwrap();
        assert_eq!(slot.holder, "a");
    }

    #[tokio::test]
    async fn create_without_parent_fails() {
        let tree = MemoryTree::new();
        let client = MemoryCoordinator::connect(&tree);
        let err = client.create_ephemeral("/missing/a", b"a").await.unwrap_err();
        assert!(matches!(err, GovernorError::Coordination(_)));
    }

    #[tokio::test]
    async fn sequential_names_increase() {
        let tree = MemoryTree::new();
        let client = MemoryCoordinator::connect(&tree);
        client.ensure_path("/l").await.unwrap();
        let a = client.create_sequential("/l/n-", b"").await.unwrap();
        let b = client.create_sequential("/l/n-", b"").await.unwrap();
        assert!(a < b);
        assert_eq!(client.children("/l").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn children_lists_direct_descendants_only() {
        let tree = MemoryTree::new();
        let client = MemoryCoordinator::connect(&tree);
        client.ensure_path("/l/nested").await.unwrap();
        client.create_ephemeral("/l/a", b"").await.unwrap();
        client.create_ephemeral("/l/nested/b", b"").await.unwrap();
        assert_eq!(
            client.children("/l").await.unwrap(),
            vec!["a".to_string(), "nested".to_string()]
        );
    }

    #[tokio::test]
    async fn close_drops_session_nodes_only() {
        let tree = MemoryTree::new();
        let a = MemoryCoordinator::connect(&tree);
        let b = MemoryCoordinator::connect(&tree);
        a.ensure_path("/l").await.unwrap();
        a.create_ephemeral("/l/a", b"").await.unwrap();
        b.create_ephemeral("/l/b", b"").await.unwrap();

        a.close().await.unwrap();
        assert_eq!(b.children("/l").await.unwrap(), vec!["b".to_string()]);
        assert!(matches!(
            a.children("/l").await.unwrap_err(),
            GovernorError::Connectivity(_)
        ));
    }

    #[tokio::test]
    async fn offline_tree_fails_every_call() {
        let tree = MemoryTree::new();
        let client = MemoryCoordinator::connect(&tree);
        tree.set_online(false);
        assert!(matches!(
            client.ensure_path("/l").await.unwrap_err(),
            GovernorError::Connectivity(_)
        ));
        tree.set_online(true);
        client.ensure_path("/l").await.unwrap();
    }
}
