//! Round-robin assignment of workers to cluster nodes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ConfigError;

/// A fixed, non-empty list of hosts handed out in cyclic order.
///
/// The rotation can be shared between workers by reference: [`next`](Self::next) advances a
/// single atomic cursor, so concurrent callers neither skip nor repeat hosts beyond plain
/// round-robin. Alternatively, [`cycle`](Self::cycle) gives each caller an independent view.
#[derive(Debug)]
pub struct NodeRotation {
    nodes: Arc<[String]>,
    cursor: AtomicUsize,
}

impl NodeRotation {
    /// Creates a rotation over the given hosts.
    ///
    /// Returns [`ConfigError::EmptyNodeList`] if there are no hosts.
    pub fn new<I, S>(nodes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: Arc<[String]> = nodes.into_iter().map(Into::into).collect();
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList);
        }

        Ok(Self {
            nodes,
            cursor: AtomicUsize::new(0),
        })
    }

    /// All hosts in their original order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Returns the next host of the shared rotation.
    pub fn next(&self) -> &str {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.nodes[idx % self.nodes.len()]
    }

    /// Returns an independent, endless iterator starting at the first host.
    pub fn cycle(&self) -> NodeCycle {
        NodeCycle {
            nodes: Arc::clone(&self.nodes),
            idx: 0,
        }
    }
}

/// An endless iterator over the hosts of a [`NodeRotation`].
#[derive(Clone, Debug)]
pub struct NodeCycle {
    nodes: Arc<[String]>,
    idx: usize,
}

impl Iterator for NodeCycle {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes[self.idx].clone();
        self.idx = (self.idx + 1) % self.nodes.len();
        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::MAX, None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn cycles_in_order() {
        let rotation = NodeRotation::new(["h1", "h2", "h3"]).unwrap();
        let seen: Vec<_> = (0..7).map(|_| rotation.next().to_owned()).collect();
        assert_eq!(seen, ["h1", "h2", "h3", "h1", "h2", "h3", "h1"]);
    }

    #[test]
    fn cycle_views_restart() {
        let rotation = NodeRotation::new(["h1", "h2", "h3"]).unwrap();
        rotation.next();

        let seen: Vec<_> = rotation.cycle().take(7).collect();
        assert_eq!(seen, ["h1", "h2", "h3", "h1", "h2", "h3", "h1"]);

        let mut first = rotation.cycle();
        first.next();
        assert_eq!(rotation.cycle().next().as_deref(), Some("h1"));
    }

    #[test]
    fn empty_is_rejected() {
        let result = NodeRotation::new(Vec::<String>::new());
        assert!(matches!(result, Err(ConfigError::EmptyNodeList)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_rotation_is_fair() {
        let rotation = Arc::new(NodeRotation::new(["h1", "h2", "h3"]).unwrap());

        let tasks: Vec<_> = (0..30)
            .map(|_| {
                let rotation = Arc::clone(&rotation);
                tokio::spawn(async move { rotation.next().to_owned() })
            })
            .collect();

        let mut counts = HashMap::new();
        for task in futures::future::join_all(tasks).await {
            *counts.entry(task.unwrap()).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&count| count == 10));
    }
}
