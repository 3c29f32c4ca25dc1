//! In-memory Merkle-DAG index over content-addressed blocks.
//!
//! The graph is two maps keyed by CID: block bytes and the declared
//! outgoing-link set. Parents are computed by scan; there are no back
//! pointers. Blocks are immutable, so edges never change after insert.

use meshdag_core_types::{Block, BlockError, Cid};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised by DAG operations.
#[derive(Error, Debug)]
pub enum DagError {
    /// A cycle was found where the operation requires acyclicity.
    #[error("cycle detected in DAG")]
    Cyclic,
    /// Link extraction failed for a block being indexed.
    #[error(transparent)]
    Link(#[from] BlockError),
}

/// Aggregate figures over the indexed graph. Depth is the shortest
/// distance from any root.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DagStats {
    pub total_blocks: u64,
    pub total_size: u64,
    pub root_count: usize,
    pub leaf_count: usize,
    pub max_depth: usize,
    pub average_depth: f64,
}

#[derive(Debug, Default)]
struct DagIndex {
    blocks: HashMap<Cid, Block>,
    links: HashMap<Cid, HashSet<Cid>>,
}

impl DagIndex {
    /// Declared children that are actually present in the index.
    fn present_children<'a>(&'a self, cid: &Cid) -> impl Iterator<Item = &'a Cid> {
        self.links
            .get(cid)
            .into_iter()
            .flatten()
            .filter(|child| self.blocks.contains_key(*child))
    }

    /// Nodes with no incoming edge from another indexed node.
    fn roots(&self) -> Vec<Cid> {
        let mut targets: HashSet<&Cid> = HashSet::new();
        for (source, children) in &self.links {
            for child in children {
                if child != source && self.blocks.contains_key(child) {
                    targets.insert(child);
                }
            }
        }
        self.blocks
            .keys()
            .filter(|cid| !targets.contains(cid))
            .cloned()
            .collect()
    }

    /// Nodes whose declared outgoing set is empty.
    fn leaves(&self) -> Vec<Cid> {
        self.blocks
            .keys()
            .filter(|cid| self.links.get(*cid).map_or(true, HashSet::is_empty))
            .cloned()
            .collect()
    }
}

enum Visit {
    Enter(Cid),
    Exit(Cid),
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// A shared, async-guarded DAG index.
#[derive(Debug, Clone, Default)]
pub struct MerkleDag {
    inner: Arc<RwLock<DagIndex>>,
}

impl MerkleDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently index a block, refreshing its outgoing-link set by
    /// re-extracting from the payload.
    pub async fn add_block(&self, block: &Block) -> Result<(), DagError> {
        let links: HashSet<Cid> = block.extract_links()?.into_iter().collect();
        let mut inner = self.inner.write().await;
        inner.blocks.insert(block.cid().clone(), block.clone());
        inner.links.insert(block.cid().clone(), links);
        Ok(())
    }

    /// Erase a node and its outgoing set. Parents are untouched; their
    /// declared links simply dangle.
    pub async fn remove_block(&self, cid: &Cid) -> bool {
        let mut inner = self.inner.write().await;
        inner.links.remove(cid);
        inner.blocks.remove(cid).is_some()
    }

    pub async fn get_block(&self, cid: &Cid) -> Option<Block> {
        self.inner.read().await.blocks.get(cid).cloned()
    }

    pub async fn contains(&self, cid: &Cid) -> bool {
        self.inner.read().await.blocks.contains_key(cid)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.blocks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.blocks.is_empty()
    }

    /// The declared outgoing set, whether or not the targets are indexed.
    pub async fn get_children(&self, cid: &Cid) -> Vec<Cid> {
        self.inner
            .read()
            .await
            .links
            .get(cid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Indexed nodes that declare a link to `cid`, computed by scan.
    pub async fn get_parents(&self, cid: &Cid) -> Vec<Cid> {
        let inner = self.inner.read().await;
        inner
            .links
            .iter()
            .filter(|(source, children)| *source != cid && children.contains(cid))
            .map(|(source, _)| source.clone())
            .collect()
    }

    /// Nodes with no incoming edge.
    pub async fn roots(&self) -> Vec<Cid> {
        self.inner.read().await.roots()
    }

    /// Nodes with an empty outgoing set.
    pub async fn leaves(&self) -> Vec<Cid> {
        self.inner.read().await.leaves()
    }

    /// Iterative depth-first search with white/gray/black coloring; true
    /// when a back edge exists. Links to absent nodes are ignored.
    pub async fn has_cycles(&self) -> bool {
        let inner = self.inner.read().await;
        Self::color_dfs(&inner, None).is_err()
    }

    /// Nodes in reverse post-order; every node precedes its declared
    /// descendants. Fails with [`DagError::Cyclic`] when a cycle exists.
    pub async fn topological_sort(&self) -> Result<Vec<Cid>, DagError> {
        let inner = self.inner.read().await;
        let mut order = Vec::with_capacity(inner.blocks.len());
        Self::color_dfs(&inner, Some(&mut order)).map_err(|_| DagError::Cyclic)?;
        order.reverse();
        Ok(order)
    }

    /// Shared DFS core: detects back edges, optionally records post-order.
    fn color_dfs(inner: &DagIndex, mut post_order: Option<&mut Vec<Cid>>) -> Result<(), ()> {
        let mut colors: HashMap<&Cid, Color> =
            inner.blocks.keys().map(|cid| (cid, Color::White)).collect();
        let mut stack = Vec::new();
        let starts: Vec<&Cid> = inner.blocks.keys().collect();
        for start in starts {
            if colors[start] != Color::White {
                continue;
            }
            stack.push(Visit::Enter(start.clone()));
            while let Some(step) = stack.pop() {
                match step {
                    Visit::Enter(cid) => {
                        let entry = colors.get_mut(&cid).ok_or(())?;
                        if *entry != Color::White {
                            continue;
                        }
                        *entry = Color::Gray;
                        stack.push(Visit::Exit(cid.clone()));
                        for child in inner.present_children(&cid) {
                            match colors[child] {
                                Color::Gray => return Err(()),
                                Color::White => stack.push(Visit::Enter(child.clone())),
                                Color::Black => {}
                            }
                        }
                    }
                    Visit::Exit(cid) => {
                        if let Some(order) = post_order.as_mut() {
                            order.push(cid.clone());
                        }
                        if let Some(entry) = colors.get_mut(&cid) {
                            *entry = Color::Black;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Shortest link path from `from` to `to` (inclusive), by BFS over
    /// declared links. `None` when either endpoint is absent or no path
    /// exists.
    pub async fn find_path(&self, from: &Cid, to: &Cid) -> Option<Vec<Cid>> {
        let inner = self.inner.read().await;
        if !inner.blocks.contains_key(from) || !inner.blocks.contains_key(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.clone()]);
        }
        let mut predecessors: HashMap<Cid, Cid> = HashMap::new();
        let mut visited: HashSet<Cid> = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from.clone());
        queue.push_back(from.clone());
        while let Some(current) = queue.pop_front() {
            for child in inner.present_children(&current) {
                if !visited.insert(child.clone()) {
                    continue;
                }
                predecessors.insert(child.clone(), current.clone());
                if child == to {
                    let mut path = vec![to.clone()];
                    let mut cursor = to;
                    while let Some(previous) = predecessors.get(cursor) {
                        path.push(previous.clone());
                        cursor = previous;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(child.clone());
            }
        }
        None
    }

    /// Totals plus depth figures from a multi-source BFS over the roots.
    /// Nodes unreachable from any root (only possible with cyclic link
    /// declarations) carry no depth and are excluded from the average.
    pub async fn stats(&self) -> DagStats {
        let inner = self.inner.read().await;
        let total_blocks = inner.blocks.len() as u64;
        let total_size = inner.blocks.values().map(Block::size).sum();
        let roots = inner.roots();
        let leaf_count = inner.leaves().len();

        let mut depths: HashMap<Cid, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        for root in &roots {
            depths.insert(root.clone(), 0);
            queue.push_back(root.clone());
        }
        while let Some(current) = queue.pop_front() {
            let next = depths[&current] + 1;
            for child in inner.present_children(&current) {
                if !depths.contains_key(child) {
                    depths.insert(child.clone(), next);
                    queue.push_back(child.clone());
                }
            }
        }
        let max_depth = depths.values().copied().max().unwrap_or(0);
        let average_depth = if depths.is_empty() {
            0.0
        } else {
            depths.values().sum::<usize>() as f64 / depths.len() as f64
        };

        DagStats {
            total_blocks,
            total_size,
            root_count: roots.len(),
            leaf_count,
            max_depth,
            average_depth,
        }
    }
}
