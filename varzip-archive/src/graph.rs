//! Stream-deduplication graph optimizer.
//!
//! Nodes are column streams with their encoded size as cost; edges say
//! "stream `to` can be stored as a reference to stream `from`", either
//! because the two are byte-identical (`equality`) or at the cost of storing
//! a mapping. The optimizer decides which nodes stay explicit:
//!
//! 1. drop isolated nodes
//! 2. fold equality edges (the target becomes an alias and loses its own
//!    outgoing edges)
//! 3. drop edges whose cost exceeds the target's own cost
//! 4. repeatedly commit the edge with the largest positive gain whose target
//!    has no outgoing edges; on a stall (cycles), remove the lowest-gain
//!    edge and retry
//!
//! Ordered maps keep every tie-break deterministic, so two runs over the
//! same input produce identical node and edge lists.

use std::collections::{BTreeMap, BTreeSet};

/// Input node: a column stream and its encoded size.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    /// Column id.
    pub id: i32,
    /// Encoded size of the stream.
    pub cost: u64,
}

/// Input edge: `to` can be stored as a function of `from`.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    /// Source column id.
    pub from: i32,
    /// Target column id (the one that would become a reference).
    pub to: i32,
    /// True when the two streams are byte-identical.
    pub equality: bool,
    /// Cost of storing the mapping.
    pub cost: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeData {
    cost: u64,
    in_degree: i32,
    out_degree: i32,
}

#[derive(Debug, Clone, Copy, Default)]
struct EdgeData {
    equality: bool,
    cost: u64,
}

/// Deterministic dedup optimizer.
#[derive(Debug, Default)]
pub struct GraphOptimizer {
    nodes: BTreeMap<i32, NodeData>,
    edges: BTreeMap<(i32, i32), EdgeData>,

    out_nodes: Vec<i32>,
    out_edges: Vec<(i32, i32)>,
}

impl GraphOptimizer {
    /// Create an optimizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the optimization. Returns `(nodes, edges)` where each node is
    /// `(id, explicit)` and each edge `(from, to)` marks an aliased target.
    pub fn optimize(
        &mut self,
        in_nodes: &[Node],
        in_edges: &[Edge],
    ) -> (Vec<(i32, bool)>, Vec<(i32, i32)>) {
        self.load_graph(in_nodes, in_edges);
        self.remove_isolated_nodes();
        self.remove_equality_edges();
        self.remove_isolated_nodes();

        self.edges.clear();
        for n in self.nodes.values_mut() {
            n.in_degree = 0;
            n.out_degree = 0;
        }

        self.remove_expensive_edges();
        self.remove_isolated_nodes();
        self.strip_edges();
        self.remove_isolated_nodes();

        let mut nodes = Vec::with_capacity(self.out_nodes.len());
        for &id in self.out_nodes.iter().rev() {
            let explicit = !self.out_edges.iter().any(|&(_, to)| to == id);
            nodes.push((id, explicit));
        }

        (nodes, std::mem::take(&mut self.out_edges))
    }

    fn load_graph(&mut self, in_nodes: &[Node], in_edges: &[Edge]) {
        self.nodes.clear();
        self.edges.clear();
        self.out_nodes.clear();
        self.out_edges.clear();

        for n in in_nodes {
            self.nodes.insert(
                n.id,
                NodeData {
                    cost: n.cost,
                    in_degree: 0,
                    out_degree: 0,
                },
            );
        }

        for e in in_edges {
            self.edges.insert(
                (e.from, e.to),
                EdgeData {
                    equality: e.equality,
                    cost: e.cost,
                },
            );
            self.nodes.get_mut(&e.from).unwrap().out_degree += 1;
            self.nodes.get_mut(&e.to).unwrap().in_degree += 1;
        }
    }

    fn remove_isolated_nodes(&mut self) -> bool {
        let to_remove: Vec<i32> = self
            .nodes
            .iter()
            .filter(|(_, d)| d.in_degree == 0 && d.out_degree == 0)
            .map(|(&id, _)| id)
            .collect();

        for &id in &to_remove {
            self.out_nodes.push(id);
            self.nodes.remove(&id);
        }

        !to_remove.is_empty()
    }

    fn remove_equality_edges(&mut self) -> bool {
        let mut nodes_to_remove: BTreeSet<i32> = BTreeSet::new();

        let ids: Vec<i32> = self.nodes.keys().copied().collect();
        for &n1 in &ids {
            if nodes_to_remove.contains(&n1) {
                continue;
            }
            for &n2 in &ids {
                if nodes_to_remove.contains(&n2) {
                    continue;
                }
                if let Some(e) = self.edges.get(&(n1, n2)) {
                    if e.equality {
                        nodes_to_remove.insert(n2);
                        self.out_edges.push((n1, n2));
                        self.out_nodes.push(n2);
                    }
                }
            }
        }

        let edges_to_remove: Vec<(i32, i32)> = self
            .edges
            .keys()
            .filter(|(f, t)| nodes_to_remove.contains(f) || nodes_to_remove.contains(t))
            .copied()
            .collect();

        for e in edges_to_remove {
            self.edges.remove(&e);
            self.nodes.get_mut(&e.0).unwrap().out_degree -= 1;
            self.nodes.get_mut(&e.1).unwrap().in_degree -= 1;
        }

        for &id in &nodes_to_remove {
            self.nodes.remove(&id);
        }

        !nodes_to_remove.is_empty()
    }

    fn remove_expensive_edges(&mut self) -> bool {
        let to_remove: Vec<(i32, i32)> = self
            .edges
            .iter()
            .filter(|&(&(_, to), ref e)| e.cost > self.nodes[&to].cost)
            .map(|(&k, _)| k)
            .collect();

        for e in &to_remove {
            self.edges.remove(e);
            self.nodes.get_mut(&e.0).unwrap().out_degree -= 1;
            self.nodes.get_mut(&e.1).unwrap().in_degree -= 1;
        }

        !to_remove.is_empty()
    }

    // Commit the edge with the largest positive gain whose target has no
    // outgoing edges.
    fn remove_best_edge(&mut self) -> bool {
        let mut best_edge: Option<(i32, i32)> = None;
        let mut best_gain = 0i64;

        for (&(from, to), e) in &self.edges {
            if self.nodes[&to].out_degree == 0 {
                let gain = self.nodes[&to].cost as i64 - e.cost as i64;
                if gain > best_gain {
                    best_gain = gain;
                    best_edge = Some((from, to));
                }
            }
        }

        let Some((from, to)) = best_edge else {
            return false;
        };

        self.out_nodes.push(to);
        self.out_edges.push((from, to));
        self.remove_edges_with_target(to);

        debug_assert_eq!(self.nodes[&to].in_degree, 0);
        self.nodes.remove(&to);

        true
    }

    // Remove the lowest-gain edge; breaks cycles so the main loop can make
    // progress.
    fn remove_worst_edge(&mut self) {
        let mut worst_edge: Option<(i32, i32)> = None;
        let mut worst_gain = i64::MAX;

        for (&(from, to), e) in &self.edges {
            let gain = self.nodes[&to].cost as i64 - e.cost as i64;
            if gain < worst_gain {
                worst_gain = gain;
                worst_edge = Some((from, to));
            }
        }

        let (from, to) = worst_edge.expect("strip loop never runs on an empty edge set");
        self.edges.remove(&(from, to));
        self.nodes.get_mut(&from).unwrap().out_degree -= 1;
        self.nodes.get_mut(&to).unwrap().in_degree -= 1;
    }

    fn strip_edges(&mut self) {
        while !self.edges.is_empty() {
            if !self.remove_best_edge() {
                self.remove_worst_edge();
            }
        }
    }

    fn remove_edges_with_target(&mut self, to: i32) {
        let to_remove: Vec<(i32, i32)> = self
            .edges
            .keys()
            .filter(|&&(_, t)| t == to)
            .copied()
            .collect();

        for e in to_remove {
            self.edges.remove(&e);
            self.nodes.get_mut(&e.0).unwrap().out_degree -= 1;
            self.nodes.get_mut(&e.1).unwrap().in_degree -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i32, cost: u64) -> Node {
        Node { id, cost }
    }

    fn edge(from: i32, to: i32, equality: bool, cost: u64) -> Edge {
        Edge {
            from,
            to,
            equality,
            cost,
        }
    }

    #[test]
    fn test_no_edges_all_explicit() {
        let mut opt = GraphOptimizer::new();
        let (nodes, edges) = opt.optimize(&[node(0, 10), node(1, 20)], &[]);

        assert!(edges.is_empty());
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|&(_, explicit)| explicit));
    }

    #[test]
    fn test_equality_edge_folds_target() {
        let mut opt = GraphOptimizer::new();
        let (nodes, edges) = opt.optimize(
            &[node(0, 10), node(1, 10)],
            &[edge(0, 1, true, 0)],
        );

        assert_eq!(edges, vec![(0, 1)]);
        let aliased: Vec<i32> = nodes.iter().filter(|n| !n.1).map(|n| n.0).collect();
        assert_eq!(aliased, vec![1]);
    }

    #[test]
    fn test_expensive_edge_dropped() {
        let mut opt = GraphOptimizer::new();
        let (nodes, edges) = opt.optimize(
            &[node(0, 10), node(1, 5)],
            &[edge(0, 1, false, 50)],
        );

        assert!(edges.is_empty());
        assert!(nodes.iter().all(|&(_, explicit)| explicit));
    }

    #[test]
    fn test_best_gain_wins() {
        // Two candidate sources for node 2; the cheaper mapping must win.
        let mut opt = GraphOptimizer::new();
        let (_, edges) = opt.optimize(
            &[node(0, 10), node(1, 10), node(2, 100)],
            &[edge(0, 2, false, 30), edge(1, 2, false, 5)],
        );

        assert_eq!(edges, vec![(1, 2)]);
    }

    #[test]
    fn test_cycle_resolved() {
        let mut opt = GraphOptimizer::new();
        let (nodes, edges) = opt.optimize(
            &[node(0, 100), node(1, 100)],
            &[edge(0, 1, false, 10), edge(1, 0, false, 20)],
        );

        // One direction must be chosen, not both.
        assert_eq!(edges.len(), 1);
        assert_eq!(nodes.iter().filter(|n| !n.1).count(), 1);
    }

    #[test]
    fn test_deterministic() {
        let nodes = [node(0, 50), node(1, 50), node(2, 80), node(3, 80)];
        let edges = [
            edge(0, 1, true, 0),
            edge(2, 3, false, 10),
            edge(3, 2, false, 10),
            edge(0, 3, false, 60),
        ];

        let mut opt1 = GraphOptimizer::new();
        let mut opt2 = GraphOptimizer::new();
        assert_eq!(opt1.optimize(&nodes, &edges), opt2.optimize(&nodes, &edges));
    }
}
