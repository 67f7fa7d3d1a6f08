//! FlowGraph - dependency structure of a flow (dense indices)
//!
//! Performance:
//! - Node names interned once (Arc<str>), index lookup via FxHashMap
//! - Dependencies stored as SmallVec of dense u32 indices (0-4 inline)
//! - DAG state elsewhere is kept in index-addressed vectors
//!
//! DAG Validation:
//! - Cycle detection using an iterative DFS three-color algorithm

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ast::Flow;
use crate::error::FlowError;

/// Stack-allocated deps: most nodes have 0-4 dependencies
pub type DepVec = SmallVec<[u32; 4]>;

/// Graph of node dependencies derived from input assignments and conditions
#[derive(Debug, Clone)]
pub struct FlowGraph {
    names: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, u32>,
    /// node -> nodes it depends on
    predecessors: Vec<DepVec>,
    /// node -> nodes depending on it
    successors: Vec<DepVec>,
}

impl FlowGraph {
    /// Build the graph; references to unknown nodes are ignored here and
    /// reported by `dag::validate`.
    pub fn from_flow(flow: &Flow) -> Self {
        let capacity = flow.nodes.len();
        let mut index: FxHashMap<Arc<str>, u32> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());
        let mut names = Vec::with_capacity(capacity);

        for (i, node) in flow.nodes.iter().enumerate() {
            // Duplicate names keep the first index; validation rejects them
            index.entry(Arc::clone(&node.name)).or_insert(i as u32);
            names.push(Arc::clone(&node.name));
        }

        let mut predecessors = vec![DepVec::new(); capacity];
        let mut successors = vec![DepVec::new(); capacity];
        for (i, node) in flow.nodes.iter().enumerate() {
            for dep in node.dependencies() {
                if let Some(&d) = index.get(&dep) {
                    predecessors[i].push(d);
                    successors[d as usize].push(i as u32);
                }
            }
        }

        Self {
            names,
            index,
            predecessors,
            successors,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[inline]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|&i| i as usize)
    }

    #[inline]
    pub fn name(&self, idx: usize) -> &Arc<str> {
        &self.names[idx]
    }

    #[inline]
    pub fn dependencies(&self, idx: usize) -> &[u32] {
        &self.predecessors[idx]
    }

    /// Detect cycles using DFS with three-color marking.
    ///
    /// - White: unvisited
    /// - Gray: on the current DFS path
    /// - Black: fully processed
    ///
    /// The walk keeps its own stack, so chain depth is bounded by memory
    /// rather than the thread stack. Reaching a Gray node closes a cycle;
    /// the error carries its path, e.g. `a → b → a`.
    pub fn detect_cycles(&self) -> Result<(), FlowError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors = vec![Color::White; self.len()];
        // (node, next successor to visit); the frames are the current path
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for start in 0..self.len() {
            if colors[start] != Color::White {
                continue;
            }
            colors[start] = Color::Gray;
            stack.push((start, 0));

            while let Some(frame) = stack.last_mut() {
                let (node, cursor) = *frame;
                let next = match self.successors[node].get(cursor) {
                    Some(&next) => next as usize,
                    None => {
                        colors[node] = Color::Black;
                        stack.pop();
                        continue;
                    }
                };
                frame.1 += 1;

                match colors[next] {
                    Color::White => {
                        colors[next] = Color::Gray;
                        stack.push((next, 0));
                    }
                    Color::Gray => return Err(self.cycle_error(&stack, next)),
                    Color::Black => {}
                }
            }
        }

        Ok(())
    }

    fn cycle_error(&self, stack: &[(usize, usize)], closing: usize) -> FlowError {
        let from = stack.iter().position(|&(n, _)| n == closing).unwrap_or(0);
        let mut path: Vec<&str> = stack[from..]
            .iter()
            .map(|&(n, _)| self.names[n].as_ref())
            .collect();
        path.push(self.names[closing].as_ref());
        FlowError::CycleDetected {
            cycle: path.join(" → "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> FlowGraph {
        FlowGraph::from_flow(&Flow::from_yaml(yaml).unwrap())
    }

    // ═══════════════════════════════════════════════════════════════
    // CYCLE DETECTION TESTS
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn test_detect_cycle_simple() {
        let g = graph(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: "${c.output}" }
  - name: b
    tool: echo
    inputs: { value: "${a.output}" }
  - name: c
    tool: echo
    inputs: { value: "${b.output}" }
"#,
        );
        let err = g.detect_cycles().unwrap_err();
        assert_eq!(err.code(), "FLOW-020");
        assert!(err.to_string().contains("a → b → c → a"));
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let g = graph(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: "${a}" }
"#,
        );
        let err = g.detect_cycles().unwrap_err();
        assert!(err.to_string().contains("a → a"));
    }

    #[test]
    fn test_cycle_through_condition() {
        let g = graph(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: 1 }
    activate: { when: "${b.output}", is: true }
  - name: b
    tool: echo
    inputs: { value: "${a.output}" }
"#,
        );
        assert!(g.detect_cycles().is_err());
    }

    #[test]
    fn test_diamond_no_cycle() {
        let g = graph(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: x }
  - name: b
    tool: echo
    inputs: { value: "${a.output}" }
  - name: c
    tool: echo
    inputs: { value: "${a.output}" }
  - name: d
    tool: concat
    inputs: { left: "${b.output}", right: "${c.output}" }
"#,
        );
        assert!(g.detect_cycles().is_ok());
        assert_eq!(g.dependencies(3).len(), 2);
    }

    /// `n0 <- n1 <- ... <- n{len-1}`, optionally closed back into `n0`
    fn chain(len: usize, closed: bool) -> FlowGraph {
        let mut yaml = String::from("nodes:\n");
        for i in 0..len {
            let value = match i {
                0 if closed => format!("\"${{n{}}}\"", len - 1),
                0 => "x".to_string(),
                _ => format!("\"${{n{}}}\"", i - 1),
            };
            yaml.push_str(&format!("  - {{ name: n{i}, tool: echo, inputs: {{ value: {value} }} }}\n"));
        }
        graph(&yaml)
    }

    #[test]
    fn test_deep_chain_does_not_exhaust_the_stack() {
        let g = chain(50_000, false);
        assert!(g.detect_cycles().is_ok());
    }

    #[test]
    fn test_deep_cycle_reports_full_path() {
        let g = chain(50_000, true);
        let err = g.detect_cycles().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("n0 → n1 → n2 → "));
        assert!(msg.contains("n49998 → n49999 → n0"));
    }

    #[test]
    fn test_unknown_reference_is_ignored_by_graph() {
        let g = graph(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: "${ghost.output}" }
"#,
        );
        assert!(g.dependencies(0).is_empty());
        assert_eq!(g.index_of("ghost"), None);
    }
}
