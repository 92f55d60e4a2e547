use std::marker::PhantomData;
use std::ops::Index;

use crate::internal::*;

/// An input edge of an indexed node, expressed with dense ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct IndexedEntry {
    pub node_id: usize,
    pub index: u32,
    pub version: u32,
}

/// A node as seen through the indexed view.
#[derive(Debug)]
pub struct IndexedNode {
    /// The underlying shared node.
    pub source: Arc<Node>,
    /// Inputs rewritten to dense ids.
    pub inputs: TVec<IndexedEntry>,
}

/// Dense, topologically ordered, read-only view of a graph.
///
/// Every node reachable from the graph outputs gets an id in `[0..N)`,
/// producers before consumers, and every output tensor of every node gets
/// an entry id in `[0..E)`. The per-edge attribute vectors (`shape`,
/// `dtype`, `layout`) are indexed by entry id.
///
/// The view borrows the graph it was built from and must not outlive it.
pub struct IndexedGraph<'g> {
    nodes: Vec<IndexedNode>,
    input_nodes: Vec<usize>,
    outputs: Vec<IndexedEntry>,
    entry_offsets: Vec<usize>,
    index_of: HashMap<NodeId, usize>,
    _graph: PhantomData<&'g Graph>,
}

impl<'g> IndexedGraph<'g> {
    pub(crate) fn new(graph: &'g Graph) -> IndexedGraph<'g> {
        let mut index_of = HashMap::<NodeId, usize>::new();
        let mut nodes: Vec<IndexedNode> = vec![];
        // iterative depth-first post-order: every input of a node is
        // numbered before the node itself
        let mut stack: Vec<(Arc<Node>, usize)> = vec![];
        for output in &graph.outputs {
            if index_of.contains_key(&output.node.id()) {
                continue;
            }
            stack.push((output.node.clone(), 0));
            while let Some((node, visited)) = stack.last_mut() {
                if *visited < node.inputs.len() {
                    let child = node.inputs[*visited].node.clone();
                    *visited += 1;
                    if !index_of.contains_key(&child.id()) {
                        stack.push((child, 0));
                    }
                } else {
                    let (node, _) = stack.pop().unwrap();
                    let inputs = node
                        .inputs
                        .iter()
                        .map(|e| IndexedEntry::new(index_of[&e.node.id()], e.index, e.version))
                        .collect();
                    index_of.insert(node.id(), nodes.len());
                    nodes.push(IndexedNode { source: node, inputs });
                }
            }
        }
        let mut entry_offsets = Vec::with_capacity(nodes.len() + 1);
        entry_offsets.push(0);
        for node in &nodes {
            entry_offsets.push(entry_offsets.last().unwrap() + node.source.num_outputs());
        }
        let input_nodes = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.source.is_variable())
            .map(|(ix, _)| ix)
            .collect();
        let outputs = graph
            .outputs
            .iter()
            .map(|e| IndexedEntry::new(index_of[&e.node.id()], e.index, e.version))
            .collect();
        IndexedGraph { nodes, input_nodes, outputs, entry_offsets, index_of, _graph: PhantomData }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of tensor edges.
    pub fn num_entries(&self) -> usize {
        *self.entry_offsets.last().unwrap()
    }

    /// Dense id of the `output`-th tensor of node `nid`.
    pub fn entry_id(&self, nid: usize, output: usize) -> usize {
        debug_assert!(output < self.nodes[nid].source.num_outputs());
        self.entry_offsets[nid] + output
    }

    pub fn entry_id_of(&self, entry: &IndexedEntry) -> usize {
        self.entry_id(entry.node_id, entry.index as usize)
    }

    pub fn node(&self, nid: usize) -> &IndexedNode {
        &self.nodes[nid]
    }

    /// Dense id of a node, by identity. `None` for nodes not reachable
    /// from the graph outputs.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.index_of.get(&id).copied()
    }

    /// Dense ids of the variable nodes, in topological order. The
    /// `layout_inputs` graph attribute follows this order.
    pub fn input_nodes(&self) -> &[usize] {
        &self.input_nodes
    }

    /// Position of node `nid` among the graph inputs.
    pub fn input_index(&self, nid: usize) -> Option<usize> {
        self.input_nodes.iter().position(|&n| n == nid)
    }

    pub fn outputs(&self) -> &[IndexedEntry] {
        &self.outputs
    }
}

impl Index<usize> for IndexedGraph<'_> {
    type Output = IndexedNode;
    fn index(&self, nid: usize) -> &IndexedNode {
        &self.nodes[nid]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::OpRegistry;

    // x --> relu --> add --> out
    //   \__________/
    fn diamond(reg: &OpRegistry) -> Graph {
        let x = NodeEntry::of(&Node::variable("x"));
        let relu = reg.make_node("relu", "relu", vec![x.clone()], &[]).unwrap();
        let add = reg.make_node("elemwise_add", "add", vec![relu, x], &[]).unwrap();
        Graph::with_outputs(vec![add])
    }

    #[test]
    fn producers_come_first() {
        let reg = OpRegistry::core();
        let graph = diamond(&reg);
        let idx = graph.indexed();
        assert_eq!(idx.num_nodes(), 3);
        for nid in 0..idx.num_nodes() {
            for input in idx[nid].inputs.iter() {
                assert!(input.node_id < nid);
            }
        }
        assert_eq!(idx[idx.num_nodes() - 1].source.name(), "add");
    }

    #[test]
    fn shared_nodes_are_numbered_once() {
        let reg = OpRegistry::core();
        let graph = diamond(&reg);
        let idx = graph.indexed();
        assert_eq!(idx.num_nodes(), 3);
        assert_eq!(idx.num_entries(), 3);
        assert_eq!(idx.input_nodes(), &[0]);
    }

    #[test]
    fn entry_ids_are_dense() {
        let reg = OpRegistry::core();
        let x = NodeEntry::of(&Node::variable("x"));
        let dropout =
            reg.build_node("dropout", "drop", vec![x], &[("rate", "0.5")]).unwrap();
        let relu = reg
            .make_node("relu", "relu", vec![NodeEntry::of(&dropout)], &[])
            .unwrap();
        let graph = Graph::with_outputs(vec![relu, NodeEntry::new(dropout, 1, 0)]);
        let idx = graph.indexed();
        // x, dropout (2 outputs), relu
        assert_eq!(idx.num_entries(), 4);
        let drop_id = (0..idx.num_nodes()).find(|&n| idx[n].source.name() == "drop").unwrap();
        assert_eq!(idx.entry_id(drop_id, 1), idx.entry_id(drop_id, 0) + 1);
        let relu_id = (0..idx.num_nodes()).find(|&n| idx[n].source.name() == "relu").unwrap();
        assert_eq!(idx.entry_id_of(&idx[relu_id].inputs[0]), idx.entry_id(drop_id, 0));
    }

    #[test]
    fn outputs_are_remapped() {
        let reg = OpRegistry::core();
        let graph = diamond(&reg);
        let idx = graph.indexed();
        assert_eq!(idx.outputs().len(), 1);
        assert_eq!(idx.outputs()[0].node_id, idx.num_nodes() - 1);
    }
}
