//! Generic bottom-up graph rewriting.
//!
//! [graph_transform] walks a source graph producers-first, shallow-clones
//! every node with its inputs rewired into the new graph, and offers each
//! operator node to a rewrite rule. The rule either returns the outputs of
//! a replacement sub-graph or declines, and downstream nodes are rewired
//! accordingly. Source nodes are never referenced by the result.

use crate::internal::*;

/// What a rewrite rule answers: `None` to keep the node, or the outputs of
/// the sub-graph standing in for it — exactly as many as the node declares.
pub type RewriteOutputs = Option<Vec<NodeEntry>>;

/// Rewrite `src` bottom-up under `rule`.
///
/// The rule receives the dense id of the source node and its fresh clone,
/// whose inputs already point into the new graph; anything it builds from
/// that clone is therefore free of references into `src`. Variables are
/// cloned as-is and never offered to the rule. Every source node is
/// visited exactly once.
pub fn graph_transform<R>(src: &Graph, rule: R) -> GraftResult<Graph>
where
    R: FnMut(usize, &Arc<Node>) -> GraftResult<RewriteOutputs>,
{
    Ok(graph_transform_with_mirror(src, rule)?.0)
}

/// [graph_transform], also handing back the mirror map from source node
/// identity to replacement outputs. PrePack uses it to re-attach per-edge
/// attributes onto preserved nodes.
pub fn graph_transform_with_mirror<R>(
    src: &Graph,
    mut rule: R,
) -> GraftResult<(Graph, HashMap<NodeId, Vec<NodeEntry>>)>
where
    R: FnMut(usize, &Arc<Node>) -> GraftResult<RewriteOutputs>,
{
    let idx = src.indexed();
    let mut mirror: HashMap<NodeId, Vec<NodeEntry>> = HashMap::new();
    for nid in 0..idx.num_nodes() {
        let source = &idx[nid].source;
        let inputs = source
            .inputs
            .iter()
            .map(|e| remap(&mirror, e))
            .collect::<GraftResult<Vec<_>>>()?;
        let node = source.with_inputs(inputs);
        if node.is_variable() {
            mirror.insert(source.id(), vec![NodeEntry::of(&node)]);
            continue;
        }
        let outputs = match rule(nid, &node)? {
            Some(outputs) => {
                let expected = source.num_outputs();
                if outputs.len() != expected {
                    bail!(GraphError::ArityMismatch {
                        node: source.name().to_string(),
                        op: source.op().map(|op| op.name().to_string()).unwrap_or_default(),
                        expected,
                        got: outputs.len(),
                    });
                }
                trace!("rewrote {} into a {}-output subgraph", node, outputs.len());
                outputs
            }
            None => {
                (0..node.num_outputs()).map(|i| NodeEntry::new(node.clone(), i as u32, 0)).collect()
            }
        };
        mirror.insert(source.id(), outputs);
    }
    let outputs =
        src.outputs.iter().map(|e| remap(&mirror, e)).collect::<GraftResult<Vec<_>>>()?;
    Ok((Graph::with_outputs(outputs), mirror))
}

fn remap(mirror: &HashMap<NodeId, Vec<NodeEntry>>, entry: &NodeEntry) -> GraftResult<NodeEntry> {
    let outputs = mirror
        .get(&entry.node.id())
        .with_context(|| format!("producer of {:?} not mirrored yet", entry))?;
    outputs
        .get(entry.index as usize)
        .cloned()
        .with_context(|| format!("replacement of {:?} has no output {}", entry, entry.index))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::OpRegistry;

    // x -> relu -> softmax, with relu also a graph output
    fn sample(reg: &OpRegistry) -> Graph {
        let x = NodeEntry::of(&Node::variable("x"));
        let relu = reg.make_node("relu", "relu", vec![x], &[]).unwrap();
        let softmax = reg.make_node("softmax", "softmax", vec![relu.clone()], &[]).unwrap();
        Graph::with_outputs(vec![softmax, relu])
    }

    #[test]
    fn identity_rewrite_clones_the_graph() {
        let reg = OpRegistry::core();
        let src = sample(&reg);
        let src_idx = src.indexed();
        let src_ids: HashSet<NodeId> =
            (0..src_idx.num_nodes()).map(|n| src_idx[n].source.id()).collect();
        let out = graph_transform(&src, |_, _| Ok(None)).unwrap();
        let idx = out.indexed();
        assert_eq!(idx.num_nodes(), 3);
        // no node of the result is a node of the source
        for nid in 0..idx.num_nodes() {
            assert!(!src_ids.contains(&idx[nid].source.id()));
        }
        assert_eq!(idx[idx.outputs()[0].node_id].source.name(), "softmax");
        assert_eq!(idx[idx.outputs()[1].node_id].source.name(), "relu");
    }

    #[test]
    fn every_operator_node_is_offered_once_in_topological_order() {
        let reg = OpRegistry::core();
        let src = sample(&reg);
        let mut seen = vec![];
        graph_transform(&src, |nid, node| {
            seen.push((nid, node.name().to_string()));
            Ok(None)
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(seen[0].1, "relu");
        assert_eq!(seen[1].1, "softmax");
    }

    #[test]
    fn replacement_rewires_consumers() {
        let reg = OpRegistry::core();
        let src = sample(&reg);
        let out = graph_transform(&src, |_, node| {
            if node.op_is("relu") {
                let sig =
                    reg.make_node("sigmoid", "sigmoid", vec![node.inputs[0].clone()], &[])?;
                Ok(Some(vec![sig]))
            } else {
                Ok(None)
            }
        })
        .unwrap();
        let idx = out.indexed();
        let names: Vec<&str> =
            (0..idx.num_nodes()).map(|n| idx[n].source.name()).collect();
        assert!(names.contains(&"sigmoid") && !names.contains(&"relu"));
        // the second graph output (previously relu) now aliases the sigmoid
        assert_eq!(idx[idx.outputs()[1].node_id].source.name(), "sigmoid");
        let softmax = idx[idx.outputs()[0].node_id].source.clone();
        assert_eq!(softmax.inputs[0].node.name(), "sigmoid");
    }

    #[test]
    fn wrong_output_arity_is_refused() {
        let reg = OpRegistry::core();
        let src = sample(&reg);
        let err = graph_transform(&src, |_, node| {
            if node.op_is("relu") {
                Ok(Some(vec![node.inputs[0].clone(), node.inputs[0].clone()]))
            } else {
                Ok(None)
            }
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref(),
            Some(GraphError::ArityMismatch { expected: 1, got: 2, .. })
        ));
    }

    #[test]
    fn rule_errors_abort_the_pass() {
        let reg = OpRegistry::core();
        let src = sample(&reg);
        assert!(graph_transform(&src, |_, _| bail!("no")).is_err());
    }
}
