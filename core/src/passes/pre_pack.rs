//! Let operators pre-pack their weights into hardware-friendly layouts.
//!
//! Any operator whose registry entry carries a `weight_prepack` hook is
//! offered for replacement. The hook sees the node's rewired inputs and
//! the shape/dtype of each input tensor as recorded on the *source* graph:
//! pre-packing decides based on the layout the tensors had before any
//! rewriting, so the original attribute vectors are authoritative.

use crate::internal::*;
use crate::model::attributes;
use crate::transform::graph_transform_with_mirror;

pub struct PrePack;

impl Pass for PrePack {
    fn name(&self) -> &'static str {
        "PrePack"
    }
    fn run(&self, reg: &OpRegistry, graph: &Graph) -> GraftResult<Graph> {
        pre_pack(reg, graph)
    }
}

/// Requires the `shape` and `dtype` attributes. A `layout` attribute, when
/// present, is carried over onto the edges of every node the pass leaves
/// in place; edges internal to injected sub-graphs stay undefined for the
/// LayoutTransform pass to settle.
pub fn pre_pack(_reg: &OpRegistry, src: &Graph) -> GraftResult<Graph> {
    let shapes = src.shapes()?;
    let dtypes = src.dtypes()?;
    let idx = src.indexed();

    let mut replaced: HashSet<NodeId> = HashSet::new();
    let (mut ret, mirror) = graph_transform_with_mirror(src, |nid, node| {
        let Some(op) = node.op() else { return Ok(None) };
        let Some(prepack) = op.prepack_rule() else { return Ok(None) };
        let facts = idx[nid]
            .inputs
            .iter()
            .map(|e| {
                let entry = idx.entry_id_of(e);
                TensorFact::new(shapes[entry].clone(), dtypes[entry])
            })
            .collect::<Vec<_>>();
        let outputs = prepack(&node.attrs, &node.inputs, &facts)
            .with_context(|| format!("pre-packing {}", node))?;
        debug!("pre-packed {}", node);
        replaced.insert(idx[nid].source.id());
        Ok(Some(outputs))
    })?;

    if let Some(prior) = src.layouts() {
        let layouts = restore_layouts(&idx, prior, &ret, &mirror, &replaced);
        ret.set_attr(attributes::LAYOUT, GraphAttr::Layouts(layouts));
    }
    Ok(ret)
}

// copy the recorded input and output edge layouts of every preserved
// source node onto its counterpart in the rewritten graph
fn restore_layouts(
    idx: &IndexedGraph,
    prior: &[Layout],
    ret: &Graph,
    mirror: &HashMap<NodeId, Vec<NodeEntry>>,
    replaced: &HashSet<NodeId>,
) -> Vec<Layout> {
    let ret_idx = ret.indexed();
    let mut layouts = vec![Layout::undef(); ret_idx.num_entries()];
    for nid in 0..idx.num_nodes() {
        let source = &idx[nid].source;
        if replaced.contains(&source.id()) {
            continue;
        }
        let Some(outputs) = mirror.get(&source.id()) else { continue };
        let Some(new_nid) = outputs
            .first()
            .and_then(|e| ret_idx.index_of(e.node.id()))
        else {
            // preserved but no longer reachable from the outputs
            continue;
        };
        for output in 0..source.num_outputs() {
            layouts[ret_idx.entry_id(new_nid, output)] = prior[idx.entry_id(nid, output)].clone();
        }
        for (slot, entry) in ret_idx[new_nid].inputs.iter().enumerate() {
            layouts[ret_idx.entry_id_of(entry)] =
                prior[idx.entry_id_of(&idx[nid].inputs[slot])].clone();
        }
    }
    layouts
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::{nn, OpDef, OpRegistry};

    fn l(s: &str) -> Layout {
        s.parse().unwrap()
    }

    // data -> conv2d -> relu, with shape/dtype vectors attached
    fn conv_graph(reg: &OpRegistry) -> Graph {
        let data = NodeEntry::of(&Node::variable("data"));
        let weight = NodeEntry::of(&Node::variable("weight"));
        let conv = reg
            .make_node(
                "conv2d",
                "conv",
                vec![data, weight],
                &[("channels", "32"), ("kernel_size", "(1,1)"), ("use_bias", "0")],
            )
            .unwrap();
        let relu = reg.make_node("relu", "relu", vec![conv], &[]).unwrap();
        // entries: data, weight, conv, relu
        let shapes = vec![
            tvec!(1, 16, 8, 8),
            tvec!(32, 16, 1, 1),
            tvec!(1, 32, 8, 8),
            tvec!(1, 32, 8, 8),
        ];
        Graph::with_outputs(vec![relu])
            .with_attr(attributes::SHAPE, GraphAttr::Shapes(shapes))
            .with_attr(attributes::DTYPE, GraphAttr::DTypes(vec![DatumType::F32; 4]))
    }

    // a conv2d pre-pack hook: reorder the weight, then run the packed
    // kernel variant
    fn register_conv_prepack(reg: &mut OpRegistry) {
        let factory = reg.clone();
        let mut conv = (**reg.get("conv2d").unwrap()).clone();
        conv = conv.weight_prepack(move |attrs, inputs, facts| {
            let param = attrs.params::<nn::Conv2DParam>()?;
            ensure!(facts[1].shape.len() == 4, "weight shape must be known");
            ensure!(facts[0].datum_type == DatumType::F32, "float weights only");
            let packed = factory.make_node(
                "reorder",
                format!("{}_weight_packed", attrs.name),
                vec![inputs[1].clone()],
                &[("oc_bn", "16"), ("ic_bn", "16")],
            )?;
            let conv = factory.make_node(
                "conv2d_nchw_kernel_packed",
                attrs.name.clone(),
                vec![inputs[0].clone(), packed],
                &[
                    ("channels", &param.channels.to_string()),
                    ("kernel_size", "(1,1)"),
                    ("use_bias", "0"),
                ],
            )?;
            Ok(vec![conv])
        });
        reg.register(conv);
    }

    #[test]
    fn operators_without_a_hook_pass_through() {
        let reg = OpRegistry::core();
        let src = conv_graph(&reg);
        let out = pre_pack(&reg, &src).unwrap();
        assert_eq!(out.indexed().num_nodes(), src.indexed().num_nodes());
    }

    #[test]
    fn hooked_operator_is_replaced_by_its_subgraph() {
        let mut reg = OpRegistry::core();
        register_conv_prepack(&mut reg);
        let src = conv_graph(&reg);
        let out = pre_pack(&reg, &src).unwrap();
        let idx = out.indexed();
        let names: Vec<&str> = (0..idx.num_nodes())
            .filter_map(|n| idx[n].source.op().map(|_| idx[n].source.name()))
            .collect();
        assert!(names.contains(&"conv_weight_packed"));
        let relu = &idx[idx.outputs()[0].node_id].source;
        assert_eq!(relu.inputs[0].node.op().unwrap().name(), "conv2d_nchw_kernel_packed");
    }

    #[test]
    fn prior_layouts_survive_on_preserved_nodes() {
        let mut reg = OpRegistry::core();
        register_conv_prepack(&mut reg);
        let mut src = conv_graph(&reg);
        src.set_attr(
            attributes::LAYOUT,
            GraphAttr::Layouts(vec![l("NCHW"), l("OIHW"), l("NCHW"), l("NCHW")]),
        );
        let out = pre_pack(&reg, &src).unwrap();
        let layouts = out.layouts().unwrap().to_vec();
        let idx = out.indexed();
        // the relu node was preserved: its input and output edges keep NCHW
        let relu = (0..idx.num_nodes()).find(|&n| idx[n].source.name() == "relu").unwrap();
        assert_eq!(layouts[idx.entry_id(relu, 0)], l("NCHW"));
        assert_eq!(layouts[idx.entry_id_of(&idx[relu].inputs[0])], l("NCHW"));
        // the injected reorder's output edge is left undefined
        let packed =
            (0..idx.num_nodes()).find(|&n| idx[n].source.name() == "conv_weight_packed").unwrap();
        assert_eq!(layouts[idx.entry_id(packed, 0)], Layout::undef());
    }

    #[test]
    fn tensor_facts_come_from_the_source_graph() {
        let mut reg = OpRegistry::core();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        let mut relu = (**reg.get("relu").unwrap()).clone();
        relu = relu.weight_prepack(move |_, inputs, facts| {
            *seen2.lock().unwrap() = Some(facts.to_vec());
            Ok(vec![inputs[0].clone()])
        });
        reg.register(relu);
        let src = conv_graph(&reg);
        pre_pack(&reg, &src).unwrap();
        let facts = seen.lock().unwrap().clone().unwrap();
        assert_eq!(facts, vec![TensorFact::new(tvec!(1, 32, 8, 8), DatumType::F32)]);
    }

    #[test]
    fn requires_shape_and_dtype() {
        let reg = OpRegistry::core();
        let src = Graph::with_outputs(vec![NodeEntry::of(&Node::variable("x"))]);
        let err = pre_pack(&reg, &src).unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(GraphError::MissingAttribute { .. })));
    }
}
