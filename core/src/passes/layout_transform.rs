//! Propagate per-edge layouts through the graph and materialize explicit
//! `__layout_transform__` nodes wherever a producer and a consumer
//! disagree.
//!
//! The propagation is a single producers-first sweep, no fixed point: each
//! operator's layout rule sees the layouts actually arriving on its
//! inputs, overwrites the slots it has requirements on, and declares what
//! it produces. A disagreement between what arrives and what is requested
//! becomes a conversion node on that edge; an undefined producer is left
//! alone, the rule has accepted it as-is.

use crate::internal::*;
use crate::model::attributes;
use crate::ops::nn::LAYOUT_TRANSFORM;

pub struct LayoutTransform;

impl Pass for LayoutTransform {
    fn name(&self) -> &'static str {
        "LayoutTransform"
    }
    fn run(&self, reg: &OpRegistry, graph: &Graph) -> GraftResult<Graph> {
        layout_transform(reg, graph)
    }
}

fn inference_failure(node: &Node, reason: impl Into<String>) -> anyhow::Error {
    GraphError::InferenceFailure {
        node: node.name().to_string(),
        op: node.op().map(|op| op.name().to_string()).unwrap_or_default(),
        reason: reason.into(),
    }
    .into()
}

/// Requires the `layout_inputs` attribute (one layout per graph input, in
/// indexed input order). A prior `layout` attribute, when present, seeds
/// the advisory hints; a `layout_outputs` attribute requests conversions
/// on the graph outputs. Returns a fresh graph carrying a recomputed
/// per-edge `layout` vector.
pub fn layout_transform(reg: &OpRegistry, src: &Graph) -> GraftResult<Graph> {
    let input_layouts = src.layout_inputs()?;
    let output_layouts = src.layout_outputs();
    let prior = src.layouts();
    let idx = src.indexed();
    ensure!(
        input_layouts.len() == idx.input_nodes().len(),
        "layout_inputs has {} entries, graph has {} inputs",
        input_layouts.len(),
        idx.input_nodes().len()
    );

    let mut mirror: Vec<Option<Arc<Node>>> = vec![None; idx.num_nodes()];
    // layouts produced on each output of each rewritten node
    let mut produced: HashMap<NodeId, Vec<Layout>> = HashMap::new();
    let mut inserted = 0usize;

    for nid in 0..idx.num_nodes() {
        let source = &idx[nid].source;
        if source.is_variable() {
            let node = source.with_inputs(vec![]);
            let input = idx.input_index(nid).expect("variables are graph inputs");
            produced.insert(node.id(), vec![input_layouts[input].clone()]);
            mirror[nid] = Some(node);
            continue;
        }

        let mut inputs: Vec<NodeEntry> = idx[nid]
            .inputs
            .iter()
            .map(|e| {
                NodeEntry::new(
                    mirror[e.node_id].as_ref().expect("producers come first").clone(),
                    e.index,
                    e.version,
                )
            })
            .collect();

        // what actually arrives on each input
        let producer_layouts: Vec<Layout> = inputs
            .iter()
            .map(|e| produced[&e.node.id()][e.index as usize].clone())
            .collect();
        let mut request = producer_layouts.clone();
        let mut hints = vec![Layout::undef(); inputs.len()];
        let mut produce = vec![Layout::undef(); source.num_outputs()];
        if let Some(prior) = prior {
            for (slot, entry) in idx[nid].inputs.iter().enumerate() {
                hints[slot] = prior[idx.entry_id_of(entry)].clone();
            }
            for (output, layout) in produce.iter_mut().enumerate() {
                *layout = prior[idx.entry_id(nid, output)].clone();
            }
        }

        let op = source.op().expect("not a variable");
        let rule = op
            .layout_rule()
            .ok_or_else(|| inference_failure(source, "no layout rule registered"))?;
        let ok = rule(&source.attrs, &mut request, &hints, &mut produce)
            .with_context(|| format!("layout rule of {}", source))?;
        if !ok {
            bail!(inference_failure(source, "layout rule refused the configuration"));
        }
        ensure!(
            request.len() == inputs.len() && produce.len() == source.num_outputs(),
            inference_failure(source, "layout rule changed the arity")
        );
        for layout in request.iter().chain(produce.iter()) {
            if layout.is_defined() && !layout.is_complete() {
                bail!(inference_failure(source, format!("incomplete layout {}", layout)));
            }
        }

        for slot in 0..inputs.len() {
            let arriving = &producer_layouts[slot];
            let wanted = &request[slot];
            if arriving.is_defined() && arriving != wanted {
                let transform =
                    insert_transform(reg, &mut inserted, &inputs[slot], arriving, wanted)?;
                produced.insert(transform.node.id(), vec![wanted.clone()]);
                inputs[slot] = transform;
            }
        }

        let node = source.with_inputs(inputs);
        produced.insert(node.id(), produce);
        mirror[nid] = Some(node);
    }

    let mut outputs: Vec<NodeEntry> = idx
        .outputs()
        .iter()
        .map(|e| {
            NodeEntry::new(
                mirror[e.node_id].as_ref().expect("all nodes rewritten").clone(),
                e.index,
                e.version,
            )
        })
        .collect();

    if let Some(wanted_outputs) = output_layouts {
        ensure!(
            wanted_outputs.len() == outputs.len(),
            "layout_outputs has {} entries, graph has {} outputs",
            wanted_outputs.len(),
            outputs.len()
        );
        for (output, wanted) in outputs.iter_mut().zip(wanted_outputs) {
            let got = produced[&output.node.id()][output.index as usize].clone();
            if got.is_defined() && wanted.is_defined() && &got != wanted {
                let transform = insert_transform(reg, &mut inserted, output, &got, wanted)?;
                produced.insert(transform.node.id(), vec![wanted.clone()]);
                *output = transform;
            }
        }
    }

    let mut ret = Graph::with_outputs(outputs);
    let layouts = {
        let ret_idx = ret.indexed();
        let mut layouts = vec![Layout::undef(); ret_idx.num_entries()];
        for nid in 0..ret_idx.num_nodes() {
            if let Some(node_layouts) = produced.get(&ret_idx[nid].source.id()) {
                for (output, layout) in node_layouts.iter().enumerate() {
                    layouts[ret_idx.entry_id(nid, output)] = layout.clone();
                }
            }
        }
        layouts
    };
    ret.set_attr(attributes::LAYOUT, GraphAttr::Layouts(layouts));
    Ok(ret)
}

fn insert_transform(
    reg: &OpRegistry,
    counter: &mut usize,
    input: &NodeEntry,
    from: &Layout,
    to: &Layout,
) -> GraftResult<NodeEntry> {
    let name = format!("{}_{}_{}", input.node.name(), to, counter);
    *counter += 1;
    debug!("inserting {} ({} -> {})", name, from, to);
    reg.make_node(
        LAYOUT_TRANSFORM,
        name,
        vec![input.clone()],
        &[("src_layout", from.name()), ("dst_layout", to.name())],
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::OpDef;

    fn l(s: &str) -> Layout {
        s.parse().unwrap()
    }

    fn count_transforms(graph: &Graph) -> usize {
        let idx = graph.indexed();
        (0..idx.num_nodes()).filter(|&n| idx[n].source.op_is(LAYOUT_TRANSFORM)).count()
    }

    // a convolution-like operator accepting whatever arrives but always
    // producing a blocked layout
    fn registry_with_pack_conv() -> OpRegistry {
        let mut reg = OpRegistry::core();
        reg.register(
            OpDef::new("pack_conv").num_inputs(1).num_outputs(1).infer_layout(
                |_attrs, _request, _hints, produce| {
                    produce[0] = "NCHW16c".parse()?;
                    Ok(true)
                },
            ),
        );
        reg
    }

    fn conv_relu_graph(reg: &OpRegistry) -> Graph {
        let data = NodeEntry::of(&Node::variable("data"));
        let conv = reg.make_node("pack_conv", "conv", vec![data], &[]).unwrap();
        let relu = reg.make_node("relu", "relu", vec![conv], &[]).unwrap();
        Graph::with_outputs(vec![relu])
            .with_attr(attributes::LAYOUT_INPUTS, GraphAttr::LayoutInputs(vec![l("NCHW")]))
    }

    #[test]
    fn passthrough_consumer_keeps_the_blocked_layout() {
        let reg = registry_with_pack_conv();
        let src = conv_relu_graph(&reg)
            .with_attr(attributes::LAYOUT_OUTPUTS, GraphAttr::LayoutOutputs(vec![l("NCHW16c")]));
        let out = layout_transform(&reg, &src).unwrap();
        assert_eq!(count_transforms(&out), 0);
        let idx = out.indexed();
        let layouts = out.layouts().unwrap();
        let out_entry = idx.entry_id_of(&idx.outputs()[0]);
        assert_eq!(layouts[out_entry], l("NCHW16c"));
    }

    #[test]
    fn output_request_inserts_one_transform_after_the_last_node() {
        let reg = registry_with_pack_conv();
        let src = conv_relu_graph(&reg)
            .with_attr(attributes::LAYOUT_OUTPUTS, GraphAttr::LayoutOutputs(vec![l("NCHW")]));
        let out = layout_transform(&reg, &src).unwrap();
        assert_eq!(count_transforms(&out), 1);
        let idx = out.indexed();
        let last = &idx[idx.outputs()[0].node_id].source;
        assert!(last.op_is(LAYOUT_TRANSFORM));
        assert_eq!(last.inputs[0].node.name(), "relu");
        let layouts = out.layouts().unwrap();
        assert_eq!(layouts[idx.entry_id_of(&idx.outputs()[0])], l("NCHW"));
    }

    #[test]
    fn declared_layout_inserts_a_transform_on_the_data_edge() {
        let reg = OpRegistry::core();
        let data = NodeEntry::of(&Node::variable("data"));
        let weight = NodeEntry::of(&Node::variable("weight"));
        let conv = reg
            .make_node(
                "conv2d",
                "conv",
                vec![data, weight],
                &[
                    ("channels", "8"),
                    ("kernel_size", "(1,1)"),
                    ("use_bias", "0"),
                    ("layout", "NCHW16c"),
                ],
            )
            .unwrap();
        let src = Graph::with_outputs(vec![conv]).with_attr(
            attributes::LAYOUT_INPUTS,
            GraphAttr::LayoutInputs(vec![l("NCHW"), Layout::undef()]),
        );
        let out = layout_transform(&reg, &src).unwrap();
        assert_eq!(count_transforms(&out), 1);
        let idx = out.indexed();
        let conv = &idx[idx.outputs()[0].node_id].source;
        let transform = &conv.inputs[0].node;
        assert!(transform.op_is(LAYOUT_TRANSFORM));
        assert_eq!(transform.name(), "data_NCHW16c_0");
        assert_eq!(transform.attrs.dict["src_layout"], "NCHW");
        assert_eq!(transform.attrs.dict["dst_layout"], "NCHW16c");
        // the undefined weight producer is left alone
        assert!(conv.inputs[1].node.is_variable());
    }

    #[test]
    fn producers_and_consumers_agree_on_every_edge() {
        let reg = registry_with_pack_conv();
        let src = conv_relu_graph(&reg)
            .with_attr(attributes::LAYOUT_OUTPUTS, GraphAttr::LayoutOutputs(vec![l("NCHW")]));
        let out = layout_transform(&reg, &src).unwrap();
        let layouts = out.layouts().unwrap();
        let idx = out.indexed();
        for nid in 0..idx.num_nodes() {
            let node = &idx[nid].source;
            let Some(op) = node.op() else { continue };
            let Some(rule) = op.layout_rule() else { continue };
            let mut request: Vec<Layout> = idx[nid]
                .inputs
                .iter()
                .map(|e| layouts[idx.entry_id_of(e)].clone())
                .collect();
            let hints = vec![Layout::undef(); request.len()];
            let mut produce: Vec<Layout> = (0..node.num_outputs())
                .map(|o| layouts[idx.entry_id(nid, o)].clone())
                .collect();
            let arriving = request.clone();
            assert!(rule(&node.attrs, &mut request, &hints, &mut produce).unwrap());
            // a second inference over the settled layouts requests nothing new
            for (slot, wanted) in request.iter().enumerate() {
                if arriving[slot].is_defined() {
                    assert_eq!(&arriving[slot], wanted, "edge {} of {}", slot, node);
                }
            }
        }
    }

    #[test]
    fn running_twice_is_a_fixed_point() {
        let reg = registry_with_pack_conv();
        let src = conv_relu_graph(&reg)
            .with_attr(attributes::LAYOUT_OUTPUTS, GraphAttr::LayoutOutputs(vec![l("NCHW")]));
        let once = layout_transform(&reg, &src).unwrap();
        let first = count_transforms(&once);
        let again = once
            .clone()
            .with_attr(attributes::LAYOUT_INPUTS, GraphAttr::LayoutInputs(vec![l("NCHW")]))
            .with_attr(attributes::LAYOUT_OUTPUTS, GraphAttr::LayoutOutputs(vec![l("NCHW")]));
        let twice = layout_transform(&reg, &again).unwrap();
        assert_eq!(count_transforms(&twice), first);
    }

    #[test]
    fn binary_consumers_pull_both_sides_to_one_layout() {
        let reg = registry_with_pack_conv();
        let a = NodeEntry::of(&Node::variable("a"));
        let b = NodeEntry::of(&Node::variable("b"));
        let conv = reg.make_node("pack_conv", "conv", vec![a], &[]).unwrap();
        let add = reg.make_node("broadcast_add", "add", vec![conv, b], &[]).unwrap();
        let src = Graph::with_outputs(vec![add]).with_attr(
            attributes::LAYOUT_INPUTS,
            GraphAttr::LayoutInputs(vec![l("NCHW"), l("NCHW")]),
        );
        // rhs arrives NCHW, lhs NCHW16c: the rule settles on the lhs
        // layout, one transform fixes the rhs
        let out = layout_transform(&reg, &src).unwrap();
        assert_eq!(count_transforms(&out), 1);
        let idx = out.indexed();
        let add = &idx[idx.outputs()[0].node_id].source;
        assert!(add.inputs[1].node.op_is(LAYOUT_TRANSFORM));
        let layouts = out.layouts().unwrap();
        assert_eq!(layouts[idx.entry_id_of(&idx.outputs()[0])], l("NCHW16c"));
    }

    #[test]
    fn missing_layout_rule_is_an_inference_failure() {
        let mut reg = OpRegistry::core();
        reg.register(OpDef::new("opaque").num_inputs(1).num_outputs(1));
        let x = NodeEntry::of(&Node::variable("x"));
        let node = reg.make_node("opaque", "node", vec![x], &[]).unwrap();
        let src = Graph::with_outputs(vec![node])
            .with_attr(attributes::LAYOUT_INPUTS, GraphAttr::LayoutInputs(vec![l("NCHW")]));
        let err = layout_transform(&reg, &src).unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(GraphError::InferenceFailure { .. })));
    }

    #[test]
    fn incomplete_layout_is_an_inference_failure() {
        let mut reg = OpRegistry::core();
        reg.register(OpDef::new("sloppy").num_inputs(1).num_outputs(1).infer_layout(
            |_attrs, _request, _hints, produce| {
                produce[0] = "NCHW_c".parse()?;
                Ok(true)
            },
        ));
        let x = NodeEntry::of(&Node::variable("x"));
        let node = reg.make_node("sloppy", "node", vec![x], &[]).unwrap();
        let src = Graph::with_outputs(vec![node])
            .with_attr(attributes::LAYOUT_INPUTS, GraphAttr::LayoutInputs(vec![l("NCHW")]));
        let err = layout_transform(&reg, &src).unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(GraphError::InferenceFailure { .. })));
    }

    #[test]
    fn requires_layout_inputs() {
        let reg = OpRegistry::core();
        let src = Graph::with_outputs(vec![NodeEntry::of(&Node::variable("x"))]);
        let err = layout_transform(&reg, &src).unwrap_err();
        assert!(matches!(
            err.downcast_ref(),
            Some(GraphError::MissingAttribute { attr: "layout_inputs" })
        ));
    }
}
