//! Specialize a training graph for inference: batch normalization becomes
//! an affine multiply-add over precomputed statistics, dropout becomes a
//! plain alias of its input.

use crate::internal::*;
use crate::ops::nn::{BatchNormParam, UNDEF_OP};
use crate::transform::graph_transform;

pub struct SimplifyInference;

impl Pass for SimplifyInference {
    fn name(&self) -> &'static str {
        "SimplifyInference"
    }
    fn run(&self, reg: &OpRegistry, graph: &Graph) -> GraftResult<Graph> {
        simplify_inference(reg, graph)
    }
}

/// Requires the `shape` attribute of the input graph: the batch-norm
/// rewrite needs the rank (and block size) of the data tensor.
pub fn simplify_inference(reg: &OpRegistry, src: &Graph) -> GraftResult<Graph> {
    let shapes = src.shapes()?;
    let idx = src.indexed();
    graph_transform(src, |nid, node| {
        if node.op_is("batch_norm") || node.op_is("batch_norm_inference_nchwc") {
            let dshape = &shapes[idx.entry_id(nid, 0)];
            debug!("unpacking {} over data shape {:?}", node, dshape);
            Ok(Some(batch_norm_to_affine(reg, node, dshape)?))
        } else if node.op_is("dropout") {
            debug!("dropping {}", node);
            let mask = reg.make_node(UNDEF_OP, "undef", vec![], &[])?;
            Ok(Some(vec![node.inputs[0].clone(), mask]))
        } else {
            Ok(None)
        }
    })
}

/// Rewrite `batch_norm(data, gamma, beta, mean, var)` into
/// `broadcast_add(broadcast_mul(data, scale), shift)` with
///
/// ```text
/// scale = 1 / sqrt(var + epsilon) * gamma   (gamma when param.scale)
/// shift = -mean * scale + beta              (beta when param.center)
/// ```
///
/// The 1-D `scale`/`shift` vectors are reshaped to broadcast against the
/// data: blocked 5-D data reorders them to `(C/bn, bn)` first, flat 4-D
/// data goes through plain axis expansion. The two statistics outputs are
/// replaced by dead sentinels, so nothing downstream may read them.
fn batch_norm_to_affine(
    reg: &OpRegistry,
    node: &Arc<Node>,
    dshape: &Shape,
) -> GraftResult<Vec<NodeEntry>> {
    ensure!(!dshape.is_empty(), "node {}: data shape is not known", node.name());
    let param = node.attrs.params::<BatchNormParam>()?.clone();
    let name = node.name();
    let blocked = dshape.len() == 5;

    let data = node.inputs[0].clone();
    let gamma = node.inputs[1].clone();
    let beta = node.inputs[2].clone();
    let moving_mean = node.inputs[3].clone();
    let moving_var = node.inputs[4].clone();

    let var_add_eps = reg.make_node(
        "__add_scalar__",
        format!("{name}_add_eps"),
        vec![moving_var],
        &[("scalar", &param.epsilon.to_string())],
    )?;
    let sqrt = reg.make_node("sqrt", format!("{name}_sqrt"), vec![var_add_eps], &[])?;
    let mut scale = reg.make_node(
        "__rdiv_scalar__",
        format!("{name}_div"),
        vec![sqrt],
        &[("scalar", "1")],
    )?;
    if param.scale {
        scale = reg.make_node(
            "elemwise_mul",
            format!("{name}_gamma_mul_div"),
            vec![scale, gamma],
            &[],
        )?;
    }

    let neg_mean = reg.make_node("negative", format!("{name}_neg_mean"), vec![moving_mean], &[])?;
    let mut shift = reg.make_node(
        "elemwise_mul",
        format!("{name}_neg_mean_mul_a"),
        vec![neg_mean, scale.clone()],
        &[],
    )?;
    if param.center {
        shift =
            reg.make_node("elemwise_add", format!("{name}_add_beta"), vec![shift, beta], &[])?;
    }

    if blocked {
        let bn = dshape[4];
        scale = reorder_for_blocked_data(reg, scale, bn)?;
        shift = reorder_for_blocked_data(reg, shift, bn)?;
    } else {
        scale = expand_to_match_axis(reg, scale, dshape.len(), param.axis)?;
        shift = expand_to_match_axis(reg, shift, dshape.len(), param.axis)?;
    }

    let out = reg.make_node(
        "broadcast_mul",
        format!("{name}_a_mul_data"),
        vec![data, scale],
        &[],
    )?;
    let out =
        reg.make_node("broadcast_add", format!("{name}_out"), vec![out, shift], &[])?;
    // referencing the statistics outputs after this rewrite is invalid
    let mean = reg.make_node(UNDEF_OP, "undef", vec![], &[])?;
    let var = reg.make_node(UNDEF_OP, "undef", vec![], &[])?;
    Ok(vec![out, mean, var])
}

// (C,) -> (C/bn, bn) -> (C/bn, 1, 1, bn), broadcastable against NCHWc data
fn reorder_for_blocked_data(
    reg: &OpRegistry,
    entry: NodeEntry,
    bn: usize,
) -> GraftResult<NodeEntry> {
    let name = entry.node.name().to_string();
    let reordered = reg.make_node(
        "bn_reorder",
        format!("{name}_bnreorder"),
        vec![entry],
        &[("bn", &bn.to_string())],
    )?;
    reg.make_node(
        "expand_dims",
        format!("{name}_expand"),
        vec![reordered],
        &[("axis", "1"), ("num_newaxis", "2")],
    )
}

// (C,) -> (1, ..axis.., C, 1, ..ndim-axis-1.., 1): trailing axes first,
// then the leading ones, so the vector lines up with `axis` of the data
fn expand_to_match_axis(
    reg: &OpRegistry,
    entry: NodeEntry,
    ndim: usize,
    axis: usize,
) -> GraftResult<NodeEntry> {
    ensure!(axis < ndim, "cannot broadcast to axis {} of a {}-d tensor", axis, ndim);
    let mut entry = entry;
    let trailing = ndim - axis - 1;
    if trailing > 0 {
        let name = entry.node.name().to_string();
        entry = reg.make_node(
            "expand_dims",
            format!("{name}_expand_axis"),
            vec![entry],
            &[("axis", "1"), ("num_newaxis", &trailing.to_string())],
        )?;
    }
    if axis > 0 {
        let name = entry.node.name().to_string();
        entry = reg.make_node(
            "expand_dims",
            format!("{name}_expand_0axis"),
            vec![entry],
            &[("axis", "0"), ("num_newaxis", &axis.to_string())],
        )?;
    }
    Ok(entry)
}
