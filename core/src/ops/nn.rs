//! The standard operator set: parameter structs, their parsers, and the
//! shape/type/layout rules the passes consult.
//!
//! Shape and type rules follow the mutual-inference protocol: vectors of
//! per-slot values, zero-rank meaning unknown, refined in place.

use super::elemwise;
use super::{attr, attr_bool, attr_dims, attr_or, OpDef, OpRegistry};
use crate::internal::*;

/// Name of the operator materialized between a producer and a consumer
/// that disagree on layout.
pub const LAYOUT_TRANSFORM: &str = "__layout_transform__";
/// Name of the dead-output sentinel operator.
pub const UNDEF_OP: &str = "__undef__";

#[derive(Debug, Clone)]
pub struct Conv2DParam {
    pub channels: usize,
    pub kernel_size: TVec<usize>,
    pub strides: TVec<usize>,
    pub padding: TVec<usize>,
    pub dilation: TVec<usize>,
    pub groups: usize,
    pub use_bias: bool,
    pub layout: Layout,
}
impl OpParams for Conv2DParam {}

#[derive(Debug, Clone)]
pub struct Conv2DNCHWcParam {
    pub channels: usize,
    pub kernel_size: TVec<usize>,
    pub strides: TVec<usize>,
    pub padding: TVec<usize>,
    pub dilation: TVec<usize>,
    pub groups: usize,
    pub use_bias: bool,
    pub ic_bn: usize,
    pub oc_bn: usize,
}
impl OpParams for Conv2DNCHWcParam {}

#[derive(Debug, Clone)]
pub struct BatchNormParam {
    pub epsilon: f32,
    pub axis: usize,
    pub center: bool,
    pub scale: bool,
}
impl OpParams for BatchNormParam {}

#[derive(Debug, Clone)]
pub struct DropoutParam {
    pub rate: f32,
}
impl OpParams for DropoutParam {}

#[derive(Debug, Clone)]
pub struct ScalarParam {
    pub scalar: f64,
}
impl OpParams for ScalarParam {}

#[derive(Debug, Clone)]
pub struct ExpandDimsParam {
    pub axis: usize,
    pub num_newaxis: usize,
}
impl OpParams for ExpandDimsParam {}

#[derive(Debug, Clone)]
pub struct ReorderParam {
    pub oc_bn: usize,
    pub ic_bn: usize,
}
impl OpParams for ReorderParam {}

#[derive(Debug, Clone)]
pub struct BnReorderParam {
    pub bn: usize,
}
impl OpParams for BnReorderParam {}

#[derive(Debug, Clone)]
pub struct LayoutTransformParam {
    pub src_layout: Layout,
    pub dst_layout: Layout,
}
impl OpParams for LayoutTransformParam {}

/// Merge a freshly inferred shape into a slot: fill it if unknown, refuse
/// a disagreement otherwise.
fn shape_assign(
    attrs: &NodeAttrs,
    what: &str,
    shapes: &mut [Shape],
    slot: usize,
    value: Shape,
) -> GraftResult<()> {
    if shapes[slot].is_empty() || shapes[slot] == value {
        shapes[slot] = value;
        Ok(())
    } else {
        bail!(
            "node {}: inferred {} shape {:?} disagrees with known {:?} at slot {}",
            attrs.name,
            what,
            value,
            shapes[slot],
            slot
        )
    }
}

fn use_bias_inputs<P: OpParams>(
    extract: fn(&P) -> bool,
) -> impl Fn(&NodeAttrs) -> usize + Send + Sync {
    move |attrs: &NodeAttrs| match attrs.params::<P>() {
        Ok(p) => {
            if extract(p) {
                3
            } else {
                2
            }
        }
        Err(_) => 2,
    }
}

// leaves produce untouched inputs and an unknown output layout; for
// operators that change the rank of the tensor
fn layout_opaque(
    _attrs: &NodeAttrs,
    _request: &mut Vec<Layout>,
    _hints: &[Layout],
    produce: &mut Vec<Layout>,
) -> GraftResult<bool> {
    for layout in produce.iter_mut() {
        *layout = Layout::undef();
    }
    Ok(true)
}

fn conv2d_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let param = attrs.params::<Conv2DParam>()?.clone();
    let expected = if param.use_bias { 3 } else { 2 };
    ensure!(in_shapes.len() == expected, "node {}: inputs are [data, weight{}]", attrs.name,
        if param.use_bias { ", bias" } else { "" });
    ensure!(out_shapes.len() == 1, "node {}: single output", attrs.name);

    if in_shapes[0].is_empty() {
        return Ok(false);
    }
    let nchw: Layout = "NCHW".parse()?;
    let mut dshape = convert_shape(&in_shapes[0], &param.layout, &nchw)?;
    ensure!(dshape.len() == 4, "node {}: input data should be 4D", attrs.name);
    ensure!(param.kernel_size.len() == 2, "node {}: incorrect kernel size", attrs.name);
    ensure!(param.strides.len() == 2, "node {}: incorrect stride size", attrs.name);
    ensure!(param.dilation.len() == 2, "node {}: incorrect dilation size", attrs.name);
    ensure!(
        dshape[1] % param.groups == 0,
        "node {}: input channels must divide group size",
        attrs.name
    );
    ensure!(
        param.channels % param.groups == 0,
        "node {}: output channels must divide group size",
        attrs.name
    );

    let wshape = tvec!(
        param.channels / param.groups,
        dshape[1] / param.groups,
        param.kernel_size[0],
        param.kernel_size[1]
    );
    let mut wshape = convert_shape(&wshape, &nchw, &param.layout)?;
    wshape[0] *= param.groups;
    shape_assign(attrs, "weight", in_shapes, 1, wshape)?;
    if param.use_bias {
        shape_assign(attrs, "bias", in_shapes, 2, tvec!(param.channels))?;
    }

    let dilated_ksize_y = 1 + (param.kernel_size[0] - 1) * param.dilation[0];
    let dilated_ksize_x = 1 + (param.kernel_size[1] - 1) * param.dilation[1];
    let mut oshape = tvec!(dshape[0], param.channels, 0, 0);
    if dshape[2] != 0 {
        oshape[2] = (dshape[2] + param.padding[0] * 2 - dilated_ksize_y) / param.strides[0] + 1;
    }
    if dshape[3] != 0 {
        oshape[3] = (dshape[3] + param.padding[1] * 2 - dilated_ksize_x) / param.strides[1] + 1;
    }
    shape_assign(attrs, "output", out_shapes, 0, convert_shape(&oshape, &nchw, &param.layout)?)?;

    // fill in what can be deduced backward: the batch size always, the
    // spatial extents when the stride is 1
    let oshape = convert_shape(&out_shapes[0], &param.layout, &nchw)?;
    dshape[0] = oshape[0];
    if oshape[2] != 0 && param.strides[0] == 1 {
        dshape[2] = oshape[2] + dilated_ksize_y - 1 - 2 * param.padding[0];
    }
    if oshape[3] != 0 && param.strides[1] == 1 {
        dshape[3] = oshape[3] + dilated_ksize_x - 1 - 2 * param.padding[1];
    }
    shape_assign(attrs, "data", in_shapes, 0, convert_shape(&dshape, &nchw, &param.layout)?)?;
    if dshape[2] != 0 {
        ensure!(
            dilated_ksize_y <= dshape[2] + 2 * param.padding[0],
            "node {}: kernel size exceeds input",
            attrs.name
        );
    }
    if dshape[3] != 0 {
        ensure!(
            dilated_ksize_x <= dshape[3] + 2 * param.padding[1],
            "node {}: kernel size exceeds input",
            attrs.name
        );
    }
    Ok(true)
}

fn conv2d_nchwc_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let param = attrs.params::<Conv2DNCHWcParam>()?.clone();
    let expected = if param.use_bias { 3 } else { 2 };
    ensure!(in_shapes.len() == expected, "node {}: inputs are [data, weight{}]", attrs.name,
        if param.use_bias { ", bias" } else { "" });
    ensure!(out_shapes.len() == 1, "node {}: single output", attrs.name);

    if in_shapes[0].is_empty() {
        return Ok(false);
    }
    let mut dshape = in_shapes[0].clone();
    ensure!(dshape.len() == 5, "node {}: packed input data should be 5D", attrs.name);
    ensure!(param.kernel_size.len() == 2, "node {}: incorrect kernel size", attrs.name);
    ensure!(param.strides.len() == 2, "node {}: incorrect stride size", attrs.name);
    ensure!(param.dilation.len() == 2, "node {}: incorrect dilation size", attrs.name);
    ensure!(
        dshape[1] % param.groups == 0,
        "node {}: input channels must divide group size",
        attrs.name
    );
    ensure!(
        param.channels % param.groups == 0,
        "node {}: output channels must divide group size",
        attrs.name
    );
    ensure!(
        param.channels % param.oc_bn == 0,
        "node {}: output channels must divide oc_bn",
        attrs.name
    );

    if param.use_bias {
        shape_assign(
            attrs,
            "bias",
            in_shapes,
            2,
            tvec!(param.channels / param.oc_bn, param.oc_bn),
        )?;
    }
    let dilated_ksize_y = 1 + (param.kernel_size[0] - 1) * param.dilation[0];
    let dilated_ksize_x = 1 + (param.kernel_size[1] - 1) * param.dilation[1];
    let mut oshape = tvec!(dshape[0], param.channels / param.oc_bn, 0, 0, param.oc_bn);
    if dshape[2] != 0 {
        oshape[2] = (dshape[2] + param.padding[0] * 2 - dilated_ksize_y) / param.strides[0] + 1;
    }
    if dshape[3] != 0 {
        oshape[3] = (dshape[3] + param.padding[1] * 2 - dilated_ksize_x) / param.strides[1] + 1;
    }
    shape_assign(attrs, "output", out_shapes, 0, oshape.clone())?;

    dshape[0] = oshape[0];
    if oshape[2] != 0 && param.strides[0] == 1 {
        dshape[2] = oshape[2] + dilated_ksize_y - 1 - 2 * param.padding[0];
    }
    if oshape[3] != 0 && param.strides[1] == 1 {
        dshape[3] = oshape[3] + dilated_ksize_x - 1 - 2 * param.padding[1];
    }
    shape_assign(attrs, "data", in_shapes, 0, dshape)?;
    Ok(true)
}

fn reorder_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let param = attrs.params::<ReorderParam>()?.clone();
    ensure!(in_shapes.len() == 1 && out_shapes.len() == 1, "node {}: unary", attrs.name);
    let shp = &in_shapes[0];
    if shp.is_empty() {
        return Ok(false);
    }
    ensure!(shp.len() == 4, "node {}: weight should be 4D", attrs.name);
    ensure!(
        shp[0] % param.oc_bn == 0 && shp[1] % param.ic_bn == 0,
        "node {}: block sizes must divide the channel extents",
        attrs.name
    );
    let (h, w) = (shp[2], shp[3]);
    let ret = if h == 1 && w == 1 {
        // (oc, ic, h, w) -> (OC, IC, ic, oc, h, w)
        tvec!(shp[0] / param.oc_bn, shp[1] / param.ic_bn, param.ic_bn, param.oc_bn, h, w)
    } else {
        // (oc, ic, h, w) -> (OC, IC, h, w, ic, oc)
        tvec!(shp[0] / param.oc_bn, shp[1] / param.ic_bn, h, w, param.ic_bn, param.oc_bn)
    };
    shape_assign(attrs, "output", out_shapes, 0, ret)?;
    Ok(true)
}

fn batch_norm_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let param = attrs.params::<BatchNormParam>()?.clone();
    ensure!(
        in_shapes.len() == 5,
        "node {}: inputs are [data, gamma, beta, moving_mean, moving_var]",
        attrs.name
    );
    ensure!(out_shapes.len() == 3, "node {}: outputs are [output, mean, var]", attrs.name);
    let dshape = in_shapes[0].clone();
    if dshape.is_empty() {
        return Ok(false);
    }
    ensure!(param.axis < dshape.len(), "node {}: axis {} out of range", attrs.name, param.axis);
    let bshape = tvec!(dshape[param.axis]);
    for slot in 1..5 {
        shape_assign(attrs, "param", in_shapes, slot, bshape.clone())?;
    }
    shape_assign(attrs, "output", out_shapes, 0, dshape)?;
    shape_assign(attrs, "mean", out_shapes, 1, bshape.clone())?;
    shape_assign(attrs, "var", out_shapes, 2, bshape)?;
    Ok(true)
}

fn batch_norm_nchwc_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    ensure!(
        in_shapes.len() == 5,
        "node {}: inputs are [data, gamma, beta, moving_mean, moving_var]",
        attrs.name
    );
    ensure!(out_shapes.len() == 3, "node {}: outputs are [output, mean, var]", attrs.name);
    let dshape = in_shapes[0].clone();
    if dshape.is_empty() {
        return Ok(false);
    }
    ensure!(dshape.len() == 5, "node {}: packed input data must be 5D", attrs.name);
    let bshape = tvec!(dshape[1] * dshape[4]);
    for slot in 1..5 {
        shape_assign(attrs, "param", in_shapes, slot, bshape.clone())?;
    }
    shape_assign(attrs, "output", out_shapes, 0, dshape)?;
    shape_assign(attrs, "mean", out_shapes, 1, bshape.clone())?;
    shape_assign(attrs, "var", out_shapes, 2, bshape)?;
    Ok(true)
}

fn expand_dims_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let param = attrs.params::<ExpandDimsParam>()?.clone();
    let dshape = &in_shapes[0];
    if dshape.is_empty() {
        return Ok(false);
    }
    ensure!(param.axis <= dshape.len(), "node {}: axis {} out of range", attrs.name, param.axis);
    let mut out = dshape.clone();
    for _ in 0..param.num_newaxis {
        out.insert(param.axis, 1);
    }
    shape_assign(attrs, "output", out_shapes, 0, out)?;
    Ok(true)
}

fn bn_reorder_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let param = attrs.params::<BnReorderParam>()?.clone();
    let shp = &in_shapes[0];
    if shp.is_empty() {
        return Ok(false);
    }
    ensure!(shp.len() == 1, "node {}: input must be 1D", attrs.name);
    ensure!(
        shp[0] % param.bn == 0,
        "node {}: block size {} must divide {}",
        attrs.name,
        param.bn,
        shp[0]
    );
    shape_assign(attrs, "output", out_shapes, 0, tvec!(shp[0] / param.bn, param.bn))?;
    Ok(true)
}

fn layout_transform_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let param = attrs.params::<LayoutTransformParam>()?.clone();
    if in_shapes[0].is_empty() {
        return Ok(false);
    }
    let out = convert_shape(&in_shapes[0], &param.src_layout, &param.dst_layout)?;
    shape_assign(attrs, "output", out_shapes, 0, out)?;
    Ok(true)
}

fn dropout_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let dshape = in_shapes[0].clone();
    if dshape.is_empty() {
        return Ok(false);
    }
    shape_assign(attrs, "output", out_shapes, 0, dshape.clone())?;
    shape_assign(attrs, "mask", out_shapes, 1, dshape)?;
    Ok(true)
}

fn register_unary(reg: &mut OpRegistry, name: &str) {
    reg.register(
        OpDef::new(name)
            .num_inputs(1)
            .num_outputs(1)
            .infer_shape(elemwise::elemwise_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(elemwise::layout_copy_to_output),
    );
}

fn register_scalar(reg: &mut OpRegistry, name: &str) {
    reg.register(
        OpDef::new(name)
            .num_inputs(1)
            .num_outputs(1)
            .attr_parser(|attrs| {
                let param = ScalarParam { scalar: attr(attrs, "scalar")? };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(elemwise::elemwise_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(elemwise::layout_copy_to_output),
    );
}

fn register_binary(
    reg: &mut OpRegistry,
    name: &str,
    shape: fn(&NodeAttrs, &mut Vec<Shape>, &mut Vec<Shape>) -> GraftResult<bool>,
) {
    reg.register(
        OpDef::new(name)
            .num_inputs(2)
            .num_outputs(1)
            .infer_shape(shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(elemwise::layout_binary),
    );
}

/// Register the standard operator set into `reg`.
pub fn register(reg: &mut OpRegistry) {
    for name in ["relu", "sqrt", "negative", "sigmoid", "exp", "copy", "softmax"] {
        register_unary(reg, name);
    }
    for name in
        ["__add_scalar__", "__sub_scalar__", "__mul_scalar__", "__div_scalar__", "__rdiv_scalar__"]
    {
        register_scalar(reg, name);
    }
    for name in ["elemwise_add", "elemwise_sub", "elemwise_mul", "elemwise_div"] {
        register_binary(reg, name, elemwise::elemwise_shape);
    }
    for name in ["broadcast_add", "broadcast_mul"] {
        register_binary(reg, name, elemwise::broadcast_shape);
    }

    reg.register(
        OpDef::new("elemwise_sum")
            .num_inputs_from(|attrs| {
                attrs.dict.get("num_args").and_then(|s| s.parse().ok()).unwrap_or(1)
            })
            .num_outputs(1)
            .infer_shape(elemwise::elemwise_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(elemwise::layout_deduce),
    );

    reg.register(
        OpDef::new("expand_dims")
            .num_inputs(1)
            .num_outputs(1)
            .attr_parser(|attrs| {
                let param = ExpandDimsParam {
                    axis: attr(attrs, "axis")?,
                    num_newaxis: attr_or(attrs, "num_newaxis", 1)?,
                };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(expand_dims_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(layout_opaque),
    );

    reg.register(
        OpDef::new("dropout")
            .num_inputs(1)
            .num_outputs(2)
            .attr_parser(|attrs| {
                let param = DropoutParam { rate: attr_or(attrs, "rate", 0.5)? };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(dropout_shape)
            .infer_type(elemwise::elemwise_type),
    );

    reg.register(
        OpDef::new("batch_norm")
            .num_inputs(5)
            .num_outputs(3)
            .attr_parser(|attrs| {
                let param = BatchNormParam {
                    epsilon: attr_or(attrs, "epsilon", 1e-5)?,
                    axis: attr_or(attrs, "axis", 1)?,
                    center: attr_bool(attrs, "center", true)?,
                    scale: attr_bool(attrs, "scale", true)?,
                };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(batch_norm_shape)
            .infer_type(elemwise::elemwise_type),
    );

    reg.register(
        OpDef::new("batch_norm_inference_nchwc")
            .num_inputs(5)
            .num_outputs(3)
            .attr_parser(|attrs| {
                let param = BatchNormParam {
                    epsilon: attr_or(attrs, "epsilon", 1e-5)?,
                    axis: attr_or(attrs, "axis", 1)?,
                    center: attr_bool(attrs, "center", true)?,
                    scale: attr_bool(attrs, "scale", true)?,
                };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(batch_norm_nchwc_shape)
            .infer_type(elemwise::elemwise_type),
    );

    reg.register(
        OpDef::new("conv2d")
            .num_inputs_from(use_bias_inputs::<Conv2DParam>(|p| p.use_bias))
            .num_outputs(1)
            .attr_parser(|attrs| {
                ensure!(
                    attrs.dict.contains_key("kernel_size"),
                    "node {}: missing attribute kernel_size",
                    attrs.name
                );
                let param = Conv2DParam {
                    channels: attr(attrs, "channels")?,
                    kernel_size: attr_dims(attrs, "kernel_size", &[])?,
                    strides: attr_dims(attrs, "strides", &[1, 1])?,
                    padding: attr_dims(attrs, "padding", &[0, 0])?,
                    dilation: attr_dims(attrs, "dilation", &[1, 1])?,
                    groups: attr_or(attrs, "groups", 1)?,
                    use_bias: attr_bool(attrs, "use_bias", true)?,
                    layout: attr_or(attrs, "layout", "NCHW".parse()?)?,
                };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(conv2d_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(|attrs, request, _hints, produce| {
                let param = attrs.params::<Conv2DParam>()?;
                let out_layout = param.layout.clone();
                ensure!(produce.len() == 1, "node {}: single output", attrs.name);
                produce[0] = out_layout.clone();
                for slot in request.iter_mut() {
                    if slot.is_defined() && !slot.convertible(&out_layout) {
                        return Ok(false);
                    }
                    *slot = out_layout.clone();
                }
                Ok(true)
            }),
    );

    reg.register(
        OpDef::new("conv2d_nchwc")
            .num_inputs_from(use_bias_inputs::<Conv2DNCHWcParam>(|p| p.use_bias))
            .num_outputs(1)
            .attr_parser(|attrs| {
                ensure!(
                    attrs.dict.contains_key("kernel_size"),
                    "node {}: missing attribute kernel_size",
                    attrs.name
                );
                let param = Conv2DNCHWcParam {
                    channels: attr(attrs, "channels")?,
                    kernel_size: attr_dims(attrs, "kernel_size", &[])?,
                    strides: attr_dims(attrs, "strides", &[1, 1])?,
                    padding: attr_dims(attrs, "padding", &[0, 0])?,
                    dilation: attr_dims(attrs, "dilation", &[1, 1])?,
                    groups: attr_or(attrs, "groups", 1)?,
                    use_bias: attr_bool(attrs, "use_bias", true)?,
                    ic_bn: attr_or(attrs, "ic_bn", 16)?,
                    oc_bn: attr_or(attrs, "oc_bn", 16)?,
                };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(conv2d_nchwc_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(|attrs, request, _hints, produce| {
                let param = attrs.params::<Conv2DNCHWcParam>()?;
                let in_layout: Layout = format!("NCHW{}c", param.ic_bn).parse()?;
                let out_layout: Layout = format!("NCHW{}c", param.oc_bn).parse()?;
                ensure!(!request.is_empty(), "node {}: data input expected", attrs.name);
                ensure!(produce.len() == 1, "node {}: single output", attrs.name);
                // weight and bias arrive pre-packed, take them as produced
                request[0] = in_layout;
                produce[0] = out_layout;
                Ok(true)
            }),
    );

    reg.register(
        OpDef::new("conv2d_nchw_kernel_packed")
            .num_inputs_from(use_bias_inputs::<Conv2DParam>(|p| p.use_bias))
            .num_outputs(1)
            .attr_parser(|attrs| {
                ensure!(
                    attrs.dict.contains_key("kernel_size"),
                    "node {}: missing attribute kernel_size",
                    attrs.name
                );
                let param = Conv2DParam {
                    channels: attr(attrs, "channels")?,
                    kernel_size: attr_dims(attrs, "kernel_size", &[])?,
                    strides: attr_dims(attrs, "strides", &[1, 1])?,
                    padding: attr_dims(attrs, "padding", &[0, 0])?,
                    dilation: attr_dims(attrs, "dilation", &[1, 1])?,
                    groups: attr_or(attrs, "groups", 1)?,
                    use_bias: attr_bool(attrs, "use_bias", true)?,
                    layout: "NCHW".parse()?,
                };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_type(elemwise::elemwise_type)
            .infer_layout(|attrs, request, _hints, produce| {
                let nchw: Layout = "NCHW".parse()?;
                ensure!(!request.is_empty(), "node {}: data input expected", attrs.name);
                ensure!(produce.len() == 1, "node {}: single output", attrs.name);
                request[0] = nchw.clone();
                produce[0] = nchw;
                Ok(true)
            }),
    );

    reg.register(
        OpDef::new("reorder")
            .num_inputs(1)
            .num_outputs(1)
            .attr_parser(|attrs| {
                let param =
                    ReorderParam { oc_bn: attr(attrs, "oc_bn")?, ic_bn: attr(attrs, "ic_bn")? };
                ensure!(
                    param.oc_bn >= 1 && param.ic_bn >= 1,
                    "node {}: block sizes must be at least 1",
                    attrs.name
                );
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(reorder_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(layout_opaque),
    );

    reg.register(
        OpDef::new("bn_reorder")
            .num_inputs(1)
            .num_outputs(1)
            .attr_parser(|attrs| {
                let param = BnReorderParam { bn: attr(attrs, "bn")? };
                ensure!(param.bn >= 1, "node {}: block size must be at least 1", attrs.name);
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(bn_reorder_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(layout_opaque),
    );

    reg.register(
        OpDef::new(LAYOUT_TRANSFORM)
            .num_inputs(1)
            .num_outputs(1)
            .attr_parser(|attrs| {
                let param = LayoutTransformParam {
                    src_layout: attr(attrs, "src_layout")?,
                    dst_layout: attr(attrs, "dst_layout")?,
                };
                attrs.parsed = Some(Arc::new(param));
                Ok(())
            })
            .infer_shape(layout_transform_shape)
            .infer_type(elemwise::elemwise_type)
            .infer_layout(|attrs, request, _hints, produce| {
                let param = attrs.params::<LayoutTransformParam>()?;
                request[0] = param.src_layout.clone();
                produce[0] = param.dst_layout.clone();
                Ok(true)
            }),
    );

    reg.register(OpDef::new(UNDEF_OP).num_inputs(0).num_outputs(1).infer_layout(
        |_attrs, _request, _hints, produce| {
            produce[0] = Layout::undef();
            Ok(true)
        },
    ));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::OpRegistry;

    fn run_shape(
        reg: &OpRegistry,
        op: &str,
        dict: &[(&str, &str)],
        ins: &[Shape],
        n_out: usize,
    ) -> GraftResult<(Vec<Shape>, Vec<Shape>)> {
        let inputs = (0..ins.len())
            .map(|i| NodeEntry::of(&Node::variable(format!("i{i}"))))
            .collect::<Vec<_>>();
        let node = reg.build_node(op, "node", inputs, dict)?;
        let mut in_shapes = ins.to_vec();
        let mut out_shapes = vec![Shape::new(); n_out];
        let rule = node.op().unwrap().shape_rule().unwrap();
        anyhow::ensure!(rule(&node.attrs, &mut in_shapes, &mut out_shapes)?, "underdetermined");
        Ok((in_shapes, out_shapes))
    }

    #[test]
    fn conv2d_shape_inference() {
        let reg = OpRegistry::core();
        let (ins, outs) = run_shape(
            &reg,
            "conv2d",
            &[("channels", "64"), ("kernel_size", "(3,3)"), ("padding", "(1,1)")],
            &[tvec!(1, 3, 224, 224), Shape::new(), Shape::new()],
            1,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(1, 64, 224, 224));
        assert_eq!(ins[1], tvec!(64, 3, 3, 3));
        assert_eq!(ins[2], tvec!(64));
    }

    #[test]
    fn conv2d_strided_shape() {
        let reg = OpRegistry::core();
        let (_, outs) = run_shape(
            &reg,
            "conv2d",
            &[
                ("channels", "8"),
                ("kernel_size", "(3,3)"),
                ("strides", "(2,2)"),
                ("use_bias", "0"),
            ],
            &[tvec!(1, 3, 9, 9), Shape::new()],
            1,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(1, 8, 4, 4));
    }

    #[test]
    fn conv2d_nchwc_shape_inference() {
        let reg = OpRegistry::core();
        let (ins, outs) = run_shape(
            &reg,
            "conv2d_nchwc",
            &[("channels", "64"), ("kernel_size", "(1,1)"), ("use_bias", "1")],
            &[tvec!(1, 2, 56, 56, 16), Shape::new(), Shape::new()],
            1,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(1, 4, 56, 56, 16));
        assert_eq!(ins[2], tvec!(4, 16));
    }

    #[test]
    fn reorder_shapes() {
        let reg = OpRegistry::core();
        let (_, outs) = run_shape(
            &reg,
            "reorder",
            &[("oc_bn", "16"), ("ic_bn", "8")],
            &[tvec!(64, 32, 3, 3)],
            1,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(4, 4, 3, 3, 8, 16));
        let (_, outs) = run_shape(
            &reg,
            "reorder",
            &[("oc_bn", "16"), ("ic_bn", "8")],
            &[tvec!(64, 32, 1, 1)],
            1,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(4, 4, 8, 16, 1, 1));
    }

    #[test]
    fn bn_reorder_splits_the_channel_vector() {
        let reg = OpRegistry::core();
        let (_, outs) =
            run_shape(&reg, "bn_reorder", &[("bn", "16")], &[tvec!(64)], 1).unwrap();
        assert_eq!(outs[0], tvec!(4, 16));
        assert!(run_shape(&reg, "bn_reorder", &[("bn", "5")], &[tvec!(64)], 1).is_err());
    }

    #[test]
    fn expand_dims_shapes() {
        let reg = OpRegistry::core();
        let (_, outs) = run_shape(
            &reg,
            "expand_dims",
            &[("axis", "1"), ("num_newaxis", "2")],
            &[tvec!(4, 16)],
            1,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(4, 1, 1, 16));
        let (_, outs) =
            run_shape(&reg, "expand_dims", &[("axis", "0")], &[tvec!(64)], 1).unwrap();
        assert_eq!(outs[0], tvec!(1, 64));
    }

    #[test]
    fn batch_norm_shapes() {
        let reg = OpRegistry::core();
        let (ins, outs) = run_shape(
            &reg,
            "batch_norm",
            &[("epsilon", "0.001")],
            &[tvec!(1, 32, 8, 8), Shape::new(), Shape::new(), Shape::new(), Shape::new()],
            3,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(1, 32, 8, 8));
        assert_eq!(ins[1], tvec!(32));
        assert_eq!(outs[1], tvec!(32));
    }

    #[test]
    fn layout_transform_shape_follows_the_conversion() {
        let reg = OpRegistry::core();
        let (_, outs) = run_shape(
            &reg,
            LAYOUT_TRANSFORM,
            &[("src_layout", "NCHW"), ("dst_layout", "NCHW16c")],
            &[tvec!(1, 64, 56, 56)],
            1,
        )
        .unwrap();
        assert_eq!(outs[0], tvec!(1, 4, 56, 56, 16));
    }

    #[test]
    fn dynamic_arity_reads_the_attributes() {
        let reg = OpRegistry::core();
        let inputs =
            (0..3).map(|i| NodeEntry::of(&Node::variable(format!("i{i}")))).collect::<Vec<_>>();
        let node =
            reg.build_node("elemwise_sum", "sum", inputs, &[("num_args", "3")]).unwrap();
        assert_eq!(node.num_inputs(), 3);
        assert!(reg
            .build_node(
                "elemwise_sum",
                "sum",
                vec![NodeEntry::of(&Node::variable("x"))],
                &[("num_args", "2")]
            )
            .is_err());
    }

    #[test]
    fn conv2d_layout_rule_requests_its_declared_layout() {
        let reg = OpRegistry::core();
        let x = NodeEntry::of(&Node::variable("x"));
        let w = NodeEntry::of(&Node::variable("w"));
        let node = reg
            .build_node(
                "conv2d",
                "conv",
                vec![x, w],
                &[("channels", "8"), ("kernel_size", "(1,1)"), ("use_bias", "0")],
            )
            .unwrap();
        let rule = node.op().unwrap().layout_rule().unwrap();
        let mut request = vec!["NCHW16c".parse().unwrap(), Layout::undef()];
        let mut produce = vec![Layout::undef()];
        assert!(rule(&node.attrs, &mut request, &[], &mut produce).unwrap());
        let nchw: Layout = "NCHW".parse().unwrap();
        assert_eq!(request, vec![nchw.clone(), nchw.clone()]);
        assert_eq!(produce, vec![nchw]);

        // a producer that cannot be converted is refused
        let mut request = vec!["NCDHW".parse().unwrap(), Layout::undef()];
        let mut produce = vec![Layout::undef()];
        assert!(!rule(&node.attrs, &mut request, &[], &mut produce).unwrap());
    }
}
