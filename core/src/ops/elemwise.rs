//! Inference rules shared by the elementwise operator families.
//!
//! A zero-rank shape means "unknown"; the rules deduce a common value
//! across the known slots, refuse disagreements, and write the result
//! everywhere.

use crate::internal::*;

/// One common shape across all inputs and outputs.
pub fn elemwise_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    let mut common = Shape::new();
    for (slot, shape) in in_shapes.iter().chain(out_shapes.iter()).enumerate() {
        if shape.is_empty() {
            continue;
        }
        if common.is_empty() {
            common = shape.clone();
        } else {
            ensure!(
                &common == shape,
                "node {}: incompatible shape at slot {}: expected {:?}, got {:?}",
                attrs.name,
                slot,
                common,
                shape
            );
        }
    }
    if common.is_empty() {
        return Ok(false);
    }
    for shape in in_shapes.iter_mut().chain(out_shapes.iter_mut()) {
        *shape = common.clone();
    }
    Ok(true)
}

/// One common element type across all inputs and outputs.
pub fn elemwise_type(
    attrs: &NodeAttrs,
    in_types: &mut Vec<DatumType>,
    out_types: &mut Vec<DatumType>,
) -> GraftResult<bool> {
    let mut it = in_types.iter().chain(out_types.iter());
    let first = *it.next().with_context(|| format!("node {}: no type to deduce", attrs.name))?;
    for dt in it {
        ensure!(
            *dt == first,
            "node {}: incompatible element types {} and {}",
            attrs.name,
            first,
            dt
        );
    }
    for dt in in_types.iter_mut().chain(out_types.iter_mut()) {
        *dt = first;
    }
    Ok(true)
}

/// Numpy-style broadcast of two shapes, aligned on the trailing axes.
pub fn broadcast_shape(
    attrs: &NodeAttrs,
    in_shapes: &mut Vec<Shape>,
    out_shapes: &mut Vec<Shape>,
) -> GraftResult<bool> {
    ensure!(in_shapes.len() == 2, "node {}: broadcast wants 2 inputs", attrs.name);
    let (lhs, rhs) = (&in_shapes[0], &in_shapes[1]);
    if lhs.is_empty() || rhs.is_empty() {
        return Ok(false);
    }
    let rank = lhs.len().max(rhs.len());
    let mut out = tvec!(0; rank);
    for i in 0..rank {
        let l = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let r = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        out[i] = if l == r {
            l
        } else if l == 1 {
            r
        } else if r == 1 {
            l
        } else {
            bail!(
                "node {}: shapes {:?} and {:?} do not broadcast (axis {})",
                attrs.name,
                lhs,
                rhs,
                i
            )
        };
    }
    out_shapes[0] = out;
    Ok(true)
}

/// Copy the (single, agreed upon) input layout to every output. The rule
/// for elementwise unary operators: the tensor is traversed point-wise, so
/// whatever blocked form comes in goes out.
pub fn layout_copy_to_output(
    attrs: &NodeAttrs,
    request: &mut Vec<Layout>,
    _hints: &[Layout],
    produce: &mut Vec<Layout>,
) -> GraftResult<bool> {
    let mut common = Layout::undef();
    for layout in request.iter() {
        if !layout.is_defined() {
            continue;
        }
        if !common.is_defined() {
            common = layout.clone();
        } else if &common != layout {
            bail!(
                "node {}: inputs disagree on layout: {} vs {}",
                attrs.name,
                common,
                layout
            );
        }
    }
    for layout in produce.iter_mut() {
        *layout = common.clone();
    }
    Ok(true)
}

/// Deduce a common layout from the inputs and the previous output layouts;
/// when they differ, the previous output wins and the inputs are rewritten
/// to it, leaving the LayoutTransform pass to materialize the conversion
/// in front of the node. The rule for reduce-style operators.
pub fn layout_deduce(
    attrs: &NodeAttrs,
    request: &mut Vec<Layout>,
    _hints: &[Layout],
    produce: &mut Vec<Layout>,
) -> GraftResult<bool> {
    let deduce = |slots: &[Layout], what: &str| -> GraftResult<Layout> {
        let mut common = Layout::undef();
        for layout in slots.iter() {
            if !layout.is_defined() {
                continue;
            }
            if !common.is_defined() {
                common = layout.clone();
            } else if &common != layout {
                bail!(
                    "node {}: {} layouts disagree: {} vs {}",
                    attrs.name,
                    what,
                    common,
                    layout
                );
            }
        }
        Ok(common)
    };
    let input = deduce(request, "input")?;
    let mut output = deduce(produce, "output")?;
    if !output.is_defined() {
        output = input;
    }
    for layout in request.iter_mut() {
        *layout = output.clone();
    }
    for layout in produce.iter_mut() {
        *layout = output.clone();
    }
    Ok(true)
}

/// Binary tie-break: an undefined side adopts the other; equal layouts
/// pass through; otherwise the left layout wins if the right is
/// convertible to it, then the other way around; else the rule refuses.
pub fn layout_binary(
    attrs: &NodeAttrs,
    request: &mut Vec<Layout>,
    _hints: &[Layout],
    produce: &mut Vec<Layout>,
) -> GraftResult<bool> {
    ensure!(
        request.len() == 2 && produce.len() == 1,
        "node {}: binary layout rule wants 2 inputs and 1 output",
        attrs.name
    );
    let (lhs, rhs) = (request[0].clone(), request[1].clone());
    if !lhs.is_defined() && !rhs.is_defined() {
        return Ok(!produce[0].is_defined());
    }
    if !lhs.is_defined() {
        request[0] = rhs.clone();
        produce[0] = rhs;
        return Ok(true);
    }
    if !rhs.is_defined() {
        request[1] = lhs.clone();
        produce[0] = lhs;
        return Ok(true);
    }
    if lhs == rhs {
        produce[0] = lhs;
        return Ok(true);
    }
    if rhs.convertible(&lhs) {
        request[1] = lhs.clone();
        produce[0] = lhs;
        Ok(true)
    } else if lhs.convertible(&rhs) {
        request[0] = rhs.clone();
        produce[0] = rhs;
        Ok(true)
    } else {
        Ok(false)
    }
}
