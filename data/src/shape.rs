//! Tensor shapes and layout-directed reinterpretation.

use crate::internal::*;
use crate::layout::Layout;

/// A tensor shape: one extent per axis of the owning layout. A zero extent
/// means "not known yet" to the shape inference rules.
pub type Shape = TVec<usize>;

/// Reinterpret `src`, whose axes follow `from`, as a shape following `to`.
///
/// For each major axis the full extent (major extent times block extent, if
/// any) is recomputed, then redistributed according to the block factor the
/// target layout declares. Fails when the layouts do not cover the same
/// major axes, when `src` disagrees with a fixed factor of `from`, or when
/// a target factor does not divide the full extent.
pub fn convert_shape(src: &[usize], from: &Layout, to: &Layout) -> GraftResult<Shape> {
    if from == to {
        return Ok(src.iter().copied().collect());
    }
    ensure!(
        from.is_defined(),
        DataError::Invariant { reason: format!("cannot convert undefined layout to {}", to) }
    );
    ensure!(
        to.is_defined(),
        DataError::Invariant { reason: format!("cannot convert {} to undefined layout", from) }
    );
    ensure!(
        from.convertible(to),
        DataError::IncompatibleLayout { from: from.name().to_string(), to: to.name().to_string() }
    );
    ensure!(
        src.len() == from.ndim(),
        DataError::Invariant {
            reason: format!("shape {:?} does not have the {} axes of {}", src, from.ndim(), from)
        }
    );

    let mut dst = tvec!(0; to.ndim());
    for (i, &axis) in from.axes().iter().enumerate() {
        if !Layout::is_major_axis(axis) {
            continue;
        }
        let mut full = src[i];
        if let Some(minor) = from.pos_minor(axis) {
            let block = src[minor];
            if let Some(BlockFactor::Fixed(f)) = from.factor(axis) {
                ensure!(
                    f as usize == block,
                    DataError::Invariant {
                        reason: format!("shape {:?} does not agree with layout {}", src, from)
                    }
                );
            }
            full *= block;
        }
        let major = to.pos_major(axis).expect("checked by convertible");
        if let Some(minor) = to.pos_minor(axis) {
            let factor = match to.factor(axis) {
                Some(BlockFactor::Fixed(f)) => f as usize,
                _ => bail!(DataError::Invariant {
                    reason: format!("target layout {} has an unspecified factor for {}", to, axis)
                }),
            };
            ensure!(
                factor <= full,
                DataError::Invariant {
                    reason: format!(
                        "cannot split axis {} of extent {} by {} ({} to {})",
                        axis, full, factor, from, to
                    )
                }
            );
            ensure!(
                full % factor == 0,
                DataError::Invariant {
                    reason: format!(
                        "block factor {} does not divide axis {} of extent {} ({} to {})",
                        factor, axis, full, from, to
                    )
                }
            );
            dst[major] = full / factor;
            dst[minor] = factor;
        } else {
            dst[major] = full;
        }
    }
    Ok(dst)
}
