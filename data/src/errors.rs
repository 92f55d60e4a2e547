//! Typed failure kinds for the data layer.
use thiserror::Error;

/// Failures raised by the layout algebra and shape conversion.
///
/// All of these are fatal for the operation that raised them. They travel
/// inside [anyhow::Error] so call sites can stack context; match on the
/// kind with `downcast_ref::<DataError>()`.
#[derive(Error, Debug)]
pub enum DataError {
    /// Malformed layout string.
    #[error("invalid layout \"{layout}\": {reason}")]
    Parse { layout: String, reason: String },
    /// An internal invariant does not hold: duplicate axis, minor axis
    /// without its major, block factor not dividing the axis size...
    #[error("layout invariant violated: {reason}")]
    Invariant { reason: String },
    /// The two layouts do not describe the same set of major axes, so no
    /// conversion between them exists.
    #[error("cannot convert layout {from} to {to}")]
    IncompatibleLayout { from: String, to: String },
}
