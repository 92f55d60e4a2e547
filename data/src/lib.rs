//! Data-level vocabulary for the graft graph compiler: tensor shapes,
//! element types and the blocked-layout algebra.
//!
//! Everything here is value-typed and graph-agnostic. The graph IR and the
//! rewriting passes live in `graft-core`.

#[macro_use]
mod macros;

/// A Smallvec instantiation with 4 embeddable values.
///
/// Used about everywhere in graft, for node inputs and outputs, or
/// tensor dimensions.
pub type TVec<T> = smallvec::SmallVec<[T; 4]>;

pub mod datum;
pub mod errors;
pub mod layout;
pub mod shape;

pub use anyhow;

/// Crate-wide result alias. Typed failure kinds ([errors::DataError]) are
/// raised through it and can be recovered with `downcast_ref`.
pub type GraftResult<T> = anyhow::Result<T>;

pub mod prelude {
    pub use crate::datum::DatumType;
    pub use crate::layout::{BlockFactor, Layout};
    pub use crate::shape::{convert_shape, Shape};
    pub use crate::tvec;
    pub use crate::GraftResult;
    pub use crate::TVec;
}

pub mod internal {
    pub use crate::errors::DataError;
    pub use crate::prelude::*;
    pub use anyhow::{anyhow, bail, ensure, Context};
}
