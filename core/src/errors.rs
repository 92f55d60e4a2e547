//! Typed failure kinds for graph passes.
use thiserror::Error;

/// Failures raised while rewriting a graph. Always fatal for the pass that
/// raised them: the partial output graph is discarded, the input graph is
/// left untouched.
///
/// They travel inside [anyhow::Error]; match on the kind with
/// `downcast_ref::<GraphError>()`.
#[derive(Error, Debug)]
pub enum GraphError {
    /// An operator's layout rule refused the configuration, produced an
    /// incomplete layout, or is simply not registered.
    #[error("node {node} ({op}): layout inference failed: {reason}")]
    InferenceFailure { node: String, op: String, reason: String },
    /// A required graph attribute vector is not attached.
    #[error("graph attribute \"{attr}\" is missing")]
    MissingAttribute { attr: &'static str },
    /// A rewrite rule returned a different number of outputs than the node
    /// it replaces declares.
    #[error("node {node} ({op}): rewrite produced {got} outputs, expected {expected}")]
    ArityMismatch { node: String, op: String, expected: usize, got: usize },
}
