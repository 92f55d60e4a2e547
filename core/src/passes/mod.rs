//! Graph-to-graph rewriting passes.
//!
//! Each pass is a pure function: it takes a graph (with whatever attribute
//! vectors it requires) and returns a fresh graph. On error the input is
//! untouched and the partial result discarded.

use crate::internal::*;

mod layout_transform;
mod pre_pack;
mod simplify_inference;

pub use self::layout_transform::{layout_transform, LayoutTransform};
pub use self::pre_pack::{pre_pack, PrePack};
pub use self::simplify_inference::{simplify_inference, SimplifyInference};

/// A named graph-to-graph rewrite.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, reg: &OpRegistry, graph: &Graph) -> GraftResult<Graph>;
}

/// Run a list of passes in order, each feeding the next.
#[derive(Default)]
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    pub fn then(mut self, pass: impl Pass + 'static) -> Pipeline {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn run(&self, reg: &OpRegistry, graph: &Graph) -> GraftResult<Graph> {
        let mut graph = graph.clone();
        for pass in &self.passes {
            debug!("running pass {}", pass.name());
            graph = pass
                .run(reg, &graph)
                .with_context(|| format!("running pass {}", pass.name()))?;
        }
        Ok(graph)
    }
}
