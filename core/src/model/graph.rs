use std::any::Any;
use std::fmt;

use crate::internal::*;

/// Names of the well-known graph attributes.
pub mod attributes {
    /// Per-edge tensor shape, `Vec<Shape>` indexed by entry id.
    pub const SHAPE: &str = "shape";
    /// Per-edge element type, `Vec<DatumType>` indexed by entry id.
    pub const DTYPE: &str = "dtype";
    /// Per-edge layout, `Vec<Layout>` indexed by entry id.
    pub const LAYOUT: &str = "layout";
    /// Requested layout of each graph input, in indexed input order.
    pub const LAYOUT_INPUTS: &str = "layout_inputs";
    /// Requested layout of each graph output.
    pub const LAYOUT_OUTPUTS: &str = "layout_outputs";
}

/// An attribute attached to a graph. The core only interprets the variants
/// below; anything else a frontend wants to piggyback rides along opaquely.
#[derive(Clone)]
pub enum GraphAttr {
    Shapes(Vec<Shape>),
    DTypes(Vec<DatumType>),
    Layouts(Vec<Layout>),
    LayoutInputs(Vec<Layout>),
    LayoutOutputs(Vec<Layout>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for GraphAttr {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphAttr::Shapes(v) => write!(fmt, "Shapes({v:?})"),
            GraphAttr::DTypes(v) => write!(fmt, "DTypes({v:?})"),
            GraphAttr::Layouts(v) => write!(fmt, "Layouts({v:?})"),
            GraphAttr::LayoutInputs(v) => write!(fmt, "LayoutInputs({v:?})"),
            GraphAttr::LayoutOutputs(v) => write!(fmt, "LayoutOutputs({v:?})"),
            GraphAttr::Opaque(_) => write!(fmt, "Opaque(..)"),
        }
    }
}

/// An immutable computation graph: its output tensors, plus named
/// attribute vectors computed by earlier passes or attached by the caller.
///
/// The node set is whatever is reachable from `outputs`; [Graph::indexed]
/// flattens it into dense, topologically ordered ids.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub outputs: Vec<NodeEntry>,
    pub attrs: HashMap<String, GraphAttr>,
}

impl Graph {
    pub fn with_outputs(outputs: Vec<NodeEntry>) -> Graph {
        Graph { outputs, attrs: HashMap::new() }
    }

    /// Dense topological view. Borrows the graph: build it once per pass.
    pub fn indexed(&self) -> IndexedGraph<'_> {
        IndexedGraph::new(self)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, attr: GraphAttr) {
        self.attrs.insert(name.into(), attr);
    }

    pub fn with_attr(mut self, name: impl Into<String>, attr: GraphAttr) -> Graph {
        self.set_attr(name, attr);
        self
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    /// Per-edge shapes. Required by PrePack and SimplifyInference.
    pub fn shapes(&self) -> GraftResult<&[Shape]> {
        match self.attrs.get(attributes::SHAPE) {
            Some(GraphAttr::Shapes(v)) => Ok(v),
            Some(other) => bail!("attribute \"shape\" has unexpected payload {:?}", other),
            None => bail!(GraphError::MissingAttribute { attr: attributes::SHAPE }),
        }
    }

    /// Per-edge element types. Required by PrePack.
    pub fn dtypes(&self) -> GraftResult<&[DatumType]> {
        match self.attrs.get(attributes::DTYPE) {
            Some(GraphAttr::DTypes(v)) => Ok(v),
            Some(other) => bail!("attribute \"dtype\" has unexpected payload {:?}", other),
            None => bail!(GraphError::MissingAttribute { attr: attributes::DTYPE }),
        }
    }

    /// Per-edge layouts from an earlier LayoutTransform run, if any.
    pub fn layouts(&self) -> Option<&[Layout]> {
        match self.attrs.get(attributes::LAYOUT) {
            Some(GraphAttr::Layouts(v)) => Some(v),
            _ => None,
        }
    }

    /// Caller-requested layout for each graph input. Required by
    /// LayoutTransform.
    pub fn layout_inputs(&self) -> GraftResult<&[Layout]> {
        match self.attrs.get(attributes::LAYOUT_INPUTS) {
            Some(GraphAttr::LayoutInputs(v)) => Ok(v),
            Some(other) => bail!("attribute \"layout_inputs\" has unexpected payload {:?}", other),
            None => bail!(GraphError::MissingAttribute { attr: attributes::LAYOUT_INPUTS }),
        }
    }

    /// Caller-requested layout for each graph output, if any.
    pub fn layout_outputs(&self) -> Option<&[Layout]> {
        match self.attrs.get(attributes::LAYOUT_OUTPUTS) {
            Some(GraphAttr::LayoutOutputs(v)) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use itertools::Itertools;
        let idx = self.indexed();
        for nid in 0..idx.num_nodes() {
            let node = &idx[nid].source;
            writeln!(
                fmt,
                "{:4} | {:25} {:30} <- {}",
                nid,
                node.op().map(|op| op.name()).unwrap_or("variable"),
                node.name(),
                idx[nid].inputs.iter().map(|e| format!("{}/{}", e.node_id, e.index)).join(", "),
            )?;
        }
        writeln!(fmt, "outputs: {}", self.outputs.iter().map(|e| format!("{e:?}")).join(", "))
    }
}
