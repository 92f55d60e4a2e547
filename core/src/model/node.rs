use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use downcast_rs::{impl_downcast, Downcast};

use crate::internal::*;
use crate::ops::OpDef;

/// Stable identity of a node.
///
/// Nodes are shared through `Arc` and every pass rebuilds its graph, so
/// the id — allocated once at construction — is the only handle that can
/// key the source-to-replacement maps a pass maintains.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

static NODE_IDS: AtomicU64 = AtomicU64::new(0);

impl NodeId {
    fn next() -> NodeId {
        NodeId(NODE_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

/// Parsed operator parameters, produced by the operator's attribute parser
/// from the raw string dictionary.
pub trait OpParams: Downcast + fmt::Debug + Send + Sync {}
impl_downcast!(OpParams);

/// Attributes of a node: its name, its operator (`None` for variables,
/// the graph inputs), the raw attribute dictionary and its parsed form.
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    pub name: String,
    pub op: Option<Arc<OpDef>>,
    pub dict: HashMap<String, String>,
    pub parsed: Option<Arc<dyn OpParams>>,
}

impl NodeAttrs {
    /// Downcast the parsed parameters.
    pub fn params<T: OpParams>(&self) -> GraftResult<&T> {
        self.parsed
            .as_deref()
            .and_then(|p| p.downcast_ref::<T>())
            .with_context(|| format!("node {}: no parsed {}", self.name, std::any::type_name::<T>()))
    }
}

/// A node of a computation graph. Immutable once built; passes produce new
/// nodes instead of mutating.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    pub attrs: NodeAttrs,
    /// Tensors consumed by the node, in operator argument order.
    pub inputs: Vec<NodeEntry>,
}

impl Node {
    /// A variable node: a graph input. No operator, a single output.
    pub fn variable(name: impl Into<String>) -> Arc<Node> {
        Arc::new(Node {
            id: NodeId::next(),
            attrs: NodeAttrs { name: name.into(), ..NodeAttrs::default() },
            inputs: vec![],
        })
    }

    /// An operator node. Runs the operator's attribute parser and checks
    /// the input arity.
    pub fn build(
        op: &Arc<OpDef>,
        name: impl Into<String>,
        inputs: Vec<NodeEntry>,
        dict: HashMap<String, String>,
    ) -> GraftResult<Arc<Node>> {
        let mut attrs =
            NodeAttrs { name: name.into(), op: Some(op.clone()), dict, parsed: None };
        if let Some(parser) = op.attr_parser_fn() {
            parser(&mut attrs).with_context(|| format!("parsing attributes of {}", attrs.name))?;
        }
        let expected = op.input_arity().resolve(&attrs);
        ensure!(
            inputs.len() == expected,
            "node {} ({}): {} inputs, operator wants {}",
            attrs.name,
            op.name(),
            inputs.len(),
            expected
        );
        Ok(Arc::new(Node { id: NodeId::next(), attrs, inputs }))
    }

    /// Shallow clone with fresh inputs. The clone is a new node with its
    /// own identity.
    pub fn with_inputs(&self, inputs: Vec<NodeEntry>) -> Arc<Node> {
        Arc::new(Node { id: NodeId::next(), attrs: self.attrs.clone(), inputs })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.attrs.name
    }

    pub fn op(&self) -> Option<&Arc<OpDef>> {
        self.attrs.op.as_ref()
    }

    pub fn op_is(&self, name: &str) -> bool {
        self.attrs.op.as_ref().map(|op| op.name() == name).unwrap_or(false)
    }

    pub fn is_variable(&self) -> bool {
        self.attrs.op.is_none()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Declared output arity. Variables have exactly one output.
    pub fn num_outputs(&self) -> usize {
        match &self.attrs.op {
            Some(op) => op.output_arity().resolve(&self.attrs),
            None => 1,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let op = self.attrs.op.as_ref().map(|op| op.name()).unwrap_or("variable");
        write!(fmt, "\"{}\" {}", self.attrs.name, op)
    }
}

/// A tensor in the graph: the node producing it, which of the node's
/// outputs it is, and a version counter kept for mutation-tracking
/// frontends.
#[derive(Clone, new)]
pub struct NodeEntry {
    pub node: Arc<Node>,
    pub index: u32,
    pub version: u32,
}

impl NodeEntry {
    /// The first output of `node`.
    pub fn of(node: &Arc<Node>) -> NodeEntry {
        NodeEntry::new(node.clone(), 0, 0)
    }
}

impl PartialEq for NodeEntry {
    fn eq(&self, other: &NodeEntry) -> bool {
        self.node.id() == other.node.id()
            && self.index == other.index
            && self.version == other.version
    }
}

impl Eq for NodeEntry {}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.node.name(), self.index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::OpRegistry;

    #[test]
    fn identity_is_stable_and_unique() {
        let a = Node::variable("a");
        let b = Node::variable("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn clone_gets_a_fresh_identity() {
        let a = Node::variable("a");
        let b = a.with_inputs(vec![]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn build_checks_input_arity() {
        let reg = OpRegistry::core();
        let op = reg.get("elemwise_add").unwrap().clone();
        let x = NodeEntry::of(&Node::variable("x"));
        assert!(Node::build(&op, "add", vec![x.clone()], HashMap::new()).is_err());
        let node = Node::build(&op, "add", vec![x.clone(), x], HashMap::new()).unwrap();
        assert_eq!(node.num_outputs(), 1);
        assert!(node.op_is("elemwise_add"));
    }
}
