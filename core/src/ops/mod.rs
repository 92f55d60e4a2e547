//! Operator definitions: arity, attribute parsing and inference
//! capabilities, looked up by name in an [OpRegistry].
//!
//! The registry is read-only data as far as the passes are concerned. A
//! process-wide instance with the standard operator set lives behind
//! [global]; tests and alternate frontends build their own with
//! [OpRegistry::core] and [OpRegistry::register].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::internal::*;

pub mod elemwise;
pub mod nn;

/// Input or output arity of an operator: a constant, or derived from the
/// node attributes (a convolution has 2 or 3 inputs depending on
/// `use_bias`).
#[derive(Clone)]
pub enum Arity {
    Fixed(usize),
    FromAttrs(Arc<dyn Fn(&NodeAttrs) -> usize + Send + Sync>),
}

impl Arity {
    pub fn resolve(&self, attrs: &NodeAttrs) -> usize {
        match self {
            Arity::Fixed(n) => *n,
            Arity::FromAttrs(f) => f.as_ref()(attrs),
        }
    }
}

impl fmt::Debug for Arity {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Arity::Fixed(n) => write!(fmt, "{n}"),
            Arity::FromAttrs(_) => write!(fmt, "dynamic"),
        }
    }
}

pub type DynAttrParser = dyn Fn(&mut NodeAttrs) -> GraftResult<()> + Send + Sync;
pub type AttrParser = Arc<DynAttrParser>;

/// Mutual shape inference over a node: reads and refines the input and
/// output shape vectors in place. `Ok(false)` means "not enough
/// information yet".
pub type DynInferShape =
    dyn Fn(&NodeAttrs, &mut Vec<Shape>, &mut Vec<Shape>) -> GraftResult<bool> + Send + Sync;
pub type FInferShape = Arc<DynInferShape>;

/// Element type inference, same protocol as [FInferShape].
pub type DynInferType =
    dyn Fn(&NodeAttrs, &mut Vec<DatumType>, &mut Vec<DatumType>) -> GraftResult<bool> + Send + Sync;
pub type FInferType = Arc<DynInferType>;

/// Layout rule of an operator, driven by the LayoutTransform pass.
///
/// * `request` arrives prefilled with the layouts the producers actually
///   deliver; the rule overwrites slots with the layouts it requires.
/// * `hints` carries the input layouts a previous LayoutTransform run
///   settled on, advisory only.
/// * `produce` arrives prefilled with the previous run's output layouts
///   and must be left holding the layouts the operator will produce.
///
/// Every slot must end up either undefined or a complete layout.
/// `Ok(false)` means the operator cannot accommodate the configuration.
pub type DynInferLayout =
    dyn Fn(&NodeAttrs, &mut Vec<Layout>, &[Layout], &mut Vec<Layout>) -> GraftResult<bool>
        + Send
        + Sync;
pub type FInferLayout = Arc<DynInferLayout>;

/// Weight pre-packing hook: given the node attributes, its input tensors
/// and their type information, return the outputs of a replacement
/// sub-graph.
pub type DynWeightPrepack =
    dyn Fn(&NodeAttrs, &[NodeEntry], &[TensorFact]) -> GraftResult<Vec<NodeEntry>> + Send + Sync;
pub type FWeightPrepack = Arc<DynWeightPrepack>;

/// Kernel computation hook. Owned by the code generation layer; the core
/// stores it and never calls it.
pub type DynCompute = dyn Fn(&NodeAttrs, &[TensorFact]) -> GraftResult<()> + Send + Sync;
pub type FCompute = Arc<DynCompute>;

/// Everything the core knows about one operator.
#[derive(Clone)]
pub struct OpDef {
    name: String,
    num_inputs: Arity,
    num_outputs: Arity,
    attr_parser: Option<AttrParser>,
    infer_shape: Option<FInferShape>,
    infer_type: Option<FInferType>,
    infer_layout: Option<FInferLayout>,
    weight_prepack: Option<FWeightPrepack>,
    compute: Option<FCompute>,
}

impl OpDef {
    pub fn new(name: impl Into<String>) -> OpDef {
        OpDef {
            name: name.into(),
            num_inputs: Arity::Fixed(1),
            num_outputs: Arity::Fixed(1),
            attr_parser: None,
            infer_shape: None,
            infer_type: None,
            infer_layout: None,
            weight_prepack: None,
            compute: None,
        }
    }

    pub fn num_inputs(self, n: usize) -> OpDef {
        OpDef { num_inputs: Arity::Fixed(n), ..self }
    }

    pub fn num_inputs_from(
        self,
        f: impl Fn(&NodeAttrs) -> usize + Send + Sync + 'static,
    ) -> OpDef {
        OpDef { num_inputs: Arity::FromAttrs(Arc::new(f)), ..self }
    }

    pub fn num_outputs(self, n: usize) -> OpDef {
        OpDef { num_outputs: Arity::Fixed(n), ..self }
    }

    pub fn attr_parser(
        self,
        f: impl Fn(&mut NodeAttrs) -> GraftResult<()> + Send + Sync + 'static,
    ) -> OpDef {
        OpDef { attr_parser: Some(Arc::new(f)), ..self }
    }

    pub fn infer_shape(
        self,
        f: impl Fn(&NodeAttrs, &mut Vec<Shape>, &mut Vec<Shape>) -> GraftResult<bool>
            + Send
            + Sync
            + 'static,
    ) -> OpDef {
        OpDef { infer_shape: Some(Arc::new(f)), ..self }
    }

    pub fn infer_type(
        self,
        f: impl Fn(&NodeAttrs, &mut Vec<DatumType>, &mut Vec<DatumType>) -> GraftResult<bool>
            + Send
            + Sync
            + 'static,
    ) -> OpDef {
        OpDef { infer_type: Some(Arc::new(f)), ..self }
    }

    pub fn infer_layout(
        self,
        f: impl Fn(&NodeAttrs, &mut Vec<Layout>, &[Layout], &mut Vec<Layout>) -> GraftResult<bool>
            + Send
            + Sync
            + 'static,
    ) -> OpDef {
        OpDef { infer_layout: Some(Arc::new(f)), ..self }
    }

    pub fn weight_prepack(
        self,
        f: impl Fn(&NodeAttrs, &[NodeEntry], &[TensorFact]) -> GraftResult<Vec<NodeEntry>>
            + Send
            + Sync
            + 'static,
    ) -> OpDef {
        OpDef { weight_prepack: Some(Arc::new(f)), ..self }
    }

    pub fn compute(
        self,
        f: impl Fn(&NodeAttrs, &[TensorFact]) -> GraftResult<()> + Send + Sync + 'static,
    ) -> OpDef {
        OpDef { compute: Some(Arc::new(f)), ..self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_arity(&self) -> &Arity {
        &self.num_inputs
    }

    pub fn output_arity(&self) -> &Arity {
        &self.num_outputs
    }

    pub fn attr_parser_fn(&self) -> Option<&DynAttrParser> {
        self.attr_parser.as_deref()
    }

    pub fn shape_rule(&self) -> Option<&DynInferShape> {
        self.infer_shape.as_deref()
    }

    pub fn type_rule(&self) -> Option<&DynInferType> {
        self.infer_type.as_deref()
    }

    pub fn layout_rule(&self) -> Option<&DynInferLayout> {
        self.infer_layout.as_deref()
    }

    pub fn prepack_rule(&self) -> Option<&DynWeightPrepack> {
        self.weight_prepack.as_deref()
    }

    pub fn compute_rule(&self) -> Option<&DynCompute> {
        self.compute.as_deref()
    }
}

impl fmt::Debug for OpDef {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "OpDef({}, {:?} -> {:?})", self.name, self.num_inputs, self.num_outputs)
    }
}

/// Read-only mapping from operator name to definition.
#[derive(Clone, Default)]
pub struct OpRegistry {
    ops: HashMap<String, Arc<OpDef>>,
}

impl OpRegistry {
    pub fn new() -> OpRegistry {
        OpRegistry::default()
    }

    /// The standard operator set.
    pub fn core() -> OpRegistry {
        let mut reg = OpRegistry::new();
        nn::register(&mut reg);
        reg
    }

    /// Add or override an operator. Registration happens at startup;
    /// passes only ever read.
    pub fn register(&mut self, op: OpDef) -> &mut OpRegistry {
        self.ops.insert(op.name.clone(), Arc::new(op));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<OpDef>> {
        self.ops.get(name)
    }

    pub fn expect(&self, name: &str) -> GraftResult<&Arc<OpDef>> {
        self.get(name).with_context(|| format!("operator {} is not registered", name))
    }

    /// Build an operator node: look the operator up, parse the attribute
    /// dictionary, check arity.
    pub fn build_node(
        &self,
        op: &str,
        name: impl Into<String>,
        inputs: Vec<NodeEntry>,
        dict: &[(&str, &str)],
    ) -> GraftResult<Arc<Node>> {
        let op = self.expect(op)?;
        let dict =
            dict.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>();
        Node::build(op, name, inputs, dict)
    }

    /// [OpRegistry::build_node], returning the node's first output.
    pub fn make_node(
        &self,
        op: &str,
        name: impl Into<String>,
        inputs: Vec<NodeEntry>,
        dict: &[(&str, &str)],
    ) -> GraftResult<NodeEntry> {
        Ok(NodeEntry::of(&self.build_node(op, name, inputs, dict)?))
    }
}

/// The process-wide registry, populated once and frozen.
pub fn global() -> &'static OpRegistry {
    static GLOBAL: OnceLock<OpRegistry> = OnceLock::new();
    GLOBAL.get_or_init(OpRegistry::core)
}

// attribute dictionary access, shared by the operator parsers

pub(crate) fn attr<T: FromStr>(attrs: &NodeAttrs, key: &str) -> GraftResult<T>
where
    T::Err: fmt::Display,
{
    let value = attrs
        .dict
        .get(key)
        .with_context(|| format!("node {}: missing attribute {}", attrs.name, key))?;
    value.parse::<T>().map_err(|e| {
        anyhow!("node {}: attribute {}={:?} does not parse: {}", attrs.name, key, value, e)
    })
}

pub(crate) fn attr_or<T: FromStr>(attrs: &NodeAttrs, key: &str, default: T) -> GraftResult<T>
where
    T::Err: fmt::Display,
{
    match attrs.dict.get(key) {
        None => Ok(default),
        Some(_) => attr(attrs, key),
    }
}

pub(crate) fn attr_bool(attrs: &NodeAttrs, key: &str, default: bool) -> GraftResult<bool> {
    match attrs.dict.get(key).map(|s| s.as_str()) {
        None => Ok(default),
        Some("1") | Some("true") | Some("True") => Ok(true),
        Some("0") | Some("false") | Some("False") => Ok(false),
        Some(other) => {
            bail!("node {}: attribute {}={:?} is not a boolean", attrs.name, key, other)
        }
    }
}

/// Parse a dimension tuple attribute: `(1, 1)`, `[1, 1]` or `1,1`.
pub(crate) fn attr_dims(attrs: &NodeAttrs, key: &str, default: &[usize]) -> GraftResult<TVec<usize>> {
    let Some(value) = attrs.dict.get(key) else {
        return Ok(default.iter().copied().collect());
    };
    value
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']'])
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim().parse::<usize>().map_err(|e| {
                anyhow!("node {}: attribute {}={:?} does not parse: {}", attrs.name, key, value, e)
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_lookup() {
        let reg = OpRegistry::core();
        assert!(reg.get("relu").is_some());
        assert!(reg.get("batch_norm").is_some());
        assert!(reg.get("made_up").is_none());
        assert!(reg.expect("made_up").is_err());
    }

    #[test]
    fn global_is_frozen_core() {
        assert!(global().get("__layout_transform__").is_some());
    }

    #[test]
    fn registries_are_independent() {
        let mut reg = OpRegistry::core();
        reg.register(OpDef::new("custom").num_inputs(2).num_outputs(1));
        assert!(reg.get("custom").is_some());
        assert!(global().get("custom").is_none());
    }

    #[test]
    fn dims_attribute_parsing() {
        let x = NodeEntry::of(&Node::variable("x"));
        let w = NodeEntry::of(&Node::variable("w"));
        let reg = OpRegistry::core();
        let node = reg
            .build_node(
                "conv2d",
                "conv",
                vec![x, w],
                &[
                    ("channels", "8"),
                    ("kernel_size", "(3, 3)"),
                    ("strides", "[2,2]"),
                    ("use_bias", "false"),
                ],
            )
            .unwrap();
        let param = node.attrs.params::<nn::Conv2DParam>().unwrap();
        assert_eq!(param.channels, 8);
        assert_eq!(param.kernel_size, tvec!(3, 3));
        assert_eq!(param.strides, tvec!(2, 2));
        assert_eq!(param.padding, tvec!(0, 0));
    }
}
