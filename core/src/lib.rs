//! # graft-core
//!
//! Layout-aware rewriting core for tensor operator graphs.
//!
//! A computation graph comes in as a DAG of reference-counted nodes plus
//! per-edge attribute vectors (`shape`, `dtype`, optionally `layout`). The
//! passes in [passes] specialize it for inference:
//!
//! * [passes::simplify_inference] folds batch normalization into an affine
//!   form and drops dropout,
//! * [passes::pre_pack] lets operators pre-pack their weights into blocked
//!   memory layouts,
//! * [passes::layout_transform] propagates layout descriptors edge by edge
//!   and materializes explicit `__layout_transform__` nodes wherever a
//!   producer and a consumer disagree.
//!
//! Operator semantics (arity, attribute parsing, inference rules, weight
//! pre-packing) are data looked up in an [ops::OpRegistry]; the registry is
//! injectable so alternate operator sets can be exercised in isolation.

#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub mod errors;
pub mod model;
pub mod ops;
pub mod passes;
pub mod transform;

pub use graft_data as data;

pub mod prelude {
    pub use crate::errors::GraphError;
    pub use crate::model::{
        Graph, GraphAttr, IndexedGraph, Node, NodeAttrs, NodeEntry, NodeId, TensorFact,
    };
    pub use crate::ops::{OpDef, OpRegistry};
    pub use crate::passes::{
        layout_transform, pre_pack, simplify_inference, Pass, Pipeline,
    };
    pub use crate::transform::{graph_transform, graph_transform_with_mirror};
    pub use graft_data::prelude::*;
}

pub mod internal {
    pub use crate::model::attributes;
    pub use crate::model::{IndexedEntry, IndexedNode, OpParams};
    pub use crate::ops::{
        FCompute, FInferLayout, FInferShape, FInferType, FWeightPrepack,
    };
    pub use crate::prelude::*;
    pub use graft_data::internal::*;
    pub use std::collections::{HashMap, HashSet};
    pub use std::sync::Arc;
}

#[cfg(test)]
#[allow(dead_code)]
fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("GRAFT_LOG").try_init();
}
