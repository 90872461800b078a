use crate::config::Config;
use derive_more::Display;
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Unique identifier of a node in the graph arena.
///
/// Plain index into the arena's node table; only meaningful for the
/// [`Graph`](crate::graph::Graph) that issued it.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("node#{_0}")]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a compute device, `0..num_devices`.
///
/// Each device owns exactly one ready queue and one worker thread.
pub type DeviceId = usize;

/// Gradient value type bound to a specific `Config`.
pub type Value<C> = <C as Config>::Value;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
