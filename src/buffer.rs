use crate::{config::Config, op::Gradient, types::Value};
use derive_more::Debug;

/// Per-node staging area for partial gradients.
///
/// One buffer exists per reachable node and invocation, sized to the node's
/// declared input slot count. Predecessors deliver into it one gradient at a
/// time; two deliveries landing in the same slot are summed via
/// [`Gradient::accumulate`]. The buffer itself is not synchronized — the
/// owning invocation guards each buffer with its own lock, so contention is
/// local to one node.
///
/// Completeness is governed by the invocation's dependency counter, not by
/// slot occupancy: a node with three incoming edges on one slot is complete
/// after three deliveries. Once complete, the buffer is moved out of its
/// staging slot and never returns.
#[must_use]
#[derive(Debug)]
pub struct InputBuffer<C: Config> {
    slots: Vec<Option<Value<C>>>,
}

impl<C: Config> Default for InputBuffer<C> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<C: Config> InputBuffer<C> {
    /// Buffer with `num_inputs` empty slots.
    pub fn new(num_inputs: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(num_inputs, || None);
        Self { slots }
    }

    /// Deliver one partial gradient into `slot`, summing with any value
    /// already staged there.
    ///
    /// # Panics
    /// If `slot` is outside the buffer. Slot indices are validated when the
    /// graph is wired, so this is an internal invariant.
    pub fn add(&mut self, slot: usize, value: Value<C>) {
        let entry = self.slots.get_mut(slot).expect("InputBuffer::add: [1]");
        *entry = Some(match entry.take() {
            Some(staged) => staged.accumulate(value),
            None => value,
        });
    }

    /// The staged gradients, indexed by input slot.
    #[must_use]
    pub fn slots(&self) -> &[Option<Value<C>>] {
        &self.slots
    }

    /// Mutable view of the staged gradients, handed to pre-execution hooks.
    pub fn slots_mut(&mut self) -> &mut [Option<Value<C>>] {
        &mut self.slots
    }

    /// Consume the buffer, yielding the staged gradients by slot.
    #[must_use]
    pub fn into_slots(self) -> Vec<Option<Value<C>>> {
        self.slots
    }

    /// Whether no slot holds a value yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        op::{Op, OpApi, OpError},
        types::Value,
    };
    use std::fmt::Debug;

    #[derive(Debug, Clone, PartialEq)]
    struct Grad(f64);

    impl Gradient for Grad {
        fn accumulate(self, other: Self) -> Self {
            Grad(self.0 + other.0)
        }
    }

    #[derive(Debug)]
    struct Noop;

    struct Cfg;

    impl Config for Cfg {
        type Value = Grad;
        type Op = Noop;
    }

    impl Op<Cfg> for Noop {
        fn apply(
            &self,
            _api: &impl OpApi<Cfg>,
            _inputs: &[Option<Value<Cfg>>],
        ) -> Result<Vec<Value<Cfg>>, OpError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn first_delivery_occupies_slot() {
        let mut buffer = InputBuffer::<Cfg>::new(2);
        assert!(buffer.is_empty());
        buffer.add(1, Grad(3.0));
        assert_eq!(buffer.slots(), [None, Some(Grad(3.0))]);
    }

    #[test]
    fn same_slot_deliveries_accumulate() {
        let mut buffer = InputBuffer::<Cfg>::new(1);
        buffer.add(0, Grad(1.0));
        buffer.add(0, Grad(1.0));
        buffer.add(0, Grad(0.5));
        assert_eq!(buffer.into_slots(), [Some(Grad(2.5))]);
    }

    #[test]
    #[should_panic(expected = "InputBuffer::add")]
    fn out_of_range_slot_is_a_defect() {
        let mut buffer = InputBuffer::<Cfg>::new(1);
        buffer.add(1, Grad(1.0));
    }
}
