//! Split reference counter of a queue node.
//!
//! `external` is the number of `AtomicTaggedPtr` slots still pointing at the node, `internal`
//! collects the checkouts those slots handed out once they are folded in by `retire`, minus the
//! checkouts already given back by `release`. Both halves live in one `AtomicU64` (low 32 bits
//! `internal`, high 32 bits `external`) and are always updated by a single CAS, so the thread
//! that observes both reaching zero is the only one that may free the node.
use std::sync::atomic::{AtomicU64, Ordering};
use util;

/// A snapshot of both counter halves.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct NodeCount {
    pub internal: i32,
    pub external: u32,
}

impl NodeCount {
    /// A fresh node is referenced by the tail slot and by its predecessor's `next`.
    pub const INITIAL_EXTERNAL: u32 = 2;

    #[inline]
    fn to_bits(self) -> u64 {
        u64::from(self.internal as u32) | (u64::from(self.external) << 32)
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        NodeCount {
            internal: bits as u32 as i32,
            external: (bits >> 32) as u32,
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.internal == 0 && self.external == 0
    }
}

impl Default for NodeCount {
    fn default() -> Self {
        NodeCount {
            internal: 0,
            external: NodeCount::INITIAL_EXTERNAL,
        }
    }
}

pub struct AtomicNodeCount {
    bits: AtomicU64,
}

impl Default for AtomicNodeCount {
    fn default() -> Self {
        AtomicNodeCount {
            bits: AtomicU64::new(NodeCount::default().to_bits()),
        }
    }
}

impl AtomicNodeCount {
    #[inline]
    pub fn load(&self, order: Ordering) -> NodeCount {
        NodeCount::from_bits(self.bits.load(order))
    }

    fn update<F>(&self, f: F) -> NodeCount
    where
        F: Fn(NodeCount) -> NodeCount,
    {
        let mut old = self.bits.load(Ordering::Relaxed);
        loop {
            let new = f(NodeCount::from_bits(old));
            match self.bits.compare_exchange_weak(
                old,
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return new,
                Err(actual) => {
                    old = actual;
                    util::pause();
                }
            }
        }
    }

    /// Give back one checkout which was never folded into a retirement. Returns true if the
    /// caller now has to free the node.
    pub fn release(&self) -> bool {
        self.update(|mut c| {
            c.internal -= 1;
            c
        })
        .is_zero()
    }

    /// Fold the final auxiliary count of a slot that stopped pointing at the node. Two of those
    /// checkouts are not outstanding: the slot's own base reference and the retiring thread's.
    /// Returns true if the caller now has to free the node.
    pub fn retire(&self, aux_count: u64) -> bool {
        debug_assert!(aux_count >= 2, "retired slot was never checked out");
        let increase = aux_count as i32 - 2;
        self.update(|mut c| {
            debug_assert!(c.external > 0, "node retired more often than referenced");
            c.external -= 1;
            c.internal += increase;
            c
        })
        .is_zero()
    }
}
