//! Unbounded lock-free MPMC queue based on split reference counting for Rust
//!
//! Every node of `LockFreeQueue` carries a split reference counter. Threads never dereference a
//! node before they `checkout` the atomic slot pointing at it, which bumps an auxiliary count
//! packed next to the node address in the same word. When the slot is replaced, its auxiliary
//! count is folded into the node's internal count in one atomic step, and every visitor later
//! gives its reference back there. A node is freed by whichever thread brings both halves of the
//! counter to zero, so no node is freed while some thread still uses it and no address can be
//! reused under a pending compare-and-swap, which solves the
//! [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem) without hazard pointers or epochs.
//!
//! `LockFreeQueue` contains a few simple methods like `enqueue`, `dequeue`.
//!

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;

pub mod util;
pub mod error;
pub mod tagged_ptr;
pub mod ref_count;
pub mod lockfree_queue;
