//! Unbounded multi-producer multi-consumer queue.
//!
//! `head` and `tail` are `AtomicTaggedPtr` slots. The queue always holds one node whose value
//! has not been claimed yet (initially a dummy), so `head` and `tail` pointing at the same node
//! means the queue is empty.
//!
//! A producer checks out `tail` and races to claim the value slot of the tail node. The winner
//! links its freshly allocated node as `next` and swings `tail` over to it; losers wait for the
//! tail to move and try again on the new one. A consumer checks out `head` and races to swing it
//! to `next`; the winner takes the value out of the detached node.
//!
//! Nodes are reclaimed with split reference counting, see `ref_count`.
use error::AllocError;
use ref_count::AtomicNodeCount;
use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use tagged_ptr::{AtomicTaggedPtr, TaggedPtr};
use util;
use util::WrappedAlign64Type;

type FIFONodePtr<T> = *mut FIFONode<T>;

#[repr(align(64))]
struct FIFONode<T> {
    /// Null until claimed by a producer, never reset afterwards. The boxed value is owned by
    /// the queue from the claim until the dequeue which detaches the node.
    value: AtomicPtr<T>,
    count: AtomicNodeCount,
    next: AtomicTaggedPtr<FIFONode<T>>,
}

impl<T> Default for FIFONode<T> {
    fn default() -> Self {
        FIFONode {
            value: AtomicPtr::new(ptr::null_mut()),
            count: AtomicNodeCount::default(),
            next: AtomicTaggedPtr::default(),
        }
    }
}

/// Node allocation statistics of one queue.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub struct NodeStats {
    /// Nodes allocated so far, including the dummy.
    pub allocated: usize,
    /// Nodes freed so far.
    pub reclaimed: usize,
}

impl NodeStats {
    /// Nodes which are still allocated.
    pub fn live(&self) -> usize {
        self.allocated - self.reclaimed
    }
}

impl fmt::Display for NodeStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "allocated={} reclaimed={} live={}",
            self.allocated,
            self.reclaimed,
            self.live()
        )
    }
}

/// Lock-free FIFO queue. Any number of threads may `enqueue` and `dequeue` concurrently through
/// a shared reference.
///
/// # Examples
///
/// ```
/// use rs_split_queue::lockfree_queue::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.enqueue(1);
/// queue.enqueue(2);
/// assert_eq!(queue.dequeue(), Some(1));
/// assert_eq!(queue.dequeue(), Some(2));
/// assert_eq!(queue.dequeue(), None);
/// ```
///
pub struct LockFreeQueue<T> {
    head: WrappedAlign64Type<AtomicTaggedPtr<FIFONode<T>>>,
    tail: WrappedAlign64Type<AtomicTaggedPtr<FIFONode<T>>>,
    allocated: WrappedAlign64Type<AtomicUsize>,
    reclaimed: WrappedAlign64Type<AtomicUsize>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}

unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T> LockFreeQueue<T> {
    /// Create an empty queue holding a single dummy node.
    ///
    /// # Panics
    ///
    /// Panics if the allocator hands out a node address which cannot be packed into a tagged
    /// pointer, see `TaggedPtr::try_new`.
    pub fn new() -> LockFreeQueue<T> {
        let dummy = TaggedPtr::new(Box::into_raw(Box::new(FIFONode::default())), 1);
        LockFreeQueue {
            head: WrappedAlign64Type(AtomicTaggedPtr::new(dummy)),
            tail: WrappedAlign64Type(AtomicTaggedPtr::new(dummy)),
            allocated: WrappedAlign64Type(AtomicUsize::new(1)),
            reclaimed: WrappedAlign64Type(AtomicUsize::new(0)),
            _marker: PhantomData,
        }
    }

    /// Append `v` at the tail. Aborts the process if memory cannot be allocated.
    pub fn enqueue(&self, v: T) {
        if self.try_enqueue(v).is_err() {
            alloc::handle_alloc_error(Layout::new::<FIFONode<T>>());
        }
    }

    /// Append `v` at the tail, handing it back if a node cannot be allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_split_queue::lockfree_queue::LockFreeQueue;
    ///
    /// let queue = LockFreeQueue::new();
    /// assert!(queue.try_enqueue(String::from("a")).is_ok());
    /// assert_eq!(queue.dequeue().unwrap(), "a");
    /// ```
    ///
    pub fn try_enqueue(&self, v: T) -> Result<(), AllocError<T>> {
        self.try_enqueue_with(v, Self::alloc_node)
    }

    /// Allocate a fresh node and pack it with the initial aux count. A node whose address cannot
    /// be packed is freed again and reported like an allocation failure.
    fn alloc_node() -> Option<TaggedPtr<FIFONode<T>>> {
        let node = match util::try_box(FIFONode::default()) {
            Ok(b) => Box::into_raw(b),
            Err(_) => {
                warn!("enqueue fail, cannot allocate node");
                return None;
            }
        };
        let tagged = TaggedPtr::try_new(node, 1);
        if tagged.is_none() {
            warn!("enqueue fail, node address {:p} cannot be tagged", node);
            unsafe { drop(Box::from_raw(node)) };
        }
        tagged
    }

    fn try_enqueue_with<F>(&self, v: T, alloc_node: F) -> Result<(), AllocError<T>>
    where
        F: FnOnce() -> Option<TaggedPtr<FIFONode<T>>>,
    {
        let value = match util::try_box(v) {
            Ok(b) => Box::into_raw(b),
            Err(v) => {
                warn!("enqueue fail, cannot allocate value");
                return Err(AllocError(v));
            }
        };
        let node = match alloc_node() {
            Some(node) => node,
            None => {
                let v = unsafe { *Box::from_raw(value) };
                return Err(AllocError(v));
            }
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        unsafe { self.inner_enqueue(value, node) }
        Ok(())
    }

    unsafe fn inner_enqueue(&self, value: *mut T, new_tail: TaggedPtr<FIFONode<T>>) {
        loop {
            let old_tail = self.tail.checkout();
            let node = old_tail.ptr();
            if (*node)
                .value
                .compare_exchange(ptr::null_mut(), value, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                (*node).next.store(new_tail, Ordering::Release);
                let replaced = self.tail.swap(new_tail, Ordering::AcqRel);
                debug_assert_eq!(replaced.ptr(), node);
                self.retire(replaced);
                return;
            }
            // Another producer owns this node now; wait until it has published its successor.
            // Our checkout keeps the node alive, so its address cannot show up again meanwhile.
            while self.tail.load(Ordering::Acquire).ptr() == node {
                util::pause();
            }
            self.release(node);
        }
    }

    /// Remove the oldest value, or return `None` if the queue is empty at the moment.
    pub fn dequeue(&self) -> Option<T> {
        unsafe { self.inner_dequeue() }
    }

    unsafe fn inner_dequeue(&self) -> Option<T> {
        loop {
            let old_head = self.head.checkout();
            let node = old_head.ptr();
            if node == self.tail.load(Ordering::Acquire).ptr() {
                self.abandon(&self.head, old_head);
                return None;
            }
            let next = (*node).next.load(Ordering::Acquire);
            debug_assert!(!next.is_null());
            if self
                .head
                .compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // The slot keeps the moved-out pointer: a producer still holding this detached
                // node must never be able to claim it again.
                let value = (*node).value.load(Ordering::Acquire);
                debug_assert!(!value.is_null());
                self.retire(old_head);
                return Some(*Box::from_raw(value));
            }
            self.release(node);
            util::pause();
        }
    }

    /// Return true if the queue was empty at some instant during the call.
    pub fn is_empty(&self) -> bool {
        let old_head = self.head.checkout();
        let empty = old_head.ptr() == self.tail.load(Ordering::Acquire).ptr();
        unsafe { self.abandon(&self.head, old_head) };
        empty
    }

    /// Snapshot of the node counters.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue, free every node and return the final node statistics.
    ///
    /// # Examples
    ///
    /// ```
    /// use rs_split_queue::lockfree_queue::LockFreeQueue;
    ///
    /// let queue = LockFreeQueue::new();
    /// queue.enqueue(1);
    /// queue.enqueue(2);
    /// let stats = queue.destroy();
    /// assert_eq!(stats.allocated, 3);
    /// assert_eq!(stats.live(), 0);
    /// ```
    ///
    pub fn destroy(mut self) -> NodeStats {
        unsafe { self.inner_destroy() };
        self.stats()
    }

    unsafe fn inner_destroy(&mut self) {
        if self.head.load(Ordering::Relaxed).is_null() {
            return;
        }
        let mut drained = 0_usize;
        while self.inner_dequeue().is_some() {
            drained += 1;
        }
        let dummy = self.head.load(Ordering::Relaxed).ptr();
        debug_assert_eq!(dummy, self.tail.load(Ordering::Relaxed).ptr());
        self.reclaim(dummy);
        self.head.store(TaggedPtr::null(), Ordering::Relaxed);
        self.tail.store(TaggedPtr::null(), Ordering::Relaxed);
        debug!("destroy queue, drained={} {}", drained, self.stats());
    }

    /// Give up a checkout of `slot` that did not lead to a retirement.
    unsafe fn abandon(&self, slot: &AtomicTaggedPtr<FIFONode<T>>, held: TaggedPtr<FIFONode<T>>) {
        if !slot.try_return(held) {
            self.release(held.ptr());
        }
    }

    unsafe fn release(&self, node: FIFONodePtr<T>) {
        if (*node).count.release() {
            self.reclaim(node);
        }
    }

    unsafe fn retire(&self, old: TaggedPtr<FIFONode<T>>) {
        let node = old.ptr();
        if (*node).count.retire(old.aux_count()) {
            self.reclaim(node);
        }
    }

    unsafe fn reclaim(&self, node: FIFONodePtr<T>) {
        drop(Box::from_raw(node));
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        trace!("reclaim node {:p}", node);
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        unsafe {
            self.inner_destroy();
        }
    }
}
