//! Tagged node references.
//!
//! A `TaggedPtr` pairs a node address with an auxiliary count and packs both into one `u64`,
//! so that they are always loaded, compared and swapped together. Nodes are 64-byte aligned,
//! which leaves the low 6 address bits free; the address is stored shifted right by
//! `ALIGN_SHIFT` and the count occupies the remaining high bits.
//!
//! Every thread that wants to dereference the node behind an `AtomicTaggedPtr` must first
//! `checkout` the slot, which bumps the auxiliary count in place. The count is later folded into
//! the node's own reference counter when the slot is replaced, see `ref_count`.
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use util;

/// Number of low address bits which are zero for every node.
pub const ALIGN_SHIFT: u32 = 6;

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Bits of the shifted address, enough for a 48-bit virtual address space.
        const ADDR_BITS: u32 = 48 - ALIGN_SHIFT;
    } else {
        /// Bits of the shifted address.
        const ADDR_BITS: u32 = 32 - ALIGN_SHIFT;
    }
}

const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// Largest auxiliary count a `TaggedPtr` can hold.
pub const MAX_AUX_COUNT: u64 = !0 >> ADDR_BITS;

/// Node address plus auxiliary count.
pub struct TaggedPtr<N> {
    bits: u64,
    _marker: PhantomData<*mut N>,
}

impl<N> Clone for TaggedPtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for TaggedPtr<N> {}

impl<N> PartialEq for TaggedPtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<N> Eq for TaggedPtr<N> {}

impl<N> fmt::Debug for TaggedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaggedPtr({:p}, {})", self.ptr(), self.aux_count())
    }
}

impl<N> TaggedPtr<N> {
    #[inline]
    fn from_bits(bits: u64) -> Self {
        TaggedPtr {
            bits,
            _marker: PhantomData,
        }
    }

    /// Pack `ptr` and `aux_count`, or return `None` if `ptr` is not 64-byte aligned, does not
    /// fit into the address bits (e.g. a pointer tagged in its top byte) or `aux_count` is
    /// larger than `MAX_AUX_COUNT`.
    #[inline]
    pub fn try_new(ptr: *mut N, aux_count: u64) -> Option<Self> {
        let addr = ptr as usize as u64;
        if addr & ((1 << ALIGN_SHIFT) - 1) != 0
            || (addr >> ALIGN_SHIFT) & !ADDR_MASK != 0
            || aux_count > MAX_AUX_COUNT
        {
            return None;
        }
        Some(Self::from_bits((addr >> ALIGN_SHIFT) | (aux_count << ADDR_BITS)))
    }

    /// Pack `ptr` and `aux_count`. Panics if they cannot be represented, see `try_new`.
    #[inline]
    pub fn new(ptr: *mut N, aux_count: u64) -> Self {
        match Self::try_new(ptr, aux_count) {
            Some(p) => p,
            None => panic!("cannot pack node {:p} with aux count {}", ptr, aux_count),
        }
    }

    #[inline]
    pub fn null() -> Self {
        Self::from_bits(0)
    }

    #[inline]
    pub fn ptr(&self) -> *mut N {
        ((self.bits & ADDR_MASK) << ALIGN_SHIFT) as usize as *mut N
    }

    #[inline]
    pub fn aux_count(&self) -> u64 {
        self.bits >> ADDR_BITS
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.bits & ADDR_MASK == 0
    }

    /// Same node, different count.
    #[inline]
    pub fn with_aux_count(&self, aux_count: u64) -> Self {
        assert!(aux_count <= MAX_AUX_COUNT, "aux count overflow");
        Self::from_bits((self.bits & ADDR_MASK) | (aux_count << ADDR_BITS))
    }
}

/// A `TaggedPtr` slot which can be shared between threads.
pub struct AtomicTaggedPtr<N> {
    bits: AtomicU64,
    _marker: PhantomData<*mut N>,
}

impl<N> Default for AtomicTaggedPtr<N> {
    fn default() -> Self {
        Self::new(TaggedPtr::null())
    }
}

impl<N> AtomicTaggedPtr<N> {
    pub fn new(v: TaggedPtr<N>) -> Self {
        AtomicTaggedPtr {
            bits: AtomicU64::new(v.bits),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedPtr<N> {
        TaggedPtr::from_bits(self.bits.load(order))
    }

    #[inline]
    pub fn store(&self, v: TaggedPtr<N>, order: Ordering) {
        self.bits.store(v.bits, order)
    }

    #[inline]
    pub fn swap(&self, v: TaggedPtr<N>, order: Ordering) -> TaggedPtr<N> {
        TaggedPtr::from_bits(self.bits.swap(v.bits, order))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<N>,
        new: TaggedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<N>, TaggedPtr<N>> {
        self.bits
            .compare_exchange(current.bits, new.bits, success, failure)
            .map(TaggedPtr::from_bits)
            .map_err(TaggedPtr::from_bits)
    }

    /// Increment the auxiliary count of whatever the slot currently holds and return the
    /// incremented value. The node behind it stays allocated until the caller gives the
    /// reference back. A saturated count is waited out until other holders give theirs back or
    /// the slot moves on.
    pub fn checkout(&self) -> TaggedPtr<N> {
        let mut cur = self.load(Ordering::Relaxed);
        loop {
            if cur.aux_count() >= MAX_AUX_COUNT {
                util::pause();
                cur = self.load(Ordering::Relaxed);
                continue;
            }
            let next = cur.with_aux_count(cur.aux_count() + 1);
            match self.compare_exchange(cur, next, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(actual) => {
                    cur = actual;
                    util::pause();
                }
            }
        }
    }

    /// Undo a `checkout` of `held` while the slot still points at the same node. Returns false
    /// once the slot has moved on: the checkout was then folded into the node's counter and the
    /// caller has to release it there instead.
    pub fn try_return(&self, held: TaggedPtr<N>) -> bool {
        let mut cur = self.load(Ordering::Relaxed);
        while cur.ptr() == held.ptr() {
            debug_assert!(cur.aux_count() >= 2);
            let prev = cur.with_aux_count(cur.aux_count() - 1);
            match self.compare_exchange(cur, prev, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => {
                    cur = actual;
                    util::pause();
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time;
    use tagged_ptr::{AtomicTaggedPtr, TaggedPtr, MAX_AUX_COUNT};
    use util::WrappedAlign64Type;

    #[test]
    fn test_pack() {
        let mut obj = Box::new(WrappedAlign64Type(0_u64));
        let raw = &mut *obj as *mut WrappedAlign64Type<u64>;
        let p = TaggedPtr::new(raw, 3);
        assert_eq!(p.ptr(), raw);
        assert_eq!(p.aux_count(), 3);
        assert!(!p.is_null());

        let q = p.with_aux_count(MAX_AUX_COUNT);
        assert_eq!(q.ptr(), raw);
        assert_eq!(q.aux_count(), MAX_AUX_COUNT);
        assert!(p != q);

        let n = TaggedPtr::<WrappedAlign64Type<u64>>::null();
        assert!(n.is_null());
        assert!(n.ptr().is_null());
        assert!(n.with_aux_count(1).is_null());
    }

    #[test]
    fn test_checkout_and_return() {
        let mut a = Box::new(WrappedAlign64Type(1_u8));
        let mut b = Box::new(WrappedAlign64Type(2_u8));
        let pa = &mut *a as *mut WrappedAlign64Type<u8>;
        let pb = &mut *b as *mut WrappedAlign64Type<u8>;

        let slot = AtomicTaggedPtr::new(TaggedPtr::new(pa, 1));
        let first = slot.checkout();
        let second = slot.checkout();
        assert_eq!(first.aux_count(), 2);
        assert_eq!(second.aux_count(), 3);
        assert_eq!(second.ptr(), pa);

        assert!(slot.try_return(first));
        assert_eq!(slot.load(Ordering::Relaxed).aux_count(), 2);

        let old = slot.swap(TaggedPtr::new(pb, 1), Ordering::AcqRel);
        assert_eq!(old, TaggedPtr::new(pa, 2));
        assert!(!slot.try_return(second));
        assert_eq!(slot.load(Ordering::Relaxed), TaggedPtr::new(pb, 1));
    }

    #[test]
    fn test_compare_exchange() {
        let mut a = Box::new(WrappedAlign64Type(1_u8));
        let pa = &mut *a as *mut WrappedAlign64Type<u8>;
        let slot = AtomicTaggedPtr::new(TaggedPtr::new(pa, 1));
        let stale = TaggedPtr::new(pa, 1);
        slot.checkout();
        // Same node, different tag: must fail.
        let r = slot.compare_exchange(stale, TaggedPtr::null(), Ordering::AcqRel, Ordering::Relaxed);
        assert_eq!(r, Err(TaggedPtr::new(pa, 2)));
        assert!(!slot.load(Ordering::Acquire).is_null());
    }

    #[test]
    fn test_reject_unpackable() {
        let mut a = Box::new(WrappedAlign64Type(1_u8));
        let pa = &mut *a as *mut WrappedAlign64Type<u8>;
        assert!(TaggedPtr::try_new(pa, 1).is_some());
        assert!(TaggedPtr::try_new((pa as usize + 8) as *mut WrappedAlign64Type<u8>, 1).is_none());
        assert!(TaggedPtr::try_new(pa, MAX_AUX_COUNT + 1).is_none());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_reject_top_byte_tagged() {
        let raw = 0xb400_7f00_1234_5640_usize as *mut u64;
        assert!(TaggedPtr::try_new(raw, 1).is_none());
        let raw = 0x1_0000_0000_0000_usize as *mut u64;
        assert!(TaggedPtr::try_new(raw, 1).is_none());
        let raw = 0x7f00_1234_5640_usize as *mut u64;
        assert_eq!(TaggedPtr::try_new(raw, 1).map(|p| p.ptr()), Some(raw));
    }

    #[test]
    #[should_panic]
    fn test_new_panics_on_unpackable() {
        TaggedPtr::new(0x48_usize as *mut u64, 1);
    }

    #[test]
    #[should_panic]
    fn test_aux_count_overflow_panics() {
        TaggedPtr::new(0x40_usize as *mut u64, MAX_AUX_COUNT).with_aux_count(MAX_AUX_COUNT + 1);
    }

    struct ShardPtr<T>(*const T);

    unsafe impl<T> Send for ShardPtr<T> {}

    #[test]
    fn test_checkout_waits_for_saturated_count() {
        let mut a = Box::new(WrappedAlign64Type(1_u8));
        let pa = &mut *a as *mut WrappedAlign64Type<u8>;
        let slot = AtomicTaggedPtr::new(TaggedPtr::new(pa, MAX_AUX_COUNT));
        let slot_ptr = ShardPtr(&slot as *const AtomicTaggedPtr<WrappedAlign64Type<u8>>);

        let waiter = thread::spawn(move || {
            let slot_ptr = slot_ptr;
            let got = unsafe { (*slot_ptr.0).checkout() };
            (got.ptr() as usize, got.aux_count())
        });
        thread::sleep(time::Duration::from_millis(50));
        assert_eq!(slot.load(Ordering::Relaxed).aux_count(), MAX_AUX_COUNT);
        assert!(slot.try_return(TaggedPtr::new(pa, MAX_AUX_COUNT)));

        let (ptr, aux_count) = waiter.join().unwrap();
        assert_eq!(ptr, pa as usize);
        assert_eq!(aux_count, MAX_AUX_COUNT);
    }
}
