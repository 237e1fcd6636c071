extern crate time;

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};

static GLOBAL_THREAD_ID: AtomicI64 = AtomicI64::new(0);

/// Sequential id of the calling thread, assigned on first use.
pub fn get_thread_id() -> i64 {
    thread_local!(static THREAD_ID: Cell<i64> = Cell::new(-1););
    THREAD_ID.with(|tid| {
        if -1 == tid.get() {
            tid.set(GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        tid.get()
    })
}

#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

/// Move `value` into a fresh heap allocation, giving it back instead of aborting when the
/// allocator is out of memory.
pub fn try_box<T>(value: T) -> Result<Box<T>, T> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }
    unsafe {
        let raw = alloc::alloc(layout) as *mut T;
        if raw.is_null() {
            return Err(value);
        }
        ptr::write(raw, value);
        Ok(Box::from_raw(raw))
    }
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}
