// Intrusive reference-counted ownership handle
//
// Every GPU object wrapper in this crate lives behind a Handle. The count is
// stored in the same heap block as the object. The counting strategy is a
// type parameter:
//
// - LocalCount (default): a plain Cell<i32>. The handle is !Send and !Sync,
//   so handing it to another thread is a compile error rather than a data race.
// - AtomicCount: opt-in for handles shared across threads (SharedHandle<T>).
//
// Dropping a count below zero means the bookkeeping is already corrupt; that
// is asserted, never repaired.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicI32, Ordering};

/// Counting strategy for [`Handle`].
pub trait RefCount {
    fn new(initial: i32) -> Self;
    fn get(&self) -> i32;
    /// Returns the count after incrementing.
    fn increment(&self) -> i32;
    /// Returns the count after decrementing.
    fn decrement(&self) -> i32;
}

/// Unsynchronized count for thread-confined handles.
pub struct LocalCount(Cell<i32>);

impl RefCount for LocalCount {
    fn new(initial: i32) -> Self {
        Self(Cell::new(initial))
    }

    fn get(&self) -> i32 {
        self.0.get()
    }

    fn increment(&self) -> i32 {
        let n = self.0.get() + 1;
        self.0.set(n);
        n
    }

    fn decrement(&self) -> i32 {
        let n = self.0.get() - 1;
        self.0.set(n);
        n
    }
}

/// Atomic count for handles shared between threads.
pub struct AtomicCount(AtomicI32);

impl RefCount for AtomicCount {
    fn new(initial: i32) -> Self {
        Self(AtomicI32::new(initial))
    }

    fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn decrement(&self) -> i32 {
        let n = self.0.fetch_sub(1, Ordering::Release) - 1;
        if n == 0 {
            // Synchronize with every other release before the object is freed
            atomic::fence(Ordering::Acquire);
        }
        n
    }
}

struct Shared<T, C> {
    count: C,
    value: T,
}

enum Slot<T, C> {
    Empty,
    Owned(NonNull<Shared<T, C>>),
    /// Lifetime managed outside the handle; never counted, never freed.
    External(NonNull<T>),
}

/// Reference-counted owner of a single heap object.
///
/// Clones share the object, drops release it, and the object is destroyed
/// synchronously when the last owning handle goes away.
pub struct Handle<T, C: RefCount = LocalCount> {
    slot: Slot<T, C>,
    _marker: PhantomData<Shared<T, C>>,
}

/// Handle with an atomic count, for objects shared across threads.
pub type SharedHandle<T> = Handle<T, AtomicCount>;

unsafe impl<T: Send + Sync> Send for Handle<T, AtomicCount> {}
unsafe impl<T: Send + Sync> Sync for Handle<T, AtomicCount> {}

impl<T, C: RefCount> Handle<T, C> {
    pub fn new(value: T) -> Self {
        let shared = Box::new(Shared {
            count: C::new(1),
            value,
        });
        Self {
            slot: Slot::Owned(NonNull::from(Box::leak(shared))),
            _marker: PhantomData,
        }
    }

    /// An unset handle. `is_valid_ref` reports false and dereferencing panics.
    pub fn empty() -> Self {
        Self {
            slot: Slot::Empty,
            _marker: PhantomData,
        }
    }

    /// Wraps an object whose lifetime is managed elsewhere. The handle never
    /// counts or frees it.
    ///
    /// # Safety
    /// `ptr` must stay valid for as long as this handle or any clone of it
    /// is alive.
    pub unsafe fn from_external(ptr: NonNull<T>) -> Self {
        Self {
            slot: Slot::External(ptr),
            _marker: PhantomData,
        }
    }

    pub fn from_static(value: &'static T) -> Self {
        // SAFETY: a 'static reference outlives every handle
        unsafe { Self::from_external(NonNull::from(value)) }
    }

    pub fn is_valid_ref(&self) -> bool {
        match &self.slot {
            Slot::Empty => false,
            Slot::Owned(ptr) => unsafe { ptr.as_ref() }.count.get() > 0,
            Slot::External(_) => true,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.slot, Slot::External(_))
    }

    /// Current owner count. External and empty handles report 0.
    pub fn ref_count(&self) -> i32 {
        match &self.slot {
            Slot::Owned(ptr) => unsafe { ptr.as_ref() }.count.get(),
            _ => 0,
        }
    }

    /// Manually adds an owner for a sub-object that keeps a raw pointer to the
    /// value instead of a handle. Returns the new count. Pair with
    /// [`Handle::release_ref`], otherwise the object leaks.
    pub fn add_ref(&self) -> i32 {
        match &self.slot {
            Slot::Owned(ptr) => unsafe { ptr.as_ref() }.count.increment(),
            _ => panic!("add_ref on a handle that does not own a count"),
        }
    }

    /// Gives back an owner taken with [`Handle::add_ref`].
    ///
    /// # Safety
    /// Must balance an earlier `add_ref`. Releasing an owner that some other
    /// handle still relies on leaves that handle dangling.
    pub unsafe fn release_ref(&self) -> i32 {
        match &self.slot {
            Slot::Owned(ptr) => {
                let remaining = ptr.as_ref().count.decrement();
                assert!(
                    remaining >= 1,
                    "release_ref dropped the last owner of a live handle"
                );
                remaining
            }
            _ => panic!("release_ref on a handle that does not own a count"),
        }
    }

    /// Destroys the object now, whatever the count, and returns whether this
    /// handle was the sole owner. Lifetime-audit tool only.
    ///
    /// # Safety
    /// Every other handle to the same object dangles afterwards and must not
    /// be dereferenced or dropped.
    pub unsafe fn debug_deconstruction(&mut self) -> bool {
        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Owned(ptr) => {
                let sole = ptr.as_ref().count.get() == 1;
                drop(Box::from_raw(ptr.as_ptr()));
                sole
            }
            Slot::External(_) | Slot::Empty => false,
        }
    }

    pub fn get(&self) -> Option<&T> {
        match &self.slot {
            Slot::Empty => None,
            Slot::Owned(ptr) => Some(unsafe { &ptr.as_ref().value }),
            Slot::External(ptr) => Some(unsafe { ptr.as_ref() }),
        }
    }

    /// True when both handles point at the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        match (a.get(), b.get()) {
            (Some(x), Some(y)) => std::ptr::eq(x, y),
            _ => false,
        }
    }
}

impl<T, C: RefCount> Clone for Handle<T, C> {
    fn clone(&self) -> Self {
        let slot = match &self.slot {
            Slot::Empty => Slot::Empty,
            Slot::Owned(ptr) => {
                unsafe { ptr.as_ref() }.count.increment();
                Slot::Owned(*ptr)
            }
            Slot::External(ptr) => Slot::External(*ptr),
        };
        Self {
            slot,
            _marker: PhantomData,
        }
    }
}

impl<T, C: RefCount> Drop for Handle<T, C> {
    fn drop(&mut self) {
        if let Slot::Owned(ptr) = self.slot {
            let remaining = unsafe { ptr.as_ref() }.count.decrement();
            assert!(
                remaining >= 0,
                "Handle reference count is below 0. Handle<T> with LocalCount is not thread safe"
            );
            if remaining == 0 {
                // SAFETY: the count just reached zero, no other owner remains
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            }
        }
    }
}

impl<T, C: RefCount> Deref for Handle<T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get().expect("dereferenced an empty Handle")
    }
}

impl<T, C: RefCount> Default for Handle<T, C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: fmt::Debug, C: RefCount> fmt::Debug for Handle<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Slot::Empty => f.write_str("Handle(<empty>)"),
            Slot::Owned(_) => f
                .debug_struct("Handle")
                .field("refs", &self.ref_count())
                .field("value", &**self)
                .finish(),
            Slot::External(_) => f.debug_tuple("Handle::External").field(&**self).finish(),
        }
    }
}
