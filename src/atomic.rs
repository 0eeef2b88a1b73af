use crate::{mcas, rdcss};
use crossbeam_epoch::{pin, Guard};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Low bits of every stored word. Zero means a user value, anything else a
/// descriptor installed by an in-flight operation.
pub(crate) const TAG_MASK: usize = 0b11;
pub(crate) const RDCSS_TAG: usize = 1;
pub(crate) const CASN_TAG: usize = 2;

/// One word as stored in an [`Atomic`]: a tagged user value or a tagged
/// descriptor pointer. Equality is word identity.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Slot(usize);

impl Slot {
    pub(crate) fn from_usize(raw: usize) -> Self {
        Self(raw)
    }

    pub(crate) fn into_usize(self) -> usize {
        self.0
    }

    pub(crate) fn tag(self) -> usize {
        self.0 & TAG_MASK
    }

    /// Tag a descriptor address. The pointee alignment keeps the low bits free.
    pub(crate) fn descriptor<D>(ptr: *const D, tag: usize) -> Self {
        debug_assert!(std::mem::align_of::<D>() >= 4);
        debug_assert_eq!(ptr as usize & TAG_MASK, 0);
        debug_assert_ne!(tag & TAG_MASK, 0);
        Self(ptr as usize | tag)
    }

    pub(crate) fn descriptor_ptr<D>(self) -> *const D {
        (self.0 & !TAG_MASK) as *const D
    }
}

/// The raw cell behind an [`Atomic`]. `compare_exchange` hands the observed
/// word back because the protocols need to know which descriptor, if any,
/// was in the way.
pub(crate) struct AtomicSlot(AtomicUsize);

impl AtomicSlot {
    pub fn new(slot: Slot) -> Self {
        Self(AtomicUsize::new(slot.into_usize()))
    }

    pub fn load(&self) -> Slot {
        Slot::from_usize(self.0.load(Ordering::SeqCst))
    }

    pub fn compare_exchange(&self, expected: Slot, new: Slot) -> Result<Slot, Slot> {
        let exchanged = self.0.compare_exchange(
            expected.into_usize(),
            new.into_usize(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match exchanged {
            Ok(prev) => Ok(Slot::from_usize(prev)),
            Err(curr) => Err(Slot::from_usize(curr)),
        }
    }
}

/// Value types an [`Atomic`] can hold: word-sized, convertible to and from a
/// tagged [`Slot`]. Pointers must be at least 4-aligned; `usize` values lose
/// their top two bits to the tag.
pub trait Word: sealed::Word + Into<Slot> + From<Slot> + Copy {}

impl<T> Word for *mut T {}
impl<T> Word for *const T {}
impl Word for usize {}

impl<T> From<*mut T> for Slot {
    fn from(ptr: *mut T) -> Self {
        debug_assert_eq!(ptr as usize & TAG_MASK, 0);
        Slot::from_usize(ptr as usize)
    }
}

impl<T> From<Slot> for *mut T {
    fn from(slot: Slot) -> Self {
        slot.into_usize() as _
    }
}

impl<T> From<*const T> for Slot {
    fn from(ptr: *const T) -> Self {
        debug_assert_eq!(ptr as usize & TAG_MASK, 0);
        Slot::from_usize(ptr as usize)
    }
}

impl<T> From<Slot> for *const T {
    fn from(slot: Slot) -> Self {
        slot.into_usize() as _
    }
}

impl From<usize> for Slot {
    fn from(int: usize) -> Self {
        Slot::from_usize(int << 2)
    }
}

impl From<Slot> for usize {
    fn from(slot: Slot) -> Self {
        slot.into_usize() >> 2
    }
}

mod sealed {
    pub trait Word {}

    impl<T> Word for *mut T {}
    impl<T> Word for *const T {}
    impl Word for usize {}
}

/// A single-word atomic reference. The stored word is either a user value or
/// a transient descriptor; user code never observes the latter, every read
/// drives the owning operation to completion first.
pub struct Atomic<T: Word> {
    slot: AtomicSlot,
    _marker: PhantomData<T>,
}

unsafe impl<T: Word> Send for Atomic<T> {}
unsafe impl<T: Word> Sync for Atomic<T> {}

impl<T: Word> Atomic<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: AtomicSlot::new(value.into()),
            _marker: PhantomData,
        }
    }

    /// Current user value, after driving any installed descriptor terminal.
    pub fn get(&self) -> T {
        let guard = pin();
        self.get_in(&guard)
    }

    /// Unconditional write, expressed as a get/cas loop so an installed
    /// descriptor is never clobbered.
    pub fn set(&self, value: T) {
        let guard = pin();
        let new = value.into();
        loop {
            let curr = self.get_in(&guard);
            if self.cas_in(curr.into(), new, &guard) {
                return;
            }
        }
    }

    /// One-cell compare-and-swap. Fails only on a genuine value mismatch;
    /// descriptors in the way are helped and the attempt is retried.
    pub fn cas(&self, expected: T, new: T) -> bool {
        let guard = pin();
        self.cas_in(expected.into(), new.into(), &guard)
    }

    pub(crate) fn get_in(&self, guard: &Guard) -> T {
        loop {
            let curr = rdcss::read(&self.slot, guard);
            if curr.tag() == CASN_TAG {
                unsafe { mcas::help_foreign(curr, guard) };
                continue;
            }
            return curr.into();
        }
    }

    pub(crate) fn cas_in(&self, expected: Slot, new: Slot, guard: &Guard) -> bool {
        loop {
            match self.slot.compare_exchange(expected, new) {
                Ok(_) => return true,
                Err(observed) => match observed.tag() {
                    RDCSS_TAG => unsafe { rdcss::help_foreign(observed, guard) },
                    CASN_TAG => unsafe {
                        mcas::help_foreign(observed, guard);
                    },
                    _ => return false,
                },
            }
        }
    }

    pub(crate) fn as_slot(&self) -> &AtomicSlot {
        &self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_tags_round_trip() {
        #[repr(align(8))]
        struct Dummy(u64);

        let d = Box::into_raw(Box::new(Dummy(7)));
        let slot = Slot::descriptor(d as *const Dummy, RDCSS_TAG);
        assert_eq!(slot.tag(), RDCSS_TAG);
        assert_eq!(slot.descriptor_ptr::<Dummy>(), d as *const Dummy);
        unsafe { drop(Box::from_raw(d)) };
    }

    #[test]
    fn usize_encoding_is_tag_free() {
        let slot: Slot = 42usize.into();
        assert_eq!(slot.tag(), 0);
        let back: usize = slot.into();
        assert_eq!(back, 42);
    }

    #[test]
    fn get_cas_sequence() {
        let a = Atomic::new(42usize);
        assert_eq!(a.get(), 42);
        assert!(a.cas(42, 43));
        assert_eq!(a.get(), 43);
        assert!(!a.cas(42, 99));
        assert_eq!(a.get(), 43);
    }

    #[test]
    fn set_overwrites() {
        let a = Atomic::new(1usize);
        a.set(5);
        assert_eq!(a.get(), 5);
        a.set(5);
        assert_eq!(a.get(), 5);
    }

    #[test]
    fn null_pointer_is_a_value() {
        let a: Atomic<*const u64> = Atomic::new(std::ptr::null());
        assert!(a.get().is_null());
        let boxed = Box::into_raw(Box::new(9u64)) as *const u64;
        assert!(a.cas(std::ptr::null(), boxed));
        assert_eq!(a.get(), boxed);
        unsafe { drop(Box::from_raw(boxed as *mut u64)) };
    }
}
