//! A lock-free work-stealing deque.
//!
//! The data structure is a dynamically growable ring buffer with two ends: bottom and top. The
//! worker that owns a [`Deque`] can [`push`] elements into the bottom and [`pop`] elements from
//! the bottom, so it sees its own work in LIFO order. Other threads can only
//! [`steal`][Stealer::steal] elements from the top, so they see the worker's oldest work first.
//!
//! A [`Deque`] doesn't implement `Sync`, so it cannot itself be shared among multiple threads.
//! Instead, it creates [`Stealer`]s, and those can be cloned, shared, and sent to other threads
//! freely.
//!
//! Here's a visualization of the data structure:
//!
//! ```text
//!                        top
//!                         _
//!   Stealer::steal --> | | <-- Deque::steal
//!                      | |
//!                      | |
//!  Deque::push/pop --> |_|
//!
//!                      bottom
//! ```
//!
//! # Work-stealing schedulers
//!
//! The intended use is as the per-worker run queue of a work-stealing scheduler. Each worker
//! thread owns a [`Deque`] and hands a [`Stealer`] to every other worker. A worker pops work from
//! the bottom of its own deque, and when that runs dry, it picks another worker and steals from
//! the top of that worker's deque. New work produced while executing a task is pushed back into
//! the worker's own deque.
//!
//! All three operations are lock-free. `push` and `pop` complete in a bounded number of steps
//! except when the buffer must grow; `steal` may return `None` under contention even though the
//! deque is not empty, and callers that need an element must retry.
//!
//! # Examples
//!
//! ```
//! use wsdeque::Deque;
//! use std::thread;
//!
//! let d = Deque::new();
//! let s = d.stealer();
//!
//! d.push('a');
//! d.push('b');
//! d.push('c');
//!
//! assert_eq!(d.pop(), Some('c'));
//! drop(d);
//!
//! thread::spawn(move || {
//!     assert_eq!(s.steal(), Some('a'));
//!     assert_eq!(s.steal(), Some('b'));
//! }).join().unwrap();
//! ```
//!
//! # References
//!
//! The implementation is based on the following work:
//!
//! 1. [Chase and Lev. Dynamic circular work-stealing deque. SPAA 2005.][chase-lev]
//! 2. [Le, Pop, Cohen, and Zappa Nardelli. Correct and efficient work-stealing for weak memory
//!    models. PPoPP 2013.][weak-mem]
//!
//! [chase-lev]: https://dl.acm.org/citation.cfm?id=1073974
//! [weak-mem]: https://dl.acm.org/citation.cfm?id=2442524
//!
//! [`Deque`]: struct.Deque.html
//! [`Stealer`]: struct.Stealer.html
//! [`push`]: struct.Deque.html#method.push
//! [`pop`]: struct.Deque.html#method.pop
//! [Stealer::steal]: struct.Stealer.html#method.steal

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{self, AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Capacity of a deque constructed with [`Deque::new`].
const DEFAULT_CAP: usize = 1024;

/// Number of retired-buffer entries reserved up front, so that the first growths don't
/// reallocate the list.
const RETIRED_RESERVE: usize = 32;

/// Returns `true` if values of type `T` are stored directly in a slot word.
///
/// A value qualifies when it fits a `usize` slot (on which atomic accesses are lock-free on all
/// supported targets) and has nothing to drop. Everything else is boxed and the slot holds the
/// pointer.
const fn fits_inline<T>() -> bool {
    mem::size_of::<T>() <= mem::size_of::<usize>()
        && mem::align_of::<T>() <= mem::align_of::<usize>()
        && !mem::needs_drop::<T>()
}

/// Packs a value into a slot word, either by bit pattern or behind a fresh allocation.
///
/// The predicate depends on the type alone, so the branch is folded at compile time.
fn pack<T>(value: T) -> usize {
    if fits_inline::<T>() {
        let mut word = 0usize;
        unsafe {
            ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                &mut word as *mut usize as *mut u8,
                mem::size_of::<T>(),
            );
        }
        mem::forget(value);
        word
    } else {
        Box::into_raw(Box::new(value)) as usize
    }
}

/// Unpacks a slot word, taking ownership of the value. For boxed values this releases the
/// allocation.
///
/// # Safety
///
/// `word` must have been produced by `pack::<T>` and not been unpacked before.
unsafe fn unpack<T>(word: usize) -> T {
    if fits_inline::<T>() {
        let mut value = MaybeUninit::<T>::uninit();
        ptr::copy_nonoverlapping(
            &word as *const usize as *const u8,
            value.as_mut_ptr() as *mut u8,
            mem::size_of::<T>(),
        );
        value.assume_init()
    } else {
        *Box::from_raw(word as *mut T)
    }
}

/// A cyclic array of slot words, addressed by unbounded indices modulo its capacity.
///
/// The capacity is always a power of two, so the modulo is a mask. Slot accesses are relaxed;
/// visibility of slot contents across threads is ordered by the fences and index publications in
/// `push`, `pop` and `steal`, not by the slots themselves.
struct RingBuf {
    /// Capacity minus one.
    mask: i64,

    slots: Box<[AtomicUsize]>,
}

impl RingBuf {
    /// Returns a new buffer with the specified capacity, which must be a power of two.
    fn new(cap: usize) -> RingBuf {
        debug_assert!(cap.is_power_of_two());

        RingBuf {
            mask: cap as i64 - 1,
            slots: (0..cap).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn cap(&self) -> usize {
        self.slots.len()
    }

    /// Writes a slot word at `index` modulo the capacity.
    fn store(&self, index: i64, word: usize) {
        self.slots[(index & self.mask) as usize].store(word, Ordering::Relaxed);
    }

    /// Reads the slot word at `index` modulo the capacity.
    fn load(&self, index: i64) -> usize {
        self.slots[(index & self.mask) as usize].load(Ordering::Relaxed)
    }

    /// Allocates a buffer of twice the capacity and copies the occupied range `[t, b)` into it,
    /// keeping every index at the same modular position. `self` is left untouched.
    fn grow(&self, b: i64, t: i64) -> RingBuf {
        let new = RingBuf::new(2 * self.cap());
        let mut i = t;
        while i != b {
            new.store(i, self.load(i));
            i += 1;
        }
        new
    }
}

/// State shared between a deque and its stealers.
struct Inner<T> {
    /// The top index. Grows with every successful steal and never decreases.
    top: AtomicI64,

    /// The bottom index. Written only by the owner.
    bottom: AtomicI64,

    /// The active ring buffer.
    buffer: AtomicPtr<RingBuf>,

    /// Buffers replaced by growth. They stay readable until the deque is destroyed, so a stealer
    /// holding a stale buffer pointer never reads freed memory. Touched only by the owner.
    retired: UnsafeCell<Vec<Box<RingBuf>>>,

    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    /// Returns a new `Inner` with capacity `cap`, which must be a power of two.
    fn with_capacity(cap: usize) -> Inner<T> {
        Inner {
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            buffer: AtomicPtr::new(Box::into_raw(Box::new(RingBuf::new(cap)))),
            retired: UnsafeCell::new(Vec::with_capacity(RETIRED_RESERVE)),
            _marker: PhantomData,
        }
    }

    fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    fn capacity(&self) -> usize {
        // The active buffer stays valid for as long as any handle exists.
        unsafe { (*self.buffer.load(Ordering::Relaxed)).cap() }
    }

    /// Attempts to steal the element at the top.
    fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        // Orders the load of `top` above before the load of `bottom` below. Without it, this
        // steal and a concurrent `pop` could both read the pre-race counter values and hand out
        // the same element twice.
        atomic::fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return None;
        }

        // The slot must be read before claiming it: the instant the exchange below succeeds, the
        // owner is free to overwrite this slot with a new push.
        let buffer = unsafe { &*self.buffer.load(Ordering::Acquire) };
        let word = buffer.load(t);

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // Lost the race. The word now belongs to whoever won it, so it must not be dropped
            // or freed here.
            return None;
        }

        Some(unsafe { unpack(word) })
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);

        unsafe {
            let buffer = Box::from_raw(self.buffer.load(Ordering::Relaxed));

            // Drop every element still in the deque.
            let mut i = t;
            while i != b {
                drop(unpack::<T>(buffer.load(i)));
                i += 1;
            }

            // `buffer` and the retired buffers are freed here.
        }
    }
}

/// A lock-free work-stealing deque, held by the worker that owns it.
///
/// The owner pushes elements into the bottom and pops them back off the bottom, treating the
/// deque as a stack. Any number of [`Stealer`]s created with [`stealer`][Deque::stealer] can
/// concurrently take elements from the top.
///
/// # Capacity
///
/// The deque starts out with a fixed capacity and doubles its internal buffer whenever a push
/// finds it full. Buffers only grow; a replaced buffer is kept until the deque is destroyed so
/// that concurrent stealers can finish reading from it.
///
/// # Examples
///
/// ```
/// use wsdeque::Deque;
///
/// let d = Deque::with_capacity(16);
/// let s = d.stealer();
///
/// d.push('a');
/// d.push('b');
/// d.push('c');
///
/// assert_eq!(d.pop(), Some('c'));
/// assert_eq!(d.steal(), Some('a'));
/// assert_eq!(s.steal(), Some('b'));
/// ```
pub struct Deque<T> {
    inner: Arc<CachePadded<Inner<T>>>,
    _marker: PhantomData<*mut ()>, // !Send + !Sync
}

unsafe impl<T: Send> Send for Deque<T> {}

impl<T> Deque<T> {
    /// Returns a new deque with the default capacity of 1024.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::<i32>::new();
    /// ```
    pub fn new() -> Deque<T> {
        Self::with_capacity(DEFAULT_CAP)
    }

    /// Returns a new deque with the specified capacity.
    ///
    /// # Panics
    ///
    /// Panics if `cap` is not a power of two.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::<i32>::with_capacity(64);
    /// assert_eq!(d.capacity(), 64);
    /// ```
    pub fn with_capacity(cap: usize) -> Deque<T> {
        assert!(cap.is_power_of_two(), "capacity must be a power of two: {}", cap);
        Deque {
            inner: Arc::new(CachePadded::new(Inner::with_capacity(cap))),
            _marker: PhantomData,
        }
    }

    /// Returns `true` if the deque was empty at the instant of the call.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// assert!(d.is_empty());
    /// d.push("foo");
    /// assert!(!d.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of elements in the deque at the instant of the call.
    ///
    /// The count is an estimate: concurrent stealers may have changed it by the time it is
    /// returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// d.push('a');
    /// d.push('b');
    /// d.push('c');
    /// assert_eq!(d.len(), 3);
    /// ```
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns the capacity of the active buffer.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::with_capacity(4);
    /// for i in 0..5 {
    ///     d.push(i);
    /// }
    /// assert_eq!(d.capacity(), 8);
    /// ```
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Pushes an element into the bottom of the deque.
    ///
    /// If the buffer is full, a new one with twice the capacity is allocated and the old one is
    /// retired.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// d.push(1);
    /// d.push(2);
    /// ```
    pub fn push(&self, value: T) {
        let inner = &**self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let t = inner.top.load(Ordering::Acquire);
        // Only this thread swaps the buffer pointer, so a relaxed load is enough.
        let mut buffer = unsafe { &*inner.buffer.load(Ordering::Relaxed) };

        if (buffer.cap() as i64) < b - t + 1 {
            buffer = self.grow(b, t);
        }

        buffer.store(b, pack(value));

        // Pairs with the acquire load of `bottom` in `steal`: a thief that observes the new
        // bottom also observes the slot written above.
        atomic::fence(Ordering::Release);
        inner.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Replaces the active buffer with one of twice the capacity and returns it. The old buffer
    /// moves onto the retired list, where it stays readable for stealers that still hold its
    /// pointer.
    #[cold]
    fn grow(&self, b: i64, t: i64) -> &RingBuf {
        let inner = &**self.inner;
        let old = inner.buffer.load(Ordering::Relaxed);
        let new = Box::into_raw(Box::new(unsafe { (*old).grow(b, t) }));

        unsafe {
            // Only the owner touches the retired list.
            (*inner.retired.get()).push(Box::from_raw(old));
            // A stealer that still observes the old pointer reads a retired buffer, which holds
            // the same occupied slots as the new one.
            inner.buffer.store(new, Ordering::Relaxed);
            &*new
        }
    }

    /// Pops an element from the bottom of the deque.
    ///
    /// Returns `None` if the deque was empty, or if the one remaining element was stolen first.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// d.push(1);
    /// d.push(2);
    ///
    /// assert_eq!(d.pop(), Some(2));
    /// assert_eq!(d.pop(), Some(1));
    /// assert_eq!(d.pop(), None);
    /// ```
    pub fn pop(&self) -> Option<T> {
        let inner = &**self.inner;
        let b = inner.bottom.load(Ordering::Relaxed) - 1;
        let buffer = unsafe { &*inner.buffer.load(Ordering::Relaxed) };

        // Tentatively claim the bottommost slot.
        inner.bottom.store(b, Ordering::Relaxed);

        // Orders the claim above before the load of `top` below. The claim and a concurrent
        // steal each store one counter and then load the other, so release/acquire on the
        // counters alone cannot stop both sides from seeing the pre-race values and taking the
        // same element.
        atomic::fence(Ordering::SeqCst);

        let t = inner.top.load(Ordering::Relaxed);

        if t > b {
            // The deque was already empty. Undo the claim.
            inner.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        if t == b {
            // Exactly one element left, and thieves may be racing for it.
            if inner
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // A thief got it first.
                inner.bottom.store(b + 1, Ordering::Relaxed);
                return None;
            }
            inner.bottom.store(b + 1, Ordering::Relaxed);
        }

        // The slot can be read after winning it: nobody but this thread pushes, so it cannot be
        // overwritten in the meantime.
        Some(unsafe { unpack(buffer.load(b)) })
    }

    /// Steals an element from the top of the deque.
    ///
    /// Returns `None` if the deque was empty or if another consumer took the element first. A
    /// `None` therefore does not prove the deque is empty; callers that need an element should
    /// retry or check [`is_empty`][Deque::is_empty].
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// d.push(1);
    /// d.push(2);
    ///
    /// assert_eq!(d.steal(), Some(1));
    /// assert_eq!(d.steal(), Some(2));
    /// assert_eq!(d.steal(), None);
    /// ```
    pub fn steal(&self) -> Option<T> {
        self.inner.steal()
    }

    /// Creates a stealer that can be shared with other threads.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    /// use std::thread;
    ///
    /// let d = Deque::new();
    /// d.push(1);
    ///
    /// let s = d.stealer();
    ///
    /// thread::spawn(move || {
    ///     assert_eq!(s.steal(), Some(1));
    /// }).join().unwrap();
    /// ```
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Deque<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Deque {{ ... }}")
    }
}

impl<T> Default for Deque<T> {
    fn default() -> Deque<T> {
        Deque::new()
    }
}

/// A thief's handle to a [`Deque`].
///
/// The only mutating operation available to a stealer is [`steal`], which removes an element from
/// the top of the deque. Stealers can be cloned, and they implement `Send` and `Sync`, so any
/// number of threads can hold one.
///
/// [`Deque`]: struct.Deque.html
/// [`steal`]: struct.Stealer.html#method.steal
pub struct Stealer<T> {
    inner: Arc<CachePadded<Inner<T>>>,
    _marker: PhantomData<*mut ()>,
}

unsafe impl<T: Send> Send for Stealer<T> {}
unsafe impl<T: Send> Sync for Stealer<T> {}

impl<T> Stealer<T> {
    /// Returns `true` if the deque was empty at the instant of the call.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// d.push("foo");
    ///
    /// let s = d.stealer();
    /// assert!(!s.is_empty());
    /// s.steal();
    /// assert!(s.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of elements in the deque at the instant of the call.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// let s = d.stealer();
    /// d.push('a');
    /// d.push('b');
    /// d.push('c');
    /// assert_eq!(s.len(), 3);
    /// ```
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns the capacity of the active buffer.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Steals an element from the top of the deque.
    ///
    /// Returns `None` if the deque was empty or if another consumer took the element first. A
    /// `None` therefore does not prove the deque is empty; callers that need an element should
    /// retry or check [`is_empty`][Stealer::is_empty].
    ///
    /// # Examples
    ///
    /// ```
    /// use wsdeque::Deque;
    ///
    /// let d = Deque::new();
    /// let s = d.stealer();
    /// d.push(1);
    /// d.push(2);
    ///
    /// assert_eq!(s.steal(), Some(1));
    /// assert_eq!(s.steal(), Some(2));
    /// assert_eq!(s.steal(), None);
    /// ```
    pub fn steal(&self) -> Option<T> {
        self.inner.steal()
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Stealer {{ ... }}")
    }
}
