use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

/// Exclusive lock whose waiters block instead of spinning.
///
/// The lock remembers which thread took it so callers can assert that
/// they are the holder before touching protected state.
pub struct SleepLock<T> {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
    data: UnsafeCell<T>,
}

/// Safety: access to `data` is serialized by `owner`; only the thread that
/// set `owner` holds a guard.
unsafe impl<T: Send> Send for SleepLock<T> {}

/// Safety: see above, shared references never reach `data` without a guard.
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Block until the lock is free, then take it.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut owner = self.owner.lock();
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(thread::current().id());
        SleepLockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Whether the calling thread holds the lock
    pub fn holding(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    fn unlock(&self) {
        *self.owner.lock() = None;
        self.released.notify_one();
    }
}

/// Shares and sends like `&mut T`: only `Sync` when `T` is.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<T> SleepLockGuard<'_, T> {
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: a live guard means the lock is held
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: a live guard means the lock is held, and `&mut self`
        // rules out other borrows through this guard
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
