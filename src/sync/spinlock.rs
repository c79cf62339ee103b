//! A single-word compare-and-swap spinlock, plus the interrupt-safe
//! composition required by §4.1/§9 of the core spec.
//!
//! The lock word is `0` (unlocked) or `1` (held). There is no ticket queue
//! and no fairness guarantee — `lock` simply retries the CAS with a
//! `pause`-hint backoff until it succeeds. Callers that may be reached from
//! interrupt context must use [`SpinlockIrqSave`], which composes the mask
//! guard with the lock so the ordering (mask, then lock; unlock, then
//! restore) cannot be gotten wrong at the call site.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;

/// A busy-wait mutex built on a single atomic word.
pub struct Spinlock<T: ?Sized> {
	word: AtomicUsize,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
	pub const fn new(value: T) -> Self {
		Self {
			word: AtomicUsize::new(UNLOCKED),
			data: UnsafeCell::new(value),
		}
	}

	pub fn into_inner(self) -> T {
		self.data.into_inner()
	}
}

impl<T: ?Sized> Spinlock<T> {
	/// Busy-waits until the CAS `0 -> 1` succeeds.
	pub fn lock(&self) -> SpinlockGuard<'_, T> {
		let backoff = Backoff::new();
		while self.try_lock_raw().is_err() {
			while self.word.load(Ordering::Relaxed) == LOCKED {
				backoff.snooze();
			}
		}
		SpinlockGuard { lock: self }
	}

	/// Single CAS attempt; does not retry.
	pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
		self.try_lock_raw().ok().map(|()| SpinlockGuard { lock: self })
	}

	fn try_lock_raw(&self) -> Result<(), usize> {
		self.word
			.compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
			.map(|_| ())
	}

	/// Release store of `0`. Only ever called by `SpinlockGuard::drop`; the
	/// holder is the only party permitted to unlock.
	fn unlock(&self) {
		self.word.store(UNLOCKED, Ordering::Release);
	}
}

impl<T: ?Sized + Default> Default for Spinlock<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

pub struct SpinlockGuard<'a, T: ?Sized> {
	lock: &'a Spinlock<T>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.unlock();
	}
}

/// A [`Spinlock`] combined with an interrupt-mask guard (§4.1, §9).
///
/// Any lock that may be acquired from interrupt context must be taken this
/// way: interrupts are masked before the spin begins and restored only
/// after the lock is released, so the owning CPU cannot take an interrupt
/// whose handler would try to re-acquire the same lock.
pub struct SpinlockIrqSave<T: ?Sized> {
	inner: Spinlock<T>,
}

impl<T> SpinlockIrqSave<T> {
	pub const fn new(value: T) -> Self {
		Self {
			inner: Spinlock::new(value),
		}
	}
}

impl<T: ?Sized> SpinlockIrqSave<T> {
	pub fn lock(&self) -> SpinlockIrqSaveGuard<'_, T> {
		let was_enabled = super::irq_guard::nested_disable();
		let guard = self.inner.lock();
		SpinlockIrqSaveGuard {
			guard: core::mem::ManuallyDrop::new(guard),
			was_enabled,
		}
	}
}

impl<T: ?Sized + Default> Default for SpinlockIrqSave<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

pub struct SpinlockIrqSaveGuard<'a, T: ?Sized> {
	guard: core::mem::ManuallyDrop<SpinlockGuard<'a, T>>,
	was_enabled: bool,
}

impl<T: ?Sized> Deref for SpinlockIrqSaveGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.guard
	}
}

impl<T: ?Sized> DerefMut for SpinlockIrqSaveGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.guard
	}
}

impl<T: ?Sized> Drop for SpinlockIrqSaveGuard<'_, T> {
	fn drop(&mut self) {
		// Release the lock first, then restore interrupts -- the reverse
		// order would let an interrupt fire while we still hold the lock.
		unsafe { core::mem::ManuallyDrop::drop(&mut self.guard) };
		super::irq_guard::nested_enable(self.was_enabled);
	}
}

#[cfg(test)]
mod tests {
	use alloc::sync::Arc;

	use super::*;

	#[test]
	fn mutual_exclusion() {
		let lock = Spinlock::new(0usize);
		{
			let mut guard = lock.lock();
			*guard += 1;
		}
		assert_eq!(*lock.lock(), 1);
	}

	#[test]
	fn try_lock_fails_while_held() {
		let lock = Spinlock::new(());
		let guard = lock.lock();
		assert!(lock.try_lock().is_none());
		drop(guard);
		assert!(lock.try_lock().is_some());
	}

	#[test]
	fn concurrent_increments_are_not_lost() {
		let lock = Arc::new(Spinlock::new(0usize));
		let mut handles = alloc::vec::Vec::new();
		for _ in 0..4 {
			let lock = Arc::clone(&lock);
			handles.push(std::thread::spawn(move || {
				for _ in 0..1000 {
					*lock.lock() += 1;
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		assert_eq!(*lock.lock(), 4000);
	}

	#[test]
	fn irq_save_masks_interrupts_while_held() {
		let lock = SpinlockIrqSave::new(0usize);
		super::super::irq_guard::nested_enable(true);
		{
			let _guard = lock.lock();
			assert!(!super::super::irq_guard::are_enabled());
		}
		assert!(super::super::irq_guard::are_enabled());
	}
}
