//! # Locking primitives for the device context
//!
//! The aperture/page-table subsystem serializes all structural mutation with
//! one coarse lock per device ([`SpinLock`]). Peer mapping operations span
//! two devices' lock domains; [`lock_pair`] acquires both in a globally
//! consistent order so concurrent create/remove calls between the same pair
//! of devices cannot deadlock.

#![cfg_attr(not(test), no_std)]

mod spin_lock;

pub use crate::spin_lock::{SpinLock, SpinLockGuard};

/// Acquire two locks in a globally consistent order.
///
/// Ordering is by the caller-supplied keys (device indices); ties are not
/// allowed — a peer pair is always two distinct devices, and locking the
/// same `SpinLock` twice would deadlock.
///
/// Returns the guards in the caller's argument order, regardless of which
/// lock was acquired first.
///
/// # Panics
/// Panics if `key_a == key_b`.
pub fn lock_pair<'a, T>(
    (key_a, lock_a): (usize, &'a SpinLock<T>),
    (key_b, lock_b): (usize, &'a SpinLock<T>),
) -> (SpinLockGuard<'a, T>, SpinLockGuard<'a, T>) {
    assert_ne!(key_a, key_b, "lock_pair requires two distinct devices");
    if key_a < key_b {
        let a = lock_a.lock();
        let b = lock_b.lock();
        (a, b)
    } else {
        let b = lock_b.lock();
        let a = lock_a.lock();
        (a, b)
    }
}
