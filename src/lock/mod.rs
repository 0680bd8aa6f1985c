//! Distributed mutual exclusion over the store.
//!
//! A lock is a key set only-if-absent with an expiry, holding a random
//! token that identifies the owner. Release deletes the key only while it
//! still holds that token, so an owner whose lock already expired (and was
//! taken by someone else) cannot release the new owner's lock.

mod locker;

pub use locker::Locker;
