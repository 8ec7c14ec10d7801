//! Dual-slot secret storage for zero-downtime rotation.
//!
//! A [`RotatingSecret`] holds the value in use and, for one overlap window,
//! the value it replaced. Readers load an immutable [`SecretPair`] snapshot
//! without locking; writers serialize on a mutex and publish a whole new
//! pair, so a reader never sees a half-updated state.
//!
//! The window closes the first time the current value validates an inbound
//! request (see [`RotatingSecret::try_with`]), or when the caller confirms
//! it through [`RotatingSecret::retire_if_current`].

use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};

/// Immutable snapshot of a rotating secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretPair<T> {
    /// Value used for signing and tried first on verification.
    pub current: T,
    /// Value replaced by the last rotation, until retired.
    pub previous: Option<T>,
}

/// Which slot of a [`SecretPair`] accepted a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// The current value.
    Current,
    /// The not yet retired previous value.
    Previous,
}

/// Current/previous pair with lock-free reads and serialized writes.
pub struct RotatingSecret<T> {
    pair: ArcSwap<SecretPair<T>>,
    // Guards no data; only orders writers.
    writer: Mutex<()>,
}

impl<T: Clone + PartialEq> RotatingSecret<T> {
    /// Create with an initial value and no previous value.
    pub fn new(initial: T) -> Self {
        Self {
            pair: ArcSwap::from_pointee(SecretPair {
                current: initial,
                previous: None,
            }),
            writer: Mutex::new(()),
        }
    }

    /// Snapshot of the current pair.
    pub fn snapshot(&self) -> Arc<SecretPair<T>> {
        self.pair.load_full()
    }

    /// `(current, previous)` by value.
    pub fn get(&self) -> (T, Option<T>) {
        let pair = self.pair.load();
        (pair.current.clone(), pair.previous.clone())
    }

    /// The current value.
    pub fn current(&self) -> T {
        self.pair.load().current.clone()
    }

    /// Rotate to `value`, demoting the present current value to previous.
    ///
    /// Returns `false` and leaves the pair untouched when `value` is already
    /// current.
    pub fn set(&self, value: T) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let pair = self.pair.load_full();
        if pair.current == value {
            return false;
        }
        self.pair.store(Arc::new(SecretPair {
            current: value,
            previous: Some(pair.current.clone()),
        }));
        true
    }

    /// Drop the previous value. Returns `false` when there was none.
    pub fn retire_old(&self) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let pair = self.pair.load_full();
        if pair.previous.is_none() {
            return false;
        }
        self.pair.store(Arc::new(SecretPair {
            current: pair.current.clone(),
            previous: None,
        }));
        true
    }

    /// Retire the previous value if `validated` is still current.
    ///
    /// Returns `false` when there was nothing to retire or a concurrent
    /// [`set`](Self::set) has demoted `validated` already.
    pub fn retire_if_current(&self, validated: &T) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let pair = self.pair.load_full();
        if pair.previous.is_none() || pair.current != *validated {
            return false;
        }
        self.pair.store(Arc::new(SecretPair {
            current: pair.current.clone(),
            previous: None,
        }));
        true
    }

    /// Run `check` against the current value, then against the previous one.
    ///
    /// Success under the current value retires the previous one; success
    /// under the previous value leaves the pair as it is. When both fail the
    /// last error is returned.
    pub fn try_with<R, E>(&self, check: impl FnMut(&T) -> Result<R, E>) -> Result<(R, Slot), E> {
        let pair = self.snapshot();
        let (out, slot) = check_pair(&pair, check)?;
        if slot == Slot::Current && pair.previous.is_some() {
            self.retire_if_current(&pair.current);
        }
        Ok((out, slot))
    }

    /// Like [`try_with`](Self::try_with) but never retires.
    ///
    /// For requests that carry more than one proof: call
    /// [`retire_if_current`](Self::retire_if_current) once all of them hold.
    pub fn find_with<R, E>(&self, check: impl FnMut(&T) -> Result<R, E>) -> Result<(R, Slot), E> {
        check_pair(&self.snapshot(), check)
    }
}

fn check_pair<T, R, E>(pair: &SecretPair<T>, mut check: impl FnMut(&T) -> Result<R, E>) -> Result<(R, Slot), E> {
    match check(&pair.current) {
        Ok(out) => Ok((out, Slot::Current)),
        Err(err) => match &pair.previous {
            Some(previous) => check(previous).map(|out| (out, Slot::Previous)),
            None => Err(err),
        },
    }
}

impl<T: Clone + PartialEq + Default> Default for RotatingSecret<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
