//! Reader/writer/shared-exclusive latch.
//!
//! A latch has four modes:
//!
//! ```text
//!              held: SHARED   SX      EXCLUSIVE
//! want SHARED        ok       ok      blocks
//! want SX            ok       blocks  blocks
//! want EXCLUSIVE     blocks   blocks  blocks
//! ```
//!
//! The SX holder may upgrade to EXCLUSIVE. From the moment the upgrade starts
//! no new SHARED holder is admitted; the upgrade then waits for the existing
//! readers to drain. Downgrading EXCLUSIVE to SX never blocks.
//!
//! The latch is a small state machine behind one mutex/condvar pair. SX and
//! EXCLUSIVE holders are recorded by thread so that a release, upgrade or
//! downgrade from the wrong thread is reported as a protocol error.

use crate::error::{Result, StorageError};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

/// Latch acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatchMode {
    /// No latch held
    None,
    /// Many concurrent holders
    Shared,
    /// One holder, compatible with SHARED holders
    SharedExclusive,
    /// Sole holder
    Exclusive,
}

#[derive(Debug, Default)]
struct LatchState {
    readers: u32,
    writer: Option<ThreadId>,
    sx: Option<ThreadId>,
    upgrading: bool,
}

impl LatchState {
    fn admits(&self, mode: LatchMode) -> bool {
        match mode {
            LatchMode::None => true,
            LatchMode::Shared => self.writer.is_none() && !self.upgrading,
            LatchMode::SharedExclusive => self.writer.is_none() && self.sx.is_none(),
            LatchMode::Exclusive => {
                self.writer.is_none() && self.sx.is_none() && self.readers == 0
            }
        }
    }

    fn grant(&mut self, mode: LatchMode, me: ThreadId) {
        match mode {
            LatchMode::None => {}
            LatchMode::Shared => self.readers += 1,
            LatchMode::SharedExclusive => self.sx = Some(me),
            LatchMode::Exclusive => self.writer = Some(me),
        }
    }
}

/// Point-in-time view of a latch, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchSnapshot {
    pub readers: u32,
    pub exclusive: bool,
    pub sx: bool,
    pub upgrading: bool,
}

/// A raw latch; callers pair every `lock` with an `unlock` in the same mode.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the latch can be held in `mode`
    pub fn lock(&self, mode: LatchMode) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.admits(mode) {
            self.cond.wait(&mut state);
        }
        state.grant(mode, me);
    }

    /// Acquire in `mode` if that is possible without waiting
    pub fn try_lock(&self, mode: LatchMode) -> bool {
        let mut state = self.state.lock();
        if !state.admits(mode) {
            return false;
        }
        state.grant(mode, thread::current().id());
        true
    }

    /// Release a hold in `mode` and wake waiters
    pub fn unlock(&self, mode: LatchMode) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match mode {
            LatchMode::None => return Ok(()),
            LatchMode::Shared => {
                if state.readers == 0 {
                    return Err(StorageError::latch_protocol(
                        "shared unlock without a shared holder",
                    ));
                }
                state.readers -= 1;
            }
            LatchMode::SharedExclusive => {
                if state.sx != Some(me) {
                    return Err(StorageError::latch_protocol(
                        "SX unlock by a thread that does not hold SX",
                    ));
                }
                state.sx = None;
            }
            LatchMode::Exclusive => {
                if state.writer != Some(me) {
                    return Err(StorageError::latch_protocol(
                        "exclusive unlock by a thread that does not hold it",
                    ));
                }
                state.writer = None;
            }
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Convert this thread's SX hold into EXCLUSIVE.
    ///
    /// New SHARED requests are refused as soon as the upgrade starts; the call
    /// returns once every existing reader has released.
    pub fn upgrade_sx_to_exclusive(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.sx != Some(me) {
            return Err(StorageError::latch_protocol(
                "upgrade requested by a thread that does not hold SX",
            ));
        }
        state.upgrading = true;
        while state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.upgrading = false;
        state.sx = None;
        state.writer = Some(me);
        Ok(())
    }

    /// Convert this thread's EXCLUSIVE hold into SX. Never blocks.
    pub fn downgrade_exclusive_to_sx(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer != Some(me) {
            return Err(StorageError::latch_protocol(
                "downgrade requested by a thread that does not hold EXCLUSIVE",
            ));
        }
        state.writer = None;
        state.sx = Some(me);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    pub fn snapshot(&self) -> LatchSnapshot {
        let state = self.state.lock();
        LatchSnapshot {
            readers: state.readers,
            exclusive: state.writer.is_some(),
            sx: state.sx.is_some(),
            upgrading: state.upgrading,
        }
    }
}

/// A value protected by a [`Latch`], accessed through RAII guards.
pub struct Latched<T> {
    latch: Latch,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is mediated by the latch: shared and SX guards
// hand out `&T`, only the exclusive guard hands out `&mut T`.
unsafe impl<T: Send> Send for Latched<T> {}
unsafe impl<T: Send + Sync> Sync for Latched<T> {}

impl<T> Latched<T> {
    pub fn new(value: T) -> Self {
        Self {
            latch: Latch::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn shared(&self) -> SharedGuard<'_, T> {
        self.latch.lock(LatchMode::Shared);
        SharedGuard {
            latched: self,
            _not_send: PhantomData,
        }
    }

    pub fn sx(&self) -> SxGuard<'_, T> {
        self.latch.lock(LatchMode::SharedExclusive);
        SxGuard {
            latched: self,
            _not_send: PhantomData,
        }
    }

    pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
        self.latch.lock(LatchMode::Exclusive);
        ExclusiveGuard {
            latched: self,
            _not_send: PhantomData,
        }
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Shared access to a [`Latched`] value
pub struct SharedGuard<'a, T> {
    latched: &'a Latched<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a shared hold excludes any exclusive guard.
        unsafe { &*self.latched.value.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.latched.latch.unlock(LatchMode::Shared);
        debug_assert!(released.is_ok());
    }
}

/// SX access to a [`Latched`] value; readers may still be present
pub struct SxGuard<'a, T> {
    latched: &'a Latched<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SxGuard<'a, T> {
    /// Wait for readers to drain and take the value exclusively
    pub fn upgrade(self) -> Result<ExclusiveGuard<'a, T>> {
        let latched = self.latched;
        latched.latch.upgrade_sx_to_exclusive()?;
        std::mem::forget(self);
        Ok(ExclusiveGuard {
            latched,
            _not_send: PhantomData,
        })
    }
}

impl<T> Deref for SxGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: SX excludes exclusive holders; concurrent readers only read.
        unsafe { &*self.latched.value.get() }
    }
}

impl<T> Drop for SxGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.latched.latch.unlock(LatchMode::SharedExclusive);
        debug_assert!(released.is_ok());
    }
}

/// Exclusive access to a [`Latched`] value
pub struct ExclusiveGuard<'a, T> {
    latched: &'a Latched<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> ExclusiveGuard<'a, T> {
    /// Readmit readers while keeping the right to upgrade again
    pub fn downgrade(self) -> Result<SxGuard<'a, T>> {
        let latched = self.latched;
        latched.latch.downgrade_exclusive_to_sx()?;
        std::mem::forget(self);
        Ok(SxGuard {
            latched,
            _not_send: PhantomData,
        })
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we are the sole holder.
        unsafe { &*self.latched.value.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we are the sole holder.
        unsafe { &mut *self.latched.value.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.latched.latch.unlock(LatchMode::Exclusive);
        debug_assert!(released.is_ok());
    }
}
