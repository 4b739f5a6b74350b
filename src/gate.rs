//! Fair reader/writer gate.
//!
//! Any number of readers, or one writer. When a writer leaves, waiting readers
//! go first; a reader that empties the reader queue hands the turn to the
//! writers, so readers arriving later queue up behind a waiting writer.

use std::ops::{Deref, DerefMut};
use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Turn {
    Read,
    Write,
}

#[derive(Debug)]
struct GateState {
    readers: usize,
    writers: usize,
    waiting_readers: usize,
    waiting_writers: usize,
    turn: Turn,
}

pub struct Gate<T> {
    state: Mutex<GateState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    data: RwLock<T>,
}

impl<T> Gate<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(GateState {
                readers: 0,
                writers: 0,
                waiting_readers: 0,
                waiting_writers: 0,
                turn: Turn::Read,
            }),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            data: RwLock::new(data),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut state = self.lock_state();
        state.waiting_readers += 1;
        while state.writers != 0 || (state.turn != Turn::Read && state.waiting_writers > 0) {
            state = self
                .readers_cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting_readers -= 1;
        state.readers += 1;
        if state.waiting_readers == 0 {
            state.turn = Turn::Write;
        }
        drop(state);

        ReadGuard {
            gate: self,
            inner: self.data.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut state = self.lock_state();
        state.waiting_writers += 1;
        // readers woken by the last writer go first
        while state.writers != 0
            || state.readers != 0
            || (state.turn == Turn::Read && state.waiting_readers > 0)
        {
            state = self
                .writers_cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting_writers -= 1;
        state.writers += 1;
        drop(state);

        WriteGuard {
            gate: self,
            inner: self.data.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn end_read(&self) {
        let mut state = self.lock_state();
        state.readers -= 1;
        if state.readers == 0 {
            self.writers_cv.notify_one();
        }
    }

    fn end_write(&self) {
        let mut state = self.lock_state();
        state.writers -= 1;
        state.turn = Turn::Read;
        if state.waiting_readers > 0 {
            self.readers_cv.notify_all();
        } else {
            self.writers_cv.notify_one();
        }
    }
}

pub struct ReadGuard<'a, T> {
    gate: &'a Gate<T>,
    inner: RwLockReadGuard<'a, T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.gate.end_read();
    }
}

pub struct WriteGuard<'a, T> {
    gate: &'a Gate<T>,
    inner: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.gate.end_write();
    }
}
