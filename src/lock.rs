use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

/// Writer pending-or-held bit.
const WRITER: u32 = 1 << 31;
/// Mask of the active reader count.
const READERS: u32 = WRITER - 1;

/// A compact spin reader/writer lock.
///
/// The whole state lives in one 32-bit word: the high bit records a pending
/// or active writer, the low 31 bits count active readers. A writer announces
/// itself first and then waits for the readers to drain, so a stream of
/// readers cannot starve it forever. The lock is not reentrant and makes no
/// fairness guarantee beyond that.
///
/// The lock guards no data of its own; every node stores one and accesses its
/// fields under it by protocol.
pub(crate) struct RawRwLock {
    state: AtomicU32,
}

impl RawRwLock {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquires the lock in shared mode.
    pub(crate) fn read(&self) -> ReadGuard<'_> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER == 0 {
                debug_assert!(state & READERS < READERS);
                if self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return ReadGuard { lock: self };
                }
            }
            thread::yield_now();
        }
    }

    /// Acquires the lock in exclusive mode.
    pub(crate) fn write(&self) -> WriteGuard<'_> {
        loop {
            let state = self.state.fetch_or(WRITER, Ordering::Acquire);
            if state & WRITER == 0 {
                break;
            }
            thread::yield_now();
        }
        while self.state.load(Ordering::Acquire) & READERS != 0 {
            thread::yield_now();
        }
        WriteGuard { lock: self }
    }
}

pub(crate) struct ReadGuard<'a> {
    lock: &'a RawRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub(crate) struct WriteGuard<'a> {
    lock: &'a RawRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn readers_share() {
        let lock = RawRwLock::new();
        let first = lock.read();
        let second = lock.read();
        assert_eq!(lock.state.load(Ordering::Relaxed), 2);
        drop(first);
        drop(second);
        assert_eq!(lock.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn writer_is_exclusive() {
        let lock = RawRwLock::new();
        {
            let _guard = lock.write();
            assert_eq!(lock.state.load(Ordering::Relaxed), WRITER);
        }
        assert_eq!(lock.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn writers_serialize_increments() {
        static VALUE: AtomicUsize = AtomicUsize::new(0);
        let lock = std::sync::Arc::new(RawRwLock::new());
        let threads = (0..4)
            .map(|_| {
                let lock = std::sync::Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.write();
                        let value = VALUE.load(Ordering::Relaxed);
                        VALUE.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(VALUE.load(Ordering::Relaxed), 4000);
    }
}
