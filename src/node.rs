use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle tag of a collection node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Status {
    /// Unlinked from the live structure, possibly still pinned by cursors.
    Deleted = 0,
    /// A live entry.
    Active = 1,
    /// The end-of-collection sentinel.
    End = 2,
    /// The start-of-collection sentinel of the list.
    Begin = 3,
}

/// A `Status` that can be read and written concurrently.
///
/// Accesses are sequentially consistent: the retire path stores the tag and
/// then reads the reference count, while the release path decrements the
/// count and then reads the tag. Under weaker orderings both sides can miss
/// the other's write and the node would never reach the purgatory.
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> Status {
        match self.0.load(Ordering::SeqCst) {
            0 => Status::Deleted,
            1 => Status::Active,
            2 => Status::End,
            _ => Status::Begin,
        }
    }

    pub(crate) fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_tag() {
        for &status in &[Status::Deleted, Status::Active, Status::End, Status::Begin] {
            let atomic = AtomicStatus::new(status);
            assert_eq!(atomic.load(), status);
        }
        let atomic = AtomicStatus::new(Status::Active);
        atomic.store(Status::Deleted);
        assert_eq!(atomic.load(), Status::Deleted);
    }
}
