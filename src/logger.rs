use fxhash::FxHashSet;
use std::ffi::c_void;
use std::sync::Mutex;

/// A trait to log creation and destruction of collection nodes.
pub trait Log {
    /// Logs the creation of a new node.
    fn log_new(ptr: *const c_void);

    /// Logs the destruction of a node.
    fn log_drop(ptr: *const c_void);
}

/// A logger that doesn't actually log anything.
pub struct NoopLogger;

impl Log for NoopLogger {
    fn log_new(_ptr: *const c_void) {}
    fn log_drop(_ptr: *const c_void) {}
}

/// A logger that records every live node allocation in a process-wide set.
///
/// Mostly useful to assert that a collection reclaimed everything it
/// allocated. The set is shared by every collection using this logger.
pub struct TrackingLogger;

static LIVE: Mutex<Option<FxHashSet<usize>>> = Mutex::new(None);

impl TrackingLogger {
    /// Returns the number of node allocations that are currently live.
    pub fn live() -> usize {
        LIVE.lock().unwrap().as_ref().map_or(0, FxHashSet::len)
    }
}

impl Log for TrackingLogger {
    fn log_new(ptr: *const c_void) {
        let mut live = LIVE.lock().unwrap();
        let inserted = live
            .get_or_insert_with(Default::default)
            .insert(ptr as usize);
        debug_assert!(inserted, "allocation logged twice");
    }

    fn log_drop(ptr: *const c_void) {
        let mut live = LIVE.lock().unwrap();
        let removed = live
            .get_or_insert_with(Default::default)
            .remove(&(ptr as usize));
        debug_assert!(removed, "dropped an allocation that was never logged");
    }
}
