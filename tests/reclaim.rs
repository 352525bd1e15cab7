use crossbeam_utils::thread::scope;
use limbo::{AvlMap, List, TrackingLogger};
use std::time::{Duration, Instant};

// Reclamation of a chain of unlinked nodes advances one frozen link per
// scan, so these waits allow for many 100ms worker cycles.
fn wait_for_live(expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while TrackingLogger::live() != expected {
        assert!(
            Instant::now() < deadline,
            "reclamation stalled at {} live nodes, expected {}",
            TrackingLogger::live(),
            expected
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

// One test drives both collections: the tracking logger's live set is
// process-wide, so parallel tests would see each other's nodes.
#[test]
fn every_allocation_is_reclaimed() {
    assert_eq!(TrackingLogger::live(), 0);

    {
        let list = List::<u64, TrackingLogger>::new();
        for value in 0..30 {
            list.push_back(value);
        }
        // 30 live nodes plus the two sentinels.
        assert_eq!(TrackingLogger::live(), 32);

        // Unreferenced erased nodes are reclaimed while the list is still
        // alive, without waiting for its destructor.
        for _ in 0..10 {
            list.pop_back();
        }
        wait_for_live(22);

        // A pinned node survives reclamation for as long as its cursor
        // does, even across erasure and a concurrent walker.
        let pinned = list.find(&10);
        let erased = list.find(&11);
        list.remove(&erased);
        list.remove(&pinned);
        scope(|scope| {
            let list = &list;
            scope.spawn(move |_| {
                let mut cursor = list.begin();
                while cursor != list.end() {
                    cursor.move_next();
                }
            });
        })
        .unwrap();
        assert_eq!(pinned.get(), Some(10));
        drop(erased);
        drop(pinned);
        wait_for_live(20);
    }
    // The destructor joined the worker and tore the chain down.
    assert_eq!(TrackingLogger::live(), 0);

    {
        let map = AvlMap::<u64, u64, TrackingLogger>::new();
        for key in 0..30 {
            map.insert(key, key);
        }
        // 30 live nodes plus the end sentinel.
        assert_eq!(TrackingLogger::live(), 31);

        // The pinned node's frozen links can keep a few of the other
        // removed nodes alive, so only the post-drop count is exact.
        let pinned = map.find(&15);
        for key in 12..18 {
            map.remove(&key);
        }
        assert_eq!(pinned.value(), Some(&15));
        drop(pinned);
        wait_for_live(25);

        map.clear();
        wait_for_live(1);
    }
    assert_eq!(TrackingLogger::live(), 0);
}
