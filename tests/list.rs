use crossbeam_utils::thread::scope;
use limbo::List;
use std::sync::Barrier;

fn values(list: &List<u64>) -> Vec<u64> {
    let mut values = Vec::new();
    let mut cursor = list.begin();
    while cursor != list.end() {
        values.extend(cursor.get());
        cursor.move_next();
    }
    values
}

#[test]
fn edits_at_every_position() {
    let list = (1..=4).collect::<List<u64>>();
    list.push_back(5);
    list.push_front(0);
    list.insert(&list.end(), 6);
    let mut before_last = list.end();
    before_last.move_prev();
    list.insert(&before_last, 7);
    assert_eq!(values(&list), [0, 1, 2, 3, 4, 5, 7, 6]);

    let mut backwards = Vec::new();
    let mut cursor = list.end();
    loop {
        cursor.move_prev();
        match cursor.get() {
            Some(value) => backwards.push(value),
            None => break,
        }
    }
    assert_eq!(backwards, [6, 7, 5, 4, 3, 2, 1, 0]);
}

#[test]
fn push_pop_round_trip() {
    let list = (1..=3).collect::<List<u64>>();
    list.push_back(4);
    list.pop_back();
    assert_eq!(values(&list), [1, 2, 3]);
}

#[test]
fn concurrent_push_back_keeps_every_value() {
    const PER_THREAD: u64 = 250_000;
    let list = List::new();
    scope(|scope| {
        for thread in 0..4u64 {
            let list = &list;
            scope.spawn(move |_| {
                for index in 0..PER_THREAD {
                    list.push_back(thread * PER_THREAD + index);
                }
            });
        }
    })
    .unwrap();

    assert_eq!(list.len(), 4 * PER_THREAD as usize);

    // Every thread's values appear in its own push order, and the whole
    // walk visits exactly the advertised number of live nodes.
    let all = values(&list);
    assert_eq!(all.len(), 4 * PER_THREAD as usize);
    let mut next = [0u64; 4];
    for value in all {
        let thread = (value / PER_THREAD) as usize;
        assert_eq!(value % PER_THREAD, next[thread]);
        next[thread] += 1;
    }
    assert_eq!(next, [PER_THREAD; 4]);
}

#[test]
fn concurrent_front_and_back_pushes_do_not_collide() {
    let list = List::new();
    scope(|scope| {
        let fronts = &list;
        scope.spawn(move |_| {
            for index in 0..10_000u64 {
                fronts.push_front(index);
            }
        });
        let backs = &list;
        scope.spawn(move |_| {
            for index in 10_000..20_000u64 {
                backs.push_back(index);
            }
        });
    })
    .unwrap();

    assert_eq!(list.len(), 20_000);
    let all = values(&list);
    assert_eq!(all.len(), 20_000);
    // Front pushes read back in reverse order, back pushes in order.
    let split = all.iter().position(|value| *value >= 10_000).unwrap();
    assert!(all[..split].windows(2).all(|pair| pair[0] > pair[1]));
    assert!(all[split..].windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn walkers_race_erasers_without_losing_the_chain() {
    const PRELOAD: usize = 1000;
    const ERASES: usize = 200;
    let list = (0..PRELOAD as u64).collect::<List<u64>>();
    let barrier = Barrier::new(4);

    scope(|scope| {
        for _ in 0..2 {
            let list = &list;
            let barrier = &barrier;
            scope.spawn(move |_| {
                barrier.wait();
                for _ in 0..ERASES {
                    let cursor = list.begin();
                    list.remove(&cursor);
                }
            });
        }
        for _ in 0..2 {
            let list = &list;
            let barrier = &barrier;
            scope.spawn(move |_| {
                barrier.wait();
                let mut cursor = list.begin();
                let mut steps = 0usize;
                while cursor != list.end() {
                    cursor.move_next();
                    steps += 1;
                    assert!(steps <= PRELOAD, "walked past the whole chain");
                }
            });
        }
    })
    .unwrap();

    // Two erasers can race for the same front node, so at most 2 * ERASES
    // nodes are gone; the survivors are the original suffix, in order.
    let survivors = values(&list);
    assert_eq!(survivors.len(), list.len());
    assert!(list.len() >= PRELOAD - 2 * ERASES);
    assert_eq!(
        survivors,
        ((PRELOAD - survivors.len()) as u64..PRELOAD as u64).collect::<Vec<_>>()
    );
}

#[test]
fn concurrent_cursor_sets_are_never_torn() {
    let list = (0..8u64).collect::<List<u64>>();
    scope(|scope| {
        for thread in 0..4u64 {
            let list = &list;
            scope.spawn(move |_| {
                for index in 0..1000 {
                    let cursor = list.find(&(index % 8));
                    if let Some(value) = cursor.get() {
                        assert!(value < 8 || value >= 1000);
                    }
                    cursor.set(1000 + thread);
                }
            });
        }
    })
    .unwrap();
}
