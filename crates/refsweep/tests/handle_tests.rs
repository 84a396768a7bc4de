//! Handle lifecycle tests
//!
//! These tests drive handles through the public API and check the registry's
//! counts and releases at each step. Each test uses its own payload type, so
//! every test starts from an empty registry.

use proptest::prelude::*;
use refsweep::{CollectorConfig, Handle, SweepPolicy, registered_types, with_config};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Payload that counts how many times it was dropped
#[derive(Debug)]
struct Tracked {
    value: i32,
    drops: Rc<Cell<usize>>,
}

impl Tracked {
    fn new(value: i32, drops: &Rc<Cell<usize>>) -> Self {
        Self {
            value,
            drops: drops.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn test_reassign_copy_and_drop_scenario() {
    struct Int(i32);

    let mut h1 = Handle::new(Int(19));
    assert_eq!(Handle::<Int>::registry_size(), 1);
    assert_eq!(h1.strong_count(), 1);

    // Reassigning the sole owner releases the old value
    h1.set(Int(21));
    assert_eq!(Handle::<Int>::registry_size(), 1);
    assert_eq!(h1.strong_count(), 1);
    assert_eq!(h1.0, 21);
    let h1_ptr = h1.as_ptr();

    let h2 = h1.clone();
    assert_eq!(h2.strong_count(), 2);

    drop(h1);
    assert_eq!(h2.strong_count(), 1);
    assert_eq!(Handle::<Int>::registry_size(), 1);
    assert_eq!(h2.as_ptr(), h1_ptr);
    assert_eq!(h2.0, 21);

    drop(h2);
    assert_eq!(Handle::<Int>::registry_size(), 0);
}

#[test]
fn test_last_drop_releases_exactly_once() {
    let drops = Rc::new(Cell::new(0));
    let a = Handle::new(Tracked::new(1, &drops));
    let b = a.clone();
    let c = a.clone();

    drop(a);
    drop(b);
    assert_eq!(drops.get(), 0);

    drop(c);
    assert_eq!(drops.get(), 1);
    assert_eq!(Handle::<Tracked>::registry_size(), 0);

    // Further sweeps find nothing
    assert!(!Handle::<Tracked>::collect());
    assert_eq!(drops.get(), 1);
}

#[test]
fn test_assign_from_other_handle() {
    let drops = Rc::new(Cell::new(0));
    let mut a = Handle::new(Tracked::new(1, &drops));
    let b = Handle::new(Tracked::new(2, &drops));
    let keep_old = a.clone();

    a.assign(&b);
    assert_eq!(drops.get(), 0);
    assert_eq!(keep_old.strong_count(), 1);
    assert_eq!(b.strong_count(), 2);
    assert_eq!(a.value, 2);

    drop(keep_old);
    assert_eq!(drops.get(), 1);
    assert_eq!(Handle::<Tracked>::registry_size(), 1);
}

#[test]
fn test_assign_same_target_keeps_count() {
    #[allow(dead_code)]
    struct Payload(u8);

    let mut a = Handle::new(Payload(0));
    let b = a.clone();
    let c = a.clone();

    a.assign(&b);
    a.clone_from(&c);
    assert_eq!(a.strong_count(), 3);
    assert!(a.ptr_eq(&b) && a.ptr_eq(&c));
}

#[test]
fn test_assign_null_releases_old_target() {
    let drops = Rc::new(Cell::new(0));
    let mut h = Handle::new(Tracked::new(5, &drops));

    let raw = unsafe { h.assign_raw(std::ptr::null_mut()) };
    assert!(raw.is_null());
    assert!(h.is_null());
    assert_eq!(h.strong_count(), 0);
    assert_eq!(drops.get(), 1);
    assert_eq!(Handle::<Tracked>::registry_size(), 0);

    // Dropping a null handle still sweeps, and releases nothing
    let before = Handle::<Tracked>::stats();
    drop(h);
    let after = Handle::<Tracked>::stats();
    assert_eq!(after.sweeps, before.sweeps + 1);
    assert_eq!(after.released, before.released);
    assert_eq!(drops.get(), 1);
}

#[test]
fn test_separate_allocations_tracked_separately() {
    let drops = Rc::new(Cell::new(0));
    let a = Handle::new(Tracked::new(1, &drops));
    let b = Handle::new(Tracked::new(1, &drops));

    assert!(!a.ptr_eq(&b));
    assert_eq!(a.strong_count(), 1);
    assert_eq!(b.strong_count(), 1);
    assert_eq!(Handle::<Tracked>::registry_size(), 2);

    drop(a);
    assert_eq!(drops.get(), 1);
    assert_eq!(b.strong_count(), 1);
    drop(b);
    assert_eq!(drops.get(), 2);
}

#[test]
fn test_array_handle_iteration() {
    let d = Handle::<f64, 5>::from_array([0.0, 1.1, 2.2, 3.3, 4.4]);

    let mut positions = Vec::new();
    let mut values = Vec::new();
    let mut it = d.begin();
    let end = d.end();
    while it < end {
        positions.push(it.position());
        values.push(*it.value());
        it.advance();
    }

    assert_eq!(values, vec![0.0, 1.1, 2.2, 3.3, 4.4]);
    assert_eq!(positions.len(), 5);
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(end.try_value(), None);
    assert_eq!(it.region_start(), d.as_ptr().cast_const());
    assert_eq!(it.region_end(), end.position());
}

#[test]
fn test_array_and_scalar_release() {
    let drops = Rc::new(Cell::new(0));
    let array = Handle::<Tracked, 3>::from_array(std::array::from_fn(|i| {
        Tracked::new(i as i32, &drops)
    }));
    let scalar = Handle::new(Tracked::new(10, &drops));

    drop(array);
    assert_eq!(drops.get(), 3);

    drop(scalar);
    assert_eq!(drops.get(), 4);
}

#[test]
fn test_assign_array_releases_previous_block() {
    let drops = Rc::new(Cell::new(0));
    let mut h = Handle::<Tracked, 2>::from_array([
        Tracked::new(1, &drops),
        Tracked::new(2, &drops),
    ]);

    h.assign_array(Box::new([Tracked::new(3, &drops), Tracked::new(4, &drops)]));
    assert_eq!(drops.get(), 2);
    assert_eq!(h[1].value, 4);
    assert_eq!(Handle::<Tracked, 2>::registry_size(), 1);
}

#[test]
fn test_shutdown_collects_leaked_handles() {
    let drops = Rc::new(Cell::new(0));
    for i in 0..4 {
        std::mem::forget(Handle::new(Tracked::new(i, &drops)));
    }
    assert_eq!(Handle::<Tracked>::registry_size(), 4);

    let released = unsafe { Handle::<Tracked>::shutdown() };
    assert_eq!(released, 4);
    assert_eq!(drops.get(), 4);
    assert_eq!(Handle::<Tracked>::registry_size(), 0);
    assert_eq!(Handle::<Tracked>::stats().shutdowns, 1);

    // Empty registry: nothing to do
    assert_eq!(unsafe { Handle::<Tracked>::shutdown() }, 0);
}

#[test]
fn test_finalize_reports_every_type() {
    std::thread::spawn(|| {
        #[allow(dead_code)]
        struct Leaked(u8);
        #[allow(dead_code)]
        struct Clean(u8);

        std::mem::forget(Handle::new(Leaked(0)));
        std::mem::forget(Handle::<Leaked, 2>::from_array([Leaked(1), Leaked(2)]));
        drop(Handle::new(Clean(0)));

        let names = registered_types();
        assert_eq!(names.len(), 3);

        let report = unsafe { refsweep::finalize() };
        assert_eq!(report.types.len(), 3);
        assert_eq!(report.total_leaked(), 2);
        assert_eq!(report.total_released(), 2);
        assert_eq!(report.types[1].arity, 2);

        assert_eq!(Handle::<Leaked>::registry_size(), 0);
        assert_eq!(Handle::<Leaked, 2>::registry_size(), 0);
    })
    .join()
    .unwrap();
}

#[test]
fn test_thread_exit_finalizes_when_enabled() {
    let observed = Arc::new(AtomicUsize::new(0));

    let seen = observed.clone();
    std::thread::spawn(move || {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        // SAFETY: nothing on this thread touches a handle during teardown
        let config = unsafe { CollectorConfig::default().with_finalize_on_thread_exit(true) };
        refsweep::set_config(config);
        std::mem::forget(Handle::new(Flag(seen)));
    })
    .join()
    .unwrap();

    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_thread_exit_keeps_referenced_blocks() {
    let observed = Arc::new(AtomicUsize::new(0));

    let seen = observed.clone();
    std::thread::spawn(move || {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        std::mem::forget(Handle::new(Flag(seen)));
    })
    .join()
    .unwrap();

    assert_eq!(observed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_live_handle_in_thread_local_survives_exit() {
    struct Payload {
        value: u32,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for Payload {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Reader {
        handle: Option<Handle<Payload>>,
        dropped: Arc<AtomicUsize>,
        read: Arc<AtomicUsize>,
    }

    impl Drop for Reader {
        fn drop(&mut self) {
            // Only read through the handle while its block is still alive
            if self.dropped.load(Ordering::SeqCst) != 0 {
                return;
            }
            let value = self.handle.as_ref().and_then(|h| h.get()).map_or(0, |p| p.value);
            self.read.store(value as usize, Ordering::SeqCst);
        }
    }

    thread_local! {
        static READER: RefCell<Option<Reader>> = const { RefCell::new(None) };
    }

    let dropped = Arc::new(AtomicUsize::new(0));
    let read = Arc::new(AtomicUsize::new(0));

    let (dropped_in, read_in) = (dropped.clone(), read.clone());
    std::thread::spawn(move || {
        // Touched before any handle exists
        READER.with(|slot| {
            *slot.borrow_mut() = Some(Reader {
                handle: None,
                dropped: dropped_in.clone(),
                read: read_in,
            })
        });

        let handle = Handle::new(Payload {
            value: 7,
            dropped: dropped_in,
        });
        READER.with(|slot| {
            if let Some(reader) = slot.borrow_mut().as_mut() {
                reader.handle = Some(handle);
            }
        });
    })
    .join()
    .unwrap();

    assert_eq!(read.load(Ordering::SeqCst), 7);
}

#[test]
fn test_on_zero_count_policy() {
    #[allow(dead_code)]
    struct Payload(u8);

    with_config(
        CollectorConfig::default().with_policy(SweepPolicy::OnZeroCount),
        || {
            let a = Handle::new(Payload(0));
            let b = a.clone();
            let null = Handle::<Payload>::null();

            drop(null);
            drop(b);
            assert_eq!(Handle::<Payload>::stats().sweeps, 0);

            drop(a);
            let stats = Handle::<Payload>::stats();
            assert_eq!(stats.sweeps, 1);
            assert_eq!(stats.released, 1);
            assert_eq!(Handle::<Payload>::registry_size(), 0);
        },
    );
}

#[test]
fn test_every_drop_policy_sweeps_each_drop() {
    #[allow(dead_code)]
    struct Payload(u8);

    let a = Handle::new(Payload(0));
    let b = a.clone();
    drop(b);
    drop(Handle::<Payload>::null());
    assert_eq!(Handle::<Payload>::stats().sweeps, 2);
    assert_eq!(Handle::<Payload>::stats().released, 0);
    drop(a);
    assert_eq!(Handle::<Payload>::stats().released, 1);
}

#[test]
fn test_nested_handles_released_transitively() {
    struct Node {
        _next: Option<Handle<Node>>,
        drops: Rc<Cell<usize>>,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    let drops = Rc::new(Cell::new(0));
    let mut head = Handle::new(Node {
        _next: None,
        drops: drops.clone(),
    });
    for _ in 0..9 {
        head = Handle::new(Node {
            _next: Some(head),
            drops: drops.clone(),
        });
    }
    assert_eq!(Handle::<Node>::registry_size(), 10);

    drop(head);
    assert_eq!(drops.get(), 10);
    assert_eq!(Handle::<Node>::registry_size(), 0);
}

#[test]
fn test_dump_display() {
    let a = Handle::new(19u64);
    let _b = a.clone();
    let _c = Handle::new(28u64);

    let dump = Handle::<u64>::dump();
    assert_eq!(dump.entries.len(), 2);
    assert_eq!(dump.entries[0].refcount, 2);
    assert_eq!(dump.entries[1].value.as_deref(), Some("28"));

    let text = dump.to_string();
    assert!(text.contains("u64"));
    assert!(text.contains("19"));
    assert!(text.contains("28"));
}

#[cfg(feature = "sweep_logging")]
#[test]
fn test_sweep_logging() {
    use tracing_subscriber::filter::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("refsweep=debug"))
        .with_test_writer()
        .try_init();

    #[allow(dead_code)]
    struct Payload(u8);
    let h = Handle::new(Payload(0));
    std::mem::forget(h.clone());
    drop(h);
    assert_eq!(unsafe { Handle::<Payload>::shutdown() }, 1);
}

#[derive(Debug, Clone)]
enum Op {
    New,
    Clone(usize),
    Assign(usize, usize),
    Set(usize),
    Drop(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::New),
        any::<usize>().prop_map(Op::Clone),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Assign(a, b)),
        any::<usize>().prop_map(Op::Set),
        any::<usize>().prop_map(Op::Drop),
    ]
}

proptest! {
    #[test]
    fn prop_refcount_matches_live_handles(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let drops = Rc::new(Cell::new(0));
        let mut created = 0usize;
        let mut handles: Vec<Handle<Tracked>> = Vec::new();

        for op in ops {
            match op {
                Op::New => {
                    handles.push(Handle::new(Tracked::new(0, &drops)));
                    created += 1;
                }
                Op::Clone(i) if !handles.is_empty() => {
                    let copy = handles[i % handles.len()].clone();
                    handles.push(copy);
                }
                Op::Assign(i, j) if !handles.is_empty() => {
                    let len = handles.len();
                    let source = handles[j % len].clone();
                    handles[i % len].assign(&source);
                }
                Op::Set(i) if !handles.is_empty() => {
                    let len = handles.len();
                    handles[i % len].set(Tracked::new(1, &drops));
                    created += 1;
                }
                Op::Drop(i) if !handles.is_empty() => {
                    let len = handles.len();
                    handles.swap_remove(i % len);
                }
                _ => {}
            }

            for h in &handles {
                let sharing = handles.iter().filter(|other| other.ptr_eq(h)).count();
                prop_assert_eq!(h.strong_count(), sharing);
            }

            let mut distinct: Vec<*mut Tracked> = handles.iter().map(Handle::as_ptr).collect();
            distinct.sort();
            distinct.dedup();
            prop_assert_eq!(Handle::<Tracked>::registry_size(), distinct.len());
            prop_assert_eq!(drops.get(), created - distinct.len());
        }

        handles.clear();
        prop_assert_eq!(Handle::<Tracked>::registry_size(), 0);
        prop_assert_eq!(drops.get(), created);
    }
}
