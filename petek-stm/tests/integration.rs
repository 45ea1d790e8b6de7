use petek_heap::{HeapSettings, ObjectKind, Value};
use petek_stm::{AlternatePolicy, Handle, Stm, StmConfig, Terminated, TxSession};

fn test_heap() -> HeapSettings {
    HeapSettings {
        capacity_words: 4096,
        gc_threshold: 0.9,
    }
}

fn stm() -> Stm {
    Stm::new(StmConfig::default(), test_heap())
}

fn alloc(stm: &Stm, values: &[i64]) -> Value {
    let slots: Vec<Value> = values.iter().map(|&n| Value::from_i64(n)).collect();
    stm.allocate(&TxSession::detached(), ObjectKind::Data, &slots)
        .unwrap()
}

#[test]
fn read_only_transaction_is_equivalent_to_none() {
    let stm = stm();
    let obj = alloc(&stm, &[5]);
    let (used_before, _) = stm.heap_usage();

    let session = stm.start_transaction();
    let h = stm.redirect_load(&session, Handle::Direct(obj)).unwrap();
    assert!(matches!(h, Handle::Cell(_)));
    assert_eq!(stm.resolve(&session, h), obj);
    assert_eq!(stm.load_slot(stm.resolve(&session, h), 0).to_i64(), 5);
    assert!(stm.commit_transaction(session));

    let (used_after, _) = stm.heap_usage();
    assert_eq!(used_before, used_after, "read-only commit must not touch the heap");
    assert_eq!(stm.load_slot(obj, 0).to_i64(), 5);
}

#[test]
fn read_your_own_writes() {
    let stm = stm();
    let obj = alloc(&stm, &[10]);

    let session = stm.start_transaction();
    let w = stm.redirect_store(&session, Handle::Direct(obj)).unwrap();
    let shadow = stm.resolve(&session, w);
    assert_ne!(shadow, obj, "store must redirect to a shadow copy");

    stm.store_slot(shadow, 0, Value::from_i64(20));

    // Loads of the same object now land on the shadow.
    let r = stm.redirect_load(&session, Handle::Direct(obj)).unwrap();
    assert_eq!(r, w, "load after store must return the write cell");
    assert_eq!(stm.load_slot(stm.resolve(&session, r), 0).to_i64(), 20);

    // The canonical object is untouched until commit.
    assert_eq!(stm.load_slot(obj, 0).to_i64(), 10);

    assert!(stm.commit_transaction(session));
    assert_eq!(stm.load_slot(obj, 0).to_i64(), 20);
}

#[test]
fn repeated_loads_return_the_same_cell() {
    let stm = stm();
    let obj = alloc(&stm, &[1]);

    let session = stm.start_transaction();
    let a = stm.redirect_load(&session, Handle::Direct(obj)).unwrap();
    let b = stm.redirect_load(&session, Handle::Direct(obj)).unwrap();
    let c = stm.redirect_load(&session, a).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert!(stm.commit_transaction(session));
}

#[test]
fn repeated_stores_share_one_shadow() {
    let stm = stm();
    let obj = alloc(&stm, &[0]);
    let (used_start, _) = stm.heap_usage();

    let session = stm.start_transaction();
    let a = stm.redirect_store(&session, Handle::Direct(obj)).unwrap();
    let b = stm.redirect_store(&session, Handle::Direct(obj)).unwrap();
    let c = stm.redirect_store(&session, a).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);

    let (used_end, _) = stm.heap_usage();
    assert_eq!(used_end - used_start, 2, "exactly one two-word shadow");
    assert!(stm.commit_transaction(session));
}

#[test]
fn fixnums_and_callables_pass_through() {
    let stm = stm();
    let func = stm
        .allocate(&TxSession::detached(), ObjectKind::Callable, &[Value::from_i64(0)])
        .unwrap();

    let session = stm.start_transaction();
    let n = Handle::Direct(Value::from_i64(7));
    assert_eq!(stm.redirect_load(&session, n).unwrap(), n);
    assert_eq!(stm.redirect_store(&session, n).unwrap(), n);

    let f = Handle::Direct(func);
    assert_eq!(stm.redirect_load(&session, f).unwrap(), f);
    assert_eq!(stm.redirect_store(&session, f).unwrap(), f);
    assert!(stm.commit_transaction(session));
}

#[test]
fn empty_commit_succeeds_without_heap_effects() {
    let stm = stm();
    let (used_before, _) = stm.heap_usage();
    let session = stm.start_transaction();
    assert!(stm.commit_transaction(session));
    assert_eq!(stm.heap_usage().0, used_before);

    let stats = stm.stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.aborted, 0);
}

#[test]
fn disabled_stm_is_identity() {
    let stm = Stm::new(
        StmConfig {
            enabled: false,
            thread_count: 1,
        },
        test_heap(),
    );
    let obj = alloc(&stm, &[3]);

    let session = stm.start_transaction();
    assert!(!session.is_active());
    let h = stm.redirect_load(&session, Handle::Direct(obj)).unwrap();
    assert_eq!(h, Handle::Direct(obj));
    let w = stm.redirect_store(&session, Handle::Direct(obj)).unwrap();
    assert_eq!(w, Handle::Direct(obj));

    // Writes land directly on the canonical object.
    stm.store_slot(stm.resolve(&session, w), 0, Value::from_i64(8));
    assert!(stm.commit_transaction(session));
    assert_eq!(stm.load_slot(obj, 0).to_i64(), 8);
    assert_eq!(stm.stats().committed, 1);
}

#[test]
fn aborted_transaction_terminates_and_fails_commit() {
    let stm = stm();
    let obj = alloc(&stm, &[1]);

    let session = stm.start_transaction();
    let h = stm.redirect_load(&session, Handle::Direct(obj)).unwrap();
    session.transaction().unwrap().abort();

    assert_eq!(stm.redirect_load(&session, h), Err(Terminated));
    assert_eq!(stm.redirect_store(&session, Handle::Direct(obj)), Err(Terminated));
    assert!(!stm.commit_transaction(session));
    assert_eq!(stm.load_slot(obj, 0).to_i64(), 1, "aborted writes must not land");

    let stats = stm.stats();
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.committed, 0);
}

#[test]
fn alternate_policy_aborts_every_other_commit() {
    let stm = Stm::with_policy(
        StmConfig::default(),
        test_heap(),
        Box::new(AlternatePolicy::new()),
    );
    let obj = alloc(&stm, &[0]);

    // Retry harness: keep attempting the event until a commit lands.
    let mut attempts = 0;
    loop {
        attempts += 1;
        let session = stm.start_transaction();
        let h = stm.redirect_store(&session, Handle::Direct(obj)).unwrap();
        stm.store_slot(stm.resolve(&session, h), 0, Value::from_i64(attempts));
        if stm.commit_transaction(session) {
            break;
        }
    }

    assert_eq!(attempts, 2, "first commit is forced to abort");
    assert_eq!(stm.load_slot(obj, 0).to_i64(), 2);
    let stats = stm.stats();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.aborted, 1);
}

#[test]
fn many_objects_span_cell_blocks() {
    let stm = stm();
    let objects: Vec<Value> = (0..150).map(|n| alloc(&stm, &[n])).collect();

    let session = stm.start_transaction();
    let mut handles = Vec::new();
    for obj in &objects {
        let h = stm.redirect_store(&session, Handle::Direct(*obj)).unwrap();
        let shadow = stm.resolve(&session, h);
        let n = stm.load_slot(shadow, 0).to_i64();
        stm.store_slot(shadow, 0, Value::from_i64(n + 1));
        handles.push(h);
    }
    // Handles created before the block boundary still resolve.
    for (obj, h) in objects.iter().zip(&handles) {
        let shadow = stm.resolve(&session, *h);
        assert_ne!(shadow, *obj);
    }
    assert!(stm.commit_transaction(session));

    for (n, obj) in objects.iter().enumerate() {
        assert_eq!(stm.load_slot(*obj, 0).to_i64(), n as i64 + 1);
    }
}
