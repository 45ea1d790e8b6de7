use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use petek::{
    AlternatePolicy, Event, EventError, HeapSettings, ObjectKind, Runtime, StmConfig, Value,
};

fn runtime(threads: usize) -> Runtime {
    Runtime::new(
        StmConfig {
            enabled: true,
            thread_count: threads,
        },
        HeapSettings::default(),
    )
}

fn increment_event(name: &'static str) -> Event {
    Event::new(move |ctx| {
        let h = ctx.open(name)?;
        let n = ctx.load(h, 0)?.to_i64();
        ctx.store(h, 0, Value::from_i64(n + 1))?;
        Ok(())
    })
}

#[test]
#[cfg_attr(miri, ignore)]
fn counter_race_reaches_the_sum() {
    let rt = runtime(2);
    rt.define_object("counter", &[0]).unwrap();
    for _ in 0..200 {
        rt.enqueue(increment_event("counter"));
    }

    let report = rt.run();
    assert_eq!(rt.read_global_slot("counter", 0).unwrap().to_i64(), 200);
    assert_eq!(report.committed, 200, "every event must commit exactly once");
    assert!(rt.take_errors().is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn disjoint_objects_commit_without_conflicts() {
    let rt = runtime(2);
    rt.define_object("a", &[0]).unwrap();
    rt.define_object("b", &[0]).unwrap();

    for name in ["a", "b"] {
        rt.enqueue(Event::new(move |ctx| {
            let h = ctx.open(name)?;
            ctx.store(h, 0, Value::from_i64(7))?;
            // Overlap with the other event.
            thread::sleep(Duration::from_millis(20));
            Ok(())
        }));
    }

    let report = rt.run();
    assert_eq!(rt.read_global_slot("a", 0).unwrap().to_i64(), 7);
    assert_eq!(rt.read_global_slot("b", 0).unwrap().to_i64(), 7);
    assert_eq!(report.committed, 2);
    assert_eq!(report.aborted, 0, "disjoint write sets never conflict");
}

#[test]
#[cfg_attr(miri, ignore)]
fn write_write_conflict_keeps_one_winner_per_round() {
    let rt = runtime(2);
    rt.define_object("x", &[0]).unwrap();

    for id in 1..=2i64 {
        rt.enqueue(Event::new(move |ctx| {
            let h = ctx.open("x")?;
            ctx.store(h, 0, Value::from_i64(id))?;
            thread::sleep(Duration::from_millis(10));
            Ok(())
        }));
    }

    let report = rt.run();
    let v = rt.read_global_slot("x", 0).unwrap().to_i64();
    assert!(v == 1 || v == 2, "final value must be a committed write, got {v}");
    assert_eq!(report.committed, 2, "the loser retries until it commits");
}

#[test]
#[cfg_attr(miri, ignore)]
fn read_write_conflict_retries_the_reader() {
    let rt = runtime(2);
    rt.define_object("x", &[0]).unwrap();
    rt.define_object("y", &[0]).unwrap();

    let has_read = Arc::new(AtomicBool::new(false));

    // Reader: y.v = x.v + 1, slowly.
    let reader_flag = has_read.clone();
    rt.enqueue(Event::new(move |ctx| {
        let xh = ctx.open("x")?;
        let xv = ctx.load(xh, 0)?.to_i64();
        reader_flag.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        let yh = ctx.open("y")?;
        ctx.store(yh, 0, Value::from_i64(xv + 1))?;
        Ok(())
    }));

    // Writer: x.v = 99, once the reader holds x in its read set.
    let writer_flag = has_read.clone();
    rt.enqueue(Event::new(move |ctx| {
        while !writer_flag.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        let xh = ctx.open("x")?;
        ctx.store(xh, 0, Value::from_i64(99))?;
        Ok(())
    }));

    let report = rt.run();
    assert_eq!(rt.read_global_slot("x", 0).unwrap().to_i64(), 99);
    assert_eq!(rt.read_global_slot("y", 0).unwrap().to_i64(), 100);
    assert!(report.aborted >= 1, "the reader's first attempt must abort");
}

#[test]
#[cfg_attr(miri, ignore)]
fn collection_runs_under_a_live_transaction() {
    let rt = Runtime::new(
        StmConfig {
            enabled: true,
            thread_count: 2,
        },
        HeapSettings {
            capacity_words: 512,
            gc_threshold: 0.6,
        },
    );
    rt.define_object("acc", &[0; 10]).unwrap();

    // One slow writer with a growing write set.
    rt.enqueue(Event::new(|ctx| {
        let h = ctx.open("acc")?;
        for slot in 0..10 {
            ctx.store(h, slot, Value::from_i64(slot as i64 + 1))?;
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }));

    // Allocation pressure from the other worker forces collections.
    for _ in 0..40 {
        rt.enqueue(Event::new(|ctx| {
            let _garbage = ctx.alloc(ObjectKind::Data, &[Value::from_i64(0); 16])?;
            Ok(())
        }));
    }

    let report = rt.run();
    assert!(report.gc_cycles >= 1, "allocation pressure must trigger a collection");
    for slot in 0..10 {
        assert_eq!(
            rt.read_global_slot("acc", slot).unwrap().to_i64(),
            slot as i64 + 1,
            "writes must land on the relocated object"
        );
    }
    assert!(rt.take_errors().is_empty());
}

#[test]
fn aborted_attempt_swallows_its_error() {
    let rt = Runtime::with_policy(
        StmConfig {
            enabled: true,
            thread_count: 1,
        },
        HeapSettings::default(),
        Box::new(AlternatePolicy::new()),
    );
    rt.define_object("counter", &[0]).unwrap();

    let attempts = Arc::new(AtomicU64::new(0));
    let seen = attempts.clone();
    rt.enqueue(Event::new(move |ctx| {
        let attempt = seen.fetch_add(1, Ordering::SeqCst);
        let h = ctx.open("counter")?;
        let n = ctx.load(h, 0)?.to_i64();
        ctx.store(h, 0, Value::from_i64(n + 1))?;
        if attempt == 0 {
            // Fails on the attempt the policy aborts anyway.
            return Err(EventError::User("first attempt fails".into()));
        }
        Ok(())
    }));

    let report = rt.run();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(report.committed, 1);
    assert_eq!(report.aborted, 1);
    assert_eq!(rt.read_global_slot("counter", 0).unwrap().to_i64(), 1);
    assert!(
        rt.take_errors().is_empty(),
        "an error from an aborted attempt must not surface"
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn single_thread_mode_never_aborts_on_conflicts() {
    let rt = runtime(1);
    rt.define_object("counter", &[0]).unwrap();
    for _ in 0..100 {
        rt.enqueue(increment_event("counter"));
    }

    let report = rt.run();
    assert_eq!(rt.read_global_slot("counter", 0).unwrap().to_i64(), 100);
    assert_eq!(report.aborted, 0);
}

#[test]
fn disabled_stm_runs_each_event_once() {
    let rt = Runtime::new(
        StmConfig {
            enabled: false,
            thread_count: 1,
        },
        HeapSettings::default(),
    );
    rt.define_object("counter", &[0]).unwrap();
    for _ in 0..50 {
        rt.enqueue(increment_event("counter"));
    }

    let report = rt.run();
    assert_eq!(rt.read_global_slot("counter", 0).unwrap().to_i64(), 50);
    assert_eq!(report.committed, 50);
    assert_eq!(report.aborted, 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn events_can_enqueue_more_events() {
    let rt = runtime(2);
    rt.define_object("counter", &[0]).unwrap();

    rt.enqueue(Event::new(move |ctx| {
        let h = ctx.open("counter")?;
        let n = ctx.load(h, 0)?.to_i64();
        ctx.store(h, 0, Value::from_i64(n + 1))?;
        ctx.enqueue(increment_event("counter"));
        Ok(())
    }));

    let report = rt.run();
    assert_eq!(rt.read_global_slot("counter", 0).unwrap().to_i64(), 2);
    assert_eq!(report.committed, 2);
}

#[test]
#[cfg_attr(miri, ignore)]
fn bank_transfers_conserve_the_total() {
    use rand::Rng;

    let rt = runtime(2);
    let accounts = 10usize;
    for i in 0..accounts {
        rt.define_object(&format!("acc{i}"), &[1000]).unwrap();
    }

    for _ in 0..100 {
        rt.enqueue(Event::new(move |ctx| {
            let (from, to) = {
                let mut rng = rand::thread_rng();
                let from = rng.gen_range(0..accounts);
                let to = (from + rng.gen_range(1..accounts)) % accounts;
                (from, to)
            };
            let from_h = ctx.open(&format!("acc{from}"))?;
            let to_h = ctx.open(&format!("acc{to}"))?;
            let from_bal = ctx.load(from_h, 0)?.to_i64();
            let to_bal = ctx.load(to_h, 0)?.to_i64();
            if from_bal >= 1 {
                ctx.store(from_h, 0, Value::from_i64(from_bal - 1))?;
                ctx.store(to_h, 0, Value::from_i64(to_bal + 1))?;
            }
            Ok(())
        }));
    }

    rt.run();
    let total: i64 = (0..accounts)
        .map(|i| rt.read_global_slot(&format!("acc{i}"), 0).unwrap().to_i64())
        .sum();
    assert_eq!(total, accounts as i64 * 1000, "money must be conserved");
}
