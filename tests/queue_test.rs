//! Integration tests for worker queue ordering, deduplication and hooks.

use daq_link::error::LinkError;
use daq_link::queue::{QueueEvent, QueueRegistry, Transaction, TransactionKey, WorkerQueue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Log = Vec<(usize, usize)>;

fn log_queue(name: Option<&str>) -> WorkerQueue<Log> {
    WorkerQueue::new(name, "test", Vec::new)
}

/// Park the worker until the returned sender is used or dropped.
fn block_worker(queue: &WorkerQueue<Log>) -> mpsc::Sender<()> {
    let (release, gate) = mpsc::channel::<()>();
    let (started, running) = mpsc::channel::<()>();
    queue.enqueue(Transaction::new(move |_: &mut Log| {
        let _ = started.send(());
        let _ = gate.recv();
    }));
    running.recv().unwrap();
    release
}

#[test]
fn test_fifo_per_producer_across_threads() {
    let queue = Arc::new(log_queue(Some("fifo")));
    queue.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..50 {
                    queue.enqueue(Transaction::new(move |log: &mut Log| log.push((producer, seq))));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let log = queue.submit(|log: &mut Log| log.clone()).wait().unwrap();
    assert_eq!(log.len(), 200);
    for producer in 0..4 {
        let seqs: Vec<usize> = log
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
    }
}

#[test]
fn test_unique_and_replace_while_worker_busy() {
    let queue = log_queue(None);
    queue.start().unwrap();
    let release = block_worker(&queue);

    let key = TransactionKey::new("poll").with_owner(7).with_args("ch1");
    assert!(queue.enqueue_unique(Transaction::keyed(key.clone(), |log: &mut Log| log.push((1, 0)))));
    assert!(!queue.enqueue_unique(Transaction::keyed(key, |log: &mut Log| log.push((1, 1)))));
    let other = TransactionKey::new("poll").with_owner(8).with_args("ch1");
    assert!(queue.enqueue_unique(Transaction::keyed(other, |log: &mut Log| log.push((2, 0)))));

    let superseded = queue.submit(|log: &mut Log| log.len());
    assert_eq!(
        queue.enqueue_replace(Transaction::new(|log: &mut Log| log.push((3, 0)))),
        3
    );
    release.send(()).unwrap();

    let log = queue.submit(|log: &mut Log| log.clone()).wait().unwrap();
    assert_eq!(log, vec![(3, 0)]);
    assert!(matches!(superseded.wait(), Err(LinkError::QueueClosed { .. })));
}

#[test]
fn test_second_replace_wins() {
    let queue = log_queue(None);
    queue.start().unwrap();
    let release = block_worker(&queue);

    queue.enqueue_replace(Transaction::new(|log: &mut Log| log.push((1, 0))));
    assert_eq!(
        queue.enqueue_replace(Transaction::new(|log: &mut Log| log.push((2, 0)))),
        1
    );
    drop(release);

    let log = queue.submit(|log: &mut Log| log.clone()).wait().unwrap();
    assert_eq!(log, vec![(2, 0)]);
}

#[test]
fn test_idle_timeout_handlers_take_turns() {
    let queue: WorkerQueue<Vec<&'static str>> = WorkerQueue::new(None, "poller", Vec::new);
    queue.set_idle_wait(Some(Duration::from_millis(15)));
    queue.subscribe(QueueEvent::IdleTimeout, |log: &mut Vec<&'static str>| log.push("a"));
    queue.subscribe(QueueEvent::IdleTimeout, |log: &mut Vec<&'static str>| log.push("b"));
    queue.start().unwrap();

    thread::sleep(Duration::from_millis(200));
    let log = queue.submit(|log: &mut Vec<&'static str>| log.clone()).wait().unwrap();
    assert!(log.len() >= 4, "only {} idle timeouts fired", log.len());
    for pair in log.windows(2) {
        assert_ne!(pair[0], pair[1], "handlers did not alternate: {log:?}");
    }
}

#[test]
fn test_steady_traffic_suppresses_idle_timeout() {
    let queue: WorkerQueue<()> = WorkerQueue::new(None, "poller", || ());
    queue.set_idle_wait(Some(Duration::from_millis(60)));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = timeouts.clone();
    queue.subscribe(QueueEvent::IdleTimeout, move |_: &mut ()| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    queue.start().unwrap();

    for _ in 0..30 {
        queue.enqueue(Transaction::new(|_: &mut ()| {}));
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);

    thread::sleep(Duration::from_millis(200));
    assert!(timeouts.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_work_queued_from_idle_hook_window_runs_before_idle() {
    let queue: WorkerQueue<()> = WorkerQueue::new(None, "idle", || ());
    let (entered_tx, entered) = mpsc::channel::<()>();
    let (release, gate) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let gate = Mutex::new(gate);
    queue.subscribe(QueueEvent::Idle, move |_: &mut ()| {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = gate.lock().unwrap().recv();
    });
    queue.start().unwrap();
    entered.recv().unwrap();
    assert!(queue.is_idle());

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    queue.enqueue(Transaction::new(move |_: &mut ()| flag.store(true, Ordering::SeqCst)));
    assert!(!queue.is_idle());
    drop(release);

    queue.wait_for_idle(Duration::MAX, None).unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_wait_for_idle_after_completion_sees_later_work() {
    let queue: WorkerQueue<()> = WorkerQueue::new(None, "idle", || ());
    queue.start().unwrap();
    for _ in 0..200 {
        queue.submit(|_: &mut ()| {}).wait().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.enqueue(Transaction::new(move |_: &mut ()| flag.store(true, Ordering::SeqCst)));
        queue.wait_for_idle(Duration::from_secs(1), None).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}

#[test]
fn test_idle_and_exit_idle_bracket_work() {
    let queue: WorkerQueue<Vec<&'static str>> = WorkerQueue::new(None, "hooks", Vec::new);
    queue.subscribe(QueueEvent::Idle, |log: &mut Vec<&'static str>| log.push("idle"));
    queue.subscribe(QueueEvent::ExitIdle, |log: &mut Vec<&'static str>| log.push("busy"));
    queue.start().unwrap();
    queue.wait_for_idle(Duration::from_secs(1), None).unwrap();

    let log = queue.submit(|log: &mut Vec<&'static str>| log.clone()).wait().unwrap();
    assert_eq!(log, vec!["idle", "busy"]);
}

#[test]
fn test_registry_shares_named_queues_only() {
    let registry: QueueRegistry<Log> = QueueRegistry::new();
    let (first, created) = registry.get_or_create(Some("bus"), || log_queue(Some("bus")));
    assert!(created);
    let (second, created) = registry.get_or_create(Some("bus"), || log_queue(Some("bus")));
    assert!(!created);
    assert!(Arc::ptr_eq(&first, &second));

    let (private, created) = registry.get_or_create(None, || log_queue(None));
    assert!(created);
    assert!(!Arc::ptr_eq(&first, &private));
    assert_eq!(registry.names(), vec!["bus".to_string()]);

    registry.dispose_all();
    assert!(first.is_closed());
}
