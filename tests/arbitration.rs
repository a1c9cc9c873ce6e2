//! Concurrency tests for gated device access.
//!
//! Every test drives a real `DeviceHandle` from several OS threads. Arrival
//! order is made deterministic by holding the device with a long-running
//! call and waiting for the queue length to grow before submitting the next
//! caller.

use daq_arbiter::mock::MockInstrument;
use daq_arbiter::queue::{Rejected, SubmitMode};
use daq_arbiter::{AccessError, DeviceHandle, Gated, Priority};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn open(name: &str) -> DeviceHandle<MockInstrument> {
    DeviceHandle::open_default(MockInstrument::new(name, 2)).expect("mock opens")
}

/// Block until `count` tickets are pending behind the in-flight call.
fn wait_for_pending(handle: &DeviceHandle<MockInstrument>, count: usize) {
    assert!(
        handle.queue().wait_until(|s| s.len() == count, WAIT),
        "queue never reached {} pending tickets",
        count
    );
}

fn wait_for_in_flight(handle: &DeviceHandle<MockInstrument>) {
    assert!(handle.queue().wait_until(|s| s.in_flight(), WAIT));
}

#[test]
fn test_bodies_never_overlap() {
    let handle = open("stage");
    let running = AtomicUsize::new(0);
    let max_running = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);

    thread::scope(|s| {
        for worker in 0..8u32 {
            let (handle, running, max_running, done, skipped) =
                (&handle, &running, &max_running, &done, &skipped);
            s.spawn(move || {
                // Worker 0 is a best-effort monitor, the rest are guaranteed.
                let priority = Priority::new(worker % 4);
                for _ in 0..50 {
                    let result = handle.gate(priority, |dev| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_running.fetch_max(now, Ordering::SeqCst);
                        let value = dev.get(0, "position");
                        thread::yield_now();
                        running.fetch_sub(1, Ordering::SeqCst);
                        value
                    });
                    match result.expect("gated call failed") {
                        Gated::Done(_) => done.fetch_add(1, Ordering::SeqCst),
                        Gated::Skipped => skipped.fetch_add(1, Ordering::SeqCst),
                    };
                }
            });
        }
    });

    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    assert_eq!(done.load(Ordering::SeqCst) + skipped.load(Ordering::SeqCst), 400);
    let stats = handle.stats();
    assert_eq!(stats.completed as usize, done.load(Ordering::SeqCst));
    assert!(!stats.in_flight);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_priority_order_and_best_effort_skip() {
    let handle = open("stage");
    let order = Mutex::new(Vec::new());
    let (release, gate_open) = mpsc::channel::<()>();

    thread::scope(|s| {
        let h = &handle;
        s.spawn(move || {
            h.gate(Priority::new(10), |_dev| {
                gate_open.recv().ok();
                Ok::<_, anyhow::Error>(())
            })
        });
        wait_for_in_flight(&handle);

        let mut callers = Vec::new();
        for (label, level) in [("first-5", 5), ("prio-1", 1), ("second-5", 5)] {
            let (h, order) = (&handle, &order);
            callers.push(s.spawn(move || {
                h.gate(Priority::new(level), |_dev| {
                    order.lock().unwrap().push(label);
                    Ok::<_, anyhow::Error>(())
                })
            }));
            wait_for_pending(&handle, callers.len());
        }

        let before = handle.stats();
        let skipped = handle
            .gate(Priority::BEST_EFFORT, |_dev| {
                order.lock().unwrap().push("best-effort");
                Ok::<_, anyhow::Error>(())
            })
            .unwrap();
        assert!(skipped.is_skipped());
        assert_eq!(handle.stats().next_index, before.next_index);
        assert_eq!(handle.stats().pending, 3);

        release.send(()).unwrap();
        for caller in callers {
            assert!(caller.join().unwrap().unwrap().is_done());
        }
    });

    assert_eq!(*order.lock().unwrap(), vec!["first-5", "second-5", "prio-1"]);
}

#[test]
fn test_equal_priority_is_fifo() {
    let handle = open("meter");
    let order = Mutex::new(Vec::new());
    let (release, gate_open) = mpsc::channel::<()>();

    thread::scope(|s| {
        let h = &handle;
        s.spawn(move || {
            h.gate(Priority::new(1), |_dev| {
                gate_open.recv().ok();
                Ok::<_, anyhow::Error>(())
            })
        });
        wait_for_in_flight(&handle);

        for (count, label) in ["A", "B", "C", "D"].into_iter().enumerate() {
            let (h, order) = (&handle, &order);
            s.spawn(move || {
                h.gate(Priority::new(5), |_dev| {
                    order.lock().unwrap().push(label);
                    Ok::<_, anyhow::Error>(())
                })
            });
            wait_for_pending(&handle, count + 1);
        }

        release.send(()).unwrap();
    });

    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C", "D"]);
}

#[test]
fn test_close_drains_pending_work() {
    let instrument = MockInstrument::new("laser", 1);
    let counters = instrument.counters();
    let handle = DeviceHandle::open_default(instrument).unwrap();
    let ran = AtomicUsize::new(0);
    let (release, gate_open) = mpsc::channel::<()>();

    thread::scope(|s| {
        let (h, ran) = (&handle, &ran);
        s.spawn(move || {
            h.gate(Priority::new(3), |_dev| {
                gate_open.recv().ok();
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
        });
        wait_for_in_flight(&handle);

        for count in 1..=2 {
            s.spawn(move || {
                h.gate(Priority::new(2), |dev| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    dev.set(0, "voltage", 1.0)
                })
            });
            wait_for_pending(&handle, count);
        }

        let closer = s.spawn(move || h.close());
        assert!(handle.queue().wait_until(|s| s.is_closed(), WAIT));

        // Closed to newcomers, but the admitted work is still outstanding.
        let late = handle.gate(Priority::new(9), |dev| dev.get(0, "voltage"));
        assert_eq!(
            late.unwrap_err().downcast_ref::<AccessError>(),
            Some(&AccessError::Closed)
        );
        thread::sleep(Duration::from_millis(30));
        assert!(!closer.is_finished());
        assert_eq!(counters.closes(), 0);

        release.send(()).unwrap();
        closer.join().unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(counters.closes(), 1);
    });

    assert!(handle.is_closed());
    assert_eq!(
        handle.queue().submit(Priority::new(1).sort_key(), SubmitMode::Blocking),
        Err(Rejected::Closed)
    );
    assert_eq!(handle.queue().unfinished(), 0);
}

#[test]
fn test_concurrent_close_calls_close_driver_once() {
    let instrument = MockInstrument::new("laser", 1);
    let counters = instrument.counters();
    let handle = DeviceHandle::open_default(instrument).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            let h = &handle;
            s.spawn(move || h.close().unwrap());
        }
    });

    assert_eq!(counters.closes(), 1);
    handle.close().unwrap();
    assert_eq!(counters.closes(), 1);
}

#[test]
fn test_failing_body_releases_device() {
    let handle = open("stage");
    let (release, gate_open) = mpsc::channel::<()>();
    let next_ran = AtomicUsize::new(0);

    thread::scope(|s| {
        let h = &handle;
        let failing = s.spawn(move || {
            h.gate(Priority::new(4), |_dev| -> anyhow::Result<()> {
                gate_open.recv().ok();
                anyhow::bail!("serial read timeout")
            })
        });
        wait_for_in_flight(&handle);

        let next_ran = &next_ran;
        let next = s.spawn(move || {
            h.gate(Priority::new(1), |dev| {
                next_ran.fetch_add(1, Ordering::SeqCst);
                dev.get(0, "frequency")
            })
        });
        wait_for_pending(&handle, 1);

        release.send(()).unwrap();
        let err = failing.join().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "serial read timeout");
        assert_eq!(next.join().unwrap().unwrap(), Gated::Done(1000.0));
    });

    assert_eq!(next_ran.load(Ordering::SeqCst), 1);
    assert!(!handle.queue().in_flight());
    assert_eq!(handle.stats().completed, 2);
}

#[test]
fn test_driver_fault_propagates_unchanged() {
    let handle =
        DeviceHandle::open_default(MockInstrument::new("ilm", 1).with_fault("level")).unwrap();
    let err = handle
        .channel(Priority::new(1))
        .gate(|dev| dev.get(0, "level"))
        .unwrap_err();
    assert!(err.to_string().contains("communication with device failed"));
    assert!(err.downcast_ref::<AccessError>().is_none());
    assert!(!handle.queue().in_flight());
}

#[test]
fn test_bounded_queue_reports_busy_for_guaranteed_calls() {
    let mut config = daq_arbiter::config::ArbiterConfig::default();
    config.queue.capacity = 1;
    config.queue.submit_timeout_ms = Some(10);
    let handle = DeviceHandle::open(MockInstrument::new("stage", 1), &config).unwrap();
    let (release, gate_open) = mpsc::channel::<()>();

    thread::scope(|s| {
        let h = &handle;
        s.spawn(move || {
            h.gate(Priority::new(2), |_dev| {
                gate_open.recv().ok();
                Ok::<_, anyhow::Error>(())
            })
        });
        wait_for_in_flight(&handle);
        let queued = s.spawn(move || h.gate(Priority::new(2), |dev| dev.get(0, "position")));
        wait_for_pending(&handle, 1);

        let busy = handle.gate(Priority::new(7), |dev| dev.get(0, "position"));
        assert!(matches!(
            busy.unwrap_err().downcast_ref::<AccessError>(),
            Some(AccessError::Busy(_))
        ));
        let skipped = handle.gate(Priority::BEST_EFFORT, |dev| dev.get(0, "position"));
        assert!(skipped.unwrap().is_skipped());

        release.send(()).unwrap();
        assert!(queued.join().unwrap().unwrap().is_done());
    });

    assert_eq!(handle.stats().pending, 0);
}

#[test]
fn test_best_effort_monitor_under_load() {
    let handle = DeviceHandle::open_default(
        MockInstrument::new("stage", 1).with_latency(Duration::from_micros(200)),
    )
    .unwrap();
    let monitor_done = AtomicUsize::new(0);
    let monitor_skipped = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..3 {
            let h = &handle;
            s.spawn(move || {
                let axis = h.channel(Priority::new(2));
                for step in 0..40 {
                    let gated = axis
                        .gate(|dev| dev.set(0, "position", f64::from(step)))
                        .unwrap();
                    assert!(gated.is_done());
                }
            });
        }

        let (h, done, skipped) = (&handle, &monitor_done, &monitor_skipped);
        s.spawn(move || {
            let monitor = h.channel(Priority::BEST_EFFORT);
            for _ in 0..100 {
                match monitor.gate(|dev| dev.get(0, "position")).unwrap() {
                    Gated::Done(_) => done.fetch_add(1, Ordering::SeqCst),
                    Gated::Skipped => skipped.fetch_add(1, Ordering::SeqCst),
                };
            }
        });
    });

    assert_eq!(
        monitor_done.load(Ordering::SeqCst) + monitor_skipped.load(Ordering::SeqCst),
        100
    );
    assert_eq!(
        handle.stats().completed as usize,
        120 + monitor_done.load(Ordering::SeqCst)
    );
}
