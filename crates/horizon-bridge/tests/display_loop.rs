//! Integration tests for the display loop across threads.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use horizon_bridge::{BridgeError, Display, LoopMode, NativeDispatcher, Runnable};
use parking_lot::Mutex;

fn proxy_display() -> (Arc<NativeDispatcher>, Display) {
    let toolkit = Arc::new(NativeDispatcher::spawn().unwrap());
    let display = Display::new(toolkit.clone()).unwrap();
    assert_eq!(display.mode(), LoopMode::Proxy);
    (toolkit, display)
}

fn native_display() -> (Arc<NativeDispatcher>, Display) {
    let toolkit = Arc::new(NativeDispatcher::attach_current());
    let display = Display::new(toolkit.clone()).unwrap();
    assert_eq!(display.mode(), LoopMode::Native);
    (toolkit, display)
}

/// Run loop cycles until `done` holds, failing after five seconds.
fn pump_until(display: &Display, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "loop never reached the expected state");
        if !display.read_and_dispatch().unwrap() {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[test]
fn async_calls_from_one_thread_run_in_order_on_owner() {
    let (_toolkit, display) = proxy_display();
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let display = display.clone();
        let seen = seen.clone();
        thread::spawn(move || {
            let f = seen.clone();
            display
                .async_exec(move || f.lock().push(("f", thread::current().id())))
                .unwrap();
            let g = seen.clone();
            display
                .async_exec(move || g.lock().push(("g", thread::current().id())))
                .unwrap();
        })
        .join()
        .unwrap();
    }

    assert!(display.read_and_dispatch().unwrap());
    let owner = thread::current().id();
    assert_eq!(*seen.lock(), vec![("f", owner), ("g", owner)]);
    display.dispose().unwrap();
}

#[test]
fn calls_from_many_threads_run_exactly_once_in_submission_order() {
    const THREADS: usize = 4;
    const CALLS: usize = 40;

    let (_toolkit, display) = proxy_display();
    let owner = thread::current().id();
    let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let off_owner = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..THREADS)
        .map(|t| {
            let display = display.clone();
            let seen = seen.clone();
            let off_owner = off_owner.clone();
            thread::spawn(move || {
                for i in 0..CALLS {
                    let seen = seen.clone();
                    let off_owner = off_owner.clone();
                    let call = move || {
                        if thread::current().id() != owner {
                            off_owner.fetch_add(1, Ordering::SeqCst);
                        }
                        seen.lock().push((t, i));
                    };
                    if i % 5 == 0 {
                        display.sync_exec(call).unwrap();
                    } else {
                        display.async_exec(call).unwrap();
                    }
                }
            })
        })
        .collect();

    pump_until(&display, || seen.lock().len() == THREADS * CALLS);
    for submitter in submitters {
        submitter.join().unwrap();
    }

    assert_eq!(off_owner.load(Ordering::SeqCst), 0);
    let mut per_thread: HashMap<usize, Vec<usize>> = HashMap::new();
    for (t, i) in seen.lock().iter() {
        per_thread.entry(*t).or_default().push(*i);
    }
    for t in 0..THREADS {
        assert_eq!(per_thread[&t], (0..CALLS).collect::<Vec<_>>());
    }
    display.dispose().unwrap();
}

#[test]
fn sync_exec_effects_are_visible_to_the_caller() {
    let (_toolkit, display) = proxy_display();
    let value = Arc::new(AtomicUsize::new(0));

    let caller = {
        let display = display.clone();
        let value = value.clone();
        thread::spawn(move || {
            let written = value.clone();
            let inner = display.clone();
            let sync_thread = display
                .sync_exec(move || {
                    written.store(17, Ordering::Relaxed);
                    inner.sync_thread().unwrap()
                })
                .unwrap();
            (
                value.load(Ordering::Relaxed),
                sync_thread,
                thread::current().id(),
            )
        })
    };

    pump_until(&display, || caller.is_finished());
    let (observed, sync_thread, caller_id) = caller.join().unwrap();
    assert_eq!(observed, 17);
    assert_eq!(sync_thread, Some(caller_id));
    assert_eq!(display.sync_thread().unwrap(), None);
    display.dispose().unwrap();
}

#[test]
fn sync_exec_on_owner_runs_inline() {
    let (_toolkit, display) = proxy_display();
    let inner = display.clone();
    let nested = display
        .sync_exec(move || inner.sync_exec(|| thread::current().id()).unwrap())
        .unwrap();
    assert_eq!(nested, thread::current().id());
    assert_eq!(display.debug_snapshot().pending_calls, 0);
    display.dispose().unwrap();
}

#[test]
fn sync_exec_panic_is_returned_to_caller() {
    let (_toolkit, display) = proxy_display();
    let caller = {
        let display = display.clone();
        thread::spawn(move || display.sync_exec::<_, ()>(|| panic!("sync boom")))
    };

    pump_until(&display, || caller.is_finished());
    let err = caller.join().unwrap().unwrap_err();
    assert_eq!(err.as_panic().unwrap().message(), "sync boom");
    // The owning thread never sees it.
    assert!(display.throw_if_pending().is_ok());
    display.dispose().unwrap();
}

fn assert_wake_interrupts_sleep(display: &Display, toolkit: &NativeDispatcher) {
    let dispatched_before = toolkit.dispatched_count();
    let waker = {
        let display = display.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            display.wake().unwrap();
        })
    };

    let start = Instant::now();
    display.sleep().unwrap();
    let elapsed = start.elapsed();
    waker.join().unwrap();

    assert!(elapsed < Duration::from_millis(250), "sleep took {elapsed:?}");
    assert_eq!(toolkit.dispatched_count(), dispatched_before);
}

#[test]
fn wake_interrupts_sleep_in_proxy_mode() {
    let (toolkit, display) = proxy_display();
    assert_wake_interrupts_sleep(&display, &toolkit);
    display.dispose().unwrap();
}

#[test]
fn wake_interrupts_sleep_in_native_mode() {
    let (toolkit, display) = native_display();
    assert_wake_interrupts_sleep(&display, &toolkit);
    display.dispose().unwrap();
}

#[test]
fn async_panic_is_raised_once_and_later_calls_still_run() {
    let (_toolkit, display) = proxy_display();
    let g_ran = Arc::new(AtomicUsize::new(0));

    display.async_exec(|| panic!("E")).unwrap();
    {
        let g_ran = g_ran.clone();
        display
            .async_exec(move || {
                g_ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let err = display.read_and_dispatch().unwrap_err();
    assert!(matches!(err, BridgeError::FailedExec(_)));
    assert_eq!(err.as_panic().unwrap().message(), "E");

    assert!(display.read_and_dispatch().unwrap());
    assert_eq!(g_ran.load(Ordering::SeqCst), 1);
    assert!(display.throw_if_pending().is_ok());
    display.dispose().unwrap();
}

#[test]
fn dispose_runs_every_queued_call_then_rejects() {
    const QUEUED: usize = 25;
    let (_toolkit, display) = proxy_display();
    let ran = Arc::new(AtomicUsize::new(0));

    {
        let display = display.clone();
        let ran = ran.clone();
        thread::spawn(move || {
            for _ in 0..QUEUED {
                let ran = ran.clone();
                display
                    .async_exec(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        })
        .join()
        .unwrap();
    }

    display.dispose().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), QUEUED);
    assert!(display.is_disposed());

    let remote = display.clone();
    let results = thread::spawn(move || {
        (
            remote.async_exec(|| {}),
            remote.sync_exec(|| 1),
            remote.wake(),
        )
    })
    .join()
    .unwrap();
    assert!(matches!(results.0, Err(BridgeError::DeviceDisposed)));
    assert!(matches!(results.1, Err(BridgeError::DeviceDisposed)));
    assert!(matches!(results.2, Err(BridgeError::DeviceDisposed)));
    assert!(matches!(display.check_device(), Err(BridgeError::DeviceDisposed)));
    assert!(matches!(display.read_and_dispatch(), Err(BridgeError::DeviceDisposed)));
}

#[test]
fn callback_may_dispose_the_display_mid_drain() {
    let (_toolkit, display) = native_display();
    let after = Arc::new(AtomicUsize::new(0));

    {
        let inner = display.clone();
        display.async_exec(move || inner.dispose().unwrap()).unwrap();
    }
    {
        let after = after.clone();
        display
            .async_exec(move || {
                after.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    display.read_and_dispatch().unwrap();
    assert!(display.is_disposed());
    // Disposal drains everything still queued.
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn proxy_timer_runs_on_native_thread_inside_the_section() {
    let (toolkit, display) = proxy_display();
    let observed = Arc::new(Mutex::new(None));

    let runnable = {
        let display = display.clone();
        let observed = observed.clone();
        Runnable::new(move || {
            let access = display.check_device().is_ok();
            let widget_access =
                panic::catch_unwind(AssertUnwindSafe(|| display.assert_widget_thread())).is_ok();
            let inline = display.sync_exec(|| thread::current().id()).unwrap();
            *observed.lock() = Some((thread::current().id(), access, widget_access, inline));
        })
    };

    display.timer_exec(0, &runnable).unwrap();
    pump_until(&display, || observed.lock().is_some());

    let (ran_on, access, widget_access, inline) = observed.lock().take().unwrap();
    assert_eq!(ran_on, toolkit.thread_id());
    assert!(access);
    assert!(widget_access);
    assert_eq!(inline, toolkit.thread_id());
    assert_eq!(
        display.debug_snapshot().section_holder,
        Some(thread::current().id())
    );
    display.dispose().unwrap();
}

#[test]
fn native_thread_panic_is_relayed_to_owner() {
    let (_toolkit, display) = proxy_display();
    let runnable = Runnable::new(|| panic!("timer failure"));

    display.timer_exec(0, &runnable).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let err = loop {
        assert!(Instant::now() < deadline, "failure never surfaced");
        match display.read_and_dispatch() {
            Ok(_) => thread::sleep(Duration::from_millis(1)),
            Err(err) => break err,
        }
    };

    let failure = err.as_panic().unwrap();
    assert_eq!(failure.message(), "timer failure");
    assert_eq!(failure.thread_name(), "horizon-native-dispatch");
    assert!(display.read_and_dispatch().is_ok());
    display.dispose().unwrap();
}

#[test]
fn raw_native_event_can_sync_exec_into_proxy_display() {
    let (toolkit, display) = proxy_display();
    let (tx, rx) = crossbeam_channel::bounded(1);

    {
        let display = display.clone();
        toolkit
            .post(move || {
                let owner = display.sync_exec(|| thread::current().id());
                tx.send(owner).unwrap();
            })
            .unwrap();
    }

    let mut result = None;
    pump_until(&display, || {
        result = rx.try_recv().ok();
        result.is_some()
    });
    assert_eq!(result.unwrap().unwrap(), thread::current().id());
    display.dispose().unwrap();
}

#[test]
fn one_display_per_thread() {
    let (toolkit, display) = proxy_display();
    assert!(matches!(
        Display::new(toolkit.clone()),
        Err(BridgeError::DisplayExists(thread)) if thread == display.thread()
    ));

    let other = thread::spawn(move || {
        let display = Display::new(toolkit).unwrap();
        display.dispose().unwrap();
    });
    other.join().unwrap();
    display.dispose().unwrap();
}

#[test]
fn owner_only_calls_are_rejected_elsewhere() {
    let (_toolkit, display) = proxy_display();
    let remote = display.clone();
    let results = thread::spawn(move || {
        (
            remote.check_device(),
            remote.read_and_dispatch(),
            remote.dispose(),
            remote.timer_exec(10, &Runnable::new(|| {})),
        )
    })
    .join()
    .unwrap();

    assert!(matches!(results.0, Err(BridgeError::ThreadInvalidAccess)));
    assert!(matches!(results.1, Err(BridgeError::ThreadInvalidAccess)));
    assert!(matches!(results.2, Err(BridgeError::ThreadInvalidAccess)));
    assert!(matches!(results.3, Err(BridgeError::ThreadInvalidAccess)));
    display.dispose().unwrap();
}

#[test]
fn widget_assertion_rejects_foreign_threads() {
    let (_toolkit, display) = proxy_display();
    display.assert_widget_thread();

    let remote = display.clone();
    let outcome = thread::spawn(move || remote.assert_widget_thread()).join();
    assert!(outcome.is_err());
    display.dispose().unwrap();
}

#[test]
fn native_callback_runs_nested_loop_until_async_call_arrives() {
    let (toolkit, display) = proxy_display();
    let finished = Arc::new(Mutex::new(None));

    let runnable = {
        let display = display.clone();
        let finished = finished.clone();
        Runnable::new(move || {
            let flag = Arc::new(AtomicBool::new(false));
            {
                let display = display.clone();
                let flag = flag.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    display
                        .async_exec(move || flag.store(true, Ordering::SeqCst))
                        .unwrap();
                });
            }

            let mut iterations = 0;
            while !flag.load(Ordering::SeqCst) {
                iterations += 1;
                if !display.read_and_dispatch().unwrap() {
                    display.sleep().unwrap();
                }
            }
            *finished.lock() = Some((thread::current().id(), iterations));
        })
    };

    display.timer_exec(0, &runnable).unwrap();
    pump_until(&display, || finished.lock().is_some());

    let (ran_on, iterations) = finished.lock().take().unwrap();
    assert_eq!(ran_on, toolkit.thread_id());
    assert!(iterations >= 1);
    display.dispose().unwrap();
}

#[test]
fn owner_callback_runs_nested_loop_until_timer_fires() {
    let (toolkit, display) = proxy_display();
    let fired_on = Arc::new(Mutex::new(None));
    let finished = Arc::new(AtomicBool::new(false));

    {
        let nested = display.clone();
        let fired_on = fired_on.clone();
        let finished = finished.clone();
        display
            .async_exec(move || {
                let runnable = {
                    let fired_on = fired_on.clone();
                    Runnable::new(move || *fired_on.lock() = Some(thread::current().id()))
                };
                nested.timer_exec(10, &runnable).unwrap();

                let deadline = Instant::now() + Duration::from_secs(5);
                while fired_on.lock().is_none() {
                    assert!(Instant::now() < deadline, "timer never fired");
                    if !nested.read_and_dispatch().unwrap() {
                        nested.sleep().unwrap();
                    }
                }
                finished.store(true, Ordering::SeqCst);
            })
            .unwrap();
    }

    pump_until(&display, || finished.load(Ordering::SeqCst));
    assert_eq!(*fired_on.lock(), Some(toolkit.thread_id()));

    // The owner holds the section again once the nested loop returns.
    let snapshot = display.debug_snapshot();
    assert_eq!(snapshot.section_holder, Some(thread::current().id()));
    assert!(display.check_device().is_ok());
    display.dispose().unwrap();
}
