//! Horizon Bridge Proxy Loop Example
//!
//! Drives a display whose owning thread is not the toolkit's dispatch thread:
//! - Worker threads submit `async_exec` and `sync_exec` calls
//! - A repeating timer runs on the dispatch thread while the owner yields
//! - A posted custom event asks the owning thread to close the display
//!
//! Run with: cargo run -p horizon-bridge --example proxy_loop

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use horizon_bridge::{Display, Event, EventKind, NativeDispatcher, Runnable};

const WORKERS: usize = 3;
const TICKS: usize = 5;

fn main() -> Result<(), horizon_bridge::BridgeError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let toolkit = Arc::new(NativeDispatcher::spawn()?);
    let display = Display::builder().name("proxy-demo").build(toolkit)?;
    println!("{}", display.debug_snapshot());

    display.add_listener(EventKind::Close, |_| println!("close requested"))?;
    display.add_listener(EventKind::Dispose, |_| println!("disposing"))?;

    let workers: Vec<_> = (0..WORKERS)
        .map(|id| {
            let display = display.clone();
            thread::spawn(move || {
                display
                    .async_exec(move || println!("worker {id}: async call on the UI thread"))
                    .ok();
                match display.sync_exec(move || id * 10) {
                    Ok(value) => println!("worker {id}: sync call returned {value}"),
                    Err(err) => println!("worker {id}: sync call failed: {err}"),
                }
            })
        })
        .collect();

    // The timer reschedules itself until it has ticked enough, then posts a
    // close request for the owning thread.
    let ticks = Arc::new(AtomicUsize::new(0));
    let timer: Arc<parking_lot::Mutex<Option<Runnable>>> = Arc::default();
    let runnable = {
        let display = display.clone();
        let timer = timer.clone();
        Runnable::new(move || {
            let tick = ticks.fetch_add(1, Ordering::SeqCst) + 1;
            println!(
                "tick {tick} on {:?}",
                thread::current().name().unwrap_or("unnamed")
            );
            if tick < TICKS {
                if let Some(runnable) = timer.lock().clone() {
                    display.timer_exec(20, &runnable).ok();
                }
            } else {
                display.post_event(Event::new(EventKind::Custom(1))).ok();
            }
        })
    };
    *timer.lock() = Some(runnable.clone());
    display.timer_exec(20, &runnable)?;

    let close_requested = Arc::new(AtomicBool::new(false));
    {
        let close_requested = close_requested.clone();
        display.add_listener(EventKind::Custom(1), move |_| {
            close_requested.store(true, Ordering::SeqCst);
        })?;
    }

    while !display.is_disposed() {
        if close_requested.swap(false, Ordering::SeqCst) {
            display.close()?;
            continue;
        }
        if !display.read_and_dispatch()? {
            display.sleep()?;
        }
    }

    for worker in workers {
        worker.join().ok();
    }
    // Break the runnable's reference back to the display.
    timer.lock().take();
    println!("{}", display.debug_snapshot());
    Ok(())
}
