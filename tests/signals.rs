//! Real signal delivery through the gateway.
//!
//! Built with `harness = false`: the test harness would run tests on
//! threads spawned before the gateway blocks the signals, and any of them
//! could then receive a process-directed signal and die from it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use telemetry_agent::lifecycle::{SignalGateway, SignalHandler};
use telemetry_agent::scheduler::Scheduler;

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn counter(gateway: &SignalGateway, signal: Signal, hits: &Arc<AtomicUsize>) -> SignalHandler {
    let hits = Arc::clone(hits);
    gateway
        .register_handler(signal, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
}

fn newest_handler_wins(gateway: &SignalGateway) {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let _h1 = counter(gateway, Signal::SIGUSR2, &first);
    let h2 = counter(gateway, Signal::SIGUSR2, &second);

    kill(Pid::this(), Signal::SIGUSR2).unwrap();
    wait_for("second handler", || second.load(Ordering::SeqCst) == 1);
    assert_eq!(first.load(Ordering::SeqCst), 0);

    drop(h2);
    kill(Pid::this(), Signal::SIGUSR2).unwrap();
    wait_for("first handler", || first.load(Ordering::SeqCst) == 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

fn disposed_handlers_never_run(gateway: &SignalGateway) {
    let violations = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let _base = counter(gateway, Signal::SIGUSR2, &delivered);

    let stop = Arc::new(AtomicBool::new(false));
    let sender = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let _ = kill(Pid::this(), Signal::SIGUSR2);
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    };

    for _ in 0..500 {
        let alive = Arc::new(AtomicBool::new(true));
        let handler = {
            let alive = Arc::clone(&alive);
            let violations = Arc::clone(&violations);
            gateway
                .register_handler(Signal::SIGUSR2, move || {
                    if !alive.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap()
        };
        std::thread::yield_now();
        drop(handler);
        alive.store(false, Ordering::SeqCst);
    }

    stop.store(true, Ordering::SeqCst);
    sender.join().unwrap();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

fn terminate_from_signal_ends_the_loop(gateway: &SignalGateway) {
    let scheduler = Scheduler::new(Duration::from_millis(50));
    let handle = scheduler.handle();
    let _handler = gateway
        .register_handler(Signal::SIGINT, move || handle.terminate())
        .unwrap();

    kill(Pid::this(), Signal::SIGINT).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !scheduler.run_once() {
        assert!(Instant::now() < deadline, "loop did not observe termination");
    }
    assert!(scheduler.is_terminating());
}

fn main() {
    // Blocks the signals on this thread before anything else is spawned.
    let gateway = SignalGateway::new(&[Signal::SIGUSR2, Signal::SIGINT]).unwrap();

    let tests: [(&str, fn(&SignalGateway)); 3] = [
        ("newest_handler_wins", newest_handler_wins),
        ("disposed_handlers_never_run", disposed_handlers_never_run),
        ("terminate_from_signal_ends_the_loop", terminate_from_signal_ends_the_loop),
    ];
    for (name, test) in tests {
        test(&gateway);
        println!("test {} ... ok", name);
    }

    drop(gateway);
    println!("\ntest result: ok. {} passed", tests.len());
}
