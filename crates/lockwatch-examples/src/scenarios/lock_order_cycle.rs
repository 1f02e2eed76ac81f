use lockwatch::RwMutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::logging_and;

fn spawn_link(
    worker: &'static str,
    delay: Duration,
    first: Arc<RwMutex<()>>,
    second: Arc<RwMutex<()>>,
) {
    thread::spawn(move || {
        thread::sleep(delay);
        let _first_guard = first.write();
        println!(
            "{worker} locked {}; holding it for a while",
            first.name().unwrap_or("?")
        );

        thread::sleep(Duration::from_millis(500));

        println!(
            "{worker} attempting {}; the three workers now wait on each other",
            second.name().unwrap_or("?")
        );
        let _second_guard = second.write();
        println!("{worker} unexpectedly acquired {}", second.name().unwrap_or("?"));
    });
}

pub fn run(timeout: Duration) -> Result<(), String> {
    let (tx, rx) = mpsc::channel();
    lockwatch::set_global_lock_timeout(
        timeout,
        Some(logging_and(move |report| {
            let _ = tx.send(report);
        })),
    );

    let m1 = Arc::new(RwMutex::with_name("demo.cycle.m1", ()));
    let m2 = Arc::new(RwMutex::with_name("demo.cycle.m2", ()));
    let m3 = Arc::new(RwMutex::with_name("demo.cycle.m3", ()));

    spawn_link("worker.a", Duration::ZERO, Arc::clone(&m1), Arc::clone(&m2));
    spawn_link(
        "worker.b",
        Duration::from_millis(250),
        Arc::clone(&m2),
        Arc::clone(&m3),
    );
    spawn_link(
        "worker.c",
        Duration::from_millis(250),
        Arc::clone(&m3),
        Arc::clone(&m1),
    );

    println!(
        "example running. three workers form a lock cycle; expect a stall report after {:.1}s",
        timeout.as_secs_f64()
    );

    let report = rx
        .recv_timeout(timeout * 3 + Duration::from_secs(2))
        .map_err(|e| format!("no stall reported: {e}"))?;
    println!("first stall: {report}");
    Ok(())
}
