//! Tick cadence: 10ms delays for 25 ticks, then shutdown. Total elapsed
//! time must land between the sum of the delays and a generous ceiling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use gyre::{Action, Events};

struct TickServer {
    ticks: AtomicU32,
}

impl Events for TickServer {
    fn tick(&self) -> Option<(Duration, Action)> {
        let count = self.ticks.fetch_add(1, Ordering::SeqCst);
        if count == 25 {
            Some((Duration::from_millis(10), Action::Shutdown))
        } else {
            Some((Duration::from_millis(10), Action::None))
        }
    }
}

fn run(endpoint: &str) {
    let start = Instant::now();
    gyre::serve(endpoint, TickServer {
        ticks: AtomicU32::new(0),
    })
    .unwrap();
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(250),
        "ticker ran too fast: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(1),
        "ticker ran too slow: {elapsed:?}"
    );
}

#[test]
fn tick_cadence_tcp() {
    run("tcp://127.0.0.1:0");
}

#[test]
fn tick_cadence_unix() {
    let path = std::env::temp_dir().join(format!("gyre-tick-{}.sock", std::process::id()));
    run(&format!("unix://{}", path.display()));
}
