//! Echo server that also pushes a greeting to every live connection once
//! per second, using connection handles from the tick callback. Handles
//! route through each owning loop's write queue, so writing to
//! connections owned by other loops is safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use gyre::{Action, ConnHandle, Connection, Events, Options, ServerInfo};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

struct Broadcast {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, ConnHandle>>,
}

impl Events for Broadcast {
    fn num_loops(&self) -> usize {
        0 // one loop per core
    }

    fn serving(&self, srv: &ServerInfo) -> Action {
        tracing::info!(loops = srv.num_loops, addr = ?srv.local_addr, "broadcast server up");
        Action::None
    }

    fn opened(&self, conn: &mut Connection) -> (Vec<u8>, Options, Action) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        conn.set_context(id);
        let mut conns = self.conns.lock();
        conns.insert(id, conn.handle());
        tracing::info!(id, total = conns.len(), "opened");
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&self, _conn: &mut Connection, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&self, conn: &mut Connection, _err: Option<std::io::Error>) -> Action {
        if let Some(id) = conn.context::<u64>() {
            self.conns.lock().remove(id);
        }
        Action::None
    }

    fn tick(&self) -> Option<(Duration, Action)> {
        for handle in self.conns.lock().values() {
            let _ = handle.write(b"hello\r\n");
        }
        Some((Duration::from_secs(1), Action::None))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:2269".to_string());

    let server = Broadcast {
        next_id: AtomicU64::new(0),
        conns: Mutex::new(HashMap::new()),
    };
    if let Err(e) = gyre::serve(&endpoint, server) {
        eprintln!("serve failed: {e}");
        std::process::exit(1);
    }
}
