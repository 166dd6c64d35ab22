use gyre::{Action, Connection, Events, Options, ServerInfo};
use tracing_subscriber::EnvFilter;

struct Echo;

impl Events for Echo {
    fn serving(&self, srv: &ServerInfo) -> Action {
        tracing::info!(loops = srv.num_loops, addr = ?srv.local_addr, "echo server up");
        Action::None
    }

    fn opened(&self, conn: &mut Connection) -> (Vec<u8>, Options, Action) {
        tracing::info!(remote = ?conn.remote_addr(), loop_index = conn.loop_index(), "opened");
        (Vec::new(), Options::default(), Action::None)
    }

    fn data(&self, _conn: &mut Connection, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&self, conn: &mut Connection, err: Option<std::io::Error>) -> Action {
        tracing::info!(remote = ?conn.remote_addr(), ?err, "closed");
        Action::None
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:7878".to_string());

    if let Err(e) = gyre::serve(&endpoint, Echo) {
        eprintln!("serve failed: {e}");
        std::process::exit(1);
    }
}
