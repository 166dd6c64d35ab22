//! Echo servers under every load-balance policy, over TCP and Unix
//! sockets. Each client pipes random payloads and expects them back
//! byte-for-byte, then the server shuts down once every client is gone.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use gyre::{Action, Connection, Events, LoadBalance, Options, ServerInfo};
use rand::Rng;

const NCLIENTS: i32 = 10;

struct EchoServer {
    num_loops: usize,
    balance: LoadBalance,
    ready_tx: Sender<u16>,
    connected: Arc<AtomicI32>,
    disconnected: Arc<AtomicI32>,
    owners: Arc<Mutex<Vec<usize>>>,
}

impl Events for EchoServer {
    fn num_loops(&self) -> usize {
        self.num_loops
    }

    fn load_balance(&self) -> LoadBalance {
        self.balance
    }

    fn serving(&self, srv: &ServerInfo) -> Action {
        let port = srv
            .local_addr
            .as_socket()
            .map(|a| a.port())
            .unwrap_or_default();
        self.ready_tx.send(port).unwrap();
        Action::None
    }

    fn opened(&self, conn: &mut Connection) -> (Vec<u8>, Options, Action) {
        conn.set_context(0xC0FFEE_u32);
        self.owners.lock().unwrap().push(conn.loop_index());
        self.connected.fetch_add(1, Ordering::SeqCst);
        let opts = Options {
            tcp_keep_alive: Duration::from_secs(300),
            ..Default::default()
        };
        (b"sweetness\r\n".to_vec(), opts, Action::None)
    }

    fn data(&self, _conn: &mut Connection, input: &[u8]) -> (Vec<u8>, Action) {
        (input.to_vec(), Action::None)
    }

    fn closed(&self, conn: &mut Connection, _err: Option<std::io::Error>) -> Action {
        assert_eq!(conn.context::<u32>(), Some(&0xC0FFEE));
        let disconnected = self.disconnected.fetch_add(1, Ordering::SeqCst) + 1;
        if disconnected == NCLIENTS && self.connected.load(Ordering::SeqCst) == NCLIENTS {
            Action::Shutdown
        } else {
            Action::None
        }
    }
}

/// Write `payload` from a second thread while reading the echo back, so
/// in-flight data is never bounded by kernel socket buffers.
fn pipe_random_payload<S>(mut stream: S, mut writer: S, max_write: usize)
where
    S: Read + Write + Send + 'static,
{
    let mut header = [0u8; 11];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(&header, b"sweetness\r\n");

    let mut rng = rand::thread_rng();
    let writes = rng.gen_range(8..=24);
    let mut payload = Vec::new();
    for _ in 0..writes {
        let size = rng.gen_range(0..max_write);
        let start = payload.len();
        payload.resize(start + size, 0);
        rng.fill(&mut payload[start..]);
    }

    let expected = payload.clone();
    let writer_thread = thread::spawn(move || {
        writer.write_all(&payload).unwrap();
    });
    let mut echoed = vec![0u8; expected.len()];
    stream.read_exact(&mut echoed).unwrap();
    writer_thread.join().unwrap();
    assert_eq!(echoed, expected, "echoed stream differs from input");
}

fn run_tcp(num_loops: usize, balance: LoadBalance) -> Vec<usize> {
    let (ready_tx, ready_rx) = unbounded();
    let connected = Arc::new(AtomicI32::new(0));
    let disconnected = Arc::new(AtomicI32::new(0));
    let owners = Arc::new(Mutex::new(Vec::new()));
    let server = EchoServer {
        num_loops,
        balance,
        ready_tx,
        connected: connected.clone(),
        disconnected: disconnected.clone(),
        owners: owners.clone(),
    };

    let coordinator = thread::spawn(move || {
        let port = ready_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let mut clients = Vec::new();
        for _ in 0..NCLIENTS {
            clients.push(thread::spawn(move || {
                let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
                let writer = stream.try_clone().unwrap();
                pipe_random_payload(stream, writer, 1024 * 1024);
            }));
        }
        for client in clients {
            client.join().unwrap();
        }
    });

    gyre::serve("tcp://127.0.0.1:0", server).unwrap();
    coordinator.join().unwrap();

    assert_eq!(connected.load(Ordering::SeqCst), NCLIENTS);
    assert_eq!(disconnected.load(Ordering::SeqCst), NCLIENTS);
    let owners = owners.lock().unwrap().clone();
    assert_eq!(owners.len(), NCLIENTS as usize);
    owners
}

#[test]
fn echo_tcp_single_loop() {
    run_tcp(1, LoadBalance::Random);
}

#[test]
fn echo_tcp_five_loops_least_connections() {
    let owners = run_tcp(5, LoadBalance::LeastConnections);
    // placement must stay balanced: per-loop counts differ by at most one
    let mut counts = [0usize; 5];
    for idx in owners {
        counts[idx] += 1;
    }
    let max = counts.iter().max().unwrap();
    let min = counts.iter().min().unwrap();
    assert!(max - min <= 1, "uneven placement across loops: {counts:?}");
}

#[test]
fn echo_tcp_loop_per_cpu_round_robin() {
    run_tcp(0, LoadBalance::RoundRobin);
}

#[test]
fn echo_unix_socket() {
    let path: PathBuf =
        std::env::temp_dir().join(format!("gyre-echo-{}.sock", std::process::id()));
    let endpoint = format!("unix://{}", path.display());

    let (ready_tx, ready_rx) = unbounded();
    let connected = Arc::new(AtomicI32::new(0));
    let disconnected = Arc::new(AtomicI32::new(0));
    let server = EchoServer {
        num_loops: 1,
        balance: LoadBalance::Random,
        ready_tx,
        connected: connected.clone(),
        disconnected: disconnected.clone(),
        owners: Arc::new(Mutex::new(Vec::new())),
    };

    let client_path = path.clone();
    let coordinator = thread::spawn(move || {
        ready_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let mut clients = Vec::new();
        for _ in 0..NCLIENTS {
            let path = client_path.clone();
            clients.push(thread::spawn(move || {
                let stream = UnixStream::connect(&path).unwrap();
                let writer = stream.try_clone().unwrap();
                pipe_random_payload(stream, writer, 64 * 1024);
            }));
        }
        for client in clients {
            client.join().unwrap();
        }
    });

    gyre::serve(&endpoint, server).unwrap();
    coordinator.join().unwrap();

    assert_eq!(connected.load(Ordering::SeqCst), NCLIENTS);
    assert_eq!(disconnected.load(Ordering::SeqCst), NCLIENTS);
    assert!(!path.exists(), "socket inode should be unlinked");
}
