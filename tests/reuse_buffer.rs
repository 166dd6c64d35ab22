//! ReuseInputBuffer aliasing: with reuse enabled, every `data` callback
//! sees the loop's scratch buffer at a stable address; with it disabled,
//! each call gets its own allocation.

use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use gyre::{Action, Connection, Events, Options, ServerInfo};
use std::sync::atomic::{AtomicUsize, Ordering};

struct AliasProbe {
    reuse: bool,
    ready_tx: Sender<u16>,
    result_tx: Sender<bool>,
    first_ptr: AtomicUsize,
}

impl Events for AliasProbe {
    fn serving(&self, srv: &ServerInfo) -> Action {
        let port = srv.local_addr.as_socket().unwrap().port();
        self.ready_tx.send(port).unwrap();
        Action::None
    }

    fn opened(&self, _conn: &mut Connection) -> (Vec<u8>, Options, Action) {
        let opts = Options {
            reuse_input_buffer: self.reuse,
            ..Default::default()
        };
        (Vec::new(), opts, Action::None)
    }

    fn data(&self, _conn: &mut Connection, input: &[u8]) -> (Vec<u8>, Action) {
        let ptr = input.as_ptr() as usize;
        let previous = self.first_ptr.swap(ptr, Ordering::SeqCst);
        if previous == 0 {
            (Vec::new(), Action::None)
        } else {
            self.result_tx.send(ptr == previous).unwrap();
            (Vec::new(), Action::Shutdown)
        }
    }
}

fn run(reuse: bool, first_len: usize, second_len: usize) -> bool {
    let (ready_tx, ready_rx) = unbounded();
    let (result_tx, result_rx) = unbounded();
    let server = AliasProbe {
        reuse,
        ready_tx,
        result_tx,
        first_ptr: AtomicUsize::new(0),
    };

    let client = thread::spawn(move || {
        let port = ready_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&vec![b'a'; first_len]).unwrap();
        // keep the packets in separate readiness events
        thread::sleep(Duration::from_millis(300));
        stream.write_all(&vec![b'b'; second_len]).unwrap();
        thread::sleep(Duration::from_millis(300));
    });

    gyre::serve("tcp://127.0.0.1:0", server).unwrap();
    client.join().unwrap();
    result_rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn reused_input_aliases_the_scratch_buffer() {
    assert!(run(true, 7, 7));
}

#[test]
fn copied_input_does_not_alias() {
    // different allocation sizes so the copies cannot land on one block
    assert!(!run(false, 16, 16384));
}
