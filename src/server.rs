//! Server wiring: builds the listener and loops, spawns the loop and
//! ticker threads, and sequences shutdown.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::addr;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::events::{Action, Events, LoadBalance, ServerInfo};
use crate::listener::Listener;
use crate::poller::EventTag;

/// State shared by every loop and the serving thread.
pub(crate) struct Shared<E> {
    pub(crate) events: E,
    pub(crate) listener: Listener,
    pub(crate) balance: LoadBalance,
    pub(crate) num_loops: usize,
    /// Successful accepts across all loops; drives round-robin placement.
    pub(crate) accepted: AtomicUsize,
    /// Live connections per loop; read cross-loop by LeastConnections.
    pub(crate) counts: Vec<Arc<AtomicI32>>,
    /// Loop 0 publishes the next tick delay here for the ticker thread.
    pub(crate) tick_tx: Sender<Duration>,
    shutdown: Mutex<bool>,
    shutdown_cvar: Condvar,
}

impl<E: Events> Shared<E> {
    /// Whether loop `idx` should act on listener readiness. A false
    /// negative is safe: the kernel re-reports the listener while the
    /// backlog is non-empty.
    pub(crate) fn should_accept(&self, idx: usize) -> bool {
        if self.num_loops <= 1 {
            return true;
        }
        match self.balance {
            LoadBalance::Random => true,
            LoadBalance::RoundRobin => {
                self.accepted.load(Ordering::Relaxed) % self.num_loops == idx
            }
            LoadBalance::LeastConnections => {
                let mine = self.counts[idx].load(Ordering::Relaxed);
                self.counts
                    .iter()
                    .enumerate()
                    .all(|(i, count)| i == idx || count.load(Ordering::Relaxed) >= mine)
            }
        }
    }

    fn signal_shutdown(&self) {
        let mut flag = self.shutdown.lock();
        if !*flag {
            *flag = true;
            self.shutdown_cvar.notify_all();
        }
    }

    fn wait_shutdown(&self) {
        let mut flag = self.shutdown.lock();
        while !*flag {
            self.shutdown_cvar.wait(&mut flag);
        }
    }
}

/// Bind `endpoint` and serve events until a callback returns
/// [`Action::Shutdown`].
///
/// Endpoint syntax is `proto://host[:port][?query]` with proto one of
/// `tcp`, `tcp4`, `tcp6`, `unix`, e.g. `tcp://127.0.0.1:5000`,
/// `tcp://:5000?reuseport=true`, `unix:///tmp/app.sock`. Returns `Ok(())`
/// after an orderly callback-initiated shutdown, and an error when the
/// endpoint is malformed, the listener cannot be created, or a poller
/// fails. Every connection still open at shutdown receives a final
/// `closed` callback before this returns.
pub fn serve<E: Events>(endpoint: &str, events: E) -> Result<(), Error> {
    let parsed = addr::parse(endpoint)?;
    let listener = Listener::bind(&parsed)?;

    let num_loops = match events.num_loops() {
        0 => num_cpus(),
        n => n,
    };
    let balance = events.load_balance();

    let info = ServerInfo {
        num_loops,
        local_addr: listener.local_addr().clone(),
    };
    if events.serving(&info) == Action::Shutdown {
        return Ok(());
    }

    let (tick_tx, tick_rx) = unbounded::<Duration>();
    let counts = (0..num_loops)
        .map(|_| Arc::new(AtomicI32::new(0)))
        .collect();
    let shared = Arc::new(Shared {
        events,
        listener,
        balance,
        num_loops,
        accepted: AtomicUsize::new(0),
        counts,
        tick_tx,
        shutdown: Mutex::new(false),
        shutdown_cvar: Condvar::new(),
    });

    tracing::debug!(endpoint, num_loops, balance = ?balance, "serving");

    let mut loops = Vec::with_capacity(num_loops);
    for idx in 0..num_loops {
        loops.push(EventLoop::new(idx, Arc::clone(&shared))?);
    }
    let wakeups: Vec<_> = loops
        .iter()
        .map(|lp| Arc::clone(lp.poller.wakeup()))
        .collect();

    // Ticker thread: fires a Tick at loop 0, then sleeps for whatever
    // delay the tick callback published. Exits once the delay channel
    // disconnects at teardown.
    {
        let wakeup = Arc::clone(&wakeups[0]);
        thread::Builder::new()
            .name("gyre-ticker".to_string())
            .spawn(move || {
                loop {
                    if wakeup.fire(EventTag::Tick).is_err() {
                        break;
                    }
                    match tick_rx.recv() {
                        Ok(delay) => thread::sleep(delay),
                        Err(_) => break,
                    }
                }
            })
            .map_err(Error::Io)?;
    }

    let mut handles = Vec::with_capacity(num_loops);
    for mut lp in loops {
        let shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("gyre-loop-{}", lp.idx))
            .spawn(move || {
                let result = lp.run();
                // The first loop to exit begins server-wide teardown.
                shared.signal_shutdown();
                (lp, result)
            })
            .map_err(Error::Io)?;
        handles.push(handle);
    }

    shared.wait_shutdown();

    for wakeup in &wakeups {
        let _ = wakeup.fire(EventTag::Close);
    }

    let mut first_err = None;
    let mut finished = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.join() {
            Ok((lp, result)) => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "event loop failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                finished.push(lp);
            }
            Err(_) => {
                if first_err.is_none() {
                    first_err = Some(Error::Io(io::Error::other("event loop thread panicked")));
                }
            }
        }
    }

    // All loops have returned; close every surviving connection so each
    // one observes a final `closed` before serve returns.
    for lp in &mut finished {
        lp.teardown();
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}
