//! Single-threaded readiness loop over heterogeneous socket clients.
//!
//! One `poll(2)` per iteration covers every registered descriptor plus the wake socket owned by
//! the loop. Other threads (and signal handlers) reach the loop only through [`Interrupter`].

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::socket::{Disposition, Events, SocketClient};

/// Opaque handle for a registered client. Never reused within one multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct WakeInner {
    writer: UnixStream,
    pending: AtomicBool,
}

/// Thread-safe handle that wakes the loop. Repeated calls before the loop observes the first one
/// write nothing more.
#[derive(Clone)]
pub struct Interrupter {
    inner: Arc<WakeInner>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        if !self.inner.pending.swap(true, Ordering::AcqRel) {
            // Non-blocking: a full socket buffer already guarantees a wake-up.
            let _ = (&self.inner.writer).write(&[1u8]);
        }
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("pending", &self.inner.pending.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handed to every handler: registers new clients, removes others, or stops the loop.
/// Changes are applied by the loop; additions join after the current pass.
pub struct Dispatch {
    current: ClientId,
    next_id: u64,
    added: Vec<(ClientId, Box<dyn SocketClient>)>,
    removed: Vec<ClientId>,
    stop: bool,
    interrupter: Interrupter,
}

impl Dispatch {
    /// Id of the client whose handler is running.
    pub fn current(&self) -> ClientId {
        self.current
    }

    pub fn add(&mut self, client: Box<dyn SocketClient>) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.added.push((id, client));
        id
    }

    /// Remove another client. One not yet visited in this pass will not be dispatched.
    pub fn remove(&mut self, id: ClientId) {
        self.removed.push(id);
    }

    /// Ask the loop to exit after this pass.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }
}

struct Entry {
    id: ClientId,
    client: Box<dyn SocketClient>,
}

/// Owns the client registry and runs the loop until its stop flag is set.
pub struct EventMultiplexer {
    clients: Vec<Entry>,
    next_id: u64,
    stop: Arc<AtomicBool>,
    wake_reader: UnixStream,
    interrupter: Interrupter,
}

impl EventMultiplexer {
    pub fn new() -> io::Result<Self> {
        Self::with_stop_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Use a caller-owned stop flag (shared with signal handlers or other threads).
    pub fn with_stop_flag(stop: Arc<AtomicBool>) -> io::Result<Self> {
        let (wake_reader, writer) = UnixStream::pair()?;
        wake_reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            clients: Vec::new(),
            next_id: 1,
            stop,
            wake_reader,
            interrupter: Interrupter {
                inner: Arc::new(WakeInner {
                    writer,
                    pending: AtomicBool::new(false),
                }),
            },
        })
    }

    /// Route `signals` into the loop: each sets the stop flag and wakes the poll.
    pub fn stop_on_signals(&self, signals: &[libc::c_int]) -> io::Result<()> {
        for &sig in signals {
            signal_hook::flag::register(sig, Arc::clone(&self.stop))?;
            signal_hook::low_level::pipe::register(sig, self.interrupter.inner.writer.try_clone()?)?;
        }
        Ok(())
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Request exit; takes effect before the next poll.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.interrupter.interrupt();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn add(&mut self, mut client: Box<dyn SocketClient>) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        debug!(client = client.name(), %id, "client registered");
        client.registered(id);
        self.clients.push(Entry { id, client });
        id
    }

    /// Unregister and drop a client. Returns false if it was not registered.
    pub fn remove(&mut self, id: ClientId) -> bool {
        let before = self.clients.len();
        self.clients.retain(|e| e.id != id);
        before != self.clients.len()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Run until the stop flag is set. Client failures never end the loop.
    pub fn run(&mut self) {
        info!(clients = self.clients.len(), "event loop started");
        while !self.is_stopped() {
            if let Err(e) = self.run_once() {
                warn!(error = %e, "poll failed");
            }
        }
        info!("event loop stopped");
    }

    /// One iteration: poll, then dispatch every client whose interest fired.
    pub fn run_once(&mut self) -> io::Result<()> {
        let mut fds = vec![libc::pollfd {
            fd: self.wake_reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut slots = Vec::with_capacity(self.clients.len());
        let mut pending = Vec::with_capacity(self.clients.len());
        for entry in &mut self.clients {
            let interest = entry.client.interest();
            pending.push(entry.client.pending() & (interest | Events::ERROR));
            slots.push(entry.client.fd().map(|fd| {
                let mut events = 0;
                if interest.contains(Events::READ) {
                    events |= libc::POLLIN;
                }
                if interest.contains(Events::WRITE) {
                    events |= libc::POLLOUT;
                }
                fds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                fds.len() - 1
            }));
        }
        let timeout = if pending.iter().any(|p| !p.is_empty()) {
            0
        } else {
            -1
        };

        // SAFETY: `fds` is a valid, exclusively borrowed array of `fds.len()` pollfd structs.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let interrupted = fds[0].revents & libc::POLLIN != 0;
        if interrupted {
            self.drain_wake();
        }

        let mut dispatch = Dispatch {
            current: ClientId(0),
            next_id: self.next_id,
            added: Vec::new(),
            removed: Vec::new(),
            stop: false,
            interrupter: self.interrupter.clone(),
        };
        let mut dead = vec![false; self.clients.len()];
        for (i, entry) in self.clients.iter_mut().enumerate() {
            if dispatch.removed.contains(&entry.id) {
                dead[i] = true;
                continue;
            }
            let interest = entry.client.interest();
            let mut fired = pending[i];
            if let Some(slot) = slots[i] {
                let revents = fds[slot].revents;
                if revents & libc::POLLNVAL != 0 {
                    debug!(client = entry.client.name(), id = %entry.id, "descriptor closed");
                    dead[i] = true;
                    continue;
                }
                fired |= readiness(revents, interest);
            }
            if interrupted && interest.contains(Events::INTERRUPT) {
                fired |= Events::INTERRUPT;
            }
            if fired.is_empty() {
                continue;
            }
            dispatch.current = entry.id;
            if entry.client.handle(fired, &mut dispatch) == Disposition::Remove {
                dead[i] = true;
            }
        }

        let removed = dispatch.removed;
        let mut i = 0;
        self.clients.retain(|e| {
            let keep = !dead[i] && !removed.contains(&e.id);
            i += 1;
            if !keep {
                debug!(client = e.client.name(), id = %e.id, "client removed");
            }
            keep
        });
        self.next_id = dispatch.next_id;
        for (id, mut client) in dispatch.added {
            if removed.contains(&id) {
                continue;
            }
            debug!(client = client.name(), %id, "client registered");
            client.registered(id);
            self.clients.push(Entry { id, client });
        }
        if dispatch.stop {
            self.stop.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn drain_wake(&mut self) {
        self.interrupter.inner.pending.store(false, Ordering::Release);
        let mut buf = [0u8; 64];
        loop {
            match self.wake_reader.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

/// Map poll revents onto the client's declared interest. Hang-up and error also surface as
/// `READ` for readers so they observe the end of stream themselves.
fn readiness(revents: libc::c_short, interest: Events) -> Events {
    let mut fired = Events::empty();
    if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
        && interest.contains(Events::READ)
    {
        fired |= Events::READ;
    }
    if revents & libc::POLLOUT != 0 && interest.contains(Events::WRITE) {
        fired |= Events::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLHUP) != 0 && interest.contains(Events::ERROR) {
        fired |= Events::ERROR;
    }
    fired
}
