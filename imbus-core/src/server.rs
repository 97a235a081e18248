//! Generic request/reply server built from two socket clients: an [`AcceptListener`] that runs the
//! handshake and a [`PeerConnection`] per accepted client.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::handshake::{accept_connection, HandshakeOptions, Session};
use crate::multiplexer::{ClientId, Dispatch, EventMultiplexer};
use crate::protocol::{cmd, ClientRole};
use crate::socket::{Disposition, Events, SocketAddress, SocketClient, SocketListener, SocketStream, TimedStream};
use crate::transaction::{Transaction, TransactionError};
use crate::wire::{FrameDecoder, MAX_FRAME_LEN};

/// Default bound on replies queued for a peer that is not reading them.
pub const DEFAULT_OUTBOX_LIMIT: usize = 2 * MAX_FRAME_LEN as usize;

/// Application logic behind a server. Runs on the loop thread.
pub trait RequestHandler {
    /// Handle one authenticated request. `request`'s cursor sits just after the envelope.
    /// Whatever is put into `reply` is sent back; leave it empty to send nothing.
    fn handle_request(
        &mut self,
        client: ClientId,
        session: &Session,
        request: &mut Transaction,
        reply: &mut Transaction,
    );

    fn connection_opened(&mut self, _client: ClientId, _session: &Session) {}

    /// The connection is gone; release anything held for it.
    fn connection_closed(&mut self, _client: ClientId) {}
}

pub type SharedHandler = Rc<RefCell<dyn RequestHandler>>;

/// Listening socket that admits clients through the handshake.
pub struct AcceptListener {
    listener: SocketListener,
    accepted: Vec<ClientRole>,
    options: HandshakeOptions,
    handler: SharedHandler,
}

impl AcceptListener {
    pub fn new(
        listener: SocketListener,
        accepted: Vec<ClientRole>,
        options: HandshakeOptions,
        handler: SharedHandler,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            accepted,
            options,
            handler,
        })
    }

    fn admit(&self, mut stream: SocketStream, dispatch: &mut Dispatch) {
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(error = %e, "cannot configure accepted socket");
            return;
        }
        let session = match accept_connection(&mut stream, &self.accepted, &self.options) {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "handshake failed");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = %e, "cannot configure accepted socket");
            return;
        }
        let peer = PeerConnection::new(stream, session, self.options.signature, Rc::clone(&self.handler));
        dispatch.add(Box::new(peer));
    }
}

impl SocketClient for AcceptListener {
    fn fd(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
    }

    fn interest(&self) -> Events {
        Events::READ
    }

    fn handle(&mut self, events: Events, dispatch: &mut Dispatch) -> Disposition {
        if events.contains(Events::ERROR) {
            warn!("listener error");
            return Disposition::Remove;
        }
        loop {
            match self.listener.accept() {
                Ok(stream) => self.admit(stream, dispatch),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        Disposition::Keep
    }

    fn name(&self) -> &str {
        "listener"
    }
}

/// One authenticated client. Reads frames without blocking, answers through the shared handler,
/// and queues replies until the socket is writable.
pub struct PeerConnection {
    stream: SocketStream,
    session: Session,
    signature: Option<u32>,
    decoder: FrameDecoder,
    outbox: Vec<u8>,
    outbox_limit: usize,
    handler: SharedHandler,
    id: Option<ClientId>,
}

impl PeerConnection {
    pub fn new(
        stream: SocketStream,
        session: Session,
        signature: Option<u32>,
        handler: SharedHandler,
    ) -> Self {
        Self {
            stream,
            session,
            signature,
            decoder: FrameDecoder::new(signature),
            outbox: Vec::new(),
            outbox_limit: DEFAULT_OUTBOX_LIMIT,
            handler,
            id: None,
        }
    }

    /// Drop the peer once more than `limit` reply bytes are waiting to be written.
    pub fn with_outbox_limit(mut self, limit: usize) -> Self {
        self.outbox_limit = limit;
        self
    }

    /// Drain the socket. Returns false once the peer has closed or failed.
    fn read_available(&mut self, frames: &mut Vec<Vec<u8>>) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => match self.decoder.feed(&buf[..n]) {
                    Ok(mut done) => frames.append(&mut done),
                    Err(e) => {
                        warn!(error = %e, "bad frame from client");
                        return false;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    return false;
                }
            }
        }
    }

    /// Process one frame. Returns false when the connection should close.
    fn process(&mut self, id: ClientId, frame: &[u8]) -> bool {
        let mut request = Transaction::from_bytes(frame);
        if let Err(e) = self.session.authenticate(&mut request) {
            warn!(client = %id, error = %e, "request rejected");
            return true;
        }
        if request.peek_command() == Some(cmd::CLOSE_CONNECTION) {
            info!(client = %id, "client closed connection");
            return false;
        }
        let mut reply = Transaction::new();
        self.handler
            .borrow_mut()
            .handle_request(id, &self.session, &mut request, &mut reply);
        if !reply.is_empty() {
            if let Err(e) = reply.write_to_buffer(&mut self.outbox, self.signature) {
                warn!(client = %id, error = %e, "reply dropped");
            }
            if self.outbox.len() > self.outbox_limit {
                warn!(client = %id, queued = self.outbox.len(), "client not reading replies, dropping it");
                return false;
            }
        }
        true
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl SocketClient for PeerConnection {
    fn fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }

    fn interest(&self) -> Events {
        if self.outbox.is_empty() {
            Events::READ
        } else {
            Events::READ | Events::WRITE
        }
    }

    fn registered(&mut self, id: ClientId) {
        self.id = Some(id);
        self.handler.borrow_mut().connection_opened(id, &self.session);
    }

    fn handle(&mut self, events: Events, dispatch: &mut Dispatch) -> Disposition {
        let id = dispatch.current();
        if events.contains(Events::ERROR) {
            return Disposition::Remove;
        }
        let mut open = true;
        if events.contains(Events::READ) {
            let mut frames = Vec::new();
            open = self.read_available(&mut frames);
            for frame in &frames {
                if !self.process(id, frame) {
                    open = false;
                    break;
                }
            }
        }
        if let Err(e) = self.flush() {
            debug!(client = %id, error = %e, "write failed");
            return Disposition::Remove;
        }
        if open {
            Disposition::Keep
        } else {
            Disposition::Remove
        }
    }

    fn name(&self) -> &str {
        "peer"
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        let Some(id) = self.id else { return };
        match self.handler.try_borrow_mut() {
            Ok(mut handler) => handler.connection_closed(id),
            Err(_) => warn!(client = %id, "handler busy, close notification lost"),
        }
    }
}

/// Bind `address` and register an accepting listener on `mux`.
pub fn listen(
    mux: &mut EventMultiplexer,
    address: &SocketAddress,
    accepted: Vec<ClientRole>,
    options: HandshakeOptions,
    handler: SharedHandler,
) -> io::Result<(ClientId, SocketAddress)> {
    let listener = address.bind()?;
    let bound = listener.local_address()?;
    let id = mux.add(Box::new(AcceptListener::new(listener, accepted, options, handler)?));
    info!(address = %bound, "listening");
    Ok((id, bound))
}

/// Client side of one request: send `request`, wait for the reply frame.
pub fn call<S: TimedStream>(
    stream: &mut S,
    request: &Transaction,
    options: &HandshakeOptions,
) -> Result<Transaction, TransactionError> {
    request.write_to(stream, options.signature)?;
    let mut reply = Transaction::new();
    reply.read_from(stream, options.signature, options.timeout)?;
    Ok(reply)
}
