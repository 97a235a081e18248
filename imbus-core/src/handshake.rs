//! Connection handshake and the authenticated request envelope.
//!
//! ```text
//! client                                   server
//!   {OPEN_CONNECTION, version, role}  ->
//!                                     <-   {REPLY, "Role,Role,..", magic}   (or {REPLY, FAIL})
//!   {REPLY, OK | FAIL}                ->                                     (not sent by testers)
//! ```
//!
//! Afterwards every client transaction starts `{REQUEST, magic}`.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::protocol::{cmd, join_roles, split_roles, ClientRole, FRAME_SIGNATURE, PROTOCOL_VERSION};
use crate::socket::{SocketAddress, SocketStream, TimedStream};
use crate::transaction::{Transaction, TransactionError};
use crate::value::DecodeError;

/// Default bound on each handshake read.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection attempts made by [`connect_with_retry`] callers by default.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Timeout and framing shared by both ends of a handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeOptions {
    pub timeout: Duration,
    pub signature: Option<u32>,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            signature: Some(FRAME_SIGNATURE),
        }
    }
}

/// Result of a completed handshake, owned by the connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub magic_key: u32,
    pub peer_role: ClientRole,
    pub accepted: bool,
}

/// Why an authenticated envelope was rejected. The transaction must be dropped without reply.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("transaction does not start with REQUEST (found command {0})")]
    NotARequest(i32),
    #[error("magic key mismatch")]
    KeyMismatch,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] DecodeError),
}

/// Why a handshake failed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("transport: {0}")]
    Transaction(#[from] TransactionError),
    #[error("connect: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed handshake message: {0}")]
    Decode(#[from] DecodeError),
    #[error("unexpected command {0}")]
    UnexpectedCommand(i32),
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },
    #[error("role {0} rejected")]
    RoleRejected(String),
    #[error("client refused the connection")]
    ClientRefused,
}

impl Session {
    /// Start a request transaction carrying this session's key.
    pub fn request(&self) -> Transaction {
        let mut t = Transaction::new();
        t.put_command(cmd::REQUEST);
        t.put_uint32(self.magic_key);
        t
    }

    /// Check the `{REQUEST, magic}` envelope from the start of `t`, leaving the cursor after it.
    pub fn authenticate(&self, t: &mut Transaction) -> Result<(), AuthError> {
        t.rewind();
        let c = t.get_command()?;
        if c != cmd::REQUEST {
            return Err(AuthError::NotARequest(c));
        }
        if t.get_uint32()? != self.magic_key {
            return Err(AuthError::KeyMismatch);
        }
        Ok(())
    }
}

/// Fresh non-zero session key.
pub fn generate_magic_key() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

fn status_reply(ok: bool) -> Transaction {
    let mut t = Transaction::new();
    t.put_command(cmd::REPLY);
    t.put_command(if ok { cmd::OK } else { cmd::FAIL });
    t
}

fn expect_command(t: &mut Transaction, expected: i32) -> Result<(), HandshakeError> {
    let c = t.get_command()?;
    if c != expected {
        return Err(HandshakeError::UnexpectedCommand(c));
    }
    Ok(())
}

/// Client side. A `ConnectionTester` returns as soon as the reply arrives, without confirming.
pub fn open_connection<S: TimedStream>(
    stream: &mut S,
    role: ClientRole,
    opts: &HandshakeOptions,
) -> Result<Session, HandshakeError> {
    let mut t = Transaction::new();
    t.put_command(cmd::OPEN_CONNECTION);
    t.put_string(PROTOCOL_VERSION);
    t.put_string(role.as_str());
    t.write_to(stream, opts.signature)?;

    let mut reply = Transaction::new();
    reply.read_from(stream, opts.signature, opts.timeout)?;
    expect_command(&mut reply, cmd::REPLY)?;
    if reply.peek_command() == Some(cmd::FAIL) {
        return Err(HandshakeError::RoleRejected(role.to_string()));
    }
    let accepted = split_roles(&reply.get_string()?);
    let magic_key = reply.get_uint32()?;

    if role == ClientRole::ConnectionTester {
        return Ok(Session {
            magic_key,
            peer_role: role,
            accepted: true,
        });
    }
    if !accepted.contains(&role) {
        status_reply(false).write_to(stream, opts.signature)?;
        return Err(HandshakeError::RoleRejected(role.to_string()));
    }
    status_reply(true).write_to(stream, opts.signature)?;
    debug!(%role, "handshake complete");
    Ok(Session {
        magic_key,
        peer_role: role,
        accepted: true,
    })
}

/// Server side. `Ok(None)` means a liveness probe that has already been answered.
pub fn accept_connection<S: TimedStream>(
    stream: &mut S,
    accepted: &[ClientRole],
    opts: &HandshakeOptions,
) -> Result<Option<Session>, HandshakeError> {
    let mut open = Transaction::new();
    open.read_from(stream, opts.signature, opts.timeout)?;
    expect_command(&mut open, cmd::OPEN_CONNECTION)?;
    let version = open.get_string()?;
    let role_name = open.get_string()?;

    if version != PROTOCOL_VERSION {
        status_reply(false).write_to(stream, opts.signature)?;
        return Err(HandshakeError::VersionMismatch {
            ours: PROTOCOL_VERSION.to_string(),
            theirs: version,
        });
    }
    let role = match role_name.parse::<ClientRole>() {
        Ok(r) if r == ClientRole::ConnectionTester || accepted.contains(&r) => r,
        _ => {
            status_reply(false).write_to(stream, opts.signature)?;
            return Err(HandshakeError::RoleRejected(role_name));
        }
    };

    let magic_key = generate_magic_key();
    let mut reply = Transaction::new();
    reply.put_command(cmd::REPLY);
    reply.put_string(&join_roles(accepted));
    reply.put_uint32(magic_key);
    reply.write_to(stream, opts.signature)?;

    if role == ClientRole::ConnectionTester {
        debug!("answered connection probe");
        return Ok(None);
    }

    let mut confirm = Transaction::new();
    confirm.read_from(stream, opts.signature, opts.timeout)?;
    expect_command(&mut confirm, cmd::REPLY)?;
    match confirm.get_command()? {
        cmd::OK => {
            info!(%role, "client connected");
            Ok(Some(Session {
                magic_key,
                peer_role: role,
                accepted: true,
            }))
        }
        cmd::FAIL => Err(HandshakeError::ClientRefused),
        other => Err(HandshakeError::UnexpectedCommand(other)),
    }
}

/// Open a connection to `address` and run the client handshake on it.
pub fn connect(
    address: &SocketAddress,
    role: ClientRole,
    opts: &HandshakeOptions,
) -> Result<(SocketStream, Session), HandshakeError> {
    let mut stream = address.connect(opts.timeout)?;
    let session = open_connection(&mut stream, role, opts)?;
    Ok((stream, session))
}

/// [`connect`] up to `attempts` times, re-opening the connection each time.
pub fn connect_with_retry(
    address: &SocketAddress,
    role: ClientRole,
    opts: &HandshakeOptions,
    attempts: u32,
) -> Result<(SocketStream, Session), HandshakeError> {
    let mut attempt = 1;
    loop {
        match connect(address, role, opts) {
            Ok(ok) => return Ok(ok),
            Err(e) if attempt < attempts => {
                warn!(%address, attempt, error = %e, "connection attempt failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check that a server is answering handshakes at `address`.
pub fn probe(address: &SocketAddress, opts: &HandshakeOptions) -> Result<(), HandshakeError> {
    let (_stream, _session) = connect(address, ClientRole::ConnectionTester, opts)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn opts() -> HandshakeOptions {
        HandshakeOptions {
            timeout: Duration::from_secs(2),
            signature: Some(FRAME_SIGNATURE),
        }
    }

    fn serve(
        accepted: Vec<ClientRole>,
    ) -> (UnixStream, thread::JoinHandle<Result<Option<Session>, HandshakeError>>) {
        let (client, mut server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || accept_connection(&mut server, &accepted, &opts()));
        (client, handle)
    }

    #[test]
    fn handshake_agrees_on_key() {
        let (mut client, server) = serve(vec![ClientRole::FrontEnd, ClientRole::Panel]);
        let ours = open_connection(&mut client, ClientRole::FrontEnd, &opts()).unwrap();
        let theirs = server.join().unwrap().unwrap().unwrap();
        assert_eq!(ours.magic_key, theirs.magic_key);
        assert_ne!(ours.magic_key, 0);
        assert_eq!(theirs.peer_role, ClientRole::FrontEnd);
        assert!(theirs.accepted);
    }

    #[test]
    fn unsupported_role_gets_fail() {
        let (mut client, server) = serve(vec![ClientRole::Panel]);
        let err = open_connection(&mut client, ClientRole::IMEngine, &opts()).unwrap_err();
        assert!(matches!(err, HandshakeError::RoleRejected(_)));
        assert!(matches!(
            server.join().unwrap(),
            Err(HandshakeError::RoleRejected(_))
        ));
    }

    #[test]
    fn server_fail_reply_on_wire() {
        let (mut client, server) = serve(vec![ClientRole::Panel]);
        let mut open = Transaction::new();
        open.put_command(cmd::OPEN_CONNECTION);
        open.put_string(PROTOCOL_VERSION);
        open.put_string("Helper");
        open.write_to(&mut client, Some(FRAME_SIGNATURE)).unwrap();
        let mut reply = Transaction::new();
        reply
            .read_from(&mut client, Some(FRAME_SIGNATURE), Duration::from_secs(2))
            .unwrap();
        assert_eq!(reply.get_command().unwrap(), cmd::REPLY);
        assert_eq!(reply.get_command().unwrap(), cmd::FAIL);
        assert!(server.join().unwrap().is_err());
    }

    #[test]
    fn tester_never_confirms() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let tester = accept_connection(&mut server, &[ClientRole::FrontEnd], &opts());
            let mut extra = Transaction::new();
            let followup =
                extra.read_from(&mut server, Some(FRAME_SIGNATURE), Duration::from_millis(50));
            (tester, followup)
        });
        let session = open_connection(&mut client, ClientRole::ConnectionTester, &opts()).unwrap();
        assert_eq!(session.peer_role, ClientRole::ConnectionTester);
        let (tester, followup) = handle.join().unwrap();
        assert!(tester.unwrap().is_none());
        assert!(matches!(followup, Err(TransactionError::Timeout)));
        drop(client);
    }

    #[test]
    fn version_mismatch_rejected() {
        let (mut client, server) = serve(vec![ClientRole::FrontEnd]);
        let mut open = Transaction::new();
        open.put_command(cmd::OPEN_CONNECTION);
        open.put_string("0.1");
        open.put_string("FrontEnd");
        open.write_to(&mut client, Some(FRAME_SIGNATURE)).unwrap();
        assert!(matches!(
            server.join().unwrap(),
            Err(HandshakeError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn server_times_out_on_silent_client() {
        let (_client, mut server) = UnixStream::pair().unwrap();
        let short = HandshakeOptions {
            timeout: Duration::from_millis(30),
            ..opts()
        };
        let err = accept_connection(&mut server, &[ClientRole::FrontEnd], &short).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Transaction(TransactionError::Timeout)
        ));
    }

    #[test]
    fn envelope_authentication() {
        let session = Session {
            magic_key: 0xfeed,
            peer_role: ClientRole::FrontEnd,
            accepted: true,
        };
        let mut good = session.request();
        good.put_command(cmd::USER_COMMAND_BASE);
        assert_eq!(session.authenticate(&mut good), Ok(()));
        assert_eq!(good.get_command().unwrap(), cmd::USER_COMMAND_BASE);

        let other = Session {
            magic_key: 0xbeef,
            ..session.clone()
        };
        let mut forged = other.request();
        assert_eq!(session.authenticate(&mut forged), Err(AuthError::KeyMismatch));

        let mut not_request = Transaction::new();
        not_request.put_command(cmd::REPLY);
        assert_eq!(
            session.authenticate(&mut not_request),
            Err(AuthError::NotARequest(cmd::REPLY))
        );
        assert!(matches!(
            session.authenticate(&mut Transaction::new()),
            Err(AuthError::Malformed(DecodeError::EndOfData))
        ));
    }

    #[test]
    fn magic_keys_are_nonzero() {
        assert!((0..1000).all(|_| generate_magic_key() != 0));
    }
}
