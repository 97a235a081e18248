//! Input-method bus core: the Transaction codec every peer speaks, the connection handshake,
//! a poll-based multiplexer for socket peers, and hotkey matching.
//! Command vocabulary beyond the core commands belongs to collaborators.

pub mod handshake;
pub mod hotkey;
pub mod key;
pub mod multiplexer;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod transaction;
pub mod value;
pub mod wire;

pub use handshake::{
    accept_connection, connect, connect_with_retry, open_connection, AuthError, HandshakeError,
    HandshakeOptions, Session,
};
pub use hotkey::HotkeyMatcher;
pub use key::{KeyEvent, KeyMask};
pub use multiplexer::{ClientId, Dispatch, EventMultiplexer, Interrupter};
pub use protocol::{cmd, ClientRole, FRAME_SIGNATURE, PROTOCOL_VERSION};
pub use server::{AcceptListener, PeerConnection, RequestHandler, SharedHandler};
pub use socket::{Disposition, Events, SocketAddress, SocketClient, SocketListener, SocketStream, TimedStream};
pub use transaction::{Transaction, TransactionError};
pub use value::{DataType, DecodeError, Value, WideString};
pub use wire::{FrameDecodeError, FrameDecoder, FrameEncodeError};
