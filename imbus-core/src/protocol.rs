//! Protocol vocabulary: core commands, protocol version, client roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent as a string in the open-connection request.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default signature prefixed to every frame by imbus peers.
pub const FRAME_SIGNATURE: u32 = 0x494D_4253; // "IMBS"

/// Commands defined by the core. Everything else is collaborator payload.
pub mod cmd {
    pub const REQUEST: i32 = 1;
    pub const REPLY: i32 = 2;
    pub const OK: i32 = 3;
    pub const FAIL: i32 = 4;
    pub const OPEN_CONNECTION: i32 = 5;
    pub const CLOSE_CONNECTION: i32 = 6;
    /// First command number available to collaborators.
    pub const USER_COMMAND_BASE: i32 = 0x100;
}

/// Kind of process on the client end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRole {
    FrontEnd,
    Panel,
    IMEngine,
    Config,
    Helper,
    /// Liveness probe: closes right after the server's reply.
    ConnectionTester,
}

impl ClientRole {
    pub const ALL: [ClientRole; 6] = [
        ClientRole::FrontEnd,
        ClientRole::Panel,
        ClientRole::IMEngine,
        ClientRole::Config,
        ClientRole::Helper,
        ClientRole::ConnectionTester,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClientRole::FrontEnd => "FrontEnd",
            ClientRole::Panel => "Panel",
            ClientRole::IMEngine => "IMEngine",
            ClientRole::Config => "Config",
            ClientRole::Helper => "Helper",
            ClientRole::ConnectionTester => "ConnectionTester",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown client role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for ClientRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClientRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// Join roles into the comma-separated form used on the wire.
pub fn join_roles(roles: &[ClientRole]) -> String {
    roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a comma-separated role list; unknown names are skipped.
pub fn split_roles(csv: &str) -> Vec<ClientRole> {
    csv.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_roundtrip_csv() {
        let roles = [ClientRole::FrontEnd, ClientRole::Panel, ClientRole::ConnectionTester];
        let csv = join_roles(&roles);
        assert_eq!(csv, "FrontEnd,Panel,ConnectionTester");
        assert_eq!(split_roles(&csv), roles.to_vec());
    }

    #[test]
    fn unknown_roles_skipped() {
        assert_eq!(split_roles("Panel, Bogus ,"), vec![ClientRole::Panel]);
        assert_eq!("Bogus".parse::<ClientRole>(), Err(UnknownRole("Bogus".into())));
    }

    #[test]
    fn user_commands_above_core() {
        let core = [
            cmd::REQUEST,
            cmd::REPLY,
            cmd::OK,
            cmd::FAIL,
            cmd::OPEN_CONNECTION,
            cmd::CLOSE_CONNECTION,
        ];
        assert!(core.iter().all(|c| *c < cmd::USER_COMMAND_BASE));
    }
}
