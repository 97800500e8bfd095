//! Directory and call roster value types.
//!
//! These are **pure data** — no I/O, no framework dependencies. They appear both
//! inside wire messages and in the server-side registry state.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// UDP port carrying encrypted media units on every multicast group.
pub const CONTENT_PORT: u16 = 50_000;

/// UDP port carrying in-call control datagrams (rate feedback, state).
pub const CONTROL_PORT: u16 = 50_001;

/// TCP port on which a call master accepts one-shot key-exchange connections.
pub const KEY_EXCHANGE_PORT: u16 = 50_999;

// ---------------------------------------------------------------------------
// User status
// ---------------------------------------------------------------------------

/// Whether a directory user can currently be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Available,
    InCall,
}

// ---------------------------------------------------------------------------
// Media medium
// ---------------------------------------------------------------------------

/// One of the three per-call multicast channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Audio,
    Video,
    Chat,
}

impl Medium {
    pub const ALL: [Medium; 3] = [Medium::Audio, Medium::Video, Medium::Chat];
}

// ---------------------------------------------------------------------------
// Roster entries
// ---------------------------------------------------------------------------

/// One directory user, as seen in join responses and user updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub status: UserStatus,
}

/// The multicast address triple allocated to one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAddrs {
    pub audio: IpAddr,
    pub video: IpAddr,
    pub chat: IpAddr,
}

impl MediaAddrs {
    /// Group address for a medium's content traffic.
    pub fn content(&self, medium: Medium) -> SocketAddr {
        SocketAddr::new(self.ip(medium), CONTENT_PORT)
    }

    /// Group address for in-call control traffic (shared by all media).
    pub fn control(&self) -> SocketAddr {
        SocketAddr::new(self.chat, CONTROL_PORT)
    }

    pub fn ip(&self, medium: Medium) -> IpAddr {
        match medium {
            Medium::Audio => self.audio,
            Medium::Video => self.video,
            Medium::Chat => self.chat,
        }
    }
}

/// One registered call, as seen in call updates and join responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub master: String,
    /// Participants in join order; the master is always present.
    pub user_lst: Vec<String>,
    pub addrs: MediaAddrs,
    /// Where the master accepts one-shot key-exchange connections.
    pub key_addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addrs() -> MediaAddrs {
        MediaAddrs {
            audio: IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)),
            video: IpAddr::V4(Ipv4Addr::new(239, 192, 0, 2)),
            chat: IpAddr::V4(Ipv4Addr::new(239, 192, 0, 3)),
        }
    }

    #[test]
    fn content_and_control_ports_differ() {
        let a = addrs();
        assert_eq!(a.content(Medium::Audio).port(), CONTENT_PORT);
        assert_eq!(a.control().port(), CONTROL_PORT);
        assert_ne!(a.content(Medium::Chat), a.control());
    }

    #[test]
    fn status_wire_form() {
        assert_eq!(
            serde_json::to_string(&UserStatus::InCall).unwrap(),
            "\"in_call\""
        );
    }
}
