use std::time::Duration;

use tokio::time::Instant;

/// Life cycle of a connection with a peer.
///
/// `Init -> Handshaking -> Verified -> Active -> Closed`, any state may
/// jump to `Closed`.
#[derive(Clone, Default, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The socket is connected but no handshake was sent or received.
    #[default]
    Init,

    /// Waiting for the handshake of the remote.
    Handshaking,

    /// Both handshakes were exchanged and the info hash matches.
    Verified,

    /// Exchanging core messages.
    Active,

    Closed,
}

/// Contains the state of both sides of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreState {
    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub am_choking: bool,

    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: bool,

    /// If peer is choked, we don't allow them to download pieces from us.
    pub peer_choking: bool,

    /// If peer is interested in us, they mean to download pieces that we have.
    pub peer_interested: bool,
}

impl Default for CoreState {
    /// By default, both sides of the connection start off as choked and not
    /// interested in the other.
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    /// The current state of the connection.
    pub connection: ConnectionState,

    pub state: CoreState,

    /// The time the BitTorrent connection was established (i.e. after
    /// handshaking)
    pub connected_time: Option<Instant>,

    /// Updated with the time of receipt of the most recently received
    /// message, keep alives included.
    pub last_message_time: Option<Instant>,

    /// Number of blocks received on this connection.
    pub downloaded_blocks: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection: ConnectionState::default(),
            state: CoreState::default(),
            connected_time: None,
            last_message_time: None,
            downloaded_blocks: 0,
        }
    }
}

impl Session {
    /// Move to the next state of the connection.
    ///
    /// Returns false, and does nothing, if the transition is not allowed.
    pub fn advance(&mut self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        let allowed = matches!(
            (self.connection, to),
            (Init, Handshaking)
                | (Handshaking, Verified)
                | (Verified, Active)
                | (_, Closed)
        );

        if allowed {
            if to == Active {
                self.connected_time = Some(Instant::now());
            }
            self.connection = to;
        }

        allowed
    }

    /// How long the connection has been active, zero if it never was.
    pub fn connected_for(&self, now: Instant) -> Duration {
        self.connected_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// Time since the last message of the remote, None if it sent nothing.
    pub fn silent_for(&self, now: Instant) -> Option<Duration> {
        self.last_message_time.map(|t| now.saturating_duration_since(t))
    }

    /// If a request may be sent to the peer right now.
    pub fn can_request(&self) -> bool {
        self.connection == ConnectionState::Active && !self.state.peer_choking
    }
}
