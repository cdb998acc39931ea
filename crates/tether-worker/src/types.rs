pub use tether_transport::{now_ms, Topic};

/// Correlation key between an outbound event and its response.
pub type EventId = String;

/// Lifecycle of the link to the manager.
///
/// `Open` means the WebSocket handshake completed; `SessionLive` means the
/// manager has answered a probe or acknowledged registration. Queued events
/// are only flushed in `SessionLive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    SessionLive,
    Closing,
}

impl ConnectionState {
    /// Whether a transport handle currently exists.
    pub fn is_transport_up(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::SessionLive)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::SessionLive => "SESSION_LIVE",
            ConnectionState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// One independently stored section of the worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Fragment {
    Schema,
    PrivKey,
    Profile,
    Info,
    Settings,
    Credentials,
    Url,
}

/// Fragments covered by the version string, in wire order.
///
/// This order is the protocol's version vector; never reorder it.
pub const VERSION_ORDER: [Fragment; 5] = [
    Fragment::Schema,
    Fragment::PrivKey,
    Fragment::Profile,
    Fragment::Info,
    Fragment::Settings,
];

impl Fragment {
    /// Name used in the configuration document and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Fragment::Schema => "schema",
            Fragment::PrivKey => "privKey",
            Fragment::Profile => "profile",
            Fragment::Info => "info",
            Fragment::Settings => "settings",
            Fragment::Credentials => "credentials",
            Fragment::Url => "url",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "schema" => Some(Fragment::Schema),
            "privKey" => Some(Fragment::PrivKey),
            "profile" => Some(Fragment::Profile),
            "info" => Some(Fragment::Info),
            "settings" => Some(Fragment::Settings),
            "credentials" => Some(Fragment::Credentials),
            "url" => Some(Fragment::Url),
            _ => None,
        }
    }

    pub fn is_versioned(&self) -> bool {
        VERSION_ORDER.contains(self)
    }
}

impl std::fmt::Display for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
