//! Per-connection context: identity, capabilities, and the lifecycle state
//! machine.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Connection lifecycle state.
///
/// `Closing` is entered at most once; `Closed` is terminal. A fatal inbound
/// stream error moves any state directly to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Waiting for or processing the initial handshake
    Handshaking = 0,
    /// Negotiating the SSL upgrade
    SslUpgrade = 1,
    /// Handshake response sent, waiting for the auth result
    Authenticating = 2,
    /// Logged in; command phase
    Ready = 3,
    /// Graceful close initiated
    Closing = 4,
    /// Channel is gone
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::SslUpgrade,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// SSL negotiation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SslState {
    /// Negotiation has not concluded
    #[default]
    Pending = 0,
    /// Server does not support SSL
    Unsupported = 1,
    /// SSL negotiation finished (either upgraded or skipped)
    Negotiated = 2,
}

/// Shared per-connection context.
#[derive(Debug)]
pub struct ConnectionContext {
    connection_id: AtomicU32,
    capabilities: AtomicU32,
    server_version: OnceLock<String>,
    state: AtomicU8,
    ssl: AtomicU8,
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionContext {
    /// Create a context in the `Handshaking` state.
    pub fn new() -> Self {
        Self {
            connection_id: AtomicU32::new(0),
            capabilities: AtomicU32::new(0),
            server_version: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            ssl: AtomicU8::new(SslState::Pending as u8),
        }
    }

    /// Server-assigned connection id, 0 before the handshake.
    pub fn connection_id(&self) -> u32 {
        self.connection_id.load(Ordering::Relaxed)
    }

    /// Negotiated capability flags.
    pub fn capabilities(&self) -> u32 {
        self.capabilities.load(Ordering::Relaxed)
    }

    /// Server version string, empty before the handshake.
    pub fn server_version(&self) -> &str {
        self.server_version.get().map_or("", String::as_str)
    }

    /// Record the handshake identity. The id and version are set once.
    pub fn init_handshake(&self, connection_id: u32, server_version: &str, capabilities: u32) {
        let _ = self
            .connection_id
            .compare_exchange(0, connection_id, Ordering::Relaxed, Ordering::Relaxed);
        self.capabilities.store(capabilities, Ordering::Relaxed);
        let _ = self.server_version.set(server_version.to_string());
    }

    /// Replace the capability flags with the negotiated (client AND server) set.
    pub fn set_capabilities(&self, capabilities: u32) {
        self.capabilities.store(capabilities, Ordering::Relaxed);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle, never leaving `Closed`.
    ///
    /// Returns the previous state.
    pub fn transition(&self, to: ConnectionState) -> ConnectionState {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == ConnectionState::Closed as u8 {
                return ConnectionState::Closed;
            }
            if self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return ConnectionState::from_u8(current);
            }
        }
    }

    /// Enter `Closing` from any earlier state; true only for the single
    /// caller that wins.
    pub fn begin_closing(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnectionState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Record that the server does not support SSL.
    pub fn ssl_unsupported(&self) {
        self.ssl.store(SslState::Unsupported as u8, Ordering::Release);
    }

    /// Record that SSL negotiation concluded.
    pub fn ssl_negotiated(&self) {
        self.ssl.store(SslState::Negotiated as u8, Ordering::Release);
    }

    /// SSL negotiation outcome so far.
    pub fn ssl_state(&self) -> SslState {
        match self.ssl.load(Ordering::Acquire) {
            1 => SslState::Unsupported,
            2 => SslState::Negotiated,
            _ => SslState::Pending,
        }
    }
}
