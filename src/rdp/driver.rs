//! The RDP MITM driver interface.
//!
//! The front-end never touches the RDP protocol directly: it accepts the
//! TCP connection, hands it to a driver, resolves routing once the local
//! address is known, and only then lets the driver open its outbound leg.
//! The underlying implementation can be swapped without touching
//! admission or lifecycle code. What used to be open/close observer
//! callbacks is folded into the stay's single event channel: the session
//! is "open" while [`RdpMitmSession::run`] runs and its return value is
//! the close.

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::core::errors::GatewayError;
use crate::core::registry::StayHandle;
use crate::core::stay::TerminationReason;

/// Factory for MITM sessions.
#[async_trait]
pub trait RdpMitmDriver: Send + Sync {
    /// Take ownership of an accepted connection and progress the
    /// handshake just far enough to hold the client (the outbound leg
    /// must not be opened yet).
    async fn accept(&self, stream: TcpStream) -> Result<Box<dyn RdpMitmSession>, GatewayError>;
}

/// One client connection inside a driver.
#[async_trait]
pub trait RdpMitmSession: Send {
    /// Set the backend this session relays to. Must be called before
    /// [`run`](Self::run).
    fn set_target(&mut self, target: SocketAddr);

    /// Set the replay file the session records into.
    fn write_replay(&mut self, path: PathBuf);

    /// Open the outbound TCP leg. Called after admission; a failure here
    /// means no stay is ever opened for the connection.
    ///
    /// # Errors
    ///
    /// [`GatewayError::BackendUnreachable`] when the target cannot be
    /// dialled within the deadline.
    async fn open_backend(&mut self) -> Result<(), GatewayError>;

    /// Relay until a side closes, the stay terminates, or the idle
    /// cutoff fires.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TransientIo`] for mid-session IO faults.
    async fn run(self: Box<Self>, stay: StayHandle) -> Result<TerminationReason, GatewayError>;
}
