use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::message::RudpMessage;

/// This is an abstraction for handing a finished message to the unreliable datagram
///  transport underneath, introduced to facilitate mocking the I/O part away for testing.
///
/// Implementations own encoding and the actual socket. An `Err` from `send` means the
///  message could not even be handed off locally - silent loss in the network is *not*
///  reported here, that is what the protocol itself compensates for.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send(&self, message: RudpMessage, to: SocketAddr) -> anyhow::Result<()>;
}
