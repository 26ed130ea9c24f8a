use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A connection's role in connection establishment. Both endpoints actively send SYNs (this
///  is what makes NAT traversal work), so when an initial SYN arrives it must be matched
///  against pending local connections - and a connection that initiated the handshake must
///  not be paired with another initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undefined,
    Requestor,
    Acceptor,
}

impl Role {
    pub fn can_connect_to(&self, other: Role) -> bool {
        match self {
            Role::Undefined => true,
            Role::Requestor => other != Role::Requestor,
            Role::Acceptor => other != Role::Acceptor,
        }
    }
}

/// Reason code carried in a FIN message, explaining why the sender closed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FinReason {
    NormalClose = 0x0,
    YouClosed = 0x1,
    Timeout = 0x2,
    LargePacket = 0x3,
    TooManyResends = 0x4,
    SendException = 0x5,
}

/// The five message kinds of the protocol.
///
/// `connection_id` is always the *receiver's* connection id, i.e. the value the remote
///  multiplexor routes on. Sequence numbers and window starts are the truncated 16-bit wire
///  representation; receivers widen them with a [crate::seq::SequenceNumberExtender].
///
/// Encoding to and from actual datagrams is the job of the surrounding transport - this
///  crate's boundary is the structured message.
#[derive(Clone, PartialEq)]
pub enum RudpMessage {
    /// Connection request. Carries the sender's own connection id so the receiver learns
    ///  where to address replies; `connection_id` is zero until the sender has learned the
    ///  receiver's id. The sequence number is the start of the sender's sequence space
    ///  (zero), and acknowledging it doubles as the SYN-ACK.
    Syn {
        connection_id: u8,
        sender_connection_id: u8,
        sequence_number: u16,
        role: Role,
    },
    /// Acknowledges the message with `sequence_number`, and piggybacks the receive window
    ///  state: `window_start` is the lowest sequence number not yet consumed,
    ///  `window_space` the number of free slots.
    Ack {
        connection_id: u8,
        sequence_number: u16,
        window_start: u16,
        window_space: u32,
    },
    /// A payload chunk.
    Data {
        connection_id: u8,
        sequence_number: u16,
        payload: Bytes,
    },
    /// Sent periodically on an idle connection, and immediately when a previously full
    ///  receive window reopens. Carries the same window state as an ACK but acknowledges
    ///  nothing.
    KeepAlive {
        connection_id: u8,
        window_start: u16,
        window_space: u32,
    },
    /// Connection close, with the sender's reason.
    Fin {
        connection_id: u8,
        sequence_number: u16,
        reason: FinReason,
    },
}

impl RudpMessage {
    /// The receiver-side connection id this message should be routed on.
    pub fn connection_id(&self) -> u8 {
        match self {
            RudpMessage::Syn { connection_id, .. } => *connection_id,
            RudpMessage::Ack { connection_id, .. } => *connection_id,
            RudpMessage::Data { connection_id, .. } => *connection_id,
            RudpMessage::KeepAlive { connection_id, .. } => *connection_id,
            RudpMessage::Fin { connection_id, .. } => *connection_id,
        }
    }
}

impl Debug for RudpMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RudpMessage::Syn { connection_id, sender_connection_id, sequence_number, role } =>
                write!(f, "SYN(conn={}, sender_conn={}, seq={}, role={:?})",
                       connection_id, sender_connection_id, sequence_number, role),
            RudpMessage::Ack { connection_id, sequence_number, window_start, window_space } =>
                write!(f, "ACK(conn={}, seq={}, w_start={}, w_space={})",
                       connection_id, sequence_number, window_start, window_space),
            RudpMessage::Data { connection_id, sequence_number, payload } =>
                write!(f, "DATA(conn={}, seq={}, len={})",
                       connection_id, sequence_number, payload.len()),
            RudpMessage::KeepAlive { connection_id, window_start, window_space } =>
                write!(f, "KEEPALIVE(conn={}, w_start={}, w_space={})",
                       connection_id, window_start, window_space),
            RudpMessage::Fin { connection_id, sequence_number, reason } =>
                write!(f, "FIN(conn={}, seq={}, reason={:?})",
                       connection_id, sequence_number, reason),
        }
    }
}
