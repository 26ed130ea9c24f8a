//! A reliable, ordered byte-stream transport tunneled through unreliable datagrams - a
//!  miniature TCP running over a single shared UDP socket.
//!
//! ## Design goals
//!
//! * Many logical connections over *one* datagram socket
//!   * every message carries a one-byte connection id, and a [multiplexor::Multiplexor]
//!     routes inbound messages onto up to 255 connections
//!   * id zero is reserved for "I don't know your id yet", which is only ever true for the
//!     initial SYN of a handshake
//! * Both endpoints actively try to connect
//!   * each side keeps sending SYNs until it has seen an ack of its own SYN *and* learned
//!     the peer's connection id - in either order. This symmetry is what lets two firewalled
//!     peers punch through their NATs: whichever SYN gets through first completes the pair
//!   * a connection carries a [message::Role] so that two initiators are never paired up
//! * Byte-stream semantics on top of per-chunk delivery
//!   * producer data is cut into fixed-size chunks, each sent as one DATA message with a
//!     sequence number; the receiver buffers out-of-order chunks in a window and hands
//!     bytes to the application strictly in sequence
//!   * sequence numbers travel as 16 bits on the wire and are widened back to 64 bits by a
//!     [seq::SequenceNumberExtender], so wraparound is invisible above the wire layer
//! * Selective acknowledgement with adaptive ack skipping
//!   * every ACK echoes one sequence number and piggybacks the receive window state, so a
//!     single ACK both acknowledges a chunk and implicitly acks everything below the
//!     advertised window start
//!   * while the inbound rate is steady the receiver may skip a bounded number of
//!     consecutive ACKs; any drop in the arrival rate forces one immediately
//! * Timing-based reliability without a dedicated thread per connection
//!   * all retransmission, keepalive, liveness and write pacing timers of all connections
//!     funnel through one [scheduler::Scheduler] loop
//!   * retransmission uses an RTT estimate (Jacobson/Karels) with exponential backoff, and
//!     gives up on the connection after a configured number of retries
//!   * write pacing spreads sends across the measured round trip and backs off when the
//!     observed RTT climbs above its floor, see [write_regulator::WriteRegulator]
//! * Explicit teardown
//!   * a FIN carries a reason code; the FIN is acked, retransmitted once if that ack does
//!     not arrive, and the routing slot is only released after a long quarantine so stray
//!     late messages cannot hit an unrelated new connection
//!
//! Encoding messages to actual datagrams (and any encryption of them) is the surrounding
//!  transport's concern: this crate's boundary is the structured [message::RudpMessage] on
//!  one side and the [datagram::DatagramSender] trait on the other.

pub mod chunks;
pub mod config;
pub mod connection;
pub mod data_window;
pub mod datagram;
pub mod message;
pub mod multiplexor;
pub mod scheduler;
pub mod seq;
pub mod write_regulator;
