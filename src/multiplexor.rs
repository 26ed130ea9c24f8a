use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, debug_span, Instrument};
use uuid::Uuid;

use crate::connection::Connection;
use crate::message::{Role, RudpMessage};

/// Connection id zero is never assigned: on the wire it means "I don't know your id yet",
///  which is the case exactly for the initial SYN.
pub const UNASSIGNED_ID: u8 = 0;

/// the id is a single byte, and zero is reserved
const MAX_CONNECTIONS: usize = 255;

/// Demultiplexes inbound messages of one shared datagram socket onto up to 255
///  connections, routing on the one-byte connection id each message carries.
///
/// Slot assignment is round robin rather than lowest-free so a released id is not handed
///  out again immediately - late messages for a closed connection would otherwise reach an
///  unrelated new one.
pub struct Multiplexor {
    connections: AtomicRoutingTable,
    /// the most recently assigned id, guarding registration
    last_id: Mutex<u8>,
}

impl Multiplexor {
    pub fn new() -> Arc<Multiplexor> {
        Arc::new(Multiplexor {
            connections: AtomicRoutingTable::new(),
            last_id: Mutex::new(UNASSIGNED_ID),
        })
    }

    /// Assigns the connection a free slot, or fails when all 255 are taken.
    pub async fn register(self: &Arc<Self>, connection: Arc<Connection>) -> anyhow::Result<u8> {
        let id = {
            let mut last_id = self.last_id.lock().unwrap();
            let snapshot = self.connections.snapshot();
            if snapshot.len() >= MAX_CONNECTIONS {
                bail!("all connection slots are in use");
            }

            let mut id = *last_id;
            loop {
                id = id.wrapping_add(1);
                if id == UNASSIGNED_ID {
                    continue;
                }
                if !snapshot.contains_key(&id) {
                    break;
                }
            }
            *last_id = id;

            let registered = connection.clone();
            self.connections.update(move |connections| {
                connections.insert(id, registered.clone());
            });
            id
        };

        debug!("registered connection in slot {}", id);
        connection.attach(id, Arc::downgrade(self)).await;
        Ok(id)
    }

    /// Releases a slot, called by the connection itself at the end of its teardown delay.
    pub(crate) fn deregister(&self, connection_id: u8) {
        debug!("releasing slot {}", connection_id);
        self.connections.update(move |connections| {
            connections.remove(&connection_id);
        });
    }

    /// Routes one inbound message to its connection. Unroutable messages are logged and
    ///  dropped - datagrams from the open network prove nothing.
    pub async fn route_message(&self, msg: RudpMessage, from: SocketAddr) {
        let span = debug_span!("inbound", %from, correlation_id = %Uuid::new_v4());
        async {
            let connection_id = msg.connection_id();

            if connection_id == UNASSIGNED_ID {
                // the peer doesn't know our id yet, which is legitimate only for its
                // initial SYN - match it against connections awaiting a handshake
                let syn_details = match &msg {
                    RudpMessage::Syn { sender_connection_id, role, .. } =>
                        Some((*sender_connection_id, *role)),
                    _ => None,
                };
                match syn_details {
                    Some((sender_id, role)) => {
                        match self.find_connecting(from, sender_id, role).await {
                            Some(connection) => connection.handle_message(msg).await,
                            None => debug!("no connection awaiting a SYN from {} - dropping", from),
                        }
                    }
                    None => debug!("{:?} without a connection id - dropping", msg),
                }
                return;
            }

            match self.connections.get(connection_id) {
                Some(connection) if connection.peer_addr() == Some(from) => {
                    connection.handle_message(msg).await;
                }
                Some(_) => debug!("message for slot {} from unexpected address {} - dropping",
                                  connection_id, from),
                None => debug!("message for unknown slot {} - dropping", connection_id),
            }
        }
        .instrument(span)
        .await
    }

    async fn find_connecting(
        &self,
        from: SocketAddr,
        sender_connection_id: u8,
        role: Role,
    ) -> Option<Arc<Connection>> {
        let snapshot = self.connections.snapshot();
        for connection in snapshot.values() {
            if connection.is_connecting().await
                && connection.is_for_me(from, sender_connection_id, role).await
            {
                return Some(connection.clone());
            }
        }
        None
    }

    /// Whether some registered connection to this address is fully established.
    pub async fn is_connected_to(&self, addr: SocketAddr) -> bool {
        let snapshot = self.connections.snapshot();
        for connection in snapshot.values() {
            if connection.peer_addr() == Some(addr) && connection.is_connected().await {
                return true;
            }
        }
        false
    }

    pub fn connection_count(&self) -> usize {
        self.connections.snapshot().len()
    }
}

/// Copy-on-write routing table: the map itself is immutable, writers build a modified
///  copy and swap the `Arc` under the write lock. Readers only hold the read lock for
///  the `Arc` clone, so per-datagram routing never waits on a registration in progress.
struct AtomicRoutingTable {
    map: RwLock<Arc<FxHashMap<u8, Arc<Connection>>>>,
}

impl AtomicRoutingTable {
    fn new() -> AtomicRoutingTable {
        AtomicRoutingTable {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    fn get(&self, connection_id: u8) -> Option<Arc<Connection>> {
        self.map.read().unwrap().get(&connection_id).cloned()
    }

    fn snapshot(&self) -> Arc<FxHashMap<u8, Arc<Connection>>> {
        self.map.read().unwrap().clone()
    }

    fn update(&self, f: impl Fn(&mut FxHashMap<u8, Arc<Connection>>)) {
        let mut guard = self.map.write().unwrap();
        let mut map = (**guard).clone();
        f(&mut map);
        *guard = Arc::new(map);
    }
}
