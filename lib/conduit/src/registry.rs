//! Process-wide connection registry. Connections are owned by their
//! callers; the registry keeps non-owning references keyed by a small
//! integer uid so that ids embedded in protobuf messages (e.g.
//! `PeerReply.id`) can be resolved back when responses arrive.

use crate::connection::{Connection, ConnectionId};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex, Weak};

struct Table {
    map: HashMap<ConnectionId, Weak<Connection>>,
    next_uid: ConnectionId,
}

lazy_static! {
    static ref REGISTRY: Mutex<Table> = Mutex::new(Table {
        map: HashMap::new(),
        next_uid: 0,
    });
}

/// Finds the first free uid at or after `start`, wrapping around.
fn next_free(map: &HashMap<ConnectionId, Weak<Connection>>, start: ConnectionId) -> ConnectionId {
    let mut uid = start;

    loop {
        if !map.contains_key(&uid) {
            return uid;
        }

        uid = uid.wrapping_add(1);

        if uid == start {
            panic!("Connection registry exhausted");
        }
    }
}

/// Allocates a uid, builds the connection under it and registers a weak
/// reference.
pub(crate) fn register<F>(build: F) -> Arc<Connection>
where
    F: FnOnce(ConnectionId) -> Arc<Connection>,
{
    let mut table = REGISTRY.lock().expect("Registry lock poisoned");

    let uid = next_free(&table.map, table.next_uid);
    table.next_uid = uid.wrapping_add(1);

    let conn = build(uid);
    table.map.insert(uid, Arc::downgrade(&conn));
    conn
}

/// Resolves a uid back to its connection, if it is still alive.
pub fn find(uid: ConnectionId) -> Option<Arc<Connection>> {
    let table = REGISTRY.lock().expect("Registry lock poisoned");
    table.map.get(&uid)?.upgrade()
}

pub(crate) fn remove(uid: ConnectionId) {
    let mut table = REGISTRY.lock().expect("Registry lock poisoned");
    table.map.remove(&uid);
}
