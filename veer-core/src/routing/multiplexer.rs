//! Merges per-client route definition streams into totally ordered
//! snapshots.
use std::collections::{BTreeMap, HashMap};

use futures::StreamExt;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::{route::RouteDef, util::hash::sha256_items};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventKind {
    /// Replace everything previously delivered by this client.
    Reset,
    /// Incremental upserts and deletions.
    Update,
}

#[derive(Debug)]
pub struct ClientEvent {
    pub client: String,
    pub kind: ClientEventKind,
    pub upserts: Vec<RouteDef>,
    pub deleted_ids: Vec<String>,
}

/// Union of all clients' current definitions, sorted by route id.
#[derive(Debug, Clone)]
pub struct MergedDefs {
    pub routes: Vec<RouteDef>,
    pub clients: Vec<String>,
}

/// Folds client events into per-client id maps and emits merged snapshots.
///
/// Clients are merged in lexicographic name order; when two clients provide
/// the same route id the later one wins and a warning is logged. Snapshots
/// identical to the previously emitted one are suppressed.
#[derive(Default)]
pub struct Multiplexer {
    defs_by_client: BTreeMap<String, HashMap<String, RouteDef>>,
    last_hash: Option<String>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: ClientEvent) -> Option<MergedDefs> {
        let defs = self.defs_by_client.entry(event.client.clone()).or_default();
        match event.kind {
            ClientEventKind::Reset => {
                defs.clear();
                for def in event.upserts {
                    defs.insert(def.id.clone(), def);
                }
            }
            ClientEventKind::Update => {
                for id in &event.deleted_ids {
                    defs.remove(id);
                }
                for def in event.upserts {
                    defs.insert(def.id.clone(), def);
                }
            }
        }
        self.merged()
    }

    fn merged(&mut self) -> Option<MergedDefs> {
        let mut by_id: BTreeMap<&str, (&str, &RouteDef)> = BTreeMap::new();
        for (client, defs) in &self.defs_by_client {
            for (id, def) in defs {
                if let Some((other, _)) =
                    by_id.insert(id.as_str(), (client.as_str(), def))
                {
                    warn!(
                        id = id.as_str(),
                        winner = client.as_str(),
                        loser = other,
                        "duplicate route id across data clients, last-seen wins"
                    );
                }
            }
        }

        let hash = sha256_items(by_id.values().map(|(_, def)| def.fingerprint()));
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            debug!("merged route definitions unchanged, snapshot suppressed");
            return None;
        }
        self.last_hash = Some(hash);

        Some(MergedDefs {
            routes: by_id.into_values().map(|(_, def)| def.clone()).collect(),
            clients: self.defs_by_client.keys().cloned().collect(),
        })
    }
}

/// Serialize all client events into a totally ordered snapshot stream and
/// fan every snapshot out to the worker channels.
pub async fn run_multiplexer(
    mut rx: UnboundedReceiver<ClientEvent>,
    workers: Vec<UnboundedSender<MergedDefs>>,
) {
    let mut mux = Multiplexer::new();
    while let Some(event) = rx.next().await {
        if let Some(snapshot) = mux.apply(event) {
            for tx in &workers {
                let _ = tx.unbounded_send(snapshot.clone());
            }
        }
    }
    info!("all data clients stopped, multiplexer exits");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::BackendDef;

    fn def(id: &str) -> RouteDef {
        RouteDef::new(id, BackendDef::Shunt)
    }

    fn reset(client: &str, upserts: Vec<RouteDef>) -> ClientEvent {
        ClientEvent {
            client: client.into(),
            kind: ClientEventKind::Reset,
            upserts,
            deleted_ids: Vec::new(),
        }
    }

    fn update(client: &str, upserts: Vec<RouteDef>, deleted: &[&str]) -> ClientEvent {
        ClientEvent {
            client: client.into(),
            kind: ClientEventKind::Update,
            upserts,
            deleted_ids: deleted.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(snapshot: &MergedDefs) -> Vec<&str> {
        snapshot.routes.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn reset_then_update_folds_per_client() {
        let mut mux = Multiplexer::new();
        let s = mux.apply(reset("a", vec![def("one"), def("two")])).unwrap();
        assert_eq!(ids(&s), vec!["one", "two"]);

        let s = mux
            .apply(update("a", vec![def("three")], &["one"]))
            .unwrap();
        assert_eq!(ids(&s), vec!["three", "two"]);
    }

    #[test]
    fn merge_unions_across_clients() {
        let mut mux = Multiplexer::new();
        mux.apply(reset("a", vec![def("one")]));
        let s = mux.apply(reset("b", vec![def("two")])).unwrap();
        assert_eq!(ids(&s), vec!["one", "two"]);
        assert_eq!(s.clients, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_id_resolves_by_client_order() {
        let mut mux = Multiplexer::new();
        let mut from_a = def("shared");
        from_a.method = Some("GET".into());
        let mut from_b = def("shared");
        from_b.method = Some("POST".into());
        mux.apply(reset("b", vec![from_b]));
        let s = mux.apply(reset("a", vec![from_a])).unwrap();
        // lexicographically later client wins regardless of arrival order
        assert_eq!(s.routes[0].method.as_deref(), Some("POST"));
    }

    #[test]
    fn unchanged_snapshot_is_suppressed() {
        let mut mux = Multiplexer::new();
        assert!(mux.apply(reset("a", vec![def("one")])).is_some());
        assert!(mux.apply(reset("a", vec![def("one")])).is_none());
        assert!(mux.apply(update("a", vec![], &[])).is_none());
        assert!(mux.apply(update("a", vec![], &["one"])).is_some());
    }

    #[test]
    fn client_reset_replaces_only_that_client() {
        let mut mux = Multiplexer::new();
        mux.apply(reset("a", vec![def("one")]));
        mux.apply(reset("b", vec![def("two")]));
        let s = mux.apply(reset("a", vec![def("three")])).unwrap();
        assert_eq!(ids(&s), vec!["three", "two"]);
    }
}
