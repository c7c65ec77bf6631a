//! Route definition sources and the per-client polling protocol.
use std::{cell::RefCell, collections::VecDeque, rc::Rc, time::Duration};

use async_trait::async_trait;
use futures_channel::mpsc::UnboundedSender;
use tracing::warn;

use super::multiplexer::{ClientEvent, ClientEventKind};
use crate::{route::RouteDef, AnyError, AnyResult};

#[derive(Debug, Default)]
pub struct ClientUpdate {
    pub upserts: Vec<RouteDef>,
    pub deleted_ids: Vec<String>,
}

impl ClientUpdate {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deleted_ids.is_empty()
    }
}

/// A source of route definitions.
///
/// `name()` must be stable and unique: it keys the client's slice of the
/// merged definition map and orders clients when ids conflict.
#[async_trait(?Send)]
pub trait DataClient {
    fn name(&self) -> &str;

    async fn load_all(&self) -> AnyResult<Vec<RouteDef>>;

    async fn load_update(&self) -> AnyResult<ClientUpdate>;
}

/// Drive one data client against the multiplexer.
///
/// Protocol: full load first (retried with backoff), then incremental
/// updates; an update failure falls back to a full load, which is announced
/// to the multiplexer as a reset for this client.
pub async fn poll_client(
    client: Rc<dyn DataClient>,
    tx: UnboundedSender<ClientEvent>,
    poll_timeout: Duration,
) {
    loop {
        let routes = match client.load_all().await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(client = client.name(), error = %e, "full route load failed");
                monoio::time::sleep(poll_timeout).await;
                continue;
            }
        };
        if tx
            .unbounded_send(ClientEvent {
                client: client.name().to_string(),
                kind: ClientEventKind::Reset,
                upserts: routes,
                deleted_ids: Vec::new(),
            })
            .is_err()
        {
            return;
        }

        loop {
            monoio::time::sleep(poll_timeout).await;
            match client.load_update().await {
                Ok(update) => {
                    if update.is_empty() {
                        continue;
                    }
                    if tx
                        .unbounded_send(ClientEvent {
                            client: client.name().to_string(),
                            kind: ClientEventKind::Update,
                            upserts: update.upserts,
                            deleted_ids: update.deleted_ids,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        client = client.name(),
                        error = %e,
                        "route update poll failed, reverting to full load"
                    );
                    break;
                }
            }
        }
    }
}

/// Serves the route definitions embedded in the configuration file. Never
/// delivers updates.
pub struct InlineClient {
    name: String,
    routes: Vec<RouteDef>,
}

impl InlineClient {
    pub fn new(routes: Vec<RouteDef>) -> Self {
        Self {
            name: "inline".to_string(),
            routes,
        }
    }
}

#[async_trait(?Send)]
impl DataClient for InlineClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_all(&self) -> AnyResult<Vec<RouteDef>> {
        Ok(self.routes.clone())
    }

    async fn load_update(&self) -> AnyResult<ClientUpdate> {
        Ok(ClientUpdate::default())
    }
}

#[derive(Default)]
struct ChannelState {
    routes: Vec<RouteDef>,
    queue: VecDeque<AnyResult<ClientUpdate>>,
}

/// A programmatic client: embedders (and tests) push updates through a
/// [`ChannelClientHandle`].
pub struct ChannelClient {
    name: String,
    state: Rc<RefCell<ChannelState>>,
}

#[derive(Clone)]
pub struct ChannelClientHandle {
    state: Rc<RefCell<ChannelState>>,
}

impl ChannelClient {
    pub fn new(name: impl Into<String>, routes: Vec<RouteDef>) -> (Self, ChannelClientHandle) {
        let state = Rc::new(RefCell::new(ChannelState {
            routes,
            queue: VecDeque::new(),
        }));
        (
            Self {
                name: name.into(),
                state: state.clone(),
            },
            ChannelClientHandle { state },
        )
    }
}

impl ChannelClientHandle {
    /// Replace the full definition set; delivered on the next full load.
    pub fn set_routes(&self, routes: Vec<RouteDef>) {
        self.state.borrow_mut().routes = routes;
    }

    pub fn push_update(&self, upserts: Vec<RouteDef>, deleted_ids: Vec<String>) {
        let mut state = self.state.borrow_mut();
        for def in &upserts {
            state.routes.retain(|r| r.id != def.id);
            state.routes.push(def.clone());
        }
        state.routes.retain(|r| !deleted_ids.contains(&r.id));
        state.queue.push_back(Ok(ClientUpdate {
            upserts,
            deleted_ids,
        }));
    }

    /// Make the next `load_update` call fail, driving the poller back to a
    /// full load.
    pub fn push_error(&self, error: AnyError) {
        self.state.borrow_mut().queue.push_back(Err(error));
    }
}

#[async_trait(?Send)]
impl DataClient for ChannelClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_all(&self) -> AnyResult<Vec<RouteDef>> {
        Ok(self.state.borrow().routes.clone())
    }

    async fn load_update(&self) -> AnyResult<ClientUpdate> {
        match self.state.borrow_mut().queue.pop_front() {
            Some(result) => result,
            None => Ok(ClientUpdate::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::route::BackendDef;

    fn def(id: &str) -> RouteDef {
        RouteDef::new(id, BackendDef::Shunt)
    }

    #[monoio::test(timer_enabled = true)]
    async fn poll_protocol_reset_update_and_recovery() {
        let (client, handle) = ChannelClient::new("test", vec![def("a")]);
        let (tx, mut rx) = futures_channel::mpsc::unbounded();
        monoio::spawn(poll_client(
            Rc::new(client),
            tx,
            Duration::from_millis(1),
        ));

        let first = rx.next().await.unwrap();
        assert_eq!(first.kind, ClientEventKind::Reset);
        assert_eq!(first.upserts.len(), 1);

        handle.push_update(vec![def("b")], vec!["a".to_string()]);
        let second = rx.next().await.unwrap();
        assert_eq!(second.kind, ClientEventKind::Update);
        assert_eq!(second.upserts[0].id, "b");
        assert_eq!(second.deleted_ids, vec!["a".to_string()]);

        // a failing update poll falls back to a fresh full load
        handle.push_error(anyhow::anyhow!("poll failed"));
        let third = rx.next().await.unwrap();
        assert_eq!(third.kind, ClientEventKind::Reset);
        assert_eq!(third.upserts[0].id, "b");
    }

    #[monoio::test(timer_enabled = true)]
    async fn inline_client_never_updates() {
        let client = InlineClient::new(vec![def("x")]);
        assert_eq!(client.load_all().await.unwrap().len(), 1);
        assert!(client.load_update().await.unwrap().is_empty());
    }
}
