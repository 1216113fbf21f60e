//! Role-filtered fan-out of server events to connected participants.
//!
//! The session task owns one router. Each connection registers an outbound
//! channel plus its reliable emitter; broadcasts pick recipients by role so
//! candidate-only material (e.g. copy reports going the other way) never
//! crosses a trust boundary by accident.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::emitter::{DeliveryError, ReliableEmitter};
use crate::protocol::{ServerEvent, ServerFrame};
use crate::registry::Role;

struct Link {
    role: Role,
    tx: mpsc::UnboundedSender<ServerFrame>,
    emitter: Arc<ReliableEmitter>,
}

/// Outbound channels for one room, keyed by connection id.
#[derive(Default)]
pub struct BroadcastRouter {
    links: HashMap<Uuid, Link>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(
        &mut self,
        id: Uuid,
        role: Role,
        tx: mpsc::UnboundedSender<ServerFrame>,
        emitter: Arc<ReliableEmitter>,
    ) {
        self.links.insert(id, Link { role, tx, emitter });
    }

    pub fn detach(&mut self, id: Uuid) {
        self.links.remove(&id);
    }

    pub fn role_of(&self, id: Uuid) -> Option<Role> {
        self.links.get(&id).map(|l| l.role)
    }

    /// Fire-and-forget `event` to every connection whose role is in `roles`.
    pub fn broadcast(&self, event: &ServerEvent, roles: &[Role]) {
        self.broadcast_except(event, roles, None);
    }

    /// Like [`BroadcastRouter::broadcast`] but skipping one connection,
    /// typically the one whose input caused the event.
    pub fn broadcast_except(&self, event: &ServerEvent, roles: &[Role], except: Option<Uuid>) {
        for (id, link) in &self.links {
            if Some(*id) == except {
                continue;
            }
            if roles.contains(&link.role) && link.tx.send(ServerFrame::new(event.clone())).is_err()
            {
                debug!("dropping broadcast to closed connection {id}");
            }
        }
    }

    /// Reliable emitters for every connection whose role is in `roles`,
    /// minus `except`. Snapshotting them lets the caller run deliveries
    /// off the session task.
    pub fn emitters_for(
        &self,
        roles: &[Role],
        except: Option<Uuid>,
    ) -> Vec<(Uuid, Arc<ReliableEmitter>)> {
        self.links
            .iter()
            .filter(|(id, link)| Some(**id) != except && roles.contains(&link.role))
            .map(|(id, link)| (*id, link.emitter.clone()))
            .collect()
    }

    /// Fire-and-forget `event` to a single connection.
    pub fn send_to(&self, id: Uuid, event: ServerEvent) {
        if let Some(link) = self.links.get(&id) {
            let _ = link.tx.send(ServerFrame::new(event));
        }
    }

    /// Reliable `event` to every connection whose role is in `roles`.
    ///
    /// Deliveries run concurrently; one slow or dead peer never delays the
    /// others. Failures are reported per connection so the caller can tear
    /// the connection down.
    pub async fn broadcast_reliable(
        &self,
        event: &ServerEvent,
        roles: &[Role],
    ) -> Vec<(Uuid, DeliveryError)> {
        let targets = self.emitters_for(roles, None);

        let deliveries = targets.into_iter().map(|(id, emitter)| {
            let event = event.clone();
            async move { (id, emitter.emit_with_ack(event).await) }
        });

        futures_util::future::join_all(deliveries)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }

    /// Reliable `event` to a single connection.
    pub async fn send_to_reliable(
        &self,
        id: Uuid,
        event: ServerEvent,
    ) -> Result<(), DeliveryError> {
        match self.links.get(&id) {
            Some(link) => link.emitter.emit_with_ack(event).await,
            None => Err(DeliveryError::Disconnected),
        }
    }

    pub fn acknowledge(&self, id: Uuid, seq: u64) {
        if let Some(link) = self.links.get(&id) {
            link.emitter.acknowledge(seq);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
