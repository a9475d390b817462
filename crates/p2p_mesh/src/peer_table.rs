//! Peer table: every peer this process knows about, direct or relay-only.
//!
//! A slot in `Direct` mode always owns a live [`Link`]; a slot without a
//! link is `RelayOnly`. All mutations go through this type so the invariant
//! cannot be broken from outside.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use p2p_proto::wire::write_frame;
use p2p_proto::{NetError, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::peer::{Admission, PeerAddr, PeerHandle, PeerKey, TransportMode};

pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a direct connection. The read side lives in the reader
/// task, which exits once `cancel` fires.
pub(crate) struct Link {
    writer: Mutex<BoxWriter>,
    cancel: CancellationToken,
    write_timeout: Duration,
}

impl Link {
    pub(crate) fn new(
        writer: BoxWriter,
        cancel: CancellationToken,
        write_timeout: Duration,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            cancel,
            write_timeout,
        }
    }

    /// Write one frame. Fails with `TransportLost` once the link is
    /// cancelled or when the peer stops draining its socket for longer
    /// than the write timeout.
    pub(crate) async fn send(&self, data: &[u8]) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(NetError::TransportLost("connection closed".into()))
            }
            sent = self.write(data) => sent,
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, write_frame(&mut *writer, data)).await {
            Ok(sent) => sent,
            Err(_) => Err(NetError::TransportLost(format!(
                "write stalled for {:?}",
                self.write_timeout
            ))),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the link and half-close the socket if no write holds it.
    /// A write in flight aborts on the cancellation and the socket closes
    /// when the last handle drops.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.shutdown().await.ok();
        }
    }
}

struct PeerSlot {
    handle: PeerHandle,
    link: Option<Arc<Link>>,
}

/// Peers a broadcast should reach, taken under one lock so a peer that is
/// upgraded mid-send is counted in exactly one list.
pub(crate) struct DeliveryPlan {
    pub direct: Vec<(PeerHandle, Arc<Link>)>,
    pub relay: Vec<PeerHandle>,
}

#[derive(Default)]
pub struct PeerTable {
    slots: HashMap<PeerKey, PeerSlot>,
    by_id: HashMap<String, PeerKey>,
    next_key: PeerKey,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_key(&mut self) -> PeerKey {
        self.next_key += 1;
        self.next_key
    }

    /// Add a peer reached over a fresh direct socket.
    pub(crate) fn insert_direct(
        &mut self,
        address: PeerAddr,
        admission: Admission,
        link: Arc<Link>,
    ) -> PeerHandle {
        let key = self.allocate_key();
        let handle = PeerHandle::new(key, None, address, admission, TransportMode::Direct);
        self.slots.insert(
            key,
            PeerSlot {
                handle: handle.clone(),
                link: Some(link),
            },
        );
        handle
    }

    /// Create or refresh a relay-known peer. An existing slot keeps its
    /// transport mode; only relay-only slots pick up the new address.
    /// Returns the handle and whether it was newly created.
    pub fn upsert_relay(&mut self, id: &str, address: PeerAddr) -> (PeerHandle, bool) {
        if let Some(slot) = self.by_id.get(id).and_then(|key| self.slots.get_mut(key)) {
            if slot.handle.is_relay_only() {
                slot.handle.address = address;
            }
            slot.handle.mark_seen();
            return (slot.handle.clone(), false);
        }

        let key = self.allocate_key();
        let handle = PeerHandle::new(
            key,
            Some(id.to_string()),
            address,
            Admission::Unconfirmed,
            TransportMode::RelayOnly,
        );
        self.by_id.insert(id.to_string(), key);
        self.slots.insert(
            key,
            PeerSlot {
                handle: handle.clone(),
                link: None,
            },
        );
        (handle, true)
    }

    /// Attach a direct connection to an existing slot, making it Direct and
    /// Approved. If the slot already has a link the new one is not stored
    /// and `false` is returned alongside the handle.
    pub(crate) fn attach(&mut self, key: PeerKey, link: Arc<Link>) -> Result<(PeerHandle, bool)> {
        let slot = self
            .slots
            .get_mut(&key)
            .ok_or_else(|| NetError::UnknownPeer(key.to_string()))?;
        if slot.link.is_some() {
            return Ok((slot.handle.clone(), false));
        }
        slot.link = Some(link);
        slot.handle.transport = TransportMode::Direct;
        slot.handle.admission = Admission::Approved;
        slot.handle.mark_seen();
        Ok((slot.handle.clone(), true))
    }

    /// Drop `link` from its slot if it is still the slot's current link.
    /// Relay-known peers fall back to RelayOnly; direct-only peers are
    /// removed. Returns the peer as it was before the change.
    pub(crate) fn detach(&mut self, key: PeerKey, link: &Arc<Link>) -> Option<PeerHandle> {
        let slot = self.slots.get_mut(&key)?;
        match &slot.link {
            Some(current) if Arc::ptr_eq(current, link) => {}
            _ => return None,
        }
        let before = slot.handle.clone();
        if slot.handle.id.is_some() {
            slot.link = None;
            slot.handle.transport = TransportMode::RelayOnly;
        } else {
            self.slots.remove(&key);
        }
        Some(before)
    }

    pub fn approve(&mut self, key: PeerKey) -> Result<PeerHandle> {
        let slot = self
            .slots
            .get_mut(&key)
            .ok_or_else(|| NetError::UnknownPeer(key.to_string()))?;
        if slot.handle.admission != Admission::Unconfirmed {
            return Err(NetError::NotPending(slot.handle.to_string()));
        }
        slot.handle.admission = Admission::Approved;
        Ok(slot.handle.clone())
    }

    /// Approve without complaining if the peer already is.
    pub fn ensure_approved(&mut self, key: PeerKey) -> Option<PeerHandle> {
        let slot = self.slots.get_mut(&key)?;
        slot.handle.admission = Admission::Approved;
        Some(slot.handle.clone())
    }

    pub fn set_name(&mut self, key: PeerKey, name: &str) -> Result<PeerHandle> {
        let slot = self
            .slots
            .get_mut(&key)
            .ok_or_else(|| NetError::UnknownPeer(key.to_string()))?;
        slot.handle.display_name = Some(name.to_string());
        Ok(slot.handle.clone())
    }

    pub fn set_port(&mut self, key: PeerKey, port: u16) -> Result<PeerHandle> {
        let slot = self
            .slots
            .get_mut(&key)
            .ok_or_else(|| NetError::UnknownPeer(key.to_string()))?;
        slot.handle.address.port = port;
        Ok(slot.handle.clone())
    }

    pub fn touch(&mut self, key: PeerKey) {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.handle.mark_seen();
        }
    }

    pub fn get(&self, key: PeerKey) -> Option<&PeerHandle> {
        self.slots.get(&key).map(|s| &s.handle)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&PeerHandle> {
        self.by_id.get(id).and_then(|key| self.get(*key))
    }

    #[cfg(test)]
    pub(crate) fn link(&self, key: PeerKey) -> Option<Arc<Link>> {
        self.slots.get(&key).and_then(|s| s.link.clone())
    }

    pub(crate) fn delivery_plan(&self) -> DeliveryPlan {
        let mut plan = DeliveryPlan {
            direct: Vec::new(),
            relay: Vec::new(),
        };
        for slot in self.slots.values() {
            if !slot.handle.is_approved() {
                continue;
            }
            match &slot.link {
                Some(link) => plan.direct.push((slot.handle.clone(), link.clone())),
                None => plan.relay.push(slot.handle.clone()),
            }
        }
        plan
    }

    pub fn all(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self.slots.values().map(|s| s.handle.clone()).collect();
        peers.sort_by_key(|p| p.key);
        peers
    }

    pub fn pending(&self) -> Vec<PeerHandle> {
        self.filtered(|p| p.admission == Admission::Unconfirmed)
    }

    pub fn approved(&self) -> Vec<PeerHandle> {
        self.filtered(|p| p.is_approved())
    }

    /// Every peer that carries a relay id, whatever its transport.
    pub fn relay_known(&self) -> Vec<PeerHandle> {
        self.filtered(|p| p.id.is_some())
    }

    fn filtered(&self, pred: impl Fn(&PeerHandle) -> bool) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self
            .slots
            .values()
            .map(|s| &s.handle)
            .filter(|p| pred(p))
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.key);
        peers
    }

    /// Drop relay-only peers nobody approved that have not been seen for
    /// `max_age`.
    pub fn prune_relay_only(&mut self, max_age: Duration, now: Instant) -> Vec<PeerHandle> {
        let stale: Vec<PeerKey> = self
            .slots
            .values()
            .filter(|s| s.link.is_none())
            .filter(|s| s.handle.admission == Admission::Unconfirmed)
            .filter(|s| now.saturating_duration_since(s.handle.last_seen) > max_age)
            .map(|s| s.handle.key)
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.remove(key))
            .collect()
    }

    pub fn remove(&mut self, key: PeerKey) -> Option<PeerHandle> {
        let slot = self.slots.remove(&key)?;
        if let Some(id) = &slot.handle.id {
            self.by_id.remove(id);
        }
        if let Some(link) = &slot.link {
            link.token().cancel();
        }
        Some(slot.handle)
    }

    /// Empty the table, returning every link that still needs closing.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Link>> {
        self.by_id.clear();
        self.slots.drain().filter_map(|(_, s)| s.link).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_link() -> Arc<Link> {
        Arc::new(Link::new(
            Box::new(tokio::io::sink()),
            CancellationToken::new(),
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn direct_peers_hold_links() {
        let mut table = PeerTable::new();
        let link = sink_link();
        let peer =
            table.insert_direct(PeerAddr::new("10.0.0.1", 9000), Admission::Unconfirmed, link);
        assert!(peer.is_direct());
        assert!(table.link(peer.key).is_some());
        assert_eq!(table.pending().len(), 1);
        assert!(table.approved().is_empty());
    }

    #[test]
    fn approve_only_from_unconfirmed() {
        let mut table = PeerTable::new();
        let peer = table.insert_direct(
            PeerAddr::new("10.0.0.1", 9000),
            Admission::Unconfirmed,
            sink_link(),
        );

        let approved = table.approve(peer.key).unwrap();
        assert!(approved.is_approved());
        assert!(matches!(table.approve(peer.key), Err(NetError::NotPending(_))));
        assert!(matches!(table.approve(999), Err(NetError::UnknownPeer(_))));
    }

    #[test]
    fn upsert_relay_refreshes_without_downgrading_direct() {
        let mut table = PeerTable::new();
        let (peer, is_new) = table.upsert_relay("a1", PeerAddr::new("10.0.0.1", 9000));
        assert!(is_new);
        assert!(peer.is_relay_only());
        assert_eq!(peer.admission, Admission::Unconfirmed);

        let (again, is_new) = table.upsert_relay("a1", PeerAddr::new("10.0.0.9", 9001));
        assert!(!is_new);
        assert_eq!(again.key, peer.key);
        assert_eq!(again.address, PeerAddr::new("10.0.0.9", 9001));

        let (attached, stored) = table.attach(peer.key, sink_link()).unwrap();
        assert!(stored);
        assert!(attached.is_direct());
        assert!(attached.is_approved());

        let (after, _) = table.upsert_relay("a1", PeerAddr::new("192.168.1.1", 1));
        assert!(after.is_direct());
        assert_eq!(after.address, PeerAddr::new("10.0.0.9", 9001));
    }

    #[test]
    fn second_attach_is_ignored() {
        let mut table = PeerTable::new();
        let (peer, _) = table.upsert_relay("a1", PeerAddr::new("10.0.0.1", 9000));
        let first = sink_link();
        table.attach(peer.key, first.clone()).unwrap();
        let (_, stored) = table.attach(peer.key, sink_link()).unwrap();
        assert!(!stored);
        assert!(Arc::ptr_eq(&table.link(peer.key).unwrap(), &first));
    }

    #[test]
    fn detach_reverts_relay_peers_and_removes_direct_ones() {
        let mut table = PeerTable::new();
        let (relay_peer, _) = table.upsert_relay("a1", PeerAddr::new("10.0.0.1", 9000));
        let relay_link = sink_link();
        table.attach(relay_peer.key, relay_link.clone()).unwrap();

        let direct_link = sink_link();
        let direct = table.insert_direct(
            PeerAddr::new("10.0.0.2", 9000),
            Admission::Approved,
            direct_link.clone(),
        );

        // a stale link must not detach anything
        assert!(table.detach(relay_peer.key, &sink_link()).is_none());

        assert!(table.detach(relay_peer.key, &relay_link).is_some());
        let reverted = table.get(relay_peer.key).unwrap();
        assert!(reverted.is_relay_only());
        assert!(reverted.is_approved());
        assert!(table.link(relay_peer.key).is_none());

        assert!(table.detach(direct.key, &direct_link).is_some());
        assert!(table.get(direct.key).is_none());
        assert!(table.detach(direct.key, &direct_link).is_none());
    }

    #[test]
    fn delivery_plan_splits_by_transport() {
        let mut table = PeerTable::new();
        let approved = PeerAddr::new("10.0.0.1", 1);
        table.insert_direct(approved, Admission::Approved, sink_link());
        let unconfirmed = PeerAddr::new("10.0.0.2", 2);
        table.insert_direct(unconfirmed, Admission::Unconfirmed, sink_link());
        let (relay, _) = table.upsert_relay("r1", PeerAddr::new("10.0.0.3", 3));
        table.upsert_relay("r2", PeerAddr::new("10.0.0.4", 4));
        table.ensure_approved(relay.key);

        let plan = table.delivery_plan();
        assert_eq!(plan.direct.len(), 1);
        assert_eq!(plan.relay.len(), 1);
        assert_eq!(plan.relay[0].id.as_deref(), Some("r1"));
    }

    #[test]
    fn prune_only_touches_stale_unapproved_relay_peers() {
        let mut table = PeerTable::new();
        let (stale, _) = table.upsert_relay("stale", PeerAddr::new("10.0.0.1", 1));
        let (kept, _) = table.upsert_relay("kept", PeerAddr::new("10.0.0.2", 2));
        table.ensure_approved(kept.key);
        let direct = PeerAddr::new("10.0.0.3", 3);
        table.insert_direct(direct, Admission::Unconfirmed, sink_link());

        let later = Instant::now() + Duration::from_secs(300);
        let removed = table.prune_relay_only(Duration::from_secs(120), later);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, stale.key);
        assert!(table.get_by_id("stale").is_none());
        assert!(table.get_by_id("kept").is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn naming_and_port_changes() {
        let mut table = PeerTable::new();
        let peer = table.insert_direct(
            PeerAddr::new("10.0.0.1", 1),
            Admission::Approved,
            sink_link(),
        );
        let named = table.set_name(peer.key, "bob").unwrap();
        assert_eq!(named.display_name.as_deref(), Some("bob"));
        let moved = table.set_port(peer.key, 4242).unwrap();
        assert_eq!(moved.address.port, 4242);
        assert!(table.set_name(77, "nobody").is_err());
    }

    #[test]
    fn remove_and_drain() {
        let mut table = PeerTable::new();
        let (peer, _) = table.upsert_relay("a1", PeerAddr::new("10.0.0.1", 1));
        let direct = PeerAddr::new("10.0.0.2", 2);
        table.insert_direct(direct, Admission::Approved, sink_link());
        assert!(table.remove(peer.key).is_some());
        assert!(table.get_by_id("a1").is_none());

        let links = table.drain();
        assert_eq!(links.len(), 1);
        assert!(table.is_empty());
    }
}
