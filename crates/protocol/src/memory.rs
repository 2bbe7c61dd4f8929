//! In-process network used by tests and local dry runs.
//!
//! Enforces identity uniqueness (case-insensitive), tracks channel
//! membership, can forcibly disconnect a session and parks sessions handed
//! off by [`Connection::prepare_handoff`] until they are resumed.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use {
    async_trait::async_trait,
    tokio::sync::{broadcast, watch},
    tracing::debug,
};

use crate::{
    Connection, ConnectionEnd, DialParams, Dialer, Error, Event, HandoffState, InboundMessage,
    Result, is_channel_name,
};

const EVENT_BUFFER: usize = 256;
/// Renames tried on dial when the desired identity is taken.
const MAX_NICK_SUFFIXES: usize = 8;

type SessionId = u64;

struct Session {
    nick: String,
    ident: String,
    events: broadcast::Sender<Event>,
    /// Completion signal of the handle currently attached to this session.
    end: watch::Sender<Option<ConnectionEnd>>,
    /// Bumped on every resume; stale handles stop working.
    generation: u64,
    parked: bool,
}

#[derive(Default)]
struct NetworkState {
    sessions: HashMap<SessionId, Session>,
    nicks: HashMap<String, SessionId>,
    /// Lower-cased name → (display name, members).
    channels: BTreeMap<String, (String, BTreeSet<SessionId>)>,
    parked: HashMap<i32, SessionId>,
    next_session: SessionId,
    next_token: i32,
    fail_next_dials: u32,
    dials: u64,
}

impl NetworkState {
    fn nick_of(&self, id: SessionId) -> Option<String> {
        self.sessions.get(&id).map(|s| s.nick.clone())
    }

    fn deliver(&self, id: SessionId, event: Event) {
        if let Some(session) = self.sessions.get(&id) {
            // No subscribers (e.g. while parked) simply drops the event.
            let _ = session.events.send(event);
        }
    }

    /// Sessions sharing at least one channel with `id`, plus `id` itself.
    fn neighbours(&self, id: SessionId) -> BTreeSet<SessionId> {
        let mut out: BTreeSet<SessionId> = self
            .channels
            .values()
            .filter(|(_, members)| members.contains(&id))
            .flat_map(|(_, members)| members.iter().copied())
            .collect();
        out.insert(id);
        out
    }

    fn remove_session(&mut self, id: SessionId, reason: &str, end: ConnectionEnd) {
        let Some(nick) = self.nick_of(id) else {
            return;
        };
        let event = Event::Quit {
            who: nick.clone(),
            reason: reason.to_string(),
        };
        for peer in self.neighbours(id) {
            if peer != id {
                self.deliver(peer, event.clone());
            }
        }
        for (_, members) in self.channels.values_mut() {
            members.remove(&id);
        }
        self.channels.retain(|_, (_, members)| !members.is_empty());
        self.nicks.remove(&nick.to_lowercase());
        self.parked.retain(|_, parked| *parked != id);
        if let Some(session) = self.sessions.remove(&id) {
            session.end.send_replace(Some(end));
        }
    }
}

/// Shared handle to an in-process network. Cloning shares the network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` dials fail with a refused connection.
    pub fn fail_next_dials(&self, n: u32) {
        self.lock().fail_next_dials = n;
    }

    /// Number of dial attempts so far, failed ones included.
    pub fn dial_count(&self) -> u64 {
        self.lock().dials
    }

    /// Server-side kill of whoever holds `nick`. Returns whether anyone did.
    pub fn disconnect(&self, nick: &str) -> bool {
        let mut state = self.lock();
        let Some(id) = state.nicks.get(&nick.to_lowercase()).copied() else {
            return false;
        };
        state.remove_session(id, "Killed", ConnectionEnd::Lost("killed by server".into()));
        true
    }

    /// Whether some session currently holds `nick`.
    pub fn is_online(&self, nick: &str) -> bool {
        self.lock().nicks.contains_key(&nick.to_lowercase())
    }

    /// Members of `channel` by identity.
    pub fn members(&self, channel: &str) -> Vec<String> {
        let state = self.lock();
        state
            .channels
            .get(&channel.to_lowercase())
            .map(|(_, members)| members.iter().filter_map(|id| state.nick_of(*id)).collect())
            .unwrap_or_default()
    }

    /// Number of sessions waiting to be resumed.
    pub fn parked_count(&self) -> usize {
        self.lock().parked.len()
    }

    fn attach(&self, id: SessionId, client: &str, desired: &str) -> Arc<dyn Connection> {
        let mut state = self.lock();
        let (end_tx, end_rx) = watch::channel(None);
        let generation = match state.sessions.get_mut(&id) {
            Some(session) => {
                session.generation += 1;
                session.parked = false;
                session.end = end_tx;
                session.generation
            },
            None => 0,
        };
        Arc::new(MemoryConnection {
            network: self.clone(),
            id,
            generation,
            client: client.to_string(),
            desired: desired.to_string(),
            end: end_rx,
        })
    }
}

#[async_trait]
impl Dialer for MemoryNetwork {
    async fn dial(&self, params: &DialParams) -> Result<Arc<dyn Connection>> {
        let id = {
            let mut state = self.lock();
            state.dials += 1;
            if state.fail_next_dials > 0 {
                state.fail_next_dials -= 1;
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            let nick = (0..=MAX_NICK_SUFFIXES)
                .map(|n| format!("{}{}", params.nick, "_".repeat(n)))
                .find(|candidate| !state.nicks.contains_key(&candidate.to_lowercase()))
                .ok_or_else(|| Error::identity_taken(&params.nick))?;
            let id = state.next_session;
            state.next_session += 1;
            let (events, _) = broadcast::channel(EVENT_BUFFER);
            let (end, _) = watch::channel(None);
            state.nicks.insert(nick.to_lowercase(), id);
            state.sessions.insert(id, Session {
                nick,
                ident: params.ident.clone(),
                events,
                end,
                generation: 0,
                parked: false,
            });
            id
        };
        debug!(client = %params.client, nick = %params.nick, "memory dial");
        Ok(self.attach(id, &params.client, &params.nick))
    }

    async fn resume(
        &self,
        params: &DialParams,
        state: HandoffState,
    ) -> Result<Arc<dyn Connection>> {
        let id = self
            .lock()
            .parked
            .remove(&state.fd)
            .ok_or_else(|| Error::handshake(format!("no parked session for fd {}", state.fd)))?;
        debug!(client = %params.client, fd = state.fd, "memory resume");
        Ok(self.attach(id, &params.client, &state.desired_identity))
    }

    fn discard(&self, state: HandoffState) {
        let mut network = self.lock();
        if let Some(id) = network.parked.remove(&state.fd) {
            network.remove_session(id, "Discarded", ConnectionEnd::Quit);
        }
    }
}

/// One handle onto a [`MemoryNetwork`] session.
pub struct MemoryConnection {
    network: MemoryNetwork,
    id: SessionId,
    generation: u64,
    client: String,
    desired: String,
    end: watch::Receiver<Option<ConnectionEnd>>,
}

impl MemoryConnection {
    /// Run `f` against the session if this handle is still attached to it.
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut NetworkState, SessionId) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.network.lock();
        match state.sessions.get(&self.id) {
            Some(session) if session.generation == self.generation && !session.parked => {},
            _ => return Err(Error::NotConnected),
        }
        f(&mut state, self.id)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn client(&self) -> &str {
        &self.client
    }

    fn identity(&self) -> String {
        self.network.lock().nick_of(self.id).unwrap_or_default()
    }

    fn desired_identity(&self) -> String {
        self.desired.clone()
    }

    fn channels(&self) -> Vec<String> {
        self.network
            .lock()
            .channels
            .values()
            .filter(|(_, members)| members.contains(&self.id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn members(&self, channel: &str) -> Option<Vec<String>> {
        let state = self.network.lock();
        let (_, members) = state.channels.get(&channel.to_lowercase())?;
        if !members.contains(&self.id) {
            return None;
        }
        Some(members.iter().filter_map(|id| state.nick_of(*id)).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        match self.network.lock().sessions.get(&self.id) {
            Some(session) => session.events.subscribe(),
            // Ended: hand out a receiver that reports closed immediately.
            None => broadcast::channel(1).1,
        }
    }

    async fn send(&self, target: &str, text: &str) -> Result<()> {
        self.with_session(|state, id| {
            let Some(sender) = state.nick_of(id) else {
                return Err(Error::NotConnected);
            };
            let mut message = InboundMessage::new(sender, target, text);
            if let Some(session) = state.sessions.get(&id) {
                message.sender_mask =
                    Some(format!("{}!{}@memory", message.sender, session.ident));
            }
            if is_channel_name(target) {
                if let Some((_, members)) = state.channels.get(&target.to_lowercase()) {
                    for peer in members.iter().filter(|peer| **peer != id) {
                        state.deliver(*peer, Event::Message(message.clone()));
                    }
                }
            } else if let Some(peer) = state.nicks.get(&target.to_lowercase()).copied() {
                state.deliver(peer, Event::Message(message));
            }
            Ok(())
        })
    }

    async fn join(&self, channel: &str) -> Result<()> {
        if !is_channel_name(channel) {
            return Err(Error::message(format!("{channel:?} is not a channel")));
        }
        self.with_session(|state, id| {
            let key = channel.to_lowercase();
            let (name, members) = state
                .channels
                .entry(key)
                .or_insert_with(|| (channel.to_string(), BTreeSet::new()));
            let name = name.clone();
            if !members.insert(id) {
                return Ok(());
            }
            let members: Vec<SessionId> = members.iter().copied().collect();
            let who = state.nick_of(id).unwrap_or_default();
            for peer in members {
                state.deliver(peer, Event::Joined {
                    channel: name.clone(),
                    who: who.clone(),
                });
            }
            state.deliver(id, Event::NamesSynced { channel: name });
            Ok(())
        })
    }

    async fn part(&self, channel: &str) -> Result<()> {
        self.with_session(|state, id| {
            let key = channel.to_lowercase();
            let Some((name, members)) = state.channels.get_mut(&key) else {
                return Ok(());
            };
            let name = name.clone();
            let notify: Vec<SessionId> = members.iter().copied().collect();
            if !members.remove(&id) {
                return Ok(());
            }
            if members.is_empty() {
                state.channels.remove(&key);
            }
            let who = state.nick_of(id).unwrap_or_default();
            for peer in notify {
                state.deliver(peer, Event::Parted {
                    channel: name.clone(),
                    who: who.clone(),
                });
            }
            Ok(())
        })
    }

    async fn rename(&self, identity: &str) -> Result<()> {
        self.with_session(|state, id| {
            let key = identity.to_lowercase();
            match state.nicks.get(&key) {
                Some(holder) if *holder != id => return Err(Error::identity_taken(identity)),
                _ => {},
            }
            let Some(from) = state.nick_of(id) else {
                return Err(Error::NotConnected);
            };
            if from == identity {
                return Ok(());
            }
            state.nicks.remove(&from.to_lowercase());
            state.nicks.insert(key, id);
            if let Some(session) = state.sessions.get_mut(&id) {
                session.nick = identity.to_string();
            }
            let event = Event::Renamed {
                from,
                to: identity.to_string(),
            };
            for peer in state.neighbours(id) {
                state.deliver(peer, event.clone());
            }
            Ok(())
        })
    }

    async fn quit(&self, reason: &str) -> Result<()> {
        self.with_session(|state, id| {
            state.remove_session(id, reason, ConnectionEnd::Quit);
            Ok(())
        })
    }

    async fn prepare_handoff(&self) -> Result<HandoffState> {
        let handoff = self.with_session(|state, id| {
            let token = state.next_token + 1000;
            state.next_token += 1;
            state.parked.insert(token, id);
            let channels = state
                .channels
                .values()
                .filter(|(_, members)| members.contains(&id))
                .map(|(name, _)| name.clone())
                .collect();
            let session = state.sessions.get_mut(&id).ok_or(Error::NotConnected)?;
            session.parked = true;
            session.end.send_replace(Some(ConnectionEnd::HandedOff));
            Ok(HandoffState {
                fd: token,
                identity: session.nick.clone(),
                desired_identity: self.desired.clone(),
                channels,
                metadata: BTreeMap::new(),
            })
        })?;
        debug!(client = %self.client, fd = handoff.fd, "memory session parked");
        Ok(handoff)
    }

    async fn closed(&self) -> ConnectionEnd {
        let mut end = self.end.clone();
        match end.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(ConnectionEnd::Quit),
            Err(_) => ConnectionEnd::Lost("network dropped".into()),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn params(client: &str, nick: &str) -> DialParams {
        DialParams {
            client: client.into(),
            host: "memory".into(),
            port: 0,
            password: None,
            nick: nick.into(),
            ident: nick.into(),
            real_name: "test".into(),
        }
    }

    #[tokio::test]
    async fn taken_nick_gets_suffix_on_dial() {
        let net = MemoryNetwork::new();
        let a = net.dial(&params("a", "warden")).await.unwrap();
        let b = net.dial(&params("b", "Warden")).await.unwrap();
        assert_eq!(a.identity(), "warden");
        assert_eq!(b.identity(), "Warden_");
        assert_eq!(b.desired_identity(), "Warden");
    }

    #[tokio::test]
    async fn rename_enforces_uniqueness() {
        let net = MemoryNetwork::new();
        let a = net.dial(&params("a", "alpha")).await.unwrap();
        let b = net.dial(&params("b", "beta")).await.unwrap();
        assert!(matches!(
            b.rename("ALPHA").await,
            Err(Error::IdentityTaken { .. })
        ));
        a.rename("gamma").await.unwrap();
        b.rename("alpha").await.unwrap();
        assert_eq!(b.identity(), "alpha");
        assert!(!net.is_online("beta"));
    }

    #[tokio::test]
    async fn channel_messages_reach_other_members() {
        let net = MemoryNetwork::new();
        let a = net.dial(&params("a", "alice")).await.unwrap();
        let b = net.dial(&params("b", "bob")).await.unwrap();
        a.join("#ops").await.unwrap();
        b.join("#ops").await.unwrap();
        let mut events = b.subscribe();
        a.send("#ops", "hello").await.unwrap();
        let event = events.recv().await.unwrap();
        let Event::Message(msg) = event else {
            panic!("expected message, got {event:?}");
        };
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.sender_mask.as_deref(), Some("alice!alice@memory"));
        assert_eq!(msg.reply_target(), "#ops");
        assert_eq!(b.members("#ops").unwrap(), ["alice", "bob"]);
        assert_eq!(net.members("#OPS"), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn join_reports_names_to_joiner() {
        let net = MemoryNetwork::new();
        let a = net.dial(&params("a", "alice")).await.unwrap();
        let mut events = a.subscribe();
        a.join("#ops").await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), Event::Joined { .. }));
        assert_eq!(events.recv().await.unwrap(), Event::NamesSynced {
            channel: "#ops".into()
        });
    }

    #[tokio::test]
    async fn disconnect_ends_connection_and_notifies_peers() {
        let net = MemoryNetwork::new();
        let a = net.dial(&params("a", "alice")).await.unwrap();
        let b = net.dial(&params("b", "bob")).await.unwrap();
        a.join("#ops").await.unwrap();
        b.join("#ops").await.unwrap();
        let mut events = b.subscribe();

        assert!(net.disconnect("alice"));
        assert!(matches!(a.closed().await, ConnectionEnd::Lost(_)));
        assert!(matches!(events.recv().await.unwrap(), Event::Quit { who, .. } if who == "alice"));
        assert!(matches!(a.send("#ops", "x").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn quit_frees_identity() {
        let net = MemoryNetwork::new();
        let a = net.dial(&params("a", "alice")).await.unwrap();
        a.quit("bye").await.unwrap();
        assert_eq!(a.closed().await, ConnectionEnd::Quit);
        assert!(!net.is_online("alice"));
    }

    #[tokio::test]
    async fn handoff_parks_and_resumes_session() {
        let net = MemoryNetwork::new();
        let old = net.dial(&params("a", "alice")).await.unwrap();
        old.join("#ops").await.unwrap();

        let state = old.prepare_handoff().await.unwrap();
        assert_eq!(old.closed().await, ConnectionEnd::HandedOff);
        assert_eq!(state.channels, ["#ops"]);
        assert_eq!(net.parked_count(), 1);
        // identity stays held while parked
        assert!(net.is_online("alice"));
        assert!(matches!(old.send("#ops", "x").await, Err(Error::NotConnected)));

        let resumed = net.resume(&params("a", "alice"), state).await.unwrap();
        assert_eq!(resumed.identity(), "alice");
        assert_eq!(resumed.channels(), ["#ops"]);
        assert_eq!(net.parked_count(), 0);
        resumed.send("#ops", "still here").await.unwrap();
    }

    #[tokio::test]
    async fn discarded_session_leaves_the_network() {
        let net = MemoryNetwork::new();
        let old = net.dial(&params("a", "alice")).await.unwrap();
        let state = old.prepare_handoff().await.unwrap();
        net.discard(state);
        assert_eq!(net.parked_count(), 0);
        assert!(!net.is_online("alice"));
    }

    #[tokio::test]
    async fn resume_of_unknown_token_fails() {
        let net = MemoryNetwork::new();
        let state = HandoffState {
            fd: 99,
            identity: "x".into(),
            desired_identity: "x".into(),
            channels: vec![],
            metadata: BTreeMap::new(),
        };
        assert!(net.resume(&params("a", "x"), state).await.is_err());
    }

    #[tokio::test]
    async fn failing_dials_are_counted() {
        let net = MemoryNetwork::new();
        net.fail_next_dials(2);
        assert!(net.dial(&params("a", "alice")).await.is_err());
        assert!(net.dial(&params("a", "alice")).await.is_err());
        assert!(net.dial(&params("a", "alice")).await.is_ok());
        assert_eq!(net.dial_count(), 3);
    }
}
