//! TCP connection, registration and the per-connection I/O task.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    tokio::{
        net::TcpStream,
        sync::{broadcast, mpsc, oneshot, watch},
        time::{Instant, sleep_until, timeout},
    },
    tokio_util::{
        bytes::BytesMut,
        codec::{Framed, FramedParts},
    },
    tracing::{debug, info, warn},
};

use warden_protocol::{
    Connection, ConnectionEnd, DialParams, Dialer, Error, Event, HandoffState, Result,
    handoff::{META_PENDING_INPUT, META_SERVER},
};

use crate::{
    codec::IrcCodec,
    fd,
    message::{Message, irc_lower, sanitize},
    state::SessionState,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(60);
const RENAME_TIMEOUT: Duration = Duration::from_secs(10);
const QUIT_GRACE: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 512;
/// Longest nick tried while appending `_` during registration.
const MAX_NICK_LENGTH: usize = 30;
/// Text bytes per PRIVMSG, leaving room for the prefix the server adds.
const MAX_TEXT_BYTES: usize = 400;

type IrcFramed = Framed<TcpStream, IrcCodec>;

enum Command {
    Line(String),
    Quit(String),
    Handoff(oneshot::Sender<Result<(i32, String)>>),
}

struct Shared {
    state: RwLock<SessionState>,
    events: broadcast::Sender<Event>,
    /// Nicks the server refused after registration.
    nick_errors: broadcast::Sender<String>,
    end: watch::Sender<Option<ConnectionEnd>>,
}

impl Shared {
    fn state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, end: ConnectionEnd) {
        self.end.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(end);
            true
        });
    }
}

/// Opens plain-text IRC connections.
#[derive(Debug, Clone, Default)]
pub struct IrcDialer;

impl IrcDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for IrcDialer {
    async fn dial(&self, params: &DialParams) -> Result<Arc<dyn Connection>> {
        let stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((params.host.as_str(), params.port)),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "connect",
        })??;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, IrcCodec::default());

        let state = timeout(REGISTER_TIMEOUT, register(&mut framed, params))
            .await
            .map_err(|_| Error::Timeout {
                operation: "registration",
            })??;
        info!(
            client = %params.client,
            nick = %state.nick,
            server = state.server.as_deref().unwrap_or("?"),
            "registered"
        );
        Ok(IrcConnection::spawn(params, framed, state))
    }

    async fn resume(
        &self,
        params: &DialParams,
        handoff: HandoffState,
    ) -> Result<Arc<dyn Connection>> {
        let stream = fd::adopt(handoff.fd)?;
        let mut parts = FramedParts::new::<&str>(stream, IrcCodec::default());
        if let Some(pending) = handoff.metadata.get(META_PENDING_INPUT) {
            parts.read_buf = BytesMut::from(pending.as_bytes());
        }
        let framed = Framed::from_parts(parts);

        let mut state = SessionState::resumed(&handoff.identity, &handoff.channels);
        state.server = handoff.metadata.get(META_SERVER).cloned();
        let desired = DialParams {
            nick: handoff.desired_identity.clone(),
            ..params.clone()
        };
        let connection = IrcConnection::spawn(&desired, framed, state);
        // Member lists were not carried over.
        for channel in &handoff.channels {
            connection.send_line(Message::new("NAMES", [channel.as_str()]).to_string())?;
        }
        info!(client = %params.client, fd = handoff.fd, nick = %handoff.identity, "resumed");
        Ok(connection)
    }

    fn discard(&self, handoff: HandoffState) {
        match fd::release(handoff.fd) {
            Ok(()) => info!(fd = handoff.fd, nick = %handoff.identity, "closed unclaimed inherited connection"),
            Err(e) => warn!(fd = handoff.fd, error = %e, "failed to close inherited connection"),
        }
    }
}

async fn register(framed: &mut IrcFramed, params: &DialParams) -> Result<SessionState> {
    let mut nick = params.nick.clone();
    if let Some(password) = params.password() {
        send(framed, Message::new("PASS", [password])).await?;
    }
    send(framed, Message::new("NICK", [nick.as_str()])).await?;
    send(
        framed,
        Message::new("USER", [
            params.ident.as_str(),
            "0",
            "*",
            params.real_name.as_str(),
        ]),
    )
    .await?;

    while let Some(line) = framed.next().await {
        let line = line.map_err(|e| Error::external("read failed during registration", e))?;
        let Some(msg) = Message::parse(&line) else {
            continue;
        };
        match msg.command.as_str() {
            "PING" => {
                send(framed, Message::new("PONG", msg.params.clone())).await?;
            },
            "001" => {
                let mut state = SessionState::new(nick);
                state.apply(&msg);
                return Ok(state);
            },
            "432" | "433" | "436" | "437" => {
                nick.push('_');
                if nick.len() > MAX_NICK_LENGTH {
                    return Err(Error::identity_taken(&params.nick));
                }
                debug!(client = %params.client, %nick, "nick unavailable, retrying");
                send(framed, Message::new("NICK", [nick.as_str()])).await?;
            },
            "464" => return Err(Error::handshake("password incorrect")),
            "ERROR" => {
                return Err(Error::handshake(msg.param(0).unwrap_or("server error")));
            },
            _ => {},
        }
    }
    Err(Error::handshake("server closed the connection during registration"))
}

async fn send(framed: &mut IrcFramed, msg: Message) -> Result<()> {
    framed
        .send(msg.to_string())
        .await
        .map_err(|e| Error::external("write failed", e))
}

/// A registered IRC session.
pub struct IrcConnection {
    client: String,
    desired: String,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl IrcConnection {
    fn spawn(params: &DialParams, framed: IrcFramed, state: SessionState) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (nick_errors, _) = broadcast::channel(16);
        let (end, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            events,
            nick_errors,
            end,
        });
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(
            params.client.clone(),
            framed,
            Arc::clone(&shared),
            rx,
        ));
        Arc::new(Self {
            client: params.client.clone(),
            desired: params.nick.clone(),
            shared,
            commands,
        })
    }

    fn send_line(&self, line: String) -> Result<()> {
        self.commands
            .send(Command::Line(line))
            .map_err(|_| Error::NotConnected)
    }
}

#[async_trait]
impl Connection for IrcConnection {
    fn client(&self) -> &str {
        &self.client
    }

    fn identity(&self) -> String {
        self.shared.state().nick.clone()
    }

    fn desired_identity(&self) -> String {
        self.desired.clone()
    }

    fn channels(&self) -> Vec<String> {
        self.shared.state().channels()
    }

    fn members(&self, channel: &str) -> Option<Vec<String>> {
        self.shared.state().members(channel)
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    async fn send(&self, target: &str, text: &str) -> Result<()> {
        let target = sanitize(target);
        for line in text.lines() {
            for chunk in split_text(line, MAX_TEXT_BYTES) {
                self.send_line(Message::new("PRIVMSG", [target.as_str(), chunk]).to_string())?;
            }
        }
        Ok(())
    }

    async fn join(&self, channel: &str) -> Result<()> {
        self.send_line(Message::new("JOIN", [sanitize(channel)]).to_string())
    }

    async fn part(&self, channel: &str) -> Result<()> {
        self.send_line(Message::new("PART", [sanitize(channel)]).to_string())
    }

    async fn rename(&self, identity: &str) -> Result<()> {
        let identity = sanitize(identity);
        if self.shared.state().nick == identity {
            return Ok(());
        }
        let wanted = irc_lower(&identity);
        let mut events = self.shared.events.subscribe();
        let mut errors = self.shared.nick_errors.subscribe();
        self.send_line(Message::new("NICK", [identity.as_str()]).to_string())?;

        let wait = async {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(Event::Renamed { from, to })
                            if irc_lower(&to) == wanted && self.shared.state().is_me(&to) =>
                        {
                            debug!(client = %self.client, %from, %to, "nick changed");
                            return Ok(());
                        },
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
                        Err(broadcast::error::RecvError::Closed) => return Err(Error::NotConnected),
                    },
                    refused = errors.recv() => match refused {
                        Ok(nick) if irc_lower(&nick) == wanted => {
                            return Err(Error::identity_taken(identity.as_str()));
                        },
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
                        Err(broadcast::error::RecvError::Closed) => return Err(Error::NotConnected),
                    },
                }
            }
        };
        timeout(RENAME_TIMEOUT, wait)
            .await
            .map_err(|_| Error::Timeout {
                operation: "nick change",
            })?
    }

    async fn quit(&self, reason: &str) -> Result<()> {
        self.commands
            .send(Command::Quit(sanitize(reason)))
            .map_err(|_| Error::NotConnected)?;
        self.closed().await;
        Ok(())
    }

    async fn prepare_handoff(&self) -> Result<HandoffState> {
        let (reply, packaged) = oneshot::channel();
        self.commands
            .send(Command::Handoff(reply))
            .map_err(|_| Error::NotConnected)?;
        let (fd, pending) = packaged.await.map_err(|_| Error::NotConnected)??;

        let state = self.shared.state();
        let mut metadata = BTreeMap::new();
        if let Some(server) = &state.server {
            metadata.insert(META_SERVER.to_string(), server.clone());
        }
        if !pending.is_empty() {
            metadata.insert(META_PENDING_INPUT.to_string(), pending);
        }
        Ok(HandoffState {
            fd,
            identity: state.nick.clone(),
            desired_identity: self.desired.clone(),
            channels: state.channels(),
            metadata,
        })
    }

    async fn closed(&self) -> ConnectionEnd {
        let mut end = self.shared.end.subscribe();
        match end.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(ConnectionEnd::Quit),
            Err(_) => ConnectionEnd::Lost("connection task ended".into()),
        }
    }
}

enum Exit {
    Ended(ConnectionEnd),
    Handoff(oneshot::Sender<Result<(i32, String)>>),
}

/// Owns the socket: writes queued lines, reads and applies server lines.
async fn run(
    client: String,
    mut framed: IrcFramed,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut quit_deadline: Option<Instant> = None;

    let exit = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Line(line)) => {
                    if let Err(e) = framed.send(line).await {
                        break Exit::Ended(ConnectionEnd::Lost(format!("write failed: {e}")));
                    }
                },
                Some(Command::Quit(reason)) => {
                    let _ = framed.send(Message::new("QUIT", [reason]).to_string()).await;
                    quit_deadline = Some(Instant::now() + QUIT_GRACE);
                },
                Some(Command::Handoff(reply)) => break Exit::Handoff(reply),
                // Every handle is gone.
                None => break Exit::Ended(ConnectionEnd::Quit),
            },
            frame = framed.next() => match frame {
                Some(Ok(line)) => {
                    let Some(msg) = Message::parse(&line) else {
                        continue;
                    };
                    match msg.command.as_str() {
                        "PING" => {
                            let pong = Message::new("PONG", msg.params.clone()).to_string();
                            if let Err(e) = framed.send(pong).await {
                                break Exit::Ended(ConnectionEnd::Lost(format!("write failed: {e}")));
                            }
                        },
                        "ERROR" if quit_deadline.is_none() => {
                            let reason = msg.param(0).unwrap_or("server error").to_string();
                            break Exit::Ended(ConnectionEnd::Lost(reason));
                        },
                        "432" | "433" | "436" | "437" => {
                            if let Some(nick) = msg.param(1) {
                                let _ = shared.nick_errors.send(nick.to_string());
                            }
                        },
                        _ => {},
                    }
                    let events = shared
                        .state
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .apply(&msg);
                    for event in events {
                        let _ = shared.events.send(event);
                    }
                },
                Some(Err(e)) => break Exit::Ended(ConnectionEnd::Lost(format!("read failed: {e}"))),
                None if quit_deadline.is_some() => break Exit::Ended(ConnectionEnd::Quit),
                None => break Exit::Ended(ConnectionEnd::Lost("server closed the connection".into())),
            },
            _ = sleep_until(quit_deadline.unwrap_or_else(Instant::now)), if quit_deadline.is_some() => {
                break Exit::Ended(ConnectionEnd::Quit);
            },
        }
    };

    match exit {
        Exit::Ended(end) => {
            match &end {
                ConnectionEnd::Lost(reason) => warn!(%client, %reason, "connection lost"),
                _ => debug!(%client, "connection closed"),
            }
            shared.finish(end);
        },
        Exit::Handoff(reply) => {
            let packaged = package(framed).await;
            let ok = packaged.is_ok();
            let _ = reply.send(packaged);
            shared.finish(if ok {
                ConnectionEnd::HandedOff
            } else {
                ConnectionEnd::Lost("handoff failed".into())
            });
        },
    }
}

/// Flush, then split the socket from its buffers and duplicate it.
/// Returns the duplicate descriptor and any unread input.
async fn package(mut framed: IrcFramed) -> Result<(i32, String)> {
    SinkExt::<String>::flush(&mut framed)
        .await
        .map_err(|e| Error::external("flush before handoff failed", e))?;
    let parts = framed.into_parts();
    let fd = fd::duplicate(&parts.io)?;
    let pending = String::from_utf8_lossy(&parts.read_buf).into_owned();
    // `parts.io` closes the original descriptor; the duplicate stays open.
    Ok((fd, pending))
}

/// Split `text` into pieces of at most `max` bytes on char boundaries.
fn split_text(text: &str, max: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        out.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}
