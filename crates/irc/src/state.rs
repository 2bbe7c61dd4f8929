//! Session state tracked from the server's messages: our nick and the
//! members of every channel we are in.

use std::collections::BTreeMap;

use warden_protocol::{Event, InboundMessage};

use crate::message::{Message, irc_lower};

/// Membership prefixes that can precede names in a NAMES reply.
const NAME_PREFIXES: &[char] = &['@', '+', '%', '~', '&', '!'];

#[derive(Debug, Default)]
struct Channel {
    name: String,
    /// Lower-cased nick → nick as shown by the server.
    members: BTreeMap<String, String>,
    /// Members collected from 353 replies until the closing 366.
    pending: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub nick: String,
    pub server: Option<String>,
    channels: BTreeMap<String, Channel>,
}

impl SessionState {
    pub fn new(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            ..Self::default()
        }
    }

    /// State for a session adopted from a previous process image. Member
    /// lists start empty until the next NAMES reply.
    pub fn resumed(nick: impl Into<String>, channels: &[String]) -> Self {
        let mut state = Self::new(nick);
        for channel in channels {
            state.channels.insert(irc_lower(channel), Channel {
                name: channel.clone(),
                ..Channel::default()
            });
        }
        state
    }

    pub fn is_me(&self, nick: &str) -> bool {
        irc_lower(nick) == irc_lower(&self.nick)
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.values().map(|c| c.name.clone()).collect()
    }

    pub fn members(&self, channel: &str) -> Option<Vec<String>> {
        self.channels
            .get(&irc_lower(channel))
            .map(|c| c.members.values().cloned().collect())
    }

    /// Apply one server message and return the events it produces.
    pub fn apply(&mut self, msg: &Message) -> Vec<Event> {
        let who = msg.nick().unwrap_or_default().to_string();
        match msg.command.as_str() {
            "001" => {
                if let Some(nick) = msg.param(0) {
                    self.nick = nick.to_string();
                }
                self.server = msg.prefix.clone();
                Vec::new()
            },
            "JOIN" => {
                let Some(channel) = msg.param(0) else {
                    return Vec::new();
                };
                let key = irc_lower(channel);
                if self.is_me(&who) {
                    self.channels.insert(key.clone(), Channel {
                        name: channel.to_string(),
                        ..Channel::default()
                    });
                }
                let Some(entry) = self.channels.get_mut(&key) else {
                    return Vec::new();
                };
                entry.members.insert(irc_lower(&who), who.clone());
                vec![Event::Joined {
                    channel: entry.name.clone(),
                    who,
                }]
            },
            "PART" => match msg.param(0) {
                Some(channel) => self.leave(channel, &who),
                None => Vec::new(),
            },
            "KICK" => match (msg.param(0), msg.param(1)) {
                (Some(channel), Some(victim)) => {
                    let victim = victim.to_string();
                    self.leave(channel, &victim)
                },
                _ => Vec::new(),
            },
            "QUIT" => {
                let key = irc_lower(&who);
                for channel in self.channels.values_mut() {
                    channel.members.remove(&key);
                }
                vec![Event::Quit {
                    who,
                    reason: msg.param(0).unwrap_or_default().to_string(),
                }]
            },
            "NICK" => {
                let Some(to) = msg.param(0) else {
                    return Vec::new();
                };
                if self.is_me(&who) {
                    self.nick = to.to_string();
                }
                let from_key = irc_lower(&who);
                for channel in self.channels.values_mut() {
                    if channel.members.remove(&from_key).is_some() {
                        channel.members.insert(irc_lower(to), to.to_string());
                    }
                }
                vec![Event::Renamed {
                    from: who,
                    to: to.to_string(),
                }]
            },
            "353" => {
                if let (Some(channel), Some(names)) = (msg.param(2), msg.param(3))
                    && let Some(entry) = self.channels.get_mut(&irc_lower(channel))
                {
                    let pending = entry.pending.get_or_insert_with(BTreeMap::new);
                    for name in names.split_whitespace() {
                        let name = name.trim_start_matches(NAME_PREFIXES);
                        if !name.is_empty() {
                            pending.insert(irc_lower(name), name.to_string());
                        }
                    }
                }
                Vec::new()
            },
            "366" => {
                let Some(entry) = msg
                    .param(1)
                    .and_then(|channel| self.channels.get_mut(&irc_lower(channel)))
                else {
                    return Vec::new();
                };
                entry.members = entry.pending.take().unwrap_or_default();
                vec![Event::NamesSynced {
                    channel: entry.name.clone(),
                }]
            },
            "PRIVMSG" => match (msg.param(0), msg.param(1)) {
                // CTCP requests are not commands.
                (Some(target), Some(text)) if !text.starts_with('\u{1}') => {
                    vec![Event::Message(InboundMessage {
                        sender: who,
                        sender_mask: msg.prefix.clone(),
                        target: target.to_string(),
                        text: text.to_string(),
                    })]
                },
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn leave(&mut self, channel: &str, who: &str) -> Vec<Event> {
        let key = irc_lower(channel);
        let Some(entry) = self.channels.get_mut(&key) else {
            return Vec::new();
        };
        entry.members.remove(&irc_lower(who));
        let event = Event::Parted {
            channel: entry.name.clone(),
            who: who.to_string(),
        };
        if self.is_me(who) {
            self.channels.remove(&key);
        }
        vec![event]
    }
}
