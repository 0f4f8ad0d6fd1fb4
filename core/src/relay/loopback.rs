// Loopback relay: routes signals and chat between users in one process

use crate::chat::types::now_ms;
use crate::chat::{ChatNotification, ChatService, StoredMessage, VoiceNote};
use crate::signal::{IceCandidate, InboundSignal, SessionDescription, Signal, SignalTransport, TransportError};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// What a registered user receives
pub struct RelayInbox {
    pub signals: UnboundedReceiver<InboundSignal>,
    pub chat: UnboundedReceiver<ChatNotification>,
}

/// Counters for what passed through the relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub signals_relayed: u64,
    pub messages_relayed: u64,
    pub undeliverable: u64,
}

struct Connection {
    signals: UnboundedSender<InboundSignal>,
    chat: UnboundedSender<ChatNotification>,
}

#[derive(Default)]
struct RelayState {
    connections: HashMap<String, Connection>,
    /// Everyone who has ever connected
    known: BTreeSet<String>,
    logged_in: BTreeSet<String>,
    groups: BTreeMap<String, BTreeSet<String>>,
    history: HashMap<String, Vec<StoredMessage>>,
    pending: HashMap<String, Vec<StoredMessage>>,
    stats: RelayStats,
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<RwLock<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `user`. Registering again replaces the previous inbox.
    pub fn register(&self, user: &str) -> RelayInbox {
        let (signal_tx, signals) = mpsc::unbounded();
        let (chat_tx, chat) = mpsc::unbounded();
        let mut state = self.state.write();
        state.known.insert(user.to_string());
        let replaced = state.connections.insert(
            user.to_string(),
            Connection {
                signals: signal_tx,
                chat: chat_tx,
            },
        );
        drop(state);
        if replaced.is_some() {
            tracing::debug!("{} reconnected to relay", user);
        }
        RelayInbox { signals, chat }
    }

    /// Disconnect `user`; others see them go offline
    pub fn unregister(&self, user: &str) {
        let was_online = {
            let mut state = self.state.write();
            state.connections.remove(user);
            state.logged_in.remove(user)
        };
        if was_online {
            self.broadcast_presence(user, false);
        }
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.state.read().connections.contains_key(user)
    }

    pub fn stats(&self) -> RelayStats {
        self.state.read().stats.clone()
    }

    pub fn transport(&self, user: &str) -> LoopbackTransport {
        LoopbackTransport {
            relay: self.clone(),
            user: user.to_string(),
        }
    }

    pub fn chat_service(&self) -> LoopbackChatService {
        LoopbackChatService { relay: self.clone() }
    }

    fn deliver_signal(&self, from: &str, to: &str, signal: Signal) -> Result<(), TransportError> {
        let mut state = self.state.write();
        let delivered = state
            .connections
            .get(to)
            .map(|conn| conn.signals.unbounded_send(InboundSignal::new(from, signal)).is_ok())
            .unwrap_or(false);
        if delivered {
            state.stats.signals_relayed += 1;
            Ok(())
        } else {
            state.stats.undeliverable += 1;
            Err(TransportError::RemoteUnavailable(format!("user not connected: {}", to)))
        }
    }

    fn deliver_chat(&self, to: &str, notification: ChatNotification) -> Result<(), TransportError> {
        let mut state = self.state.write();
        let delivered = state
            .connections
            .get(to)
            .map(|conn| conn.chat.unbounded_send(notification).is_ok())
            .unwrap_or(false);
        if delivered {
            state.stats.messages_relayed += 1;
            Ok(())
        } else {
            state.stats.undeliverable += 1;
            Err(TransportError::RemoteUnavailable(format!("user not connected: {}", to)))
        }
    }

    /// Push a text message to `to`, or queue it if `to` is known but away
    fn deliver_or_queue(&self, to: &str, notification: ChatNotification, record: &StoredMessage) -> Result<(), TransportError> {
        if self.deliver_chat(to, notification).is_ok() {
            return Ok(());
        }
        let mut state = self.state.write();
        if !state.known.contains(to) {
            return Err(TransportError::RemoteUnavailable(format!("user not found: {}", to)));
        }
        state.pending.entry(to.to_string()).or_default().push(record.clone());
        tracing::debug!("{} is away; message queued", to);
        Ok(())
    }

    /// Append `record` to the history of everyone in `parties`
    fn remember(&self, parties: &[&str], record: &StoredMessage) {
        let mut state = self.state.write();
        for party in parties {
            state
                .history
                .entry(party.to_string())
                .or_default()
                .push(record.clone());
        }
    }

    /// Every member of `group` except `from`
    fn group_recipients(&self, from: &str, group: &str) -> Result<Vec<String>, TransportError> {
        let state = self.state.read();
        let members = state
            .groups
            .get(group)
            .ok_or_else(|| TransportError::Rejected(format!("unknown group: {}", group)))?;
        if !members.contains(from) {
            return Err(TransportError::Rejected(format!("{} is not a member of {}", from, group)));
        }
        Ok(members.iter().filter(|m| *m != from).cloned().collect())
    }

    fn fan_out(&self, recipients: Vec<String>, notification: ChatNotification) {
        for member in recipients {
            // Offline members simply miss group traffic.
            if self.deliver_chat(&member, notification.clone()).is_err() {
                tracing::debug!("Group member {} offline", member);
            }
        }
    }

    fn broadcast_presence(&self, user: &str, online: bool) {
        let others: Vec<String> = self
            .state
            .read()
            .connections
            .keys()
            .filter(|u| *u != user)
            .cloned()
            .collect();
        self.fan_out(
            others,
            ChatNotification::UserStatusChanged {
                user: user.to_string(),
                online,
            },
        );
    }
}

/// Signal transport bound to one registered user
#[derive(Clone)]
pub struct LoopbackTransport {
    relay: LoopbackRelay,
    user: String,
}

impl LoopbackTransport {
    pub fn user(&self) -> &str {
        &self.user
    }
}

#[async_trait(?Send)]
impl SignalTransport for LoopbackTransport {
    async fn send_initiate_call(&self, remote: &str) -> Result<(), TransportError> {
        self.relay.deliver_signal(&self.user, remote, Signal::IncomingCall)
    }

    async fn send_offer(&self, remote: &str, offer: &SessionDescription) -> Result<(), TransportError> {
        self.relay
            .deliver_signal(&self.user, remote, Signal::Offer(offer.clone()))
    }

    async fn send_answer(&self, remote: &str, answer: &SessionDescription) -> Result<(), TransportError> {
        self.relay
            .deliver_signal(&self.user, remote, Signal::Answer(answer.clone()))
    }

    async fn send_candidate(&self, remote: &str, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.relay
            .deliver_signal(&self.user, remote, Signal::IceCandidate(candidate.clone()))
    }

    async fn send_call_end(&self, remote: &str) -> Result<(), TransportError> {
        self.relay.deliver_signal(&self.user, remote, Signal::CallEnd)
    }
}

/// Chat service backed by the relay's in-memory users and groups
#[derive(Clone)]
pub struct LoopbackChatService {
    relay: LoopbackRelay,
}

#[async_trait(?Send)]
impl ChatService for LoopbackChatService {
    async fn login(&self, user: &str) -> Result<(), TransportError> {
        let newly_online = {
            let mut state = self.relay.state.write();
            if !state.connections.contains_key(user) {
                return Err(TransportError::NotConnected);
            }
            state.logged_in.insert(user.to_string())
        };
        if newly_online {
            self.relay.broadcast_presence(user, true);
        }
        Ok(())
    }

    async fn logout(&self, user: &str) -> Result<(), TransportError> {
        let was_online = self.relay.state.write().logged_in.remove(user);
        if !was_online {
            return Err(TransportError::Rejected(format!("{} is not logged in", user)));
        }
        self.relay.broadcast_presence(user, false);
        Ok(())
    }

    async fn send_message_to_user(&self, from: &str, to: &str, text: &str) -> Result<(), TransportError> {
        let record = stored_text(from, to, text, false);
        self.relay.deliver_or_queue(
            to,
            ChatNotification::NewMessage {
                from: from.to_string(),
                to: to.to_string(),
                text: text.to_string(),
                is_group: false,
            },
            &record,
        )?;
        self.relay.remember(&[from, to], &record);
        Ok(())
    }

    async fn send_message_to_group(&self, from: &str, group: &str, text: &str) -> Result<(), TransportError> {
        let recipients = self.relay.group_recipients(from, group)?;
        let record = stored_text(from, group, text, true);
        let notification = ChatNotification::NewMessage {
            from: from.to_string(),
            to: group.to_string(),
            text: text.to_string(),
            is_group: true,
        };
        for member in &recipients {
            if let Err(err) = self.relay.deliver_or_queue(member, notification.clone(), &record) {
                tracing::debug!("Group message to {} dropped: {}", member, err);
            }
        }

        let mut parties: Vec<&str> = recipients.iter().map(String::as_str).collect();
        parties.push(from);
        self.relay.remember(&parties, &record);
        Ok(())
    }

    async fn send_voice_note_to_user(&self, from: &str, to: &str, note: &VoiceNote) -> Result<(), TransportError> {
        self.relay.deliver_chat(
            to,
            ChatNotification::VoiceNote {
                from: from.to_string(),
                to: to.to_string(),
                note: note.clone(),
                is_group: false,
            },
        )
    }

    async fn send_voice_note_to_group(&self, from: &str, group: &str, note: &VoiceNote) -> Result<(), TransportError> {
        let recipients = self.relay.group_recipients(from, group)?;
        self.relay.fan_out(
            recipients,
            ChatNotification::VoiceNote {
                from: from.to_string(),
                to: group.to_string(),
                note: note.clone(),
                is_group: true,
            },
        );
        Ok(())
    }

    async fn create_group(&self, creator: &str, group: &str) -> Result<(), TransportError> {
        self.relay
            .state
            .write()
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(creator.to_string());
        tracing::debug!("Group {} created by {}", group, creator);
        Ok(())
    }

    async fn add_to_group(&self, group: &str, user: &str) -> Result<(), TransportError> {
        let members: Vec<String> = {
            let mut state = self.relay.state.write();
            let members = state.groups.entry(group.to_string()).or_default();
            members.insert(user.to_string());
            members.iter().cloned().collect()
        };
        self.relay.fan_out(
            members,
            ChatNotification::GroupMemberAdded {
                group: group.to_string(),
                user: user.to_string(),
            },
        );
        Ok(())
    }

    async fn get_user_groups(&self, user: &str) -> Result<Vec<String>, TransportError> {
        Ok(self
            .relay
            .state
            .read()
            .groups
            .iter()
            .filter(|(_, members)| members.contains(user))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_online_users(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.relay.state.read().logged_in.iter().cloned().collect())
    }

    async fn get_all_users(&self) -> Result<BTreeMap<String, bool>, TransportError> {
        let state = self.relay.state.read();
        Ok(state
            .known
            .iter()
            .map(|user| (user.clone(), state.logged_in.contains(user)))
            .collect())
    }

    async fn get_group_members(&self, group: &str) -> Result<Vec<String>, TransportError> {
        Ok(self
            .relay
            .state
            .read()
            .groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_history(&self, user: &str) -> Result<Vec<StoredMessage>, TransportError> {
        Ok(self
            .relay
            .state
            .read()
            .history
            .get(user)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_pending_messages(&self, user: &str) -> Result<Vec<StoredMessage>, TransportError> {
        Ok(self
            .relay
            .state
            .write()
            .pending
            .remove(user)
            .unwrap_or_default())
    }
}

fn stored_text(from: &str, to: &str, text: &str, is_group: bool) -> StoredMessage {
    StoredMessage {
        from: from.to_string(),
        to: to.to_string(),
        content: text.to_string(),
        is_group,
        timestamp: Some(now_ms()),
    }
}
