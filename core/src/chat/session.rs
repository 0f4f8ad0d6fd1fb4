// Chat Session: the logged-in user's view of conversations, presence and groups

use super::cache::MessageCache;
use super::service::ChatService;
use super::types::{
    ChatError, ChatEvent, ChatMessage, ChatNotification, ConversationKey, MessageContent,
    StoredMessage, VoiceNote,
};
use crate::config::ChatConfig;
use crate::events::Subscribers;
use futures::channel::mpsc::UnboundedReceiver;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

struct ChatState {
    user: Option<String>,
    selected: Option<ConversationKey>,
    cache: MessageCache,
    groups: BTreeSet<String>,
    online: BTreeSet<String>,
}

pub struct ChatSession {
    service: Arc<dyn ChatService>,
    config: ChatConfig,
    state: Mutex<ChatState>,
    events: Subscribers<ChatEvent>,
}

impl ChatSession {
    pub fn new(service: Arc<dyn ChatService>, config: ChatConfig) -> Self {
        let cache = MessageCache::new(config.cache_limit);
        Self {
            service,
            config,
            state: Mutex::new(ChatState {
                user: None,
                selected: None,
                cache,
                groups: BTreeSet::new(),
                online: BTreeSet::new(),
            }),
            events: Subscribers::new(),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn current_user(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    /// Log in, load the user's groups and who is online, then fill the cache
    /// with stored history and anything queued while they were away. History
    /// that cannot be fetched is logged and skipped.
    pub async fn login(&self, user: &str) -> Result<(), ChatError> {
        self.service.login(user).await?;
        self.state.lock().user = Some(user.to_string());
        tracing::info!("👤 Logged in as {}", user);

        self.refresh().await?;
        if let Err(err) = self.load_history().await {
            tracing::warn!("Could not load history for {}: {}", user, err);
        }
        if let Err(err) = self.poll_pending().await {
            tracing::warn!("Could not fetch pending messages for {}: {}", user, err);
        }
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ChatError> {
        let user = self.require_user()?;
        let result = self.service.logout(&user).await;

        let mut state = self.state.lock();
        state.user = None;
        state.selected = None;
        state.cache.clear();
        state.groups.clear();
        state.online.clear();
        drop(state);

        tracing::info!("👤 {} logged out", user);
        result.map_err(ChatError::from)
    }

    /// Reload groups and presence from the service
    pub async fn refresh(&self) -> Result<(), ChatError> {
        let user = self.require_user()?;
        let groups = self.service.get_user_groups(&user).await?;
        let online = self.service.get_online_users().await?;

        let mut state = self.state.lock();
        state.groups = groups.into_iter().collect();
        state.online = online.into_iter().filter(|u| *u != user).collect();
        Ok(())
    }

    /// Cache the service's stored history. Returns how many messages were new.
    pub async fn load_history(&self) -> Result<usize, ChatError> {
        let user = self.require_user()?;
        let stored = self.service.get_history(&user).await?;
        let added = self.merge(&user, stored);
        tracing::debug!("Loaded {} history message(s) for {}", added.len(), user);
        Ok(added.len())
    }

    /// Fetch messages queued while we were away and announce the new ones
    pub async fn poll_pending(&self) -> Result<usize, ChatError> {
        let user = self.require_user()?;
        let pending = self.service.get_pending_messages(&user).await?;
        let added = self.merge(&user, pending);
        let count = added.len();
        for message in added {
            self.events.emit(ChatEvent::MessageAdded(message));
        }
        Ok(count)
    }

    pub async fn group_members(&self, group: &str) -> Result<Vec<String>, ChatError> {
        self.require_user()?;
        Ok(self.service.get_group_members(group).await?)
    }

    /// Everyone the service knows about except us, with online status
    pub async fn all_users(&self) -> Result<BTreeMap<String, bool>, ChatError> {
        let user = self.require_user()?;
        let mut users = self.service.get_all_users().await?;
        users.remove(&user);
        Ok(users)
    }

    pub fn select(&self, conversation: ConversationKey) {
        tracing::debug!("Selected conversation {}", conversation);
        self.state.lock().selected = Some(conversation);
    }

    pub fn selected(&self) -> Option<ConversationKey> {
        self.state.lock().selected.clone()
    }

    /// The user a call would go to: only direct conversations are callable
    pub fn callable_peer(&self) -> Option<String> {
        match self.state.lock().selected.as_ref() {
            Some(ConversationKey::Direct(user)) => Some(user.clone()),
            _ => None,
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<ChatMessage, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let (user, conversation) = self.require_selection()?;

        match &conversation {
            ConversationKey::Direct(to) => self.service.send_message_to_user(&user, to, text).await?,
            ConversationKey::Group(group) => {
                self.service.send_message_to_group(&user, group, text).await?
            }
        }

        let message = ChatMessage::new(user, conversation, MessageContent::Text(text.to_string()));
        self.record(message.clone());
        Ok(message)
    }

    /// Send recorded audio to the selected conversation, tagged with the
    /// configured MIME type
    pub async fn send_voice_note(&self, data: Vec<u8>) -> Result<ChatMessage, ChatError> {
        if data.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let (user, conversation) = self.require_selection()?;
        let note = VoiceNote::new(self.config.voice_note_mime.clone(), data);

        match &conversation {
            ConversationKey::Direct(to) => {
                self.service.send_voice_note_to_user(&user, to, &note).await?
            }
            ConversationKey::Group(group) => {
                self.service.send_voice_note_to_group(&user, group, &note).await?
            }
        }

        let message = ChatMessage::new(user, conversation, MessageContent::Voice(note));
        self.record(message.clone());
        Ok(message)
    }

    pub async fn create_group(&self, group: &str) -> Result<(), ChatError> {
        let user = self.require_user()?;
        self.service.create_group(&user, group).await?;
        self.state.lock().groups.insert(group.to_string());
        Ok(())
    }

    pub async fn add_to_group(&self, group: &str, member: &str) -> Result<(), ChatError> {
        self.require_user()?;
        self.service.add_to_group(group, member).await?;
        Ok(())
    }

    /// Apply a push from the service
    pub fn handle_notification(&self, notification: ChatNotification) {
        if let Some(conversation) = notification.conversation() {
            let (from, content) = match notification {
                ChatNotification::NewMessage { from, text, .. } => (from, MessageContent::Text(text)),
                ChatNotification::VoiceNote { from, note, .. } => (from, MessageContent::Voice(note)),
                _ => return,
            };
            self.record(ChatMessage::new(from, conversation, content));
            return;
        }

        match notification {
            ChatNotification::UserStatusChanged { user, online } => {
                {
                    let mut state = self.state.lock();
                    if state.user.as_deref() == Some(user.as_str()) {
                        return;
                    }
                    if online {
                        state.online.insert(user.clone());
                    } else {
                        state.online.remove(&user);
                    }
                }
                tracing::debug!("{} is now {}", user, if online { "online" } else { "offline" });
                self.events.emit(ChatEvent::PresenceChanged { user, online });
            }
            ChatNotification::GroupMemberAdded { group, user } => {
                {
                    let mut state = self.state.lock();
                    if state.user.as_deref() == Some(user.as_str()) {
                        state.groups.insert(group.clone());
                    }
                }
                self.events.emit(ChatEvent::GroupJoined { group, user });
            }
            _ => {}
        }
    }

    pub fn history(&self, conversation: &ConversationKey) -> Vec<ChatMessage> {
        self.state.lock().cache.history(conversation)
    }

    pub fn groups(&self) -> Vec<String> {
        self.state.lock().groups.iter().cloned().collect()
    }

    pub fn online_users(&self) -> Vec<String> {
        self.state.lock().online.iter().cloned().collect()
    }

    /// Add stored messages to the cache, skipping duplicates. Nothing is added
    /// if `user` logged out meanwhile.
    fn merge(&self, user: &str, stored: Vec<StoredMessage>) -> Vec<ChatMessage> {
        let mut state = self.state.lock();
        if state.user.as_deref() != Some(user) {
            return Vec::new();
        }
        let mut added = Vec::new();
        for message in stored {
            let message = message.into_message(user);
            if state.cache.push_unique(message.clone()) {
                added.push(message);
            }
        }
        added
    }

    fn record(&self, message: ChatMessage) {
        self.state.lock().cache.push(message.clone());
        self.events.emit(ChatEvent::MessageAdded(message));
    }

    fn require_user(&self) -> Result<String, ChatError> {
        self.state.lock().user.clone().ok_or(ChatError::NotLoggedIn)
    }

    fn require_selection(&self) -> Result<(String, ConversationKey), ChatError> {
        let state = self.state.lock();
        let user = state.user.clone().ok_or(ChatError::NotLoggedIn)?;
        let conversation = state.selected.clone().ok_or(ChatError::NoConversation)?;
        Ok((user, conversation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::TransportError;
    use async_trait::async_trait;

    /// Accepts everything and remembers what was sent
    #[derive(Default)]
    struct StubService {
        sent: Mutex<Vec<String>>,
        history: Vec<StoredMessage>,
        pending: Mutex<Vec<StoredMessage>>,
        history_offline: bool,
    }

    fn stored(from: &str, to: &str, content: &str, is_group: bool) -> StoredMessage {
        StoredMessage {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            is_group,
            timestamp: Some(1),
        }
    }

    #[async_trait(?Send)]
    impl ChatService for StubService {
        async fn login(&self, _user: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn logout(&self, _user: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send_message_to_user(&self, _from: &str, to: &str, text: &str) -> Result<(), TransportError> {
            if to == "ghost" {
                return Err(TransportError::RemoteUnavailable("user not connected".into()));
            }
            self.sent.lock().push(format!("{}:{}", to, text));
            Ok(())
        }
        async fn send_message_to_group(&self, _from: &str, group: &str, text: &str) -> Result<(), TransportError> {
            self.sent.lock().push(format!("#{}:{}", group, text));
            Ok(())
        }
        async fn send_voice_note_to_user(&self, _from: &str, to: &str, note: &VoiceNote) -> Result<(), TransportError> {
            self.sent.lock().push(format!("{}:<{} bytes>", to, note.data.len()));
            Ok(())
        }
        async fn send_voice_note_to_group(&self, _from: &str, group: &str, note: &VoiceNote) -> Result<(), TransportError> {
            self.sent.lock().push(format!("#{}:<{} bytes>", group, note.data.len()));
            Ok(())
        }
        async fn create_group(&self, _creator: &str, _group: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn add_to_group(&self, _group: &str, _user: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn get_user_groups(&self, _user: &str) -> Result<Vec<String>, TransportError> {
            Ok(vec!["team".into()])
        }
        async fn get_online_users(&self) -> Result<Vec<String>, TransportError> {
            Ok(vec!["alice".into(), "bob".into()])
        }
        async fn get_all_users(&self) -> Result<BTreeMap<String, bool>, TransportError> {
            Ok([("alice".to_string(), true), ("bob".to_string(), true), ("dave".to_string(), false)]
                .into_iter()
                .collect())
        }
        async fn get_group_members(&self, _group: &str) -> Result<Vec<String>, TransportError> {
            Ok(vec!["alice".into(), "bob".into()])
        }
        async fn get_history(&self, _user: &str) -> Result<Vec<StoredMessage>, TransportError> {
            if self.history_offline {
                return Err(TransportError::Rejected("history unavailable".into()));
            }
            Ok(self.history.clone())
        }
        async fn get_pending_messages(&self, _user: &str) -> Result<Vec<StoredMessage>, TransportError> {
            Ok(std::mem::take(&mut *self.pending.lock()))
        }
    }

    async fn logged_in(user: &str) -> (Arc<StubService>, ChatSession) {
        let service = Arc::new(StubService::default());
        let session = ChatSession::new(service.clone(), ChatConfig::default());
        session.login(user).await.unwrap();
        (service, session)
    }

    #[tokio::test]
    async fn test_login_loads_groups_and_presence() {
        let (_, session) = logged_in("bob").await;
        assert_eq!(session.groups(), vec!["team"]);
        // We never list ourselves as a peer.
        assert_eq!(session.online_users(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_login_fills_cache_from_history_and_pending() {
        let service = Arc::new(StubService {
            history: vec![
                stored("alice", "bob", "hi bob", false),
                stored("bob", "alice", "hi alice", false),
                stored("alice", "bob", "hi bob", false),
                stored("carol", "team", "standup at 10", true),
            ],
            pending: Mutex::new(vec![
                // Already in history, so not added twice.
                stored("carol", "team", "standup at 10", true),
                stored("alice", "bob", "are you there?", false),
            ]),
            ..Default::default()
        });
        let session = ChatSession::new(service.clone(), ChatConfig::default());
        let mut events = session.subscribe();

        session.login("bob").await.unwrap();

        let alice = session.history(&ConversationKey::Direct("alice".into()));
        let bodies: Vec<_> = alice
            .iter()
            .map(|m| match &m.content {
                MessageContent::Text(text) => text.as_str(),
                MessageContent::Voice(_) => "<voice>",
            })
            .collect();
        assert_eq!(bodies, vec!["hi bob", "hi alice", "are you there?"]);
        assert_eq!(session.history(&ConversationKey::Group("team".into())).len(), 1);

        // Only the genuinely new pending message is announced.
        let added: Vec<_> = std::iter::from_fn(|| events.try_next().ok().flatten()).collect();
        assert_eq!(added.len(), 1);
        assert!(service.pending.lock().is_empty());
        assert_eq!(session.poll_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_login_survives_missing_history() {
        let service = Arc::new(StubService {
            history_offline: true,
            ..Default::default()
        });
        let session = ChatSession::new(service, ChatConfig::default());

        session.login("bob").await.unwrap();

        assert_eq!(session.current_user().as_deref(), Some("bob"));
        assert!(matches!(
            session.load_history().await.unwrap_err(),
            ChatError::Transport(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_queries_leave_out_self() {
        let (_, session) = logged_in("bob").await;

        let users = session.all_users().await.unwrap();
        assert_eq!(users.keys().collect::<Vec<_>>(), vec!["alice", "dave"]);
        assert_eq!(users.get("dave"), Some(&false));
        assert_eq!(session.group_members("team").await.unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_send_requires_selection() {
        let (_, session) = logged_in("bob").await;
        assert_eq!(session.send_text("hi").await.unwrap_err(), ChatError::NoConversation);
    }

    #[tokio::test]
    async fn test_send_text_appends_on_success() {
        let (service, session) = logged_in("bob").await;
        let alice = ConversationKey::Direct("alice".into());
        session.select(alice.clone());

        session.send_text("  hello  ").await.unwrap();

        assert_eq!(*service.sent.lock(), vec!["alice:hello"]);
        assert_eq!(session.history(&alice).len(), 1);
        assert_eq!(session.callable_peer().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_failed_send_not_cached() {
        let (_, session) = logged_in("bob").await;
        let ghost = ConversationKey::Direct("ghost".into());
        session.select(ghost.clone());

        let err = session.send_text("anyone?").await.unwrap_err();

        assert!(matches!(err, ChatError::Transport(TransportError::RemoteUnavailable(_))));
        assert!(session.history(&ghost).is_empty());
    }

    #[tokio::test]
    async fn test_voice_note_uses_configured_mime() {
        let (_, session) = logged_in("bob").await;
        session.select(ConversationKey::Group("team".into()));

        let message = session.send_voice_note(vec![0u8; 16]).await.unwrap();

        match message.content {
            MessageContent::Voice(note) => assert_eq!(note.mime_type, "audio/webm"),
            other => panic!("unexpected content {:?}", other),
        }
        assert!(session.callable_peer().is_none());
    }

    #[tokio::test]
    async fn test_inbound_messages_route_to_conversations() {
        let (_, session) = logged_in("bob").await;
        let mut events = session.subscribe();

        session.handle_notification(ChatNotification::NewMessage {
            from: "alice".into(),
            to: "bob".into(),
            text: "hey".into(),
            is_group: false,
        });
        session.handle_notification(ChatNotification::NewMessage {
            from: "carol".into(),
            to: "team".into(),
            text: "standup?".into(),
            is_group: true,
        });

        assert_eq!(session.history(&ConversationKey::Direct("alice".into())).len(), 1);
        assert_eq!(session.history(&ConversationKey::Group("team".into())).len(), 1);
        assert!(matches!(events.try_next().unwrap(), Some(ChatEvent::MessageAdded(_))));
    }

    #[tokio::test]
    async fn test_presence_and_group_membership() {
        let (_, session) = logged_in("bob").await;

        session.handle_notification(ChatNotification::UserStatusChanged {
            user: "alice".into(),
            online: false,
        });
        session.handle_notification(ChatNotification::GroupMemberAdded {
            group: "ops".into(),
            user: "bob".into(),
        });

        assert!(session.online_users().is_empty());
        assert_eq!(session.groups(), vec!["ops", "team"]);
    }

    #[tokio::test]
    async fn test_logout_clears_state() {
        let (_, session) = logged_in("bob").await;
        session.select(ConversationKey::Direct("alice".into()));

        session.logout().await.unwrap();

        assert!(session.current_user().is_none());
        assert!(session.selected().is_none());
        assert_eq!(session.logout().await.unwrap_err(), ChatError::NotLoggedIn);
    }
}
