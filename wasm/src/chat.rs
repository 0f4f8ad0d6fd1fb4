// Chat bindings: conversations, presence and groups for the page

use crate::rpc::{JsChatService, RpcProxy};
use crate::{client_config, to_js};
use futures::StreamExt;
use parking_lot::Mutex;
use parley_core::{
    ChatError, ChatEvent, ChatMessage, ChatNotification, ChatSession, ConversationKey,
    MessageContent, VoiceNote,
};
use serde::Serialize;
use std::sync::Arc;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;

/// A cached message as the page renders it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmMessage {
    pub from: String,
    pub conversation: String,
    pub is_group: bool,
    /// Text body; empty for voice notes
    pub text: String,
    /// Voice-note bytes; empty for text
    pub audio: Vec<u8>,
    pub mime_type: Option<String>,
    pub timestamp: u64,
}

impl From<&ChatMessage> for WasmMessage {
    fn from(message: &ChatMessage) -> Self {
        let (text, audio, mime_type) = match &message.content {
            MessageContent::Text(text) => (text.clone(), Vec::new(), None),
            MessageContent::Voice(note) => {
                (String::new(), note.data.clone(), Some(note.mime_type.clone()))
            }
        };
        Self {
            from: message.from.clone(),
            conversation: message.conversation.name().to_string(),
            is_group: message.conversation.is_group(),
            text,
            audio,
            mime_type,
            timestamp: message.timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WasmChatEvent {
    MessageAdded { message: WasmMessage },
    PresenceChanged { user: String, online: bool },
    GroupJoined { group: String, user: String },
}

impl From<&ChatEvent> for WasmChatEvent {
    fn from(event: &ChatEvent) -> Self {
        match event {
            ChatEvent::MessageAdded(message) => Self::MessageAdded {
                message: WasmMessage::from(message),
            },
            ChatEvent::PresenceChanged { user, online } => Self::PresenceChanged {
                user: user.clone(),
                online: *online,
            },
            ChatEvent::GroupJoined { group, user } => Self::GroupJoined {
                group: group.clone(),
                user: user.clone(),
            },
        }
    }
}

fn conversation(name: String, is_group: bool) -> ConversationKey {
    if is_group {
        ConversationKey::Group(name)
    } else {
        ConversationKey::Direct(name)
    }
}

fn chat_error(err: ChatError) -> JsValue {
    JsValue::from_str(&err.to_string())
}

#[wasm_bindgen]
pub struct ChatClient {
    session: Arc<ChatSession>,
    voice_note_mime: String,
    events: Arc<Mutex<Vec<WasmChatEvent>>>,
}

#[wasm_bindgen]
impl ChatClient {
    #[wasm_bindgen(constructor)]
    pub fn new(rpc_proxy: JsValue, config: JsValue) -> Result<ChatClient, JsValue> {
        crate::init_logging();
        let config = client_config(config)?;
        let voice_note_mime = config.chat.voice_note_mime.clone();
        let session = Arc::new(ChatSession::new(
            Arc::new(JsChatService::new(RpcProxy::new(rpc_proxy))),
            config.chat,
        ));

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut updates = session.subscribe();
        let events_clone = Arc::clone(&events);
        wasm_bindgen_futures::spawn_local(async move {
            while let Some(event) = updates.next().await {
                events_clone.lock().push(WasmChatEvent::from(&event));
            }
        });

        Ok(ChatClient {
            session,
            voice_note_mime,
            events,
        })
    }

    pub fn login(&self, username: String) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            session.login(&username).await.map_err(chat_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    pub fn logout(&self) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            session.logout().await.map_err(chat_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    #[wasm_bindgen(js_name = currentUser)]
    pub fn current_user(&self) -> Option<String> {
        self.session.current_user()
    }

    #[wasm_bindgen(js_name = selectUser)]
    pub fn select_user(&self, user: String) {
        self.session.select(ConversationKey::Direct(user));
    }

    #[wasm_bindgen(js_name = selectGroup)]
    pub fn select_group(&self, group: String) {
        self.session.select(ConversationKey::Group(group));
    }

    /// The selected direct conversation's peer, i.e. who the call button rings
    #[wasm_bindgen(js_name = callablePeer)]
    pub fn callable_peer(&self) -> Option<String> {
        self.session.callable_peer()
    }

    #[wasm_bindgen(js_name = sendText)]
    pub fn send_text(&self, text: String) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            let message = session.send_text(&text).await.map_err(chat_error)?;
            Ok(to_js(&WasmMessage::from(&message)))
        })
    }

    /// Send recorded audio to the selected conversation
    #[wasm_bindgen(js_name = sendVoiceNote)]
    pub fn send_voice_note(&self, audio: Vec<u8>) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            let message = session.send_voice_note(audio).await.map_err(chat_error)?;
            Ok(to_js(&WasmMessage::from(&message)))
        })
    }

    #[wasm_bindgen(js_name = createGroup)]
    pub fn create_group(&self, group: String) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            session.create_group(&group).await.map_err(chat_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    #[wasm_bindgen(js_name = addToGroup)]
    pub fn add_to_group(&self, group: String, user: String) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            session.add_to_group(&group, &user).await.map_err(chat_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Fetch messages queued while away; resolves to how many were new
    #[wasm_bindgen(js_name = pollPending)]
    pub fn poll_pending(&self) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            let added = session.poll_pending().await.map_err(chat_error)?;
            Ok(JsValue::from(added as u32))
        })
    }

    #[wasm_bindgen(js_name = groupMembers)]
    pub fn group_members(&self, group: String) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            let members = session.group_members(&group).await.map_err(chat_error)?;
            Ok(members.into_iter().map(JsValue::from).collect::<js_sys::Array>().into())
        })
    }

    /// Resolves to `{ name: online }` for everyone but us
    #[wasm_bindgen(js_name = allUsers)]
    pub fn all_users(&self) -> js_sys::Promise {
        let session = Arc::clone(&self.session);
        future_to_promise(async move {
            let users = session.all_users().await.map_err(chat_error)?;
            // A plain object rather than a `Map`.
            users
                .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
                .map_err(JsValue::from)
        })
    }

    #[wasm_bindgen(js_name = onNewMessage)]
    pub fn on_new_message(&self, from: String, to: String, text: String, is_group: bool) {
        self.session.handle_notification(ChatNotification::NewMessage {
            from,
            to,
            text,
            is_group,
        });
    }

    #[wasm_bindgen(js_name = onVoiceNote)]
    pub fn on_voice_note(&self, from: String, to: String, audio: Vec<u8>, is_group: bool) {
        self.session.handle_notification(ChatNotification::VoiceNote {
            from,
            to,
            note: VoiceNote::new(self.voice_note_mime.clone(), audio),
            is_group,
        });
    }

    #[wasm_bindgen(js_name = onUserStatusChanged)]
    pub fn on_user_status_changed(&self, user: String, online: bool) {
        self.session
            .handle_notification(ChatNotification::UserStatusChanged { user, online });
    }

    #[wasm_bindgen(js_name = onGroupMemberAdded)]
    pub fn on_group_member_added(&self, group: String, user: String) {
        self.session
            .handle_notification(ChatNotification::GroupMemberAdded { group, user });
    }

    /// Cached messages of one conversation, oldest first
    pub fn history(&self, name: String, is_group: bool) -> js_sys::Array {
        self.session
            .history(&conversation(name, is_group))
            .iter()
            .map(|message| to_js(&WasmMessage::from(message)))
            .collect()
    }

    pub fn groups(&self) -> js_sys::Array {
        self.session.groups().into_iter().map(JsValue::from).collect()
    }

    #[wasm_bindgen(js_name = onlineUsers)]
    pub fn online_users(&self) -> js_sys::Array {
        self.session
            .online_users()
            .into_iter()
            .map(JsValue::from)
            .collect()
    }

    #[wasm_bindgen(js_name = drainEvents)]
    pub fn drain_events(&self) -> js_sys::Array {
        let events: Vec<WasmChatEvent> = std::mem::take(&mut *self.events.lock());
        events.iter().map(to_js).collect()
    }
}
