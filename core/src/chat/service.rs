//! Chat Service: the RPC operations the client invokes on the remote service
//!
//! A `{ success: false, message }` response surfaces as
//! [`TransportError::Rejected`]; an unknown or disconnected recipient as
//! [`TransportError::RemoteUnavailable`].

use super::types::{StoredMessage, VoiceNote};
use crate::signal::TransportError;
use async_trait::async_trait;
use std::collections::BTreeMap;

#[async_trait(?Send)]
pub trait ChatService {
    async fn login(&self, user: &str) -> Result<(), TransportError>;

    async fn logout(&self, user: &str) -> Result<(), TransportError>;

    async fn send_message_to_user(&self, from: &str, to: &str, text: &str) -> Result<(), TransportError>;

    async fn send_message_to_group(&self, from: &str, group: &str, text: &str) -> Result<(), TransportError>;

    async fn send_voice_note_to_user(
        &self,
        from: &str,
        to: &str,
        note: &VoiceNote,
    ) -> Result<(), TransportError>;

    async fn send_voice_note_to_group(
        &self,
        from: &str,
        group: &str,
        note: &VoiceNote,
    ) -> Result<(), TransportError>;

    /// Create `group` with `creator` as its first member
    async fn create_group(&self, creator: &str, group: &str) -> Result<(), TransportError>;

    async fn add_to_group(&self, group: &str, user: &str) -> Result<(), TransportError>;

    async fn get_user_groups(&self, user: &str) -> Result<Vec<String>, TransportError>;

    async fn get_online_users(&self) -> Result<Vec<String>, TransportError>;

    /// Every known user and whether they are online
    async fn get_all_users(&self) -> Result<BTreeMap<String, bool>, TransportError>;

    async fn get_group_members(&self, group: &str) -> Result<Vec<String>, TransportError>;

    /// Text messages `user` sent or received, oldest first
    async fn get_history(&self, user: &str) -> Result<Vec<StoredMessage>, TransportError>;

    /// Messages queued for `user` while they were away. The service forgets
    /// them once fetched.
    async fn get_pending_messages(&self, user: &str) -> Result<Vec<StoredMessage>, TransportError>;
}
