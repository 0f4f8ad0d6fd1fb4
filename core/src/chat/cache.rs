// Per-conversation message history, bounded; oldest messages go first

use super::types::{ChatMessage, ConversationKey};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct MessageCache {
    limit: usize,
    conversations: HashMap<ConversationKey, VecDeque<ChatMessage>>,
}

impl MessageCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            conversations: HashMap::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        let history = self
            .conversations
            .entry(message.conversation.clone())
            .or_default();
        history.push_back(message);
        while history.len() > self.limit {
            history.pop_front();
        }
    }

    /// Push unless the conversation already holds a message with the same
    /// sender and content. Returns whether the message was added.
    pub fn push_unique(&mut self, message: ChatMessage) -> bool {
        let duplicate = self
            .conversations
            .get(&message.conversation)
            .map(|history| {
                history
                    .iter()
                    .any(|m| m.from == message.from && m.content == message.content)
            })
            .unwrap_or(false);
        if duplicate {
            return false;
        }
        self.push(message);
        true
    }

    pub fn history(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        self.conversations
            .get(key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &ConversationKey) -> usize {
        self.conversations.get(key).map(VecDeque::len).unwrap_or(0)
    }

    pub fn conversations(&self) -> Vec<ConversationKey> {
        let mut keys: Vec<_> = self.conversations.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageContent;

    fn text(conversation: &ConversationKey, body: &str) -> ChatMessage {
        ChatMessage::new("alice", conversation.clone(), MessageContent::Text(body.to_string()))
    }

    #[test]
    fn test_evicts_oldest_first() {
        let key = ConversationKey::Direct("alice".into());
        let mut cache = MessageCache::new(2);
        cache.push(text(&key, "one"));
        cache.push(text(&key, "two"));
        cache.push(text(&key, "three"));

        let bodies: Vec<_> = cache
            .history(&key)
            .into_iter()
            .map(|m| match m.content {
                MessageContent::Text(t) => t,
                MessageContent::Voice(_) => unreachable!(),
            })
            .collect();
        assert_eq!(bodies, vec!["two", "three"]);
    }

    #[test]
    fn test_push_unique_skips_same_sender_and_content() {
        let key = ConversationKey::Direct("alice".into());
        let mut cache = MessageCache::new(10);

        assert!(cache.push_unique(text(&key, "hi")));
        assert!(!cache.push_unique(text(&key, "hi")));
        assert!(cache.push_unique(text(&key, "hi again")));

        let mut from_bob = text(&key, "hi");
        from_bob.from = "bob".into();
        assert!(cache.push_unique(from_bob));
        // Same text in another conversation is not a duplicate.
        assert!(cache.push_unique(text(&ConversationKey::Group("team".into()), "hi")));

        assert_eq!(cache.len(&key), 3);
    }

    #[test]
    fn test_conversations_are_independent() {
        let direct = ConversationKey::Direct("alice".into());
        let group = ConversationKey::Group("team".into());
        let mut cache = MessageCache::new(10);
        cache.push(text(&direct, "hi"));
        cache.push(text(&group, "hello all"));
        cache.push(text(&group, "anyone?"));

        assert_eq!(cache.len(&direct), 1);
        assert_eq!(cache.len(&group), 2);
        assert_eq!(cache.conversations(), vec![direct, group]);
        assert!(cache.history(&ConversationKey::Direct("nobody".into())).is_empty());
    }
}
