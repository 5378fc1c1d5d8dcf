use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single chat turn. Serializes to the backend's `{role, content}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

type Window = Arc<Mutex<VecDeque<Message>>>;

/// Sliding-window chat history keyed by conversation id.
///
/// Each conversation keeps at most `capacity` messages; appending past that
/// evicts from the front. The outer map lock is only held long enough to
/// resolve an id to its window, so writers on different conversations do not
/// wait on each other's history.
pub struct ConversationStore {
    capacity: usize,
    conversations: Mutex<HashMap<String, Window>>,
}

impl ConversationStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity: capacity.get(),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, conversation_id: &str, message: Message) {
        let window = self.window(conversation_id);
        let mut messages = lock(&window);
        messages.push_back(message);
        while messages.len() > self.capacity {
            messages.pop_front();
        }
    }

    /// Snapshot of the conversation, oldest first. Unknown ids yield an empty list.
    pub fn get(&self, conversation_id: &str) -> Vec<Message> {
        match self.existing(conversation_id) {
            Some(window) => lock(&window).iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.existing(conversation_id)
            .map(|window| lock(&window).len())
            .unwrap_or(0)
    }

    pub fn conversation_count(&self) -> usize {
        lock(&self.conversations).len()
    }

    fn window(&self, conversation_id: &str) -> Window {
        let mut conversations = lock(&self.conversations);
        conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.capacity))))
            .clone()
    }

    fn existing(&self, conversation_id: &str) -> Option<Window> {
        lock(&self.conversations).get(conversation_id).cloned()
    }
}

// Poisoning is ignored: every critical section leaves its data consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn store(capacity: usize) -> ConversationStore {
        ConversationStore::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(Message::content).collect()
    }

    #[test]
    fn unknown_conversation_is_empty() {
        let store = store(10);
        assert!(store.get("nobody").is_empty());
        assert_eq!(store.len("nobody"), 0);
        // reads do not create conversations
        assert_eq!(store.conversation_count(), 0);
    }

    #[test]
    fn evicts_oldest_first() {
        let store = store(3);
        store.append("c", Message::user("a"));
        store.append("c", Message::assistant("b"));
        store.append("c", Message::user("c"));
        store.append("c", Message::user("d"));

        let history = store.get("c");
        assert_eq!(texts(&history), vec!["b", "c", "d"]);
        assert_eq!(history[0], Message::assistant("b"));
    }

    #[test]
    fn keeps_last_capacity_messages_in_order() {
        let store = store(5);
        for i in 0..23 {
            store.append("c", Message::user(i.to_string()));
        }
        let history = store.get("c");
        assert_eq!(texts(&history), vec!["18", "19", "20", "21", "22"]);
    }

    #[test]
    fn capacity_is_per_conversation() {
        let store = store(2);
        store.append("a", Message::user("a1"));
        store.append("a", Message::user("a2"));
        store.append("b", Message::user("b1"));

        assert_eq!(store.len("a"), 2);
        assert_eq!(store.len("b"), 1);
        assert_eq!(store.conversation_count(), 2);
    }

    #[test]
    fn snapshot_is_detached_from_store() {
        let store = store(4);
        store.append("c", Message::user("one"));

        let mut snapshot = store.get("c");
        snapshot.push(Message::assistant("injected"));
        snapshot.clear();

        assert_eq!(texts(&store.get("c")), vec!["one"]);
    }

    #[test]
    fn concurrent_writers_keep_per_conversation_order() {
        let store = Arc::new(store(1_000));
        let writers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|id| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..500 {
                        store.append(id, Message::user(format!("{id}-{i}")));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread panicked");
        }

        for id in ["left", "right"] {
            let history = store.get(id);
            let expected: Vec<String> = (0..500).map(|i| format!("{id}-{i}")).collect();
            let actual: Vec<String> = history.iter().map(|m| m.content().to_string()).collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn serializes_in_backend_shape() {
        let json = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "assistant", "content": "hi" }));
    }
}
