//! Per-thread state the monitor keeps for each attached channel: the
//! ordered attribute map described in §4.1/§4.3 and the socket used to
//! reply to it.

use std::os::unix::net::UnixStream;

/// An insertion-ordered key/value map. Ordering matters because `%k`
/// argument substitution joins pairs in the order they were set, and
/// re-setting an existing key updates its value in place rather than
/// moving it to the end.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    entries: Vec<(String, String)>,
}

impl AttributeMap {
    pub fn new() -> AttributeMap {
        AttributeMap::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.entries.push((key.to_string(), value.to_string()));
        }
    }

    /// Removing an absent key is a no-op, per §4.3's edge cases.
    pub fn delete(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// A point-in-time copy handed to the invoker; the live map can keep
    /// changing after this snapshot is taken.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One attached thread's channel and attribute state, as tracked by the
/// monitor's event loop.
pub struct Session {
    pub stream: UnixStream,
    pub attributes: AttributeMap,
    pub thread_label: String,
    pub detached: bool,
}

impl Session {
    pub fn new(stream: UnixStream, thread_label: String) -> Session {
        Session {
            stream,
            attributes: AttributeMap::new(),
            thread_label,
            detached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_in_place_preserving_order() {
        let mut map = AttributeMap::new();
        map.set("a", "1");
        map.set("b", "2");
        map.set("a", "3");
        assert_eq!(
            map.snapshot(),
            vec![("a".to_string(), "3".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn delete_missing_key_is_a_no_op() {
        let mut map = AttributeMap::new();
        map.set("a", "1");
        map.delete("missing");
        assert_eq!(map.snapshot(), vec![("a".to_string(), "1".to_string())]);
    }

    #[test]
    fn delete_removes_the_key() {
        let mut map = AttributeMap::new();
        map.set("a", "1");
        map.set("b", "2");
        map.delete("a");
        assert_eq!(map.snapshot(), vec![("b".to_string(), "2".to_string())]);
    }
}
