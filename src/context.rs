use std::sync::Arc;

use chrono::Utc;
use connector_plugin::message::OutboundMessage;
use rhai::Dynamic;

use crate::modules::{ModuleError, ModuleManager};
use crate::storage::{Storage, StorageError};

/// Chunk threshold for outbound text, counted in characters.
pub const MAX_CHUNK_CHARS: usize = 4000;

/// Everything a block script is allowed to touch, built fresh for each
/// block run and bound to one `(user, platform)` pair.
///
/// `send_message` only queues; the engine flushes the queue after the
/// script returns so that delivery order matches call order even when
/// the script fails halfway through.
pub struct CapabilityContext {
    user_id: String,
    platform: String,
    storage: Arc<dyn Storage>,
    modules: Arc<ModuleManager>,
    outbox: Vec<OutboundMessage>,
    jumped: bool,
}

impl CapabilityContext {
    pub fn new(
        user_id: impl Into<String>,
        platform: impl Into<String>,
        storage: Arc<dyn Storage>,
        modules: Arc<ModuleManager>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            storage,
            modules,
            outbox: Vec::new(),
            jumped: false,
        }
    }

    pub fn get_param(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage.get_param(&self.user_id, &self.platform, key)
    }

    /// Upserts immediately; param writes are not batched with the rest
    /// of the turn.
    pub fn set_param(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage.set_param(&self.user_id, &self.platform, key, value)
    }

    pub fn queue_message(&mut self, message: OutboundMessage) {
        self.outbox.push(message);
    }

    /// Advances the session row at once and flags the engine to re-enter
    /// the new block. Script statements after the call still run.
    pub fn go_to(&mut self, block_id: i64) -> Result<(), StorageError> {
        if let Some(mut session) = self.storage.find_session(&self.user_id, &self.platform)? {
            session.current_block_id = block_id;
            session.updated_at = Utc::now();
            self.storage.update_session(session)?;
            self.jumped = true;
        }
        Ok(())
    }

    /// Eagerly loads a plugin, discarding the handle.
    pub fn start_module(&self, name: &str) -> Result<(), ModuleError> {
        self.modules.get(name).map(|_| ())
    }

    pub fn call_module(&self, name: &str, function: &str, args: Vec<Dynamic>) -> Result<Dynamic, ModuleError> {
        self.modules.call(name, function, args)
    }

    pub fn into_effects(self) -> (Vec<OutboundMessage>, bool) {
        (self.outbox, self.jumped)
    }
}

/// Splits `text` into chunks of at most `max_chars` characters.
///
/// The split point is the last newline before the boundary, else the
/// last space, else a hard cut; the remainder is left-trimmed before
/// continuing, so the separator itself is not re-sent.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text;

    loop {
        if rest.chars().count() <= max_chars {
            parts.push(rest.to_string());
            break;
        }

        let boundary = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let window = &rest[..boundary];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .unwrap_or(boundary);

        parts.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start();
        if rest.is_empty() {
            break;
        }
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let text = "a".repeat(4000);
        assert_eq!(split_text(&text, MAX_CHUNK_CHARS), vec![text]);
    }

    #[test]
    fn test_prefers_newline_over_space() {
        let mut text = "word ".repeat(700); // 3500 chars, spaces throughout
        text.insert(3000, '\n');
        let parts = split_text(&text, 3200);

        assert_eq!(parts[0].chars().count(), 3000);
        assert!(!parts[0].ends_with('\n'));
    }

    #[test]
    fn test_falls_back_to_space() {
        let text = format!("{} {}", "a".repeat(3999), "b".repeat(100));
        let parts = split_text(&text, 4000);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "a".repeat(3999));
        assert_eq!(parts[1], "b".repeat(100));
    }

    #[test]
    fn test_hard_cut_without_separators() {
        let text = "a".repeat(9000);
        let parts = split_text(&text, 4000);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].chars().count(), 4000);
        assert_eq!(parts[1].chars().count(), 4000);
        assert_eq!(parts[2].chars().count(), 1000);
    }

    #[test]
    fn test_no_chunk_exceeds_limit() {
        let text = format!("{}\n{} {}", "x".repeat(3000), "y".repeat(3000), "z".repeat(3000));
        for part in split_text(&text, 4000) {
            assert!(part.chars().count() <= 4000);
        }
    }

    #[test]
    fn test_reconstruction_with_separators() {
        let text = format!("{}\n{}", "x".repeat(3000), "y".repeat(3000));
        let parts = split_text(&text, 4000);

        assert_eq!(parts.len(), 2);
        assert_eq!(format!("{}\n{}", parts[0], parts[1]), text);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        // Multi-byte characters must not be split mid-codepoint.
        let text = "é".repeat(4500);
        let parts = split_text(&text, 4000);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chars().count(), 4000);
        assert_eq!(parts[1].chars().count(), 500);
    }
}
