//! Prompt screening.
//!
//! Banned-word filtering is a collaborator concern: the submission path only
//! consumes a verdict from a [`PromptScreener`] and never looks at word lists
//! itself. The default implementation matches prompts against the banned-word
//! collection in the store; deployments with an external moderation service
//! plug in behind the same trait.

use std::sync::Arc;

use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenVerdict {
    Allowed,
    /// The prompt hit a banned word; the matched word is reported back to
    /// the client.
    Banned { word: String },
}

#[cfg_attr(test, mockall::automock)]
pub trait PromptScreener: Send + Sync {
    fn screen(&self, prompt: &str) -> ScreenVerdict;
}

/// Case-insensitive substring match against the stored banned-word lists.
pub struct WordListScreener {
    store: Arc<dyn Store>,
}

impl WordListScreener {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl PromptScreener for WordListScreener {
    fn screen(&self, prompt: &str) -> ScreenVerdict {
        let prompt = prompt.to_lowercase();
        let entries = self.store.list_banned_words().unwrap_or_default();
        let hit = entries
            .iter()
            .filter(|entry| entry.enable)
            .flat_map(|entry| entry.words.iter())
            .find(|word| !word.is_empty() && prompt.contains(&word.to_lowercase()));
        match hit {
            Some(word) => ScreenVerdict::Banned { word: word.clone() },
            None => ScreenVerdict::Allowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BannedWord, SqliteStore};

    fn screener_with(entries: Vec<BannedWord>) -> WordListScreener {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        for entry in &entries {
            store.save_banned_word(entry).unwrap();
        }
        WordListScreener::new(store)
    }

    #[test]
    fn clean_prompt_is_allowed() {
        let screener = screener_with(vec![BannedWord {
            id: "b1".into(),
            words: vec!["forbidden".into()],
            enable: true,
        }]);
        assert_eq!(screener.screen("a harmless cat"), ScreenVerdict::Allowed);
    }

    #[test]
    fn match_is_case_insensitive() {
        let screener = screener_with(vec![BannedWord {
            id: "b1".into(),
            words: vec!["Forbidden".into()],
            enable: true,
        }]);
        assert_eq!(
            screener.screen("a FORBIDDEN thing"),
            ScreenVerdict::Banned {
                word: "Forbidden".into()
            }
        );
    }

    #[test]
    fn disabled_entries_are_ignored() {
        let screener = screener_with(vec![BannedWord {
            id: "b1".into(),
            words: vec!["forbidden".into()],
            enable: false,
        }]);
        assert_eq!(
            screener.screen("a forbidden thing"),
            ScreenVerdict::Allowed
        );
    }

    #[test]
    fn empty_words_never_match() {
        let screener = screener_with(vec![BannedWord {
            id: "b1".into(),
            words: vec!["".into()],
            enable: true,
        }]);
        assert_eq!(screener.screen("anything"), ScreenVerdict::Allowed);
    }
}
