use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_QUERY_CHARS: usize = 256;
pub const POPULAR_QUERY: &str = "order:rank";
pub const LATEST_QUERY: &str = "";

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").expect("word pattern"));

/// One whitespace-delimited piece of a search string. Byte ranges index the
/// searched text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterToken {
    Plain(Range<usize>),
    KeyValue { key: Range<usize>, value: Range<usize> },
}

impl FilterToken {
    pub fn span(&self) -> Range<usize> {
        match self {
            FilterToken::Plain(range) => range.clone(),
            FilterToken::KeyValue { key, value } => key.start..value.end,
        }
    }
}

/// Splits a search string into plain words and `key:value` filters. This only
/// drives highlighting: a word such as `:x` or `key:` is still reported as a
/// key/value pair with an empty side, and nothing is ever rejected.
pub fn parse_filters(text: &str) -> Vec<FilterToken> {
    WORD.find_iter(text)
        .map(|word| match word.as_str().find(':') {
            Some(colon) => {
                let split = word.start() + colon;
                FilterToken::KeyValue {
                    key: word.start()..split,
                    value: split + 1..word.end(),
                }
            }
            None => FilterToken::Plain(word.range()),
        })
        .collect()
}

pub fn pool_query(pool_id: i64) -> String {
    format!("pool:{pool_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shortcut {
    #[default]
    Latest,
    Popular,
}

impl Shortcut {
    pub fn query(self) -> &'static str {
        match self {
            Shortcut::Latest => LATEST_QUERY,
            Shortcut::Popular => POPULAR_QUERY,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Shortcut::Latest => "Latest",
            Shortcut::Popular => "Popular",
        }
    }
}

/// Single-line edit buffer with a character cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineEditor {
    text: String,
    cursor: usize,
}

impl LineEditor {
    pub fn with_text(text: &str) -> Self {
        let mut editor = Self::default();
        editor.set_text(text);
        editor
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Cursor position in characters.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn cursor_byte(&self) -> usize {
        self.byte_at(self.cursor)
    }

    pub fn set_text(&mut self, text: &str) {
        self.text = text.chars().take(MAX_QUERY_CHARS).collect();
        self.cursor = self.text.chars().count();
    }

    pub fn insert(&mut self, ch: char) {
        if ch.is_control() || self.text.chars().count() >= MAX_QUERY_CHARS {
            return;
        }
        let at = self.byte_at(self.cursor);
        self.text.insert(at, ch);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor -= 1;
        let at = self.byte_at(self.cursor);
        self.text.remove(at);
    }

    pub fn delete(&mut self) {
        if self.cursor >= self.text.chars().count() {
            return;
        }
        let at = self.byte_at(self.cursor);
        self.text.remove(at);
    }

    pub fn left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.text.chars().count());
    }

    pub fn home(&mut self) {
        self.cursor = 0;
    }

    pub fn end(&mut self) {
        self.cursor = self.text.chars().count();
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.cursor = 0;
    }

    fn byte_at(&self, chars: usize) -> usize {
        self.text
            .char_indices()
            .nth(chars)
            .map(|(idx, _)| idx)
            .unwrap_or(self.text.len())
    }
}
