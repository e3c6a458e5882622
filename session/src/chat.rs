//! Chat history and the local line editor.

use shared::{PlayerIndex, CHAT_EDIT_CAPACITY};
use std::collections::VecDeque;

const BACKSPACE: char = '\u{8}';
const DELETE: char = '\u{7f}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub from: PlayerIndex,
    pub name: String,
    pub text: String,
}

impl ChatLine {
    pub fn new(from: PlayerIndex, name: &str, text: &str) -> Self {
        Self {
            from,
            name: name.to_string(),
            text: text.to_string(),
        }
    }

    fn char_count(&self) -> usize {
        self.name.chars().count() + self.text.chars().count()
    }
}

/// Received lines, bounded by the total number of characters held. The
/// oldest lines go first.
#[derive(Debug)]
pub struct ChatBuffer {
    lines: VecDeque<ChatLine>,
    chars: usize,
    capacity: usize,
}

impl ChatBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            chars: 0,
            capacity,
        }
    }

    pub fn push(&mut self, mut line: ChatLine) {
        let name_chars = line.name.chars().count();
        let room = self.capacity.saturating_sub(name_chars);
        if line.text.chars().count() > room {
            line.text = line.text.chars().take(room).collect();
        }

        self.chars += line.char_count();
        self.lines.push_back(line);

        while self.chars > self.capacity {
            match self.lines.pop_front() {
                Some(dropped) => self.chars -= dropped.char_count(),
                None => break,
            }
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &ChatLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn char_count(&self) -> usize {
        self.chars
    }
}

/// Line being typed by the local player
#[derive(Debug)]
pub struct ChatComposer {
    buffer: String,
    capacity: usize,
}

impl Default for ChatComposer {
    fn default() -> Self {
        Self::new(CHAT_EDIT_CAPACITY)
    }
}

impl ChatComposer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: String::new(),
            capacity,
        }
    }

    /// Feeds one keystroke. Returns the finished line when Enter is pressed
    /// on a non-empty buffer.
    pub fn key(&mut self, key: char) -> Option<String> {
        match key {
            '\r' | '\n' => {
                if self.buffer.trim().is_empty() {
                    self.buffer.clear();
                    None
                } else {
                    Some(std::mem::take(&mut self.buffer))
                }
            }
            BACKSPACE | DELETE => {
                self.buffer.pop();
                None
            }
            c if c.is_control() => None,
            c => {
                if self.buffer.chars().count() < self.capacity {
                    self.buffer.push(c);
                }
                None
            }
        }
    }

    pub fn current(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
