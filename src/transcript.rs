//! Running conversation text, one entry per role and turn.

use std::collections::VecDeque;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub turn: u64,
    pub role: Role,
    pub text: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[derive(Debug)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
    limit: usize,
}

impl Transcript {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn push(&mut self, entry: TranscriptEntry) -> &TranscriptEntry {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        // just pushed
        &self.entries[self.entries.len() - 1]
    }

    fn last_assistant_mut(&mut self, turn: u64) -> Option<&mut TranscriptEntry> {
        self.entries
            .back_mut()
            .filter(|e| e.role == Role::Assistant && e.turn == turn)
    }

    pub fn push_user(&mut self, turn: u64, text: &str) -> &TranscriptEntry {
        self.push(TranscriptEntry {
            turn,
            role: Role::User,
            text: text.to_string(),
            is_final: true,
        })
    }

    /// Concatenate onto the last entry when it is the assistant's entry for
    /// `turn`, otherwise start a new one.
    pub fn apply_delta(&mut self, turn: u64, delta: &str) -> &TranscriptEntry {
        if self.last_assistant_mut(turn).is_some() {
            let idx = self.entries.len() - 1;
            let entry = &mut self.entries[idx];
            entry.text.push_str(delta);
            return &self.entries[idx];
        }
        self.push(TranscriptEntry {
            turn,
            role: Role::Assistant,
            text: delta.to_string(),
            is_final: false,
        })
    }

    pub fn apply_final(&mut self, turn: u64, text: &str) -> &TranscriptEntry {
        if self.last_assistant_mut(turn).is_some() {
            let idx = self.entries.len() - 1;
            let entry = &mut self.entries[idx];
            entry.text = text.to_string();
            entry.is_final = true;
            return &self.entries[idx];
        }
        self.push(TranscriptEntry {
            turn,
            role: Role::Assistant,
            text: text.to_string(),
            is_final: true,
        })
    }
}
