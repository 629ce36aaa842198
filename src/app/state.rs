use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::NoteOptions;

pub type NoteId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub content: String,
}

impl Note {
    pub fn blank(id: NoteId, options: &NoteOptions) -> Self {
        Self {
            id,
            title: options.default_title.clone(),
            content: String::new(),
        }
    }

    /// Returns a copy carrying `content` with the title re-derived from it.
    pub fn with_content(&self, content: impl Into<String>, options: &NoteOptions) -> Self {
        let content = content.into();
        Self {
            id: self.id,
            title: derive_title(&content, options),
            content,
        }
    }
}

pub fn derive_title(content: &str, options: &NoteOptions) -> String {
    let first_line = content.split('\n').next().unwrap_or_default();
    let title: String = first_line.chars().take(options.title_max_chars).collect();
    if title.is_empty() {
        options.default_title.clone()
    } else {
        title
    }
}

/// Hands out creation-time ids in milliseconds, bumping past the last issued
/// id when the clock has not moved.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: NoteId,
}

impl IdGenerator {
    /// Once `NoteId::MAX` has been seen, ids restart from the clock and wrap
    /// to the lowest free positive id instead of overflowing.
    pub fn next_id<F>(&mut self, taken: F) -> NoteId
    where
        F: Fn(NoteId) -> bool,
    {
        let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as NoteId;
        let start = match self.last.checked_add(1) {
            Some(next) => now.max(next),
            None => now,
        };
        let candidate = (start..=NoteId::MAX)
            .chain(1..start)
            .find(|id| !taken(*id))
            .unwrap_or(start);
        self.last = self.last.max(candidate);
        candidate
    }

    pub fn observe(&mut self, id: NoteId) {
        self.last = self.last.max(id);
    }
}

/// Ordered notes keyed by id plus the active pointer.
#[derive(Debug, Clone, Default)]
pub struct NoteCollection {
    notes: IndexMap<NoteId, Note>,
    active: Option<NoteId>,
}

// IndexMap equality ignores order; position matters here.
impl PartialEq for NoteCollection {
    fn eq(&self, other: &Self) -> bool {
        self.active == other.active && self.notes.iter().eq(other.notes.iter())
    }
}

impl NoteCollection {
    /// Builds a collection from persisted or fetched parts. Duplicate ids keep
    /// their first occurrence; a dangling active id falls back to the first
    /// note.
    pub fn from_parts(notes: Vec<Note>, active: Option<NoteId>) -> Self {
        let mut map = IndexMap::with_capacity(notes.len());
        for note in notes {
            if map.contains_key(&note.id) {
                tracing::warn!(note_id = note.id, "dropping duplicate note id");
                continue;
            }
            map.insert(note.id, note);
        }
        let mut collection = Self {
            notes: map,
            active,
        };
        collection.normalize_active();
        collection
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn contains(&self, id: NoteId) -> bool {
        self.notes.contains_key(&id)
    }

    pub fn get(&self, id: NoteId) -> Option<&Note> {
        self.notes.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn to_vec(&self) -> Vec<Note> {
        self.notes.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<NoteId> {
        self.notes.keys().copied().collect()
    }

    pub fn active_id(&self) -> Option<NoteId> {
        self.active
    }

    pub fn active(&self) -> Option<&Note> {
        self.active.and_then(|id| self.notes.get(&id))
    }

    pub fn position(&self, id: NoteId) -> Option<usize> {
        self.notes.get_index_of(&id)
    }

    /// Appends `note` and makes it active.
    pub fn push(&mut self, note: Note) {
        let id = note.id;
        self.notes.insert(id, note);
        self.active = Some(id);
    }

    pub fn select(&mut self, id: NoteId) -> bool {
        if !self.notes.contains_key(&id) {
            return false;
        }
        self.active = Some(id);
        true
    }

    /// Removes `id`. When it was active, the note now at its index becomes
    /// active, or the new last note if it was the last one.
    pub fn remove(&mut self, id: NoteId) -> Option<Note> {
        let (index, _, removed) = self.notes.shift_remove_full(&id)?;
        if self.active == Some(id) {
            self.active = if self.notes.is_empty() {
                None
            } else {
                let next = index.min(self.notes.len() - 1);
                self.notes.get_index(next).map(|(id, _)| *id)
            };
        }
        Some(removed)
    }

    pub fn replace(&mut self, note: Note) -> bool {
        match self.notes.get_mut(&note.id) {
            Some(slot) => {
                *slot = note;
                true
            }
            None => false,
        }
    }

    pub fn move_index(&mut self, from: usize, to: usize) -> bool {
        let len = self.notes.len();
        if from >= len || to >= len {
            return false;
        }
        if from != to {
            self.notes.move_index(from, to);
        }
        true
    }

    fn normalize_active(&mut self) {
        let valid = self
            .active
            .map(|id| self.notes.contains_key(&id))
            .unwrap_or(false);
        if !valid {
            self.active = self.notes.get_index(0).map(|(id, _)| *id);
        }
    }
}
