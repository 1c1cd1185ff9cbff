//! The playlist: an ordered list of track paths with a cursor.
//!
//! The cursor is `None` ("before the first track") or a valid index into
//! the list. Every mutator preserves that invariant; callers never see an
//! out-of-range cursor.

use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default)]
pub struct Playlist {
    songs: Vec<PathBuf>,
    cursor: Option<usize>,
}

impl Playlist {
    pub fn new() -> Playlist {
        Playlist::default()
    }

    /// Rebuild from a persisted snapshot. An out-of-range cursor is
    /// discarded rather than trusted.
    pub fn from_parts(songs: Vec<PathBuf>, cursor: Option<usize>) -> Playlist {
        let cursor = cursor.filter(|&i| i < songs.len());
        Playlist { songs, cursor }
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn songs(&self) -> &[PathBuf] {
        &self.songs
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// The entry under the cursor.
    pub fn current(&self) -> Option<&Path> {
        self.cursor.map(|i| self.songs[i].as_path())
    }

    /// Append one entry. Never moves the cursor.
    pub fn enqueue(&mut self, path: PathBuf) {
        debug!(path = %path.display(), "enqueue");
        self.songs.push(path);
    }

    /// Step the cursor forward, wrapping to the start when `repeat_all`
    /// is set. Returns the new current entry, or `None` when the end is
    /// reached (cursor resets).
    pub fn advance(&mut self, repeat_all: bool) -> Option<&Path> {
        if self.songs.is_empty() {
            self.cursor = None;
            return None;
        }
        let next = match self.cursor {
            None => 0,
            Some(i) => i + 1,
        };
        if next >= self.songs.len() {
            if repeat_all {
                self.cursor = Some(0);
            } else {
                self.cursor = None;
                return None;
            }
        } else {
            self.cursor = Some(next);
        }
        self.current()
    }

    /// Step the cursor backward, clamped at the first entry. There is no
    /// wrap-around. With no cursor yet, starts at the first entry.
    pub fn previous(&mut self) -> Option<&Path> {
        if self.songs.is_empty() {
            self.cursor = None;
            return None;
        }
        self.cursor = Some(match self.cursor {
            None | Some(0) => 0,
            Some(i) => i - 1,
        });
        self.current()
    }

    /// Move the cursor to the first entry.
    pub fn rewind(&mut self) {
        if !self.songs.is_empty() {
            self.cursor = Some(0);
        }
    }

    /// Move the cursor to the entry exactly matching `target`.
    pub fn jump_to(&mut self, target: &Path) -> Option<usize> {
        let idx = self.songs.iter().position(|p| p == target)?;
        self.cursor = Some(idx);
        Some(idx)
    }

    /// Forget the cursor without touching the entries.
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    /// Drop every entry and the cursor.
    pub fn truncate(&mut self) {
        debug!(dropped = self.songs.len(), "truncate playlist");
        self.songs.clear();
        self.cursor = None;
    }

    /// Remove the entry under the cursor. The cursor keeps its index so
    /// it points at the following entry, or resets when it fell off the
    /// end of the list.
    pub fn drop_current(&mut self) {
        let Some(i) = self.cursor else { return };
        self.songs.remove(i);
        if i >= self.songs.len() {
            self.cursor = None;
        }
    }

    /// Splice committed entries into the list.
    ///
    /// A negative `offset` appends; a non-negative one replaces
    /// everything from that index (clamped to the list length) to the
    /// end. Returns `true` when the cursor was invalidated by the splice
    /// and playback of the current entry must stop.
    pub fn splice(&mut self, entries: Vec<PathBuf>, offset: i64) -> bool {
        if offset < 0 {
            debug!(added = entries.len(), "commit: append");
            self.songs.extend(entries);
            return false;
        }
        let at = (offset as usize).min(self.songs.len());
        debug!(added = entries.len(), at, "commit: replace tail");
        self.songs.truncate(at);
        self.songs.extend(entries);
        match self.cursor {
            Some(i) if i >= self.songs.len() => {
                self.cursor = None;
                true
            }
            _ => false,
        }
    }
}
