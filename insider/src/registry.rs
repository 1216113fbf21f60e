//! Participant identity, roles, and presence.
//!
//! A connection is assigned a role exactly once, at connect time, and keeps
//! it until disconnect. Colors come from a small fixed palette and are
//! unique among connected participants; a disconnect returns the color to
//! the front of the pool.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trust level of a connection. Immutable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Host,
    Candidate,
    Spectator,
    Recorder,
}

impl Role {
    /// Whether this role may mutate the shared documents.
    pub fn may_edit_document(&self) -> bool {
        !matches!(self, Role::Spectator | Role::Recorder)
    }
}

/// Cursor/selection rectangle in editor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start_line: u32,
    pub start_char: u32,
    pub end_line: u32,
    pub end_char: u32,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            start_line: 1,
            start_char: 1,
            end_line: 1,
            end_char: 1,
        }
    }
}

/// Caret position inside the notes pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesAnchor {
    pub path: Vec<String>,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesSelection {
    pub anchor: NotesAnchor,
    pub head: NotesAnchor,
}

/// One connected participant as broadcast in presence payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub role: Role,
    pub name: String,
    pub color: String,
    pub selection: Selection,
    pub notes_selection: Option<NotesSelection>,
    pub is_focused: bool,
}

/// Client-writable subset of a participant's presence.
///
/// Role and color are never client-writable; everything here is optional
/// so partial updates merge into the existing state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub name: Option<String>,
    pub selection: Option<Selection>,
    pub notes_selection: Option<NotesSelection>,
    pub is_focused: Option<bool>,
}

/// The fixed cursor-color palette.
const COLORS: [&str; 5] = ["#AE022B", "#571BB8", "#0051B5", "#006627", "#3F5676"];

/// Connected participants for one room, in connection order.
pub struct SessionRegistry {
    participants: Vec<Participant>,
    unused_colors: VecDeque<&'static str>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            participants: Vec::new(),
            unused_colors: COLORS.iter().copied().collect(),
        }
    }

    /// Register a connection with its already-decided role.
    ///
    /// Assigns a free palette color; with more participants than palette
    /// entries the pick falls back to a deterministic palette slot.
    pub fn connect(&mut self, id: Uuid, role: Role) -> &Participant {
        let color = self
            .unused_colors
            .pop_front()
            .map(str::to_owned)
            .unwrap_or_else(|| COLORS[(id.as_u128() % COLORS.len() as u128) as usize].to_owned());

        self.participants.push(Participant {
            id,
            role,
            name: String::new(),
            color,
            selection: Selection::default(),
            notes_selection: None,
            is_focused: false,
        });
        self.participants.last().unwrap()
    }

    /// Remove a participant, returning its color to the pool.
    pub fn disconnect(&mut self, id: Uuid) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        let participant = self.participants.remove(index);
        if let Some(slot) = COLORS.iter().copied().find(|c| *c == participant.color) {
            if !self.unused_colors.contains(&slot) {
                self.unused_colors.push_front(slot);
            }
        }
        Some(participant)
    }

    pub fn get(&self, id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn role_of(&self, id: Uuid) -> Option<Role> {
        self.get(id).map(|p| p.role)
    }

    /// Merge a client-supplied presence update into the participant.
    pub fn apply_update(&mut self, id: Uuid, update: PresenceUpdate) -> bool {
        let Some(participant) = self.participants.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        if let Some(name) = update.name {
            participant.name = name;
        }
        if let Some(selection) = update.selection {
            participant.selection = selection;
        }
        if let Some(notes_selection) = update.notes_selection {
            participant.notes_selection = Some(notes_selection);
        }
        if let Some(is_focused) = update.is_focused {
            participant.is_focused = is_focused;
        }
        true
    }

    /// Presence payload for hosts and spectators: everyone except recorders.
    pub fn users_for_privileged(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| p.role != Role::Recorder)
            .cloned()
            .collect()
    }

    /// Presence payload for candidates: no spectators or recorders, and
    /// hosts always appear focused so a candidate never sees one as away.
    pub fn users_for_candidates(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| !matches!(p.role, Role::Spectator | Role::Recorder))
            .cloned()
            .map(|mut p| {
                if p.role == Role::Host {
                    p.is_focused = true;
                }
                p
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
