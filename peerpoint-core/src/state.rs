//! Shared pointer state.
//!
//! Both levels use the normalized `{ids, entities}` layout on the wire.
//! Identifier lists are always derived from the entity maps, so a document
//! that arrives with dangling or missing ids is repaired on decode rather
//! than trusted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PatchError;
use crate::patch::{self, Patch};
use crate::signal::ClientId;

/// One pointer reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerSample {
    /// Pointer identifier assigned by the input device.
    pub pointer_id: i32,
    /// `mouse`, `pen` or `touch`.
    pub pointer_type: String,
    /// Normalized pressure in `[0, 1]`.
    pub pressure: f64,
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

impl PointerSample {
    /// Map key for this pointer.
    #[must_use]
    pub fn key(&self) -> String {
        self.pointer_id.to_string()
    }
}

#[derive(Deserialize)]
struct PointersWire {
    #[serde(default)]
    ids: Vec<i32>,
    #[serde(default)]
    entities: BTreeMap<String, PointerSample>,
}

/// Active pointers of one client, in first-seen order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "PointersWire")]
pub struct Pointers {
    ids: Vec<i32>,
    entities: BTreeMap<String, PointerSample>,
}

impl From<PointersWire> for Pointers {
    fn from(wire: PointersWire) -> Self {
        let entities: BTreeMap<String, PointerSample> = wire
            .entities
            .into_values()
            .map(|sample| (sample.key(), sample))
            .collect();

        let mut seen = BTreeSet::new();
        let mut ids: Vec<i32> = wire
            .ids
            .into_iter()
            .filter(|id| entities.contains_key(&id.to_string()) && seen.insert(*id))
            .collect();
        let mut missing: Vec<i32> = entities
            .values()
            .map(|sample| sample.pointer_id)
            .filter(|id| !seen.contains(id))
            .collect();
        missing.sort_unstable();
        ids.extend(missing);

        Self { ids, entities }
    }
}

impl Pointers {
    /// Insert or update a sample.
    pub fn upsert(&mut self, sample: PointerSample) {
        if self.entities.insert(sample.key(), sample.clone()).is_none() {
            self.ids.push(sample.pointer_id);
        }
    }

    /// Drop a pointer.
    pub fn remove(&mut self, pointer_id: i32) -> Option<PointerSample> {
        let removed = self.entities.remove(&pointer_id.to_string())?;
        self.ids.retain(|id| *id != pointer_id);
        Some(removed)
    }

    /// Look up a pointer.
    #[must_use]
    pub fn get(&self, pointer_id: i32) -> Option<&PointerSample> {
        self.entities.get(&pointer_id.to_string())
    }

    /// Pointer ids in first-seen order.
    #[must_use]
    pub fn ids(&self) -> &[i32] {
        &self.ids
    }

    /// Samples in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &PointerSample> {
        self.ids
            .iter()
            .filter_map(|id| self.entities.get(&id.to_string()))
    }

    /// Number of active pointers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no pointer is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Everything one client publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    /// Owner.
    pub client_id: ClientId,
    /// Display hue in degrees, fixed for the session.
    pub hue: f64,
    /// Active pointers.
    #[serde(default)]
    pub pointers: Pointers,
}

impl ClientData {
    /// Fresh entry with no pointers.
    #[must_use]
    pub fn new(client_id: ClientId, hue: f64) -> Self {
        Self {
            client_id,
            hue,
            pointers: Pointers::default(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SharedStateWire {
    #[serde(default)]
    ids: Vec<ClientId>,
    #[serde(default)]
    entities: BTreeMap<ClientId, ClientData>,
}

/// Mapping from client to its published data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "SharedStateWire", into = "SharedStateWire")]
pub struct SharedState {
    entities: BTreeMap<ClientId, ClientData>,
}

impl From<SharedStateWire> for SharedState {
    fn from(wire: SharedStateWire) -> Self {
        Self {
            entities: wire.entities,
        }
    }
}

impl From<SharedState> for SharedStateWire {
    fn from(state: SharedState) -> Self {
        Self {
            ids: state.entities.keys().cloned().collect(),
            entities: state.entities,
        }
    }
}

impl SharedState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Client ids with an entry.
    pub fn ids(&self) -> impl Iterator<Item = &ClientId> {
        self.entities.keys()
    }

    /// Look up one client.
    #[must_use]
    pub fn get(&self, client: &ClientId) -> Option<&ClientData> {
        self.entities.get(client)
    }

    /// Whether `client` has an entry.
    #[must_use]
    pub fn contains(&self, client: &ClientId) -> bool {
        self.entities.contains_key(client)
    }

    /// Insert or replace a client's entry, keyed by its own id.
    pub fn insert(&mut self, data: ClientData) -> Option<ClientData> {
        self.entities.insert(data.client_id.clone(), data)
    }

    /// Remove a client's entry.
    pub fn remove(&mut self, client: &ClientId) -> Option<ClientData> {
        self.entities.remove(client)
    }

    /// Entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientData> {
        self.entities.values()
    }

    /// Number of clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no client has published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Render as a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::InvalidDocument`] if serialization fails.
    pub fn to_value(&self) -> Result<Value, PatchError> {
        serde_json::to_value(self).map_err(|e| PatchError::InvalidDocument(e.to_string()))
    }

    /// Decode from a JSON document, re-deriving every id list.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::InvalidDocument`] if the document does not
    /// describe a state.
    pub fn from_value(value: Value) -> Result<Self, PatchError> {
        serde_json::from_value(value).map_err(|e| PatchError::InvalidDocument(e.to_string()))
    }

    /// Apply a patch batch to a copy of this state.
    ///
    /// # Errors
    ///
    /// Returns a [`PatchError`] if any patch fails or the result is no
    /// longer a valid state. `self` is unchanged either way.
    pub fn patched(&self, patches: &[Patch]) -> Result<Self, PatchError> {
        let doc = self.to_value()?;
        let next = patch::apply(&doc, patches)?;
        Self::from_value(next)
    }
}
