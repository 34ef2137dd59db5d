//! Patch-based state synchronization.
//!
//! Each client owns exactly one entry of the [`SharedState`]. Local pointer
//! input mutates that entry through the [`Synchronizer`], which emits the
//! patches needed to reproduce the change and applies them to its own copy
//! with the same function replicas use.
//!
//! ## Data-channel messages
//!
//! - JSON array: a patch batch, applied atomically.
//! - JSON object with `clientId`: a full [`ClientData`] snapshot.
//! - `{"resync": "<clientId>"}`: request for a fresh snapshot.
//!
//! A batch that does not apply is dropped whole. Its writers are marked
//! stale, further batches from them are skipped, and a resync request is
//! produced for each; the next snapshot for a writer clears the mark.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde_json::{Map, Value};

use crate::error::{PatchError, SignalError};
use crate::patch::{self, Patch, PatchOp, PathSegment};
use crate::signal::ClientId;
use crate::state::{ClientData, PointerSample, SharedState};
use crate::transport::DataChannel;

const ENTITIES: &str = "entities";

/// Source of the per-client display hue.
pub struct HueSource(Box<dyn FnMut() -> f64 + Send>);

impl HueSource {
    /// Uniform draw over `[0, 360)`.
    #[must_use]
    pub fn random() -> Self {
        Self(Box::new(|| rand::rng().random_range(0.0..360.0)))
    }

    /// Always the same hue.
    #[must_use]
    pub fn fixed(hue: f64) -> Self {
        Self(Box::new(move || hue))
    }

    /// Custom generator.
    pub fn from_fn(draw: impl FnMut() -> f64 + Send + 'static) -> Self {
        Self(Box::new(draw))
    }

    fn draw(&mut self) -> f64 {
        (self.0)()
    }
}

impl Default for HueSource {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Debug for HueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HueSource")
    }
}

/// A message on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    /// Ordered patch batch.
    Patches(Vec<Patch>),
    /// Full entry of one client.
    Snapshot(ClientData),
    /// Ask the owner (or the hub) for a snapshot of this client.
    ResyncRequest(ClientId),
}

impl DataMessage {
    /// The client whose entry this message writes.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::NotOwned`] for a batch that touches more than
    /// one entry, anything outside `entities`, or an entry's `clientId`.
    pub fn writer(&self) -> Result<Option<ClientId>, PatchError> {
        match self {
            Self::Patches(patches) => sole_writer(patches),
            Self::Snapshot(data) => Ok(Some(data.client_id.clone())),
            Self::ResyncRequest(_) => Ok(None),
        }
    }

    /// Decode a data-channel text message.
    ///
    /// # Errors
    ///
    /// Returns a [`SignalError`] for invalid JSON or unrecognized shapes.
    pub fn decode(text: &str) -> Result<Self, SignalError> {
        match serde_json::from_str::<Value>(text)? {
            patches @ Value::Array(_) => serde_json::from_value(patches)
                .map(Self::Patches)
                .map_err(|e| malformed("patches", &e)),
            Value::Object(mut map) => {
                if let Some(id) = map.remove("resync") {
                    return serde_json::from_value(id)
                        .map(Self::ResyncRequest)
                        .map_err(|e| malformed("resync", &e));
                }
                if map.contains_key("clientId") {
                    return serde_json::from_value(Value::Object(map))
                        .map(Self::Snapshot)
                        .map_err(|e| malformed("snapshot", &e));
                }
                Err(SignalError::Untagged)
            }
            _ => Err(SignalError::NotAnObject),
        }
    }

    /// Encode as a data-channel text message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, SignalError> {
        let text = match self {
            Self::Patches(patches) => serde_json::to_string(patches)?,
            Self::Snapshot(data) => serde_json::to_string(data)?,
            Self::ResyncRequest(id) => {
                let mut map = Map::new();
                map.insert("resync".into(), Value::String(id.to_string()));
                serde_json::to_string(&Value::Object(map))?
            }
        };
        Ok(text)
    }
}

fn malformed(field: &'static str, e: &serde_json::Error) -> SignalError {
    SignalError::Malformed {
        field,
        reason: e.to_string(),
    }
}

/// What [`Synchronizer::apply_remote`] did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Batch of this many patches applied.
    Patched(usize),
    /// Entry of this client replaced by a snapshot.
    Snapshot(ClientId),
    /// Batch skipped because its writer is awaiting a snapshot.
    Stale(ClientId),
    /// Departed writer's entry removed.
    Removed(ClientId),
    /// Batch writes outside one foreign entry and was refused.
    Rejected(PatchError),
    /// Batch dropped; send `requests` to recover.
    Dropped {
        /// Why the batch failed.
        error: PatchError,
        /// One resync request per affected writer.
        requests: Vec<DataMessage>,
    },
    /// A peer asked for a snapshot; `reply` is set if we own that entry.
    ResyncRequested {
        /// Requested client.
        client: ClientId,
        /// Snapshot to send back.
        reply: Option<DataMessage>,
    },
    /// Message ignored (e.g. a snapshot of our own entry).
    Ignored,
}

fn entry_path(client: &ClientId) -> Vec<PathSegment> {
    vec![ENTITIES.into(), client.as_str().into()]
}

fn to_value(data: &ClientData) -> Result<Value, PatchError> {
    serde_json::to_value(data).map_err(|e| PatchError::InvalidDocument(e.to_string()))
}

/// The one client whose entry a batch writes; `None` for an empty batch.
///
/// Every patch must sit under `["entities", writer]`, never rewrite the
/// entry's `clientId`, and a whole-entry value must name the same writer.
fn sole_writer(patches: &[Patch]) -> Result<Option<ClientId>, PatchError> {
    let mut writer: Option<ClientId> = None;
    for p in patches {
        let id = match p.path.as_slice() {
            [PathSegment::Key(root), PathSegment::Key(id), rest @ ..] if root == ENTITIES => {
                let renames = matches!(rest.first(), Some(PathSegment::Key(field)) if field == "clientId");
                let whole_entry_mismatch = rest.is_empty()
                    && p.value.as_ref().is_some_and(|v| v.get("clientId").and_then(Value::as_str) != Some(id.as_str()));
                if renames || whole_entry_mismatch {
                    return Err(PatchError::NotOwned(p.rendered_path()));
                }
                id
            }
            _ => return Err(PatchError::NotOwned(p.rendered_path())),
        };
        match &writer {
            Some(w) if w.as_str() != id => return Err(PatchError::NotOwned(p.rendered_path())),
            Some(_) => {}
            None => writer = Some(ClientId::new(id.clone())),
        }
    }
    Ok(writer)
}

/// A single `remove ["entities", id]`: the relay's departure notice.
fn is_entry_removal(patches: &[Patch]) -> bool {
    matches!(patches, [p] if p.op == PatchOp::Remove && p.path.len() == 2)
}

/// Writer and replica of the shared state for one client.
#[derive(Debug)]
pub struct Synchronizer {
    client_id: ClientId,
    state: SharedState,
    hue: Option<f64>,
    hue_source: HueSource,
    stale: BTreeSet<ClientId>,
}

impl Synchronizer {
    /// Synchronizer with a random hue.
    #[must_use]
    pub fn new(client_id: ClientId) -> Self {
        Self::with_hue_source(client_id, HueSource::random())
    }

    /// Synchronizer with an injected hue source.
    #[must_use]
    pub fn with_hue_source(client_id: ClientId, hue_source: HueSource) -> Self {
        Self {
            client_id,
            state: SharedState::new(),
            hue: None,
            hue_source,
            stale: BTreeSet::new(),
        }
    }

    /// The local client.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Current state, own entry and replicas.
    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Whether batches from `client` are being skipped.
    #[must_use]
    pub fn is_stale(&self, client: &ClientId) -> bool {
        self.stale.contains(client)
    }

    /// Record a local pointer sample and return the patches describing it.
    ///
    /// The first call for this client returns a single `replace` of the
    /// whole entry; later calls return a minimal diff of the entry.
    ///
    /// # Errors
    ///
    /// Returns a [`PatchError`] if the sample cannot be represented (e.g.
    /// non-finite coordinates). State is unchanged in that case.
    pub fn pointer_event(&mut self, sample: PointerSample) -> Result<Vec<Patch>, PatchError> {
        let path = entry_path(&self.client_id);

        let patches = match self.state.get(&self.client_id) {
            Some(current) => {
                let mut next = current.clone();
                next.pointers.upsert(sample);
                patch::diff_at(path, &to_value(current)?, &to_value(&next)?)
            }
            None => {
                let hue = *self.hue.get_or_insert_with(|| self.hue_source.draw());
                let mut entry = ClientData::new(self.client_id.clone(), hue);
                entry.pointers.upsert(sample);
                vec![Patch::replace(path, to_value(&entry)?)]
            }
        };

        self.commit(&patches)?;
        Ok(patches)
    }

    /// Forget a pointer (released, cancelled or left the surface).
    ///
    /// Returns no patches if the pointer was not active.
    ///
    /// # Errors
    ///
    /// Returns a [`PatchError`] if the state cannot be re-encoded.
    pub fn release_pointer(&mut self, pointer_id: i32) -> Result<Vec<Patch>, PatchError> {
        let Some(current) = self.state.get(&self.client_id) else {
            return Ok(Vec::new());
        };
        let mut next = current.clone();
        if next.pointers.remove(pointer_id).is_none() {
            return Ok(Vec::new());
        }

        let patches = patch::diff_at(entry_path(&self.client_id), &to_value(current)?, &to_value(&next)?);
        self.commit(&patches)?;
        Ok(patches)
    }

    /// Snapshot of our own entry, if we have written one.
    #[must_use]
    pub fn snapshot(&self) -> Option<DataMessage> {
        self.state
            .get(&self.client_id)
            .cloned()
            .map(DataMessage::Snapshot)
    }

    fn commit(&mut self, patches: &[Patch]) -> Result<(), PatchError> {
        self.state = self.state.patched(patches)?;
        Ok(())
    }

    /// Apply a message received from a peer.
    pub fn apply_remote(&mut self, message: DataMessage) -> ApplyOutcome {
        match message {
            DataMessage::Patches(patches) => {
                let writer = match sole_writer(&patches) {
                    Ok(Some(writer)) if writer != self.client_id => writer,
                    Ok(Some(_)) => {
                        tracing::warn!("Rejecting remote batch that writes our own entry");
                        return ApplyOutcome::Rejected(PatchError::NotOwned(format!("/{}/{}", ENTITIES, self.client_id)));
                    }
                    Ok(None) => return ApplyOutcome::Ignored,
                    Err(error) => {
                        tracing::warn!(patches = patches.len(), "Rejecting remote batch: {}", error);
                        return ApplyOutcome::Rejected(error);
                    }
                };
                if is_entry_removal(&patches) {
                    self.stale.remove(&writer);
                    return match self.state.remove(&writer) {
                        Some(_) => ApplyOutcome::Removed(writer),
                        None => ApplyOutcome::Ignored,
                    };
                }
                if self.stale.contains(&writer) {
                    tracing::debug!(writer = %writer, "Skipping batch from stale writer");
                    return ApplyOutcome::Stale(writer);
                }
                match self.commit(&patches) {
                    Ok(()) => ApplyOutcome::Patched(patches.len()),
                    Err(error) => {
                        tracing::warn!(writer = %writer, patches = patches.len(), "Dropping patch batch: {}", error);
                        self.stale.insert(writer.clone());
                        ApplyOutcome::Dropped {
                            error,
                            requests: vec![DataMessage::ResyncRequest(writer)],
                        }
                    }
                }
            }
            DataMessage::Snapshot(data) => {
                if data.client_id == self.client_id {
                    return ApplyOutcome::Ignored;
                }
                let id = data.client_id.clone();
                self.stale.remove(&id);
                self.state.insert(data);
                ApplyOutcome::Snapshot(id)
            }
            DataMessage::ResyncRequest(client) => {
                let reply = if client == self.client_id {
                    self.snapshot()
                } else {
                    None
                };
                ApplyOutcome::ResyncRequested { client, reply }
            }
        }
    }

    /// Send one message to every open channel.
    ///
    /// Closed channels are skipped and send failures are logged. Returns
    /// the number of channels that accepted the message.
    ///
    /// # Errors
    ///
    /// Returns a [`SignalError`] if the message cannot be encoded.
    pub async fn broadcast(message: &DataMessage, channels: &[Arc<dyn DataChannel>]) -> Result<usize, SignalError> {
        let text = message.encode()?;
        Ok(broadcast_text(&text, channels).await)
    }
}

/// Send already-encoded text to every open channel.
///
/// Returns the number of channels that accepted it.
pub async fn broadcast_text(text: &str, channels: &[Arc<dyn DataChannel>]) -> usize {
    let mut delivered = 0;
    for channel in channels {
        if !channel.is_open() {
            continue;
        }
        match channel.send_text(text).await {
            Ok(()) => delivered += 1,
            Err(e) => tracing::debug!(label = channel.label(), "Broadcast send failed: {}", e),
        }
    }
    delivered
}

/// Best-effort copy of everyone's state, kept by a relay that only
/// observes traffic.
#[derive(Debug, Default)]
pub struct Replica {
    state: SharedState,
}

impl Replica {
    /// Empty replica.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view.
    #[must_use]
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Fold an observed message into the replica.
    ///
    /// A batch that does not apply evicts its writers' entries so that
    /// stale data is never served; their next snapshot restores them.
    ///
    /// # Errors
    ///
    /// Returns the [`PatchError`] of a dropped batch.
    pub fn observe(&mut self, message: &DataMessage) -> Result<(), PatchError> {
        match message {
            DataMessage::Patches(patches) => {
                let Some(writer) = sole_writer(patches)? else {
                    return Ok(());
                };
                match self.state.patched(patches) {
                    Ok(next) => {
                        self.state = next;
                        Ok(())
                    }
                    Err(e) => {
                        self.state.remove(&writer);
                        Err(e)
                    }
                }
            }
            DataMessage::Snapshot(data) => {
                self.state.insert(data.clone());
                Ok(())
            }
            DataMessage::ResyncRequest(_) => Ok(()),
        }
    }

    /// Snapshot of one client, if known.
    #[must_use]
    pub fn snapshot_of(&self, client: &ClientId) -> Option<DataMessage> {
        self.state.get(client).cloned().map(DataMessage::Snapshot)
    }

    /// One snapshot per known client.
    #[must_use]
    pub fn snapshots(&self) -> Vec<DataMessage> {
        self.state
            .iter()
            .cloned()
            .map(DataMessage::Snapshot)
            .collect()
    }

    /// Drop a departed client; returns the patch peers should apply.
    pub fn forget(&mut self, client: &ClientId) -> Option<DataMessage> {
        self.state
            .remove(client)
            .map(|_| DataMessage::Patches(vec![Patch::remove(entry_path(client))]))
    }
}
