//! Protocol messages exchanged over a session.
//!
//! Each direction is a sequence of frames, and each frame carries exactly one
//! phase. That invariant holds by construction: [`Request`] and [`Response`]
//! are enums with one variant per phase.
//!
//! ```text
//! runtime                                  connector
//!   Open ──────────────────────────────────►
//!        ◄────────────────────────────────── Opened
//!   Acknowledge ───────────────────────────►
//!   Load* ─────────────────────────────────►
//!        ◄────────────────────────────────── Acknowledged
//!        ◄────────────────────────────────── Loaded*
//!   Flush ─────────────────────────────────►
//!        ◄────────────────────────────────── Flushed
//!   Store* ────────────────────────────────►
//!   StartCommit ───────────────────────────►
//!        ◄────────────────────────────────── StartedCommit
//!   Acknowledge ───────────────────────────►   (next round)
//! ```
//!
//! Repeated phases (Load, Store, Loaded) batch items of one binding into a
//! frame, packing their byte fields into a single arena.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::arena::Slice;
use crate::codec::MsgPackCodec;
use crate::error::{Result, TxnError};

/// Runtime checkpoint meaning "discard all prior progress and start over".
///
/// Distinct from an empty checkpoint, which means "resume from the runtime's
/// own most recent checkpoint".
pub const EXPLICIT_ZERO_CHECKPOINT: [u8; 6] = [0xf8, 0xff, 0xff, 0xff, 0x0f, 0x01];

/// The phase carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    Open = 0x01,
    Load = 0x02,
    Flush = 0x03,
    Store = 0x04,
    StartCommit = 0x05,
    Acknowledge = 0x06,
    Opened = 0x81,
    Loaded = 0x82,
    Flushed = 0x83,
    StartedCommit = 0x85,
    Acknowledged = 0x86,
}

impl Phase {
    /// Wire code of this phase.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Phase for a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Phase::Open,
            0x02 => Phase::Load,
            0x03 => Phase::Flush,
            0x04 => Phase::Store,
            0x05 => Phase::StartCommit,
            0x06 => Phase::Acknowledge,
            0x81 => Phase::Opened,
            0x82 => Phase::Loaded,
            0x83 => Phase::Flushed,
            0x85 => Phase::StartedCommit,
            0x86 => Phase::Acknowledged,
            _ => return None,
        })
    }

    /// Whether this phase flows from connector to runtime.
    #[inline]
    pub fn is_response(self) -> bool {
        self.code() & 0x80 != 0
    }

    /// Name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Open => "Open",
            Phase::Load => "Load",
            Phase::Flush => "Flush",
            Phase::Store => "Store",
            Phase::StartCommit => "StartCommit",
            Phase::Acknowledge => "Acknowledge",
            Phase::Opened => "Opened",
            Phase::Loaded => "Loaded",
            Phase::Flushed => "Flushed",
            Phase::StartedCommit => "StartedCommit",
            Phase::Acknowledged => "Acknowledged",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fields of a binding's documents which are materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    pub keys: Vec<String>,
    pub values: Vec<String>,
    pub document: String,
}

/// One configured mapping of a source collection to a destination resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub collection: String,
    pub resource_path: Vec<String>,
    pub resource_config_json: String,
    pub field_selection: FieldSelection,
    pub delta_updates: bool,
}

/// Specification of the materialization driven by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationSpec {
    pub name: String,
    pub config_json: String,
    pub bindings: Vec<Binding>,
}

impl MaterializationSpec {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TxnError::validation("materialization.name", "expected non-empty"));
        }
        if self.bindings.is_empty() {
            return Err(TxnError::validation(
                "materialization.bindings",
                "expected at least one binding",
            ));
        }
        for (index, binding) in self.bindings.iter().enumerate() {
            let path = |field: &str| format!("materialization.bindings[{}].{}", index, field);
            if binding.collection.is_empty() {
                return Err(TxnError::validation(path("collection"), "expected non-empty"));
            }
            if binding.resource_path.is_empty() {
                return Err(TxnError::validation(path("resource_path"), "expected non-empty"));
            }
            if binding.field_selection.keys.is_empty() {
                return Err(TxnError::validation(
                    path("field_selection.keys"),
                    "expected at least one key",
                ));
            }
        }
        Ok(())
    }
}

/// Partition of the hashed key and r-clock spaces assigned to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub key_begin: u32,
    pub key_end: u32,
    pub r_clock_begin: u32,
    pub r_clock_end: u32,
}

impl RangeSpec {
    /// The range covering all keys and r-clocks.
    pub fn full() -> Self {
        Self {
            key_begin: 0,
            key_end: u32::MAX,
            r_clock_begin: 0,
            r_clock_end: u32::MAX,
        }
    }

    /// Whether this range covers only part of the r-clock space.
    pub fn splits_r_clock(&self) -> bool {
        self.r_clock_begin != 0 || self.r_clock_end != u32::MAX
    }

    fn validate(&self) -> Result<()> {
        if self.key_begin > self.key_end {
            return Err(TxnError::validation(
                "range.key_begin",
                format!("{:#010x} > key_end {:#010x}", self.key_begin, self.key_end),
            ));
        }
        if self.r_clock_begin > self.r_clock_end {
            return Err(TxnError::validation(
                "range.r_clock_begin",
                format!(
                    "{:#010x} > r_clock_end {:#010x}",
                    self.r_clock_begin, self.r_clock_end
                ),
            ));
        }
        Ok(())
    }
}

impl Default for RangeSpec {
    fn default() -> Self {
        Self::full()
    }
}

/// Opens a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Open {
    pub materialization: MaterializationSpec,
    pub version: String,
    pub range: RangeSpec,
    /// Last persisted connector state, or empty.
    pub state_json: Bytes,
}

impl Open {
    /// Validate field-level invariants.
    pub fn validate(&self) -> Result<()> {
        self.materialization.validate()?;
        if self.version.is_empty() {
            return Err(TxnError::validation("version", "expected non-empty"));
        }
        self.range.validate()
    }

    /// Number of bindings, which bounds every item's binding index.
    pub fn bindings(&self) -> usize {
        self.materialization.bindings.len()
    }
}

/// How the runtime should resume, as chosen by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Use the runtime's own most recent checkpoint.
    Internal,
    /// Discard all prior progress and start from the beginning.
    ExplicitZero,
    /// Resume from this connector-held checkpoint.
    Checkpoint(Bytes),
}

/// Response to Open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opened {
    pub runtime_checkpoint: Option<Bytes>,
}

impl Opened {
    /// Resume from the runtime's own checkpoint.
    pub fn internal() -> Self {
        Self::default()
    }

    /// Discard prior progress.
    pub fn explicit_zero() -> Self {
        Self {
            runtime_checkpoint: Some(Bytes::from_static(&EXPLICIT_ZERO_CHECKPOINT)),
        }
    }

    /// Resume from a connector-held checkpoint.
    pub fn checkpoint(checkpoint: impl Into<Bytes>) -> Self {
        Self {
            runtime_checkpoint: Some(checkpoint.into()),
        }
    }

    /// Validate field-level invariants.
    pub fn validate(&self) -> Result<()> {
        match &self.runtime_checkpoint {
            Some(cp) if cp.is_empty() => Err(TxnError::validation(
                "opened.runtime_checkpoint",
                "expected absent or non-empty",
            )),
            _ => Ok(()),
        }
    }

    /// Classify the carried runtime checkpoint.
    pub fn resume(&self) -> Resume {
        match &self.runtime_checkpoint {
            None => Resume::Internal,
            Some(cp) if cp.is_empty() => Resume::Internal,
            Some(cp) if cp[..] == EXPLICIT_ZERO_CHECKPOINT => Resume::ExplicitZero,
            Some(cp) => Resume::Checkpoint(cp.clone()),
        }
    }
}

/// A connector-owned checkpoint update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorState {
    pub updated_json: Bytes,
    /// Apply `updated_json` as an RFC 7396 merge patch instead of replacing.
    pub merge_patch: bool,
}

impl ConnectorState {
    /// State which replaces the prior state.
    pub fn replace(json: impl Into<Bytes>) -> Self {
        Self {
            updated_json: json.into(),
            merge_patch: false,
        }
    }

    /// State which is merge-patched into the prior state.
    pub fn merge(json: impl Into<Bytes>) -> Self {
        Self {
            updated_json: json.into(),
            merge_patch: true,
        }
    }

    /// Apply this update to `state`.
    pub fn apply(&self, state: &mut Value) -> Result<()> {
        let update: Value = serde_json::from_slice(&self.updated_json)?;
        if self.merge_patch {
            merge_patch(state, &update);
        } else {
            *state = update;
        }
        Ok(())
    }

    fn validate(&self, path: &str) -> Result<()> {
        if self.updated_json.is_empty() {
            return Err(TxnError::validation(
                format!("{}.updated_json", path),
                "expected non-empty",
            ));
        }
        if serde_json::from_slice::<serde::de::IgnoredAny>(&self.updated_json).is_err() {
            return Err(TxnError::validation(
                format!("{}.updated_json", path),
                "expected valid JSON",
            ));
        }
        Ok(())
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// One requested key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadItem {
    pub key_packed: Slice,
    /// Readable key JSON. May be empty.
    pub key_json: Slice,
}

/// Requested keys of one binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBatch {
    pub binding: u32,
    pub arena: Bytes,
    pub items: Vec<LoadItem>,
}

/// One stored document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreItem {
    pub key_packed: Slice,
    pub key_json: Slice,
    /// Packed values tuple. May be empty.
    pub values_packed: Slice,
    pub doc_json: Slice,
    /// Whether the document already exists in the store.
    pub exists: bool,
}

/// Stored documents of one binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreBatch {
    pub binding: u32,
    pub arena: Bytes,
    pub items: Vec<StoreItem>,
}

/// One document found by the connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedItem {
    pub doc_json: Slice,
}

/// Found documents of one binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedBatch {
    pub binding: u32,
    pub arena: Bytes,
    pub items: Vec<LoadedItem>,
}

macro_rules! batch_common {
    ($batch:ty, $path:literal) => {
        impl $batch {
            /// Resolve a slice of this batch's arena. Empty if out of range;
            /// a validated batch never is.
            pub fn resolve(&self, slice: Slice) -> Bytes {
                slice.get(&self.arena).unwrap_or_default()
            }

            /// Number of items.
            pub fn len(&self) -> usize {
                self.items.len()
            }

            /// Whether the batch holds no items.
            pub fn is_empty(&self) -> bool {
                self.items.is_empty()
            }

            fn check_binding(&self, bindings: usize) -> Result<()> {
                if self.items.is_empty() {
                    return Err(TxnError::validation(
                        concat!($path, ".items"),
                        "expected at least one item",
                    ));
                }
                if self.binding as usize >= bindings {
                    return Err(TxnError::validation(
                        concat!($path, ".binding"),
                        format!("{} is not less than {} bindings", self.binding, bindings),
                    ));
                }
                Ok(())
            }

            fn check_slice(
                &self,
                index: usize,
                field: &str,
                slice: Slice,
                required: bool,
            ) -> Result<()> {
                let path = || format!(concat!($path, ".items[{}].{}"), index, field);
                if !slice.fits(self.arena.len()) {
                    return Err(TxnError::validation(
                        path(),
                        format!(
                            "slice {}..{} outside arena of {} bytes",
                            slice.begin,
                            slice.end,
                            self.arena.len()
                        ),
                    ));
                }
                if required && slice.is_empty() {
                    return Err(TxnError::validation(path(), "expected non-empty"));
                }
                Ok(())
            }
        }
    };
}

batch_common!(LoadBatch, "load");
batch_common!(StoreBatch, "store");
batch_common!(LoadedBatch, "loaded");

impl LoadBatch {
    /// Validate items against the session's binding count.
    pub fn validate(&self, bindings: usize) -> Result<()> {
        self.check_binding(bindings)?;
        for (index, item) in self.items.iter().enumerate() {
            self.check_slice(index, "key_packed", item.key_packed, true)?;
            self.check_slice(index, "key_json", item.key_json, false)?;
        }
        Ok(())
    }
}

impl StoreBatch {
    /// Validate items against the session's binding count.
    pub fn validate(&self, bindings: usize) -> Result<()> {
        self.check_binding(bindings)?;
        for (index, item) in self.items.iter().enumerate() {
            self.check_slice(index, "key_packed", item.key_packed, true)?;
            self.check_slice(index, "key_json", item.key_json, false)?;
            self.check_slice(index, "values_packed", item.values_packed, false)?;
            self.check_slice(index, "doc_json", item.doc_json, true)?;
        }
        Ok(())
    }
}

impl LoadedBatch {
    /// Validate items against the session's binding count.
    pub fn validate(&self, bindings: usize) -> Result<()> {
        self.check_binding(bindings)?;
        for (index, item) in self.items.iter().enumerate() {
            self.check_slice(index, "doc_json", item.doc_json, true)?;
        }
        Ok(())
    }
}

/// Begins the commit of a stored transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommit {
    pub runtime_checkpoint: Bytes,
}

impl StartCommit {
    /// Validate field-level invariants.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_checkpoint.is_empty() {
            return Err(TxnError::validation(
                "start_commit.runtime_checkpoint",
                "expected non-empty",
            ));
        }
        Ok(())
    }
}

/// Closes the load phase, optionally updating connector state non-transactionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flushed {
    pub state: Option<ConnectorState>,
}

/// Connector state committed atomically with the runtime checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedCommit {
    pub state: Option<ConnectorState>,
}

/// The prior commit completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledged {
    pub state: Option<ConnectorState>,
}

/// A frame sent by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Open(Open),
    Load(LoadBatch),
    Flush,
    Store(StoreBatch),
    StartCommit(StartCommit),
    Acknowledge,
}

/// A frame sent by the connector.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Opened(Opened),
    Loaded(LoadedBatch),
    Flushed(Flushed),
    StartedCommit(StartedCommit),
    Acknowledged(Acknowledged),
}

/// A frame type which can travel over a byte stream.
pub trait Message: fmt::Debug + Send + Sized + 'static {
    /// Phase of this frame.
    fn phase(&self) -> Phase;
    /// Encode the payload. The phase travels in the frame header.
    fn encode(&self) -> Result<Bytes>;
    /// Decode a payload of the given phase.
    fn decode(phase: Phase, payload: &[u8]) -> Result<Self>;
    /// Validate field-level invariants against the session's binding count.
    fn validate(&self, bindings: usize) -> Result<()>;
}

fn encode_named<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(MsgPackCodec::encode(value)?))
}

impl Message for Request {
    fn phase(&self) -> Phase {
        match self {
            Request::Open(_) => Phase::Open,
            Request::Load(_) => Phase::Load,
            Request::Flush => Phase::Flush,
            Request::Store(_) => Phase::Store,
            Request::StartCommit(_) => Phase::StartCommit,
            Request::Acknowledge => Phase::Acknowledge,
        }
    }

    fn encode(&self) -> Result<Bytes> {
        match self {
            Request::Open(open) => encode_named(open),
            Request::Load(batch) => encode_named(batch),
            Request::Store(batch) => encode_named(batch),
            Request::StartCommit(start) => encode_named(start),
            Request::Flush | Request::Acknowledge => Ok(Bytes::new()),
        }
    }

    fn decode(phase: Phase, payload: &[u8]) -> Result<Self> {
        Ok(match phase {
            Phase::Open => Request::Open(MsgPackCodec::decode(payload)?),
            Phase::Load => Request::Load(MsgPackCodec::decode(payload)?),
            Phase::Flush => Request::Flush,
            Phase::Store => Request::Store(MsgPackCodec::decode(payload)?),
            Phase::StartCommit => Request::StartCommit(MsgPackCodec::decode(payload)?),
            Phase::Acknowledge => Request::Acknowledge,
            other => {
                return Err(TxnError::Protocol(format!(
                    "{} is not a request phase",
                    other
                )))
            }
        })
    }

    fn validate(&self, bindings: usize) -> Result<()> {
        match self {
            Request::Open(open) => open.validate(),
            Request::Load(batch) => batch.validate(bindings),
            Request::Store(batch) => batch.validate(bindings),
            Request::StartCommit(start) => start.validate(),
            Request::Flush | Request::Acknowledge => Ok(()),
        }
    }
}

impl Message for Response {
    fn phase(&self) -> Phase {
        match self {
            Response::Opened(_) => Phase::Opened,
            Response::Loaded(_) => Phase::Loaded,
            Response::Flushed(_) => Phase::Flushed,
            Response::StartedCommit(_) => Phase::StartedCommit,
            Response::Acknowledged(_) => Phase::Acknowledged,
        }
    }

    fn encode(&self) -> Result<Bytes> {
        match self {
            Response::Opened(opened) => encode_named(opened),
            Response::Loaded(batch) => encode_named(batch),
            Response::Flushed(flushed) => encode_named(flushed),
            Response::StartedCommit(started) => encode_named(started),
            Response::Acknowledged(acked) => encode_named(acked),
        }
    }

    fn decode(phase: Phase, payload: &[u8]) -> Result<Self> {
        Ok(match phase {
            Phase::Opened => Response::Opened(MsgPackCodec::decode(payload)?),
            Phase::Loaded => Response::Loaded(MsgPackCodec::decode(payload)?),
            Phase::Flushed => Response::Flushed(MsgPackCodec::decode(payload)?),
            Phase::StartedCommit => Response::StartedCommit(MsgPackCodec::decode(payload)?),
            Phase::Acknowledged => Response::Acknowledged(MsgPackCodec::decode(payload)?),
            other => {
                return Err(TxnError::Protocol(format!(
                    "{} is not a response phase",
                    other
                )))
            }
        })
    }

    fn validate(&self, bindings: usize) -> Result<()> {
        let state = match self {
            Response::Opened(opened) => return opened.validate(),
            Response::Loaded(batch) => return batch.validate(bindings),
            Response::Flushed(Flushed { state }) => state.as_ref().map(|s| ("flushed.state", s)),
            Response::StartedCommit(StartedCommit { state }) => {
                state.as_ref().map(|s| ("started_commit.state", s))
            }
            Response::Acknowledged(Acknowledged { state }) => {
                state.as_ref().map(|s| ("acknowledged.state", s))
            }
        };
        match state {
            Some((path, state)) => state.validate(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Arena;
    use serde_json::json;

    fn spec() -> MaterializationSpec {
        MaterializationSpec {
            name: "acme/widgets".to_string(),
            config_json: "{}".to_string(),
            bindings: vec![Binding {
                collection: "acme/events".to_string(),
                resource_path: vec!["widgets".to_string()],
                resource_config_json: r#"{"table":"widgets"}"#.to_string(),
                field_selection: FieldSelection {
                    keys: vec!["id".to_string()],
                    values: vec!["count".to_string()],
                    document: "flow_document".to_string(),
                },
                delta_updates: false,
            }],
        }
    }

    #[test]
    fn test_phase_codes() {
        for phase in [
            Phase::Open,
            Phase::Load,
            Phase::Flush,
            Phase::Store,
            Phase::StartCommit,
            Phase::Acknowledge,
            Phase::Opened,
            Phase::Loaded,
            Phase::Flushed,
            Phase::StartedCommit,
            Phase::Acknowledged,
        ] {
            assert_eq!(Phase::from_code(phase.code()), Some(phase));
        }
        assert!(Phase::Loaded.is_response());
        assert!(!Phase::Load.is_response());
        assert_eq!(Phase::from_code(0x07), None);
        assert_eq!(Phase::StartedCommit.to_string(), "StartedCommit");
    }

    #[test]
    fn test_resume_classification() {
        assert_eq!(Opened::internal().resume(), Resume::Internal);
        assert_eq!(Opened::checkpoint(Bytes::new()).resume(), Resume::Internal);
        assert_eq!(Opened::explicit_zero().resume(), Resume::ExplicitZero);
        assert_eq!(
            Opened::checkpoint(&b"cp"[..]).resume(),
            Resume::Checkpoint(Bytes::from_static(b"cp"))
        );

        assert!(Opened::explicit_zero().validate().is_ok());
        let err = Opened::checkpoint(Bytes::new()).validate().unwrap_err();
        assert!(err.to_string().contains("opened.runtime_checkpoint"));
    }

    #[test]
    fn test_connector_state_replace_and_merge() {
        let mut state = json!({"a": 1, "b": {"c": 2, "d": 3}});

        ConnectorState::merge(r#"{"b": {"c": null, "e": 4}, "f": 5}"#)
            .apply(&mut state)
            .unwrap();
        assert_eq!(state, json!({"a": 1, "b": {"d": 3, "e": 4}, "f": 5}));

        ConnectorState::replace(r#"{"applied":true}"#)
            .apply(&mut state)
            .unwrap();
        assert_eq!(state, json!({"applied": true}));

        ConnectorState::merge(r#"[1]"#).apply(&mut state).unwrap();
        assert_eq!(state, json!([1]));
    }

    #[test]
    fn test_open_validation() {
        let mut open = Open {
            materialization: spec(),
            version: "v1".to_string(),
            range: RangeSpec::full(),
            state_json: Bytes::new(),
        };
        assert!(open.validate().is_ok());
        assert_eq!(open.bindings(), 1);

        open.materialization.bindings[0].field_selection.keys.clear();
        let err = open.validate().unwrap_err().to_string();
        assert!(err.contains("materialization.bindings[0].field_selection.keys"), "{}", err);

        open.materialization = spec();
        open.range.key_begin = 10;
        open.range.key_end = 5;
        assert!(open.validate().unwrap_err().to_string().contains("range.key_begin"));
    }

    #[test]
    fn test_load_batch_validation() {
        let mut arena = Arena::new();
        let key = arena.add(b"\x02k1\x00");
        let batch = LoadBatch {
            binding: 0,
            items: vec![LoadItem {
                key_packed: key,
                key_json: Slice::default(),
            }],
            arena: arena.freeze(),
        };
        let request = Request::Load(batch.clone());
        assert!(request.validate(1).is_ok());

        let err = request.validate(0).unwrap_err().to_string();
        assert!(err.contains("load.binding"), "{}", err);

        let mut bad = batch.clone();
        bad.items[0].key_packed = Slice::new(0, 99);
        let err = Request::Load(bad).validate(1).unwrap_err().to_string();
        assert!(err.contains("load.items[0].key_packed"), "{}", err);
        assert!(err.contains("outside arena"), "{}", err);

        let mut empty = batch;
        empty.items.clear();
        assert!(Request::Load(empty).validate(1).is_err());
    }

    #[test]
    fn test_store_batch_requires_document() {
        let mut arena = Arena::new();
        let key = arena.add(b"\x02k1\x00");
        let batch = StoreBatch {
            binding: 0,
            items: vec![StoreItem {
                key_packed: key,
                ..Default::default()
            }],
            arena: arena.freeze(),
        };
        let err = Request::Store(batch).validate(1).unwrap_err().to_string();
        assert!(err.contains("store.items[0].doc_json"), "{}", err);
    }

    #[test]
    fn test_state_must_be_json() {
        let response = Response::StartedCommit(StartedCommit {
            state: Some(ConnectorState::replace("not json")),
        });
        let err = response.validate(1).unwrap_err().to_string();
        assert!(err.contains("started_commit.state.updated_json"), "{}", err);
    }

    #[test]
    fn test_encode_decode_phases() {
        let open = Request::Open(Open {
            materialization: spec(),
            version: "v1".to_string(),
            range: RangeSpec::full(),
            state_json: Bytes::from_static(b"{}"),
        });
        let payload = open.encode().unwrap();
        assert_eq!(Request::decode(Phase::Open, &payload).unwrap(), open);

        assert!(Request::Flush.encode().unwrap().is_empty());
        assert_eq!(Request::decode(Phase::Flush, &[]).unwrap(), Request::Flush);

        let acked = Response::Acknowledged(Acknowledged {
            state: Some(ConnectorState::merge(r#"{"x":1}"#)),
        });
        let payload = acked.encode().unwrap();
        assert_eq!(Response::decode(Phase::Acknowledged, &payload).unwrap(), acked);

        assert!(Request::decode(Phase::Loaded, &[]).is_err());
        assert!(Response::decode(Phase::Load, &[]).is_err());
    }
}
