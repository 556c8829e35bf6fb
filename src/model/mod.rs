//! Streamed-model data: manifests, geometry records and decoded fragments

pub mod fragment;
pub mod manifest;
pub mod record;

pub use fragment::{DecodedFragment, FragmentInstance, MeshData, MeshTopology};
pub use manifest::{AssetGeometryRef, StreamedAsset, StreamedGeometry};
pub use record::{GeometryKind, GeometryRecord, GeometryState};

use std::collections::HashMap;

/// Identifier of a geometry tile within one model
pub type GeometryId = u32;

/// Dense small integer substituting for a model's string id inside the
/// color encoding
pub type ModelIndex = u16;

/// Globally unique geometry identity across all registered models
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryKey {
    pub model: ModelIndex,
    pub geometry: GeometryId,
}

impl GeometryKey {
    pub fn new(model: ModelIndex, geometry: GeometryId) -> Self {
        Self { model, geometry }
    }
}

/// Bidirectional map between model id strings and their dense indices.
///
/// The color code space is too small to carry string ids, so each model
/// gets a small index when registered. Indices of removed models are
/// recycled.
#[derive(Default)]
pub struct ModelIndexMap {
    by_id: HashMap<String, ModelIndex>,
    by_index: HashMap<ModelIndex, String>,
    next: ModelIndex,
    free: Vec<ModelIndex>,
}

impl ModelIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the index for a model id
    pub fn insert(&mut self, model_id: &str) -> ModelIndex {
        if let Some(&index) = self.by_id.get(model_id) {
            return index;
        }
        let index = self.free.pop().unwrap_or_else(|| {
            let index = self.next;
            self.next += 1;
            index
        });
        self.by_id.insert(model_id.to_string(), index);
        self.by_index.insert(index, model_id.to_string());
        index
    }

    /// Remove a model id, freeing its index for reuse
    pub fn remove(&mut self, model_id: &str) -> Option<ModelIndex> {
        let index = self.by_id.remove(model_id)?;
        self.by_index.remove(&index);
        self.free.push(index);
        Some(index)
    }

    pub fn index_of(&self, model_id: &str) -> Option<ModelIndex> {
        self.by_id.get(model_id).copied()
    }

    pub fn id_of(&self, index: ModelIndex) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
