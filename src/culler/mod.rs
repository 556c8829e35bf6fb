//! GPU-based visibility determination for streamed geometry
//!
//! Composes the color-code allocator, the visibility tester and the
//! model index map: each registered geometry gets one code and one
//! proxy box per asset placement; scan results resolve back from codes
//! to geometry keys.

pub mod color;
pub mod scan;
pub mod tester;

pub use color::{ColorCode, ColorCodeAllocator, MAX_COLOR_CODE};
pub use scan::{PixelFrame, PixelScanner};
pub use tester::{CodeSnapshot, ColorBox, IdPassRenderer, ReadbackError, VisibilityTester};

use std::collections::HashMap;

use crate::core::types::Result;
use crate::math::Aabb;
use crate::model::{GeometryKey, ModelIndex, ModelIndexMap};

/// The key-level result of one visibility cycle
#[derive(Clone, Debug, Default)]
pub struct VisibilitySnapshot {
    pub seen: std::collections::HashSet<GeometryKey>,
    /// Seen last cycle, absent this cycle
    pub newly_hidden: std::collections::HashSet<GeometryKey>,
}

/// Tracks streamed geometries under color codes and resolves scan
/// results to geometry keys.
pub struct GeometryCuller<R: IdPassRenderer> {
    tester: VisibilityTester<R>,
    allocator: ColorCodeAllocator,
    models: ModelIndexMap,
    code_to_key: HashMap<ColorCode, GeometryKey>,
    key_to_code: HashMap<GeometryKey, ColorCode>,
}

impl<R: IdPassRenderer> GeometryCuller<R> {
    /// Must be created inside a tokio runtime (spawns the scan worker).
    pub fn new(renderer: R, threshold: u32, bbox_threshold: f32) -> Self {
        Self {
            tester: VisibilityTester::new(renderer, threshold, bbox_threshold),
            allocator: ColorCodeAllocator::new(),
            models: ModelIndexMap::new(),
            code_to_key: HashMap::new(),
            key_to_code: HashMap::new(),
        }
    }

    /// Register a model id and get its dense index
    pub fn add_model(&mut self, model_id: &str) -> ModelIndex {
        self.models.insert(model_id)
    }

    pub fn model_index(&self, model_id: &str) -> Option<ModelIndex> {
        self.models.index_of(model_id)
    }

    /// Track one geometry under a fresh code with its world-space proxy
    /// boxes (one per asset placement).
    pub fn track(&mut self, key: GeometryKey, boxes: Vec<Aabb>) -> Result<ColorCode> {
        let code = self.allocator.allocate()?;
        self.code_to_key.insert(code, key);
        self.key_to_code.insert(key, code);
        self.tester.track(code, boxes);
        Ok(code)
    }

    /// Stop tracking a geometry and return its code to the pool
    pub fn untrack(&mut self, key: GeometryKey) {
        if let Some(code) = self.key_to_code.remove(&key) {
            self.code_to_key.remove(&code);
            self.tester.untrack(code);
            self.allocator.release(code);
        }
    }

    /// Unregister a model: untracks all of its geometries and frees its
    /// index. Returns the keys that were tracked.
    pub fn remove_model(&mut self, model_id: &str) -> Vec<GeometryKey> {
        let Some(index) = self.models.remove(model_id) else {
            return Vec::new();
        };
        let keys: Vec<GeometryKey> = self
            .key_to_code
            .keys()
            .copied()
            .filter(|key| key.model == index)
            .collect();
        for key in &keys {
            self.untrack(*key);
        }
        keys
    }

    pub fn code_of(&self, key: GeometryKey) -> Option<ColorCode> {
        self.key_to_code.get(&key).copied()
    }

    pub fn tracked_count(&self) -> usize {
        self.key_to_code.len()
    }

    /// See [`VisibilityTester::request_update`]
    pub fn request_update(&mut self, force: bool, projected_size: impl Fn(&Aabb) -> f32) -> bool {
        self.tester.request_update(force, projected_size)
    }

    /// Non-blocking poll, resolved to geometry keys
    pub fn poll(&mut self) -> Option<VisibilitySnapshot> {
        self.tester.poll().map(|snapshot| self.resolve(snapshot))
    }

    /// Await the in-flight cycle, resolved to geometry keys
    pub async fn wait(&mut self) -> Option<VisibilitySnapshot> {
        let snapshot = self.tester.wait().await?;
        Some(self.resolve(snapshot))
    }

    /// See [`VisibilityTester::take_rerun`]
    pub fn take_rerun(&mut self) -> bool {
        self.tester.take_rerun()
    }

    pub fn is_busy(&self) -> bool {
        self.tester.is_busy()
    }

    pub fn is_fail_open(&self) -> bool {
        self.tester.is_fail_open()
    }

    fn resolve(&self, snapshot: CodeSnapshot) -> VisibilitySnapshot {
        let lookup = |code: &ColorCode| self.code_to_key.get(code).copied();
        VisibilitySnapshot {
            seen: snapshot.seen_codes.iter().filter_map(lookup).collect(),
            newly_hidden: snapshot.newly_hidden.iter().filter_map(lookup).collect(),
        }
    }
}
