//! On-screen visibility testing via a color-coded offscreen pass
//!
//! Each update cycle renders proxy boxes for every tracked object into
//! an offscreen target, flat-colored with the object's code, reads the
//! pixels back and scans them off-thread. A code occupying at least
//! `threshold` pixels is seen; anything seen last cycle but absent now
//! is newly hidden.
//!
//! Only one readback is ever in flight per tester. Requests arriving
//! while busy either coalesce into one rerun right after the in-flight
//! cycle completes (`force`) or are dropped, so fast camera motion can
//! never queue unbounded GPU work.

use std::collections::{HashMap, HashSet};

use crate::culler::color::ColorCode;
use crate::culler::scan::{PixelFrame, PixelScanner};
use crate::math::Aabb;

/// The environment cannot read pixels back from the offscreen target
#[derive(Debug, Clone)]
pub struct ReadbackError {
    pub reason: String,
}

impl ReadbackError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl From<ReadbackError> for crate::core::Error {
    fn from(error: ReadbackError) -> Self {
        crate::core::Error::ReadbackUnsupported(error.reason)
    }
}

/// One flat-colored proxy box for the id pass
#[derive(Clone, Copy, Debug)]
pub struct ColorBox {
    pub code: ColorCode,
    pub bounds: Aabb,
}

/// External renderer boundary: draw the boxes with flat unlit colors
/// into an offscreen target and return the framebuffer contents.
pub trait IdPassRenderer {
    fn render_and_read(&mut self, boxes: &[ColorBox]) -> Result<PixelFrame, ReadbackError>;
}

/// Result of one visibility cycle at the color-code level
#[derive(Clone, Debug, Default)]
pub struct CodeSnapshot {
    pub seen_codes: HashSet<ColorCode>,
    /// Seen last cycle, absent this cycle
    pub newly_hidden: HashSet<ColorCode>,
}

struct TrackedObject {
    boxes: Vec<Aabb>,
    world_bounds: Aabb,
}

/// Determines, per update cycle, which tracked objects are actually
/// visible on screen.
pub struct VisibilityTester<R: IdPassRenderer> {
    renderer: R,
    scanner: PixelScanner,
    /// Minimum pixel occupancy to count as seen
    pub threshold: u32,
    /// Minimum projected size to even enter the id pass
    pub bbox_threshold: f32,
    tracked: HashMap<ColorCode, TrackedObject>,
    last_seen: HashSet<ColorCode>,
    busy: bool,
    rerun: bool,
    fail_open: bool,
    /// Snapshot produced without a scan (fail-open path)
    ready: Option<HashSet<ColorCode>>,
}

impl<R: IdPassRenderer> VisibilityTester<R> {
    /// Must be created inside a tokio runtime (spawns the scan worker).
    pub fn new(renderer: R, threshold: u32, bbox_threshold: f32) -> Self {
        Self {
            renderer,
            scanner: PixelScanner::new(),
            threshold,
            bbox_threshold,
            tracked: HashMap::new(),
            last_seen: HashSet::new(),
            busy: false,
            rerun: false,
            fail_open: false,
            ready: None,
        }
    }

    /// Register an object under a color. `boxes` are the world-space
    /// proxy boxes rendered for it (one per instance placement).
    pub fn track(&mut self, code: ColorCode, boxes: Vec<Aabb>) {
        let world_bounds = boxes
            .iter()
            .copied()
            .reduce(|acc, bounds| acc.merged(&bounds))
            .unwrap_or_default();
        self.tracked.insert(code, TrackedObject { boxes, world_bounds });
    }

    /// Stop tracking an object. Its code no longer appears in snapshots.
    pub fn untrack(&mut self, code: ColorCode) {
        self.tracked.remove(&code);
        self.last_seen.remove(&code);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Whether a readback is currently in flight
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Whether the tester has degraded to assume-all-visible
    pub fn is_fail_open(&self) -> bool {
        self.fail_open
    }

    /// Trigger one test cycle.
    ///
    /// Returns `false` without starting a second pass while one is in
    /// flight; with `force` the request coalesces into a single rerun
    /// once the in-flight cycle completes (consume via [`take_rerun`]).
    ///
    /// `projected_size` maps world bounds to on-screen pixels and
    /// drives the `bbox_threshold` pre-filter.
    ///
    /// [`take_rerun`]: VisibilityTester::take_rerun
    pub fn request_update(&mut self, force: bool, projected_size: impl Fn(&Aabb) -> f32) -> bool {
        if self.busy {
            if force {
                self.rerun = true;
            }
            return false;
        }

        if self.fail_open {
            self.ready = Some(self.tracked.keys().copied().collect());
            self.busy = true;
            return true;
        }

        let mut boxes = Vec::new();
        for (&code, object) in &self.tracked {
            if projected_size(&object.world_bounds) < self.bbox_threshold {
                continue;
            }
            boxes.extend(object.boxes.iter().map(|&bounds| ColorBox { code, bounds }));
        }

        match self.renderer.render_and_read(&boxes) {
            Ok(frame) => {
                self.scanner.submit(frame, self.threshold);
            }
            Err(error) => {
                // Fail open: a blocked pipeline is worse than loading
                // everything the camera might see.
                log::warn!(
                    "pixel readback unsupported ({}); assuming all tracked geometry visible",
                    error.reason
                );
                self.fail_open = true;
                self.ready = Some(self.tracked.keys().copied().collect());
            }
        }
        self.busy = true;
        true
    }

    /// Non-blocking poll for the result of the in-flight cycle
    pub fn poll(&mut self) -> Option<CodeSnapshot> {
        if let Some(seen) = self.ready.take() {
            return Some(self.finish(seen));
        }
        let result = self.scanner.try_recv()?;
        Some(self.finish(self.filter_stale(result.seen)))
    }

    /// Await the result of the in-flight cycle. Returns `None` when no
    /// cycle is in flight.
    pub async fn wait(&mut self) -> Option<CodeSnapshot> {
        if !self.busy {
            return None;
        }
        if let Some(seen) = self.ready.take() {
            return Some(self.finish(seen));
        }
        let result = self.scanner.recv().await?;
        Some(self.finish(self.filter_stale(result.seen)))
    }

    /// Consume the coalesced rerun request left by a forced
    /// `request_update` that arrived while busy.
    pub fn take_rerun(&mut self) -> bool {
        std::mem::take(&mut self.rerun)
    }

    /// Codes untracked while the scan was in flight must not resurface.
    fn filter_stale(&self, seen: HashSet<ColorCode>) -> HashSet<ColorCode> {
        seen.into_iter()
            .filter(|code| self.tracked.contains_key(code))
            .collect()
    }

    fn finish(&mut self, seen: HashSet<ColorCode>) -> CodeSnapshot {
        self.busy = false;
        let newly_hidden = self.last_seen.difference(&seen).copied().collect();
        self.last_seen = seen.clone();
        CodeSnapshot {
            seen_codes: seen,
            newly_hidden,
        }
    }
}
