//! Pixel-occupancy scanning off the control thread
//!
//! The readback buffer from the id pass is handed to a worker task over
//! a channel. The worker counts texels per color code and reports the
//! codes whose occupancy reaches the seen threshold. Results come back
//! over a second channel; the worker never touches shared state.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::culler::color::ColorCode;

/// RGBA8 framebuffer contents read back from the offscreen id pass
#[derive(Clone, Debug)]
pub struct PixelFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl PixelFrame {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        debug_assert_eq!(rgba.len(), (width * height * 4) as usize);
        Self { width, height, rgba }
    }
}

/// One frame to scan plus the occupancy threshold for this cycle
pub struct ScanJob {
    pub frame: PixelFrame,
    pub threshold: u32,
}

/// Codes whose pixel occupancy reached the threshold
pub struct ScanResult {
    pub seen: HashSet<ColorCode>,
}

/// Count texels per distinct color code. Background (code 0) texels are
/// skipped.
pub fn count_occupancy(frame: &PixelFrame) -> HashMap<ColorCode, u32> {
    let mut counts = HashMap::new();
    let texels: &[[u8; 4]] = bytemuck::cast_slice(&frame.rgba);
    for texel in texels {
        if let Some(code) = ColorCode::from_rgb([texel[0], texel[1], texel[2]]) {
            *counts.entry(code).or_insert(0) += 1;
        }
    }
    counts
}

/// Codes with occupancy at or above the threshold
pub fn codes_over_threshold(frame: &PixelFrame, threshold: u32) -> HashSet<ColorCode> {
    count_occupancy(frame)
        .into_iter()
        .filter(|&(_, count)| count >= threshold)
        .map(|(code, _)| code)
        .collect()
}

/// Handle to the long-lived scan worker task.
///
/// Must be created inside a tokio runtime. The visibility tester
/// submits at most one job at a time, so results arrive in submit
/// order.
pub struct PixelScanner {
    job_tx: mpsc::UnboundedSender<ScanJob>,
    result_rx: mpsc::UnboundedReceiver<ScanResult>,
}

impl PixelScanner {
    pub fn new() -> Self {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<ScanJob>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<ScanResult>();

        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                let seen = codes_over_threshold(&job.frame, job.threshold);
                if result_tx.send(ScanResult { seen }).is_err() {
                    break;
                }
            }
        });

        Self { job_tx, result_rx }
    }

    /// Queue a frame for scanning
    pub fn submit(&self, frame: PixelFrame, threshold: u32) {
        // Worker lives as long as this handle holds the sender
        let _ = self.job_tx.send(ScanJob { frame, threshold });
    }

    /// Non-blocking poll for a finished scan
    pub fn try_recv(&mut self) -> Option<ScanResult> {
        self.result_rx.try_recv().ok()
    }

    /// Await the next finished scan
    pub async fn recv(&mut self) -> Option<ScanResult> {
        self.result_rx.recv().await
    }
}
