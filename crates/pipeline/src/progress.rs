use std::sync::Arc;
use once_cell::sync::Lazy;
use regex::Regex;

/// Receives stage-local progress values (0-100) as an external tool reports them
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Marker the recorder prints once the capture is complete
const FINAL_MARKER: &str = "Final progress";

static RECORDER_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"progress: '(\d+(?:\.\d+)?)'").expect("recorder progress pattern is valid")
});

/// Extract a progress value from one line of recorder output.
///
/// `progress: '42.5'` yields 42.5 and any line containing `Final progress` yields 100.
/// Every other line yields `None`; most output is ordinary diagnostics.
pub fn parse_recorder_line(line: &str) -> Option<f64> {
    if line.contains(FINAL_MARKER) {
        return Some(100.0);
    }
    RECORDER_PROGRESS
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Extract a progress value from one `key=value` line of ffmpeg's `-progress` stream.
///
/// Only the `progress` key is considered. `progress=end` counts as complete.
pub fn parse_encoder_line(line: &str) -> Option<f64> {
    let (key, value) = line.split_once('=')?;
    if key.trim() != "progress" {
        return None;
    }
    let value = value.trim();
    if value == "end" {
        return Some(100.0);
    }
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Portion of the overall 0-100 scale a stage occupies.
///
/// Segments may overlap, so the overall figure is approximate rather than a weighted
/// estimate of completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSegment {
    pub start: f64,
    pub end: f64,
}

impl ProgressSegment {
    /// Narration, done before the manifest reaches the job processor
    pub const NARRATION: ProgressSegment = ProgressSegment { start: 0.0, end: 10.0 };
    pub const RECORDING: ProgressSegment = ProgressSegment { start: 10.0, end: 90.0 };
    pub const ENCODING: ProgressSegment = ProgressSegment { start: 80.0, end: 100.0 };

    /// Map a stage-local percentage onto the overall scale
    pub fn rescale(&self, local: f64) -> f64 {
        let local = if local.is_nan() { 0.0 } else { local.clamp(0.0, 100.0) };
        self.start + (local / 100.0) * (self.end - self.start)
    }
}
