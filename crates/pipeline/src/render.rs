use std::io::Write;

/// Nominal bar width; the bar itself takes `width - 6` cells
pub const DEFAULT_BAR_WIDTH: usize = 32;

/// Smallest width that still fits `[] 100%`
const MIN_BAR_WIDTH: usize = 7;

/// Returns the cursor to column 0 and clears the line
const CLEAR_LINE: &str = "\r\x1b[2K";

/// Moves the cursor up one line and clears it
const CLEAR_PREVIOUS_LINE: &str = "\x1b[1A\x1b[K";

const AWAITING: &str = "Awaiting resources...";

/// Render `[=====     ]  45%` for a percentage, clamped to 0-100.
///
/// Widths too small to hold the brackets and percentage fall back to the default.
pub fn progress_bar(percentage: f64, total_width: usize) -> String {
    let percentage = clamp_percentage(percentage);
    let total_width = if total_width < MIN_BAR_WIDTH { DEFAULT_BAR_WIDTH } else { total_width };

    let bar_width = total_width - 6;
    let filled = ((percentage / 100.0) * bar_width as f64) as usize;

    format!(
        "[{}{}] {:>3.0}%",
        "=".repeat(filled),
        " ".repeat(bar_width - filled),
        percentage
    )
}

/// One in-place console line: clear sequence, bar, label
pub fn render_line(percentage: f64, label: &str) -> String {
    format!("{}{} {}", CLEAR_LINE, progress_bar(percentage, DEFAULT_BAR_WIDTH), label)
}

/// One line per tracked job. Jobs at 0% read "Awaiting resources..." inside the bar.
pub fn multi_progress_lines(jobs: &[(String, f64)], total_width: usize) -> Vec<String> {
    jobs.iter()
        .map(|(label, percentage)| {
            let mut bar = progress_bar(*percentage, total_width);
            if *percentage <= 0.0 {
                bar = bar.replacen(']', &format!("{}]", AWAITING), 1);
            }
            format!("{} {}", label, bar)
        })
        .collect()
}

fn clamp_percentage(percentage: f64) -> f64 {
    if percentage.is_nan() {
        0.0
    } else {
        percentage.clamp(0.0, 100.0)
    }
}

/// Destination for progress updates from whichever stage is active
pub trait ProgressSink: Send + Sync {
    fn report(&self, percentage: f64, label: &str);

    /// Called once a foreground job is done with the line
    fn finish(&self) {}
}

/// Rewrites a single stdout line in place
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, percentage: f64, label: &str) {
        let mut out = std::io::stdout().lock();
        // console output is cosmetic; a closed stdout must not fail the job
        let _ = write!(out, "{}", render_line(percentage, label));
        let _ = out.flush();
    }

    fn finish(&self) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out);
        let _ = out.flush();
    }
}

/// Per-lesson bars kept above the running job's progress and redrawn in place
#[derive(Debug, Default)]
pub struct CourseOverview {
    jobs: Vec<(String, f64)>,
    /// Lines printed since the last draw, the overview itself included
    drawn: usize,
}

impl CourseOverview {
    pub fn new(labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            jobs: labels.into_iter().map(|label| (label, 0.0)).collect(),
            drawn: 0,
        }
    }

    pub fn set(&mut self, index: usize, percentage: f64) {
        if let Some(entry) = self.jobs.get_mut(index) {
            entry.1 = percentage;
        }
    }

    /// Account for lines written below the overview since it was drawn
    pub fn printed(&mut self, lines: usize) {
        self.drawn += lines;
    }

    pub fn redraw(&mut self) {
        let mut out = std::io::stdout().lock();
        // console output is cosmetic
        let _ = self.redraw_to(&mut out);
    }

    fn redraw_to(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        for _ in 0..self.drawn {
            write!(out, "{}", CLEAR_PREVIOUS_LINE)?;
        }
        for line in multi_progress_lines(&self.jobs, DEFAULT_BAR_WIDTH) {
            writeln!(out, "{}", line)?;
        }
        out.flush()?;
        self.drawn = self.jobs.len();
        Ok(())
    }
}

/// Drops every update; used by the background service
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _percentage: f64, _label: &str) {}
}
