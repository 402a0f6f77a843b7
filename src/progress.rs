//! Progress reporting capability.
//!
//! The runner and the pool only ever talk to a [`ProgressSink`]; they never
//! assume how (or whether) progress is drawn. [`ProgressLine`] keeps the
//! numbers in memory, [`ConsoleLine`] renders them as an indicatif bar.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// An observer of completion counts.
pub trait ProgressSink: Send + Sync {
    /// Set the number of units expected.
    fn set_total(&self, total: u64);

    /// Record `delta` more completed units.
    fn advance(&self, delta: u64);

    /// Show or hide the line.
    fn set_visible(&self, visible: bool);

    /// Start counting again from zero.
    fn reset(&self);

    /// Units completed so far.
    fn completed(&self) -> u64;

    /// Units expected, if known.
    fn total(&self) -> Option<u64>;

    /// `true` once a known total has been reached.
    fn is_finished(&self) -> bool {
        self.total().is_some_and(|total| self.completed() >= total)
    }
}

// ---------------------------------------------------------------------------
// In-memory line
// ---------------------------------------------------------------------------

/// Point-in-time copy of a [`ProgressLine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSnapshot {
    pub label: String,
    pub total: Option<u64>,
    pub completed: u64,
    pub visible: bool,
}

/// Headless progress line. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct ProgressLine {
    inner: Arc<Mutex<LineSnapshot>>,
}

impl ProgressLine {
    /// A hidden line with no total.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LineSnapshot {
                label: label.into(),
                total: None,
                completed: 0,
                visible: false,
            })),
        }
    }

    pub fn snapshot(&self) -> LineSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LineSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressSink for ProgressLine {
    fn set_total(&self, total: u64) {
        self.lock().total = Some(total);
    }

    fn advance(&self, delta: u64) {
        self.lock().completed += delta;
    }

    fn set_visible(&self, visible: bool) {
        self.lock().visible = visible;
    }

    fn reset(&self) {
        self.lock().completed = 0;
    }

    fn completed(&self) -> u64 {
        self.lock().completed
    }

    fn total(&self) -> Option<u64> {
        self.lock().total
    }
}

// ---------------------------------------------------------------------------
// Terminal rendering
// ---------------------------------------------------------------------------

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg} [{elapsed_precise}<{eta_precise}]";

/// Shared terminal area that progress lines are drawn into.
#[derive(Clone, Default)]
pub struct Console {
    multi: MultiProgress,
    shown: Arc<AtomicUsize>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// A console that draws nothing. Lines still count.
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            shown: Arc::default(),
        }
    }

    /// Lines currently shown.
    pub fn visible_lines(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }

    /// Create a hidden line labelled `label`, counting `unit`s.
    pub fn line(&self, label: impl Into<Cow<'static, str>>, unit: &'static str) -> ConsoleLine {
        let bar = ProgressBar::hidden();
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar.set_prefix(label);
        bar.set_message(unit);
        bar.set_length(0);
        ConsoleLine {
            multi: self.multi.clone(),
            shown: Arc::clone(&self.shown),
            bar,
            visible: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Print above the bars without tearing them.
    pub fn log(&self, message: impl AsRef<str>) {
        if self.multi.println(message.as_ref()).is_err() {
            eprintln!("{}", message.as_ref());
        }
    }
}

/// One indicatif bar inside a [`Console`].
#[derive(Clone)]
pub struct ConsoleLine {
    multi: MultiProgress,
    shown: Arc<AtomicUsize>,
    bar: ProgressBar,
    visible: Arc<AtomicBool>,
}

impl ProgressSink for ConsoleLine {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    fn advance(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_visible(&self, visible: bool) {
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        match (was_visible, visible) {
            (false, true) => {
                self.multi.add(self.bar.clone());
                self.shown.fetch_add(1, Ordering::SeqCst);
            }
            (true, false) => {
                self.multi.remove(&self.bar);
                self.shown.fetch_sub(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    fn reset(&self) {
        self.bar.set_position(0);
    }

    fn completed(&self) -> u64 {
        self.bar.position()
    }

    fn total(&self) -> Option<u64> {
        self.bar.length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_clones_share_counters() {
        let line = ProgressLine::new("convert");
        let other = line.clone();
        line.set_total(3);
        other.advance(2);
        assert_eq!(line.completed(), 2);
        assert!(!line.is_finished());
        other.advance(1);
        assert!(line.is_finished());
    }

    #[test]
    fn unknown_total_is_never_finished() {
        let line = ProgressLine::new("x");
        line.advance(10);
        assert!(!line.is_finished());
    }

    #[test]
    fn console_line_tracks_position_while_hidden() {
        let console = Console::new();
        let line = console.line("Separating", "files");
        line.set_total(2);
        line.advance(2);
        assert_eq!(line.completed(), 2);
        assert_eq!(line.total(), Some(2));
        line.reset();
        assert_eq!(line.completed(), 0);
    }

    #[test]
    fn console_counts_shown_lines() {
        let console = Console::hidden();
        let first = console.line("Converting", "files");
        let second = console.line("Separating", "files");
        first.set_visible(true);
        second.set_visible(true);
        second.set_visible(true);
        assert_eq!(console.visible_lines(), 2);
        first.set_visible(false);
        assert_eq!(console.visible_lines(), 1);
    }
}
