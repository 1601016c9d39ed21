use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Download,
    Extract,
    Upload,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Download => "Downloading",
            Phase::Extract => "Extracting",
            Phase::Upload => "Uploading",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub current: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// Pre-rendered human-readable status block.
    pub text: String,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

#[derive(Debug)]
struct ReporterState {
    total: Option<u64>,
    started: Instant,
    last_emit: Option<Instant>,
}

/// Rate-limited progress rendering shared by the download, extract and
/// upload stages. The first update and any forced update always go
/// through; everything in between is throttled to `min_interval`.
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    phase: Phase,
    min_interval: Duration,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        phase: Phase,
        total: Option<u64>,
        min_interval: Duration,
    ) -> Self {
        Self {
            sink,
            phase,
            min_interval,
            state: Mutex::new(ReporterState {
                total,
                started: Instant::now(),
                last_emit: None,
            }),
        }
    }

    pub fn set_total(&self, total: u64) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.total = Some(total);
    }

    pub fn update(&self, current: u64) {
        self.emit(current, false);
    }

    /// Bypasses the throttle; used for the final update of a phase.
    pub fn finish(&self, current: u64) {
        self.emit(current, true);
    }

    fn emit(&self, current: u64, force: bool) {
        let (total, elapsed) = {
            let mut state = self.state.lock().expect("progress mutex poisoned");
            let now = Instant::now();
            if !force
                && let Some(last) = state.last_emit
                && now.duration_since(last) < self.min_interval
            {
                return;
            }
            state.last_emit = Some(now);
            (state.total, now.duration_since(state.started))
        };

        let text = render_progress_text(self.phase, current, total, elapsed);
        self.sink.on_progress(&ProgressUpdate {
            phase: self.phase,
            current,
            total,
            elapsed,
            text,
        });
    }
}

const BAR_WIDTH: usize = 20;

pub fn render_progress_text(
    phase: Phase,
    current: u64,
    total: Option<u64>,
    elapsed: Duration,
) -> String {
    let elapsed_secs = elapsed.as_secs_f64();
    let speed = if elapsed_secs > 0.0 {
        current as f64 / elapsed_secs
    } else {
        0.0
    };

    match total {
        Some(total) if total > 0 => {
            let percentage = (current as f64 / total as f64) * 100.0;
            let filled = ((BAR_WIDTH as f64 * percentage / 100.0) as usize).min(BAR_WIDTH);
            let bar: String = "█".repeat(filled) + &"░".repeat(BAR_WIDTH - filled);
            format!(
                "**{}**\n[{bar}] {percentage:.1}%\n**Progress:** {} / {}\n**Speed:** {}/s\n**Elapsed:** {elapsed_secs:.1}s",
                phase.label(),
                human_size(current),
                human_size(total),
                human_size(speed as u64),
            )
        }
        _ => format!(
            "**{}**\n**Progress:** {}\n**Speed:** {}/s\n**Elapsed:** {elapsed_secs:.1}s",
            phase.label(),
            human_size(current),
            human_size(speed as u64),
        ),
    }
}

pub fn human_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        updates: AtomicUsize,
    }

    impl ProgressSink for CountingSink {
        fn on_progress(&self, _update: &ProgressUpdate) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn first_update_passes_then_throttles() {
        let sink = Arc::new(CountingSink {
            updates: AtomicUsize::new(0),
        });
        let reporter = ProgressReporter::new(
            sink.clone(),
            Phase::Download,
            Some(100),
            Duration::from_secs(60),
        );

        reporter.update(1);
        reporter.update(2);
        reporter.update(3);
        assert_eq!(sink.updates.load(Ordering::Relaxed), 1);

        reporter.finish(100);
        assert_eq!(sink.updates.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(512), "512.00 B");
        assert_eq!(human_size(2048), "2.00 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn renders_full_bar_at_completion() {
        let text =
            render_progress_text(Phase::Upload, 100, Some(100), Duration::from_secs(2));
        assert!(text.contains("100.0%"));
        assert!(text.contains(&"█".repeat(20)));
        assert!(!text.contains('░'));
    }

    #[test]
    fn unknown_total_has_no_bar() {
        let text = render_progress_text(Phase::Download, 42, None, Duration::from_secs(1));
        assert!(!text.contains('['));
        assert!(text.contains("42.00 B"));
    }
}
