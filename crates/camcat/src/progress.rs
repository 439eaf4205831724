use std::time::Duration;
use serde::Serialize;
use tokio::sync::mpsc;

/// One progress report from a running encoder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    /// Output timestamp reached so far; never decreases within one job
    pub elapsed: Duration,
    /// Input duration announced by the encoder, when it announced one
    pub total: Option<Duration>,
    /// Completion in `[0, 100]`. Not guaranteed to be monotonic.
    ///
    /// Measured as output time over input duration, so a template that retimes the stream (such
    /// as `setpts=0.01*PTS`) finishes at a correspondingly small percentage.
    pub percent: f64,
    /// Set on the encoder's final report
    pub finished: bool,
}

/// Clamp a raw percentage into `[0, 100]`, mapping NaN to 0
pub fn clamp_percent(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 100.0)
    }
}

/// Percentage of `total` covered by `elapsed`, clamped. Unknown or zero totals give 0.
pub fn percent_of(elapsed: Duration, total: Option<Duration>) -> f64 {
    match total {
        Some(total) if !total.is_zero() => {
            clamp_percent(elapsed.as_secs_f64() / total.as_secs_f64() * 100.0)
        }
        _ => 0.0,
    }
}

/// Parse an `HH:MM:SS[.frac]` timestamp, or plain seconds
pub fn parse_timestamp(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.starts_with('-') {
        return None;
    }
    let parts: Vec<&str> = text.split(':').collect();
    let seconds = match parts.as_slice() {
        [h, m, s] => {
            let hours: f64 = h.parse().ok()?;
            let minutes: f64 = m.parse().ok()?;
            let seconds: f64 = s.parse().ok()?;
            hours * 3600.0 + minutes * 60.0 + seconds
        }
        [s] => s.parse().ok()?,
        _ => return None,
    };
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

/// Incremental parser for the encoder's stderr when run with `-progress pipe:2`.
///
/// The banner's first `Duration:` line gives the total. Progress arrives as `key=value` blocks
/// terminated by a `progress=continue` or `progress=end` line; each terminator yields a sample.
#[derive(Debug, Default)]
pub struct ProgressParser {
    total: Option<Duration>,
    out_time: Option<Duration>,
    last_elapsed: Duration,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> Option<Duration> {
        self.total
    }

    /// Feed one line; returns a sample when the line closes a progress block
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressSample> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("Duration:") {
            if self.total.is_none() {
                let stamp = rest.split(',').next().unwrap_or_default();
                self.total = parse_timestamp(stamp).filter(|d| !d.is_zero());
            }
            return None;
        }

        let (key, value) = line.split_once('=')?;
        match key {
            // out_time_ms is reported in microseconds as well
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.trim().parse::<i64>() {
                    self.out_time = Some(Duration::from_micros(us.max(0) as u64));
                }
                None
            }
            "out_time" if self.out_time.is_none() => {
                self.out_time = parse_timestamp(value);
                None
            }
            "progress" => {
                let reached = self.out_time.unwrap_or_default();
                self.last_elapsed = self.last_elapsed.max(reached);
                Some(ProgressSample {
                    elapsed: self.last_elapsed,
                    total: self.total,
                    percent: percent_of(self.last_elapsed, self.total),
                    finished: value.trim() == "end",
                })
            }
            _ => None,
        }
    }
}

/// Progress samples of one job.
///
/// The stream ends when the job reaches a terminal state. It can be taken from a job once and
/// cannot be restarted.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressSample>,
}

impl ProgressStream {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<ProgressSample>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next sample; `None` once the job has finished
    pub async fn next(&mut self) -> Option<ProgressSample> {
        self.rx.recv().await
    }

    /// Poll without waiting
    pub fn try_next(&mut self) -> Option<ProgressSample> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(parse_timestamp("01:30:45.500"), Some(Duration::from_millis(5_445_500)));
        assert_eq!(parse_timestamp("00:00:00"), Some(Duration::ZERO));
        assert_eq!(parse_timestamp("12.5"), Some(Duration::from_millis(12_500)));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("-00:00:01"), None);
    }

    #[test]
    fn test_parser_reads_banner_and_progress_blocks() {
        let mut parser = ProgressParser::new();
        let lines = [
            "Input #0, concat, from '/out/20240101_filelist.txt':",
            "  Duration: 00:00:10.00, start: 0.000000, bitrate: 2048 kb/s",
            "frame=120",
            "out_time_us=2500000",
            "out_time_ms=2500000",
            "out_time=00:00:02.500000",
            "speed=4.1x",
            "progress=continue",
            "out_time_us=10050000",
            "progress=end",
        ];

        let samples: Vec<ProgressSample> = lines.iter().filter_map(|l| parser.feed_line(l)).collect();
        assert_eq!(samples.len(), 2);

        assert_eq!(samples[0].elapsed, Duration::from_millis(2500));
        assert_eq!(samples[0].total, Some(Duration::from_secs(10)));
        assert!((samples[0].percent - 25.0).abs() < 1e-9);
        assert!(!samples[0].finished);

        // 10.05s of 10s is clamped
        assert_eq!(samples[1].percent, 100.0);
        assert!(samples[1].finished);
    }

    #[test]
    fn test_only_first_duration_counts() {
        let mut parser = ProgressParser::new();
        parser.feed_line("  Duration: 00:01:00.00, start: 0.000000, bitrate: N/A");
        parser.feed_line("  Duration: 00:05:00.00, start: 0.000000, bitrate: N/A");
        assert_eq!(parser.total(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_unknown_duration_reports_zero_percent() {
        let mut parser = ProgressParser::new();
        parser.feed_line("  Duration: N/A, start: 0.000000, bitrate: N/A");
        parser.feed_line("out_time_us=5000000");
        let sample = parser.feed_line("progress=continue").unwrap();
        assert_eq!(sample.total, None);
        assert_eq!(sample.percent, 0.0);
        assert_eq!(sample.elapsed, Duration::from_secs(5));
    }

    #[test]
    fn test_percent_follows_output_timeline() {
        let mut parser = ProgressParser::new();
        parser.feed_line("  Duration: 00:01:40.00, start: 0.000000, bitrate: N/A");
        // 100s of input fast-forwarded 100x ends at 1s of output
        parser.feed_line("out_time_us=1000000");
        let sample = parser.feed_line("progress=end").unwrap();
        assert!(sample.finished);
        assert!((sample.percent - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_out_time_is_floored() {
        let mut parser = ProgressParser::new();
        parser.feed_line("Duration: 00:00:10.00,");
        parser.feed_line("out_time_us=-23000");
        let sample = parser.feed_line("progress=continue").unwrap();
        assert_eq!(sample.elapsed, Duration::ZERO);
        assert_eq!(sample.percent, 0.0);
    }

    #[test]
    fn test_non_progress_lines_are_ignored() {
        let mut parser = ProgressParser::new();
        assert!(parser.feed_line("[mp4 @ 0x55] Non-monotonic DTS").is_none());
        assert!(parser.feed_line("").is_none());
        assert!(parser.feed_line("bitrate=N/A").is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_drops() {
        let (tx, mut stream) = ProgressStream::channel();
        let sample = ProgressSample {
            elapsed: Duration::from_secs(1),
            total: None,
            percent: 0.0,
            finished: false,
        };
        tx.send(sample.clone()).unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(sample));
        assert_eq!(stream.next().await, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Whatever the encoder reports, the surfaced percentage stays within [0, 100].
        #[test]
        fn test_percent_always_clamped(
            total_ms in 0u64..100_000_000,
            out_us in -10_000_000i64..1_000_000_000_000,
        ) {
            let mut parser = ProgressParser::new();
            let total = Duration::from_millis(total_ms);
            let secs = total.as_secs();
            parser.feed_line(&format!(
                "  Duration: {:02}:{:02}:{:02}.{:02}, start: 0.000000",
                secs / 3600, (secs / 60) % 60, secs % 60, total.subsec_millis() / 10,
            ));
            parser.feed_line(&format!("out_time_us={}", out_us));
            let sample = parser.feed_line("progress=continue").unwrap();

            prop_assert!(sample.percent >= 0.0 && sample.percent <= 100.0);
        }

        /// Elapsed time in consecutive samples never goes backwards, even when the raw stream does.
        #[test]
        fn test_elapsed_non_decreasing(times in prop::collection::vec(-1_000_000i64..50_000_000, 1..30)) {
            let mut parser = ProgressParser::new();
            parser.feed_line("Duration: 00:00:30.00,");
            let mut previous = Duration::ZERO;
            for t in times {
                parser.feed_line(&format!("out_time_us={}", t));
                let sample = parser.feed_line("progress=continue").unwrap();
                prop_assert!(sample.elapsed >= previous);
                previous = sample.elapsed;
            }
        }

        #[test]
        fn test_clamp_percent_bounds(raw in prop::num::f64::ANY) {
            let clamped = clamp_percent(raw);
            prop_assert!((0.0..=100.0).contains(&clamped));
        }
    }
}
