use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::metrics::Metrics;

/// Send statistics for a stretch of time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Report {
    pub dur: Duration,
    pub txs: u64,
    pub errs: u64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.dur.as_secs_f64();
        let tps = if secs > 0.0 {
            self.txs as f64 / secs
        } else {
            0.0
        };
        write!(
            f,
            "dur={}s txs={} errs={} tps={tps:.1}",
            self.dur.as_secs(),
            self.txs,
            self.errs
        )
    }
}

/// Emits delta reports against the metric counters.
pub struct Reporter {
    metrics: Arc<Metrics>,
    last_ts: Instant,
    last_txs: u64,
    last_errs: u64,
}

impl Reporter {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            last_ts: Instant::now(),
            last_txs: 0,
            last_errs: 0,
        }
    }

    /// Report since the last call (or construction).
    pub fn report(&mut self) -> Report {
        let now = Instant::now();
        let txs = self.metrics.sent_count();
        let errs = self.metrics.error_count();
        let report = Report {
            dur: now - self.last_ts,
            txs: txs - self.last_txs,
            errs: errs - self.last_errs,
        };
        self.last_ts = now;
        self.last_txs = txs;
        self.last_errs = errs;
        report
    }
}

/// History of recent reports: the latest, a ten-slot rolling window, and a
/// running total.
#[derive(Default)]
pub struct Reports {
    latest: Option<Report>,
    recent: [Option<Report>; 10],
    rec_idx: usize,
    total: Report,
}

impl Reports {
    pub fn add(&mut self, report: Report) -> Status {
        self.latest = Some(report);

        self.recent[self.rec_idx] = Some(report);
        self.rec_idx = (self.rec_idx + 1) % self.recent.len();

        self.total.dur += report.dur;
        self.total.txs += report.txs;
        self.total.errs += report.errs;

        self.status()
    }

    fn status(&self) -> Status {
        let mut recent = Report::default();
        for r in self.recent.iter().flatten() {
            recent.dur += r.dur;
            recent.txs += r.txs;
            recent.errs += r.errs;
        }
        Status {
            latest: self.latest.unwrap_or_default(),
            recent,
            total: self.total,
        }
    }
}

/// Snapshot of the report history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub latest: Report,
    pub recent: Report,
    pub total: Report,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total\t{}\nrecent\t{}\nlatest\t{}",
            self.total, self.recent, self.latest
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Report, Reporter, Reports};
    use crate::metrics::{Metrics, SEND_TX};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn accumulates_totals_and_window() {
        let mut reports = Reports::default();
        reports.add(Report {
            dur: secs(1),
            txs: 10,
            errs: 0,
        });
        reports.add(Report {
            dur: secs(1),
            txs: 20,
            errs: 1,
        });
        let status = reports.add(Report {
            dur: secs(1),
            txs: 5,
            errs: 0,
        });

        assert_eq!(
            status.total,
            Report {
                dur: secs(3),
                txs: 35,
                errs: 1
            }
        );
        assert_eq!(status.recent, status.total);
        assert_eq!(
            status.latest,
            Report {
                dur: secs(1),
                txs: 5,
                errs: 0
            }
        );
    }

    #[test]
    fn window_drops_old_reports_but_total_keeps_them() {
        let mut reports = Reports::default();
        let mut status = None;
        for _ in 0..25 {
            status = Some(reports.add(Report {
                dur: secs(1),
                txs: 2,
                errs: 1,
            }));
        }
        let status = status.unwrap();
        assert_eq!(
            status.total,
            Report {
                dur: secs(25),
                txs: 50,
                errs: 25
            }
        );
        // Only the ten most recent reports stay in the window.
        assert_eq!(
            status.recent,
            Report {
                dur: secs(10),
                txs: 20,
                errs: 10
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_emits_deltas() {
        let metrics = Arc::new(Metrics::new());
        let mut reporter = Reporter::new(metrics.clone());

        metrics.observe(SEND_TX, Duration::from_millis(3));
        metrics.observe(SEND_TX, Duration::from_millis(3));
        metrics.mark_send_error();
        tokio::time::advance(secs(30)).await;

        let first = reporter.report();
        assert_eq!((first.txs, first.errs), (2, 1));
        assert_eq!(first.dur, secs(30));

        metrics.observe(SEND_TX, Duration::from_millis(3));
        tokio::time::advance(secs(30)).await;

        let second = reporter.report();
        assert_eq!((second.txs, second.errs), (1, 0));
        assert_eq!(second.dur, secs(30));
    }

    #[test]
    fn report_displays_rounded_tps() {
        let r = Report {
            dur: secs(2),
            txs: 21,
            errs: 3,
        };
        assert_eq!(r.to_string(), "dur=2s txs=21 errs=3 tps=10.5");
    }
}
