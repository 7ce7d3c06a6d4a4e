//! In-memory metrics recorder for terminal output.
//!
//! Collects the engine's counters and gauges while the server runs and prints
//! them as one report when the command ends. Labelled counters are broken
//! down by label value, so packets show per command letter and halts per
//! reason.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;

/// Engine metrics in report order, with their titles.
const REPORT: &[(&str, &str)] = &[
    ("kstub_packets_received_total", "packets received"),
    ("kstub_checksum_failures_total", "checksum failures"),
    ("kstub_halt_events_total", "halt events"),
    ("kstub_stop_replies_total", "stop replies"),
    ("kstub_interrupts_total", "interrupts issued"),
    ("kstub_halted_cpus", "halted cpus"),
];

/// Series of one counter, keyed by label value (empty when unlabelled).
type Series = BTreeMap<String, u64>;

#[derive(Default)]
struct Storage {
    counters: RwLock<BTreeMap<String, Series>>,
    gauges: RwLock<BTreeMap<String, f64>>,
}

struct CliCounter {
    name: String,
    label: String,
    storage: Arc<Storage>,
}

impl metrics::CounterFn for CliCounter {
    fn increment(&self, value: u64) {
        let mut counters = self.storage.counters.write();
        let series = counters.entry(self.name.clone()).or_default();
        *series.entry(self.label.clone()).or_insert(0) += value;
    }

    fn absolute(&self, value: u64) {
        let mut counters = self.storage.counters.write();
        let series = counters.entry(self.name.clone()).or_default();
        series.insert(self.label.clone(), value);
    }
}

struct CliGauge {
    name: String,
    storage: Arc<Storage>,
}

impl metrics::GaugeFn for CliGauge {
    fn increment(&self, value: f64) {
        *self.storage.gauges.write().entry(self.name.clone()).or_insert(0.0) += value;
    }

    fn decrement(&self, value: f64) {
        *self.storage.gauges.write().entry(self.name.clone()).or_insert(0.0) -= value;
    }

    fn set(&self, value: f64) {
        self.storage.gauges.write().insert(self.name.clone(), value);
    }
}

/// Recorder that keeps counters and gauges in memory. The engine emits no
/// histograms, so they are dropped.
#[derive(Default)]
pub struct CliRecorder {
    storage: Arc<Storage>,
}

impl CliRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the global recorder. Returns `None` if one is already set.
    pub fn install(self) -> Option<CliRecorderHandle> {
        let handle = self.handle();
        metrics::set_global_recorder(self).ok()?;
        Some(handle)
    }

    fn handle(&self) -> CliRecorderHandle {
        CliRecorderHandle {
            storage: Arc::clone(&self.storage),
        }
    }
}

fn label_value(key: &Key) -> String {
    key.labels()
        .map(metrics::Label::value)
        .collect::<Vec<_>>()
        .join(",")
}

fn title(name: &str) -> &str {
    REPORT
        .iter()
        .find(|(metric, _)| *metric == name)
        .map_or(name, |&(_, title)| title)
}

fn report_rank(name: &str) -> usize {
    REPORT
        .iter()
        .position(|(metric, _)| *metric == name)
        .unwrap_or(REPORT.len())
}

impl Recorder for CliRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CliCounter {
            name: key.name().to_string(),
            label: label_value(key),
            storage: Arc::clone(&self.storage),
        }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(CliGauge {
            name: key.name().to_string(),
            storage: Arc::clone(&self.storage),
        }))
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// Access to the values collected by an installed [`CliRecorder`].
pub struct CliRecorderHandle {
    storage: Arc<Storage>,
}

impl CliRecorderHandle {
    /// Render the report: engine metrics first in a fixed order, then any
    /// other metric by name. Labelled counters list their breakdown.
    pub fn render(&self) -> String {
        let counters = self.storage.counters.read();
        let gauges = self.storage.gauges.read();
        if counters.is_empty() && gauges.is_empty() {
            return "No metrics collected.\n".to_string();
        }

        let mut rows: Vec<(&str, String)> = Vec::new();
        for (name, series) in counters.iter() {
            let total: u64 = series.values().sum();
            let breakdown: Vec<String> = series
                .iter()
                .filter(|(label, _)| !label.is_empty())
                .map(|(label, count)| format!("{label}={count}"))
                .collect();
            let mut row = format!("  {:<20}{total:>8}", title(name));
            if !breakdown.is_empty() {
                row.push_str(&format!("  ({})", breakdown.join(", ")));
            }
            rows.push((name.as_str(), row));
        }
        for (name, value) in gauges.iter() {
            rows.push((name.as_str(), format!("  {:<20}{value:>8}", title(name))));
        }
        rows.sort_by(|a, b| {
            report_rank(a.0)
                .cmp(&report_rank(b.0))
                .then_with(|| a.0.cmp(b.0))
        });

        let mut out = String::from("\n## Metrics Summary\n\n");
        for (_, row) in rows {
            out.push_str(&row);
            out.push('\n');
        }
        out
    }

    pub fn print_summary(&self) {
        println!("{}", self.render());
    }
}
