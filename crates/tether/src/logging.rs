// Logging and metric delivery
//
// `init_tracing` installs a global fmt subscriber filtered by RUST_LOG
// (default "info"). Library code only emits events; nothing here runs
// unless the application asks for it.
//
// MetricSink is the per-epoch metric interface. The trainer hands every
// sink a flat name → value map after each epoch.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::sync::{Arc, Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Configures the global tracing subscriber with an "info" default.
pub fn init_tracing() -> Result<(), InitError> {
    init_tracing_with("info")
}

/// Configures the global tracing subscriber, using `default_filter` when
/// RUST_LOG is unset or invalid.
pub fn init_tracing_with(default_filter: &str) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let ansi = std::io::stdout().is_terminal();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(ansi);
    Registry::default().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("another global subscriber is installed: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Receives the metrics of each finished epoch.
pub trait MetricSink: Send {
    fn record(&mut self, epoch: usize, metrics: &BTreeMap<String, f64>);
}

/// Logs each epoch's metrics as an info event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&mut self, epoch: usize, metrics: &BTreeMap<String, f64>) {
        let rendered = metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(target: "tether::metrics", epoch, "{rendered}");
    }
}

/// Keeps every record in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(usize, BTreeMap<String, f64>)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far.
    pub fn records(&self) -> Vec<(usize, BTreeMap<String, f64>)> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The series of one metric across epochs.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records()
            .into_iter()
            .filter_map(|(epoch, m)| m.get(name).map(|&v| (epoch, v)))
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, epoch: usize, metrics: &BTreeMap<String, f64>) {
        let mut guard = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((epoch, metrics.clone()));
    }
}
