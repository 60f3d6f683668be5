use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use maestro_types::RuntimeEvent;

/// Typed event bus. Subscribers register once; publishing never blocks and
/// never fails — a lagging or absent subscriber is the subscriber's problem.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RuntimeEvent) {
        tracing::debug!(target: "maestro.events", event = event.name(), "runtime_event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stem of the rolling log files; the appender adds a date suffix.
const LOG_FILE_STEM: &str = "maestro.log";

/// Logging setup for an embedding application. The runtime is a single
/// process, so there is exactly one console stream and at most one rolling
/// file sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Directory for rolling JSON log files. `None` keeps logging
    /// console-only, which is the right default for tests and embedders
    /// that own their own sinks.
    pub logs_dir: Option<PathBuf>,
    /// Rolled files older than this are pruned at startup.
    pub retention: Duration,
    /// Filter directive applied when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            logs_dir: None,
            retention: Duration::from_secs(14 * 24 * 3600),
            default_filter: "info".to_string(),
        }
    }
}

/// Install the global subscriber. Returns the appender guard when a file
/// sink was configured; dropping it flushes the file. Calling twice is
/// harmless — the second installation is ignored.
pub fn init_logging(options: &LoggingOptions) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_filter.clone()));
    let console = tracing_subscriber::fmt::layer().compact().with_target(true);

    let Some(dir) = &options.logs_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init()
            .ok();
        return Ok(None);
    };

    fs::create_dir_all(dir)?;
    prune_rolled_logs(dir, options.retention)?;

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_STEM);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .ok();
    Ok(Some(guard))
}

/// Delete rolled log files past the retention window. Age comes from the
/// filesystem modification time, not from parsing the date suffix: a file
/// with a mangled name still gets cleaned up eventually.
fn prune_rolled_logs(dir: &Path, retention: Duration) -> anyhow::Result<()> {
    let now = SystemTime::now();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(LOG_FILE_STEM) || !path.is_file() {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let expired = now
            .duration_since(modified)
            .map(|age| age > retention)
            .unwrap_or(false);
        if expired {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_types::Component;

    #[test]
    fn bus_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RuntimeEvent::CircuitOpened {
            component: Component::Llm,
            timestamp: Utc::now(),
        });
        let event = rx.try_recv().expect("event");
        assert_eq!(event.name(), "circuit.opened");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(RuntimeEvent::MemoriesCleaned {
            count: 3,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn console_only_setup_needs_no_guard() {
        let guard = init_logging(&LoggingOptions::default()).unwrap();
        assert!(guard.is_none());
    }

    #[test]
    fn prune_removes_only_expired_rolling_files() {
        let dir = tempfile::tempdir().unwrap();
        let rolled = dir.path().join("maestro.log.2000-01-01");
        let unrelated = dir.path().join("orchestrator.db");
        fs::write(&rolled, "{}").unwrap();
        fs::write(&unrelated, "x").unwrap();

        // Fresh files survive a generous retention window.
        prune_rolled_logs(dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(rolled.exists());
        assert!(unrelated.exists());

        // Once older than the window, rolled files go; other files stay.
        std::thread::sleep(Duration::from_millis(20));
        prune_rolled_logs(dir.path(), Duration::from_millis(1)).unwrap();
        assert!(!rolled.exists());
        assert!(unrelated.exists());
    }
}
