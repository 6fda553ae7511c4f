//! Record tracing events in memory so tests can assert on what was logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Severity.
    pub level: Level,
    /// Emitting module path.
    pub target: String,
    /// The `message` field, empty when the event had none.
    pub message: String,
    /// Remaining fields, rendered as text.
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Rendered value of a structured field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn mentions(&self, needle: &str) -> bool {
        self.message.contains(needle)
    }
}

/// Shared handle to the recorded events. Cloning shares the buffer.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    fn buffer(&self) -> MutexGuard<'_, Vec<CapturedEvent>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.buffer().clone()
    }

    /// True if some message contains `needle`.
    pub fn has_message(&self, needle: &str) -> bool {
        self.buffer().iter().any(|event| event.mentions(needle))
    }

    /// True if some event at `level` mentions `needle`.
    pub fn has_event(&self, level: Level, needle: &str) -> bool {
        self.buffer()
            .iter()
            .any(|event| event.level == level && event.mentions(needle))
    }

    /// Events mentioning `needle`, in emission order.
    pub fn matching(&self, needle: &str) -> Vec<CapturedEvent> {
        self.buffer()
            .iter()
            .filter(|event| event.mentions(needle))
            .cloned()
            .collect()
    }

    /// Number of events at exactly `level`.
    pub fn count_at_level(&self, level: Level) -> usize {
        self.buffer().iter().filter(|event| event.level == level).count()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.buffer().clear();
    }
}

impl fmt::Debug for CapturedLogs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedLogs")
            .field("events", &self.buffer().len())
            .finish()
    }
}

#[derive(Default)]
struct Collected {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Collected {
    fn put(&mut self, field: &Field, rendered: String) {
        if field.name() == "message" {
            self.message = rendered;
        } else {
            let _ = self.fields.insert(field.name().to_owned(), rendered);
        }
    }
}

impl Visit for Collected {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

struct Recorder(CapturedLogs);

impl<S> Layer<S> for Recorder
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        event.record(&mut collected);
        let meta = event.metadata();
        self.0.buffer().push(CapturedEvent {
            level: *meta.level(),
            target: meta.target().to_owned(),
            message: collected.message,
            fields: collected.fields,
        });
    }
}

/// Route every event on the current thread into a fresh [`CapturedLogs`].
///
/// Recording stops when the guard is dropped.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let guard = tracing_subscriber::registry()
        .with(Recorder(logs.clone()))
        .with(LevelFilter::TRACE)
        .set_default();
    (logs, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_message_and_level() {
        let (logs, _guard) = capture_logs();
        tracing::info!("audit 3 committed");
        assert!(logs.has_event(Level::INFO, "audit 3"));
        assert!(!logs.has_event(Level::WARN, "audit 3"));
        assert!(logs.has_message("committed"));
    }

    #[test]
    fn counts_per_level() {
        let (logs, _guard) = capture_logs();
        tracing::trace!("scan");
        tracing::warn!("stale end marker");
        tracing::warn!("rollback failed");
        assert_eq!(logs.count_at_level(Level::TRACE), 1);
        assert_eq!(logs.count_at_level(Level::WARN), 2);
        assert_eq!(logs.count_at_level(Level::ERROR), 0);
    }

    #[test]
    fn structured_fields_are_rendered() {
        let (logs, _guard) = capture_logs();
        tracing::info!(audit_id = 7_i64, entity = "Article", closed = true, "version rows written");

        let hits = logs.matching("version rows written");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field("audit_id"), Some("7"));
        assert_eq!(hits[0].field("entity"), Some("Article"));
        assert_eq!(hits[0].field("closed"), Some("true"));
        assert_eq!(hits[0].field("missing"), None);
    }

    #[test]
    fn clear_empties_shared_buffer() {
        let (logs, _guard) = capture_logs();
        let other = logs.clone();
        tracing::debug!("first");
        assert_eq!(other.events().len(), 1);
        logs.clear();
        assert!(other.events().is_empty());
    }
}
