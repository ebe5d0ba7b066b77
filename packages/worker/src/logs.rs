//! Log capture for inclusion in job responses.
//!
//! A [`BufferLayer`] is installed on the subscriber at process startup and
//! stays installed for the worker's lifetime; whether it actually records
//! anything is controlled per-job. The handler calls [`start_streaming`]
//! before dependency installation, drains the buffer into the response's
//! `stdout` after user code returns, and calls [`stop_streaming`] on the way
//! out. The buffer is a bounded FIFO: overflow drops the oldest lines.
//!
//! Thread safety matters here: log records arrive from any thread (installer
//! tasks, the cache-sync worker), while the request task drains.

use std::{
    collections::VecDeque,
    fmt::{self, Write as _},
    sync::{Arc, Mutex, OnceLock},
};

use tracing::{Event, Level, Subscriber, field::Field};
use tracing_subscriber::layer::{Context, Layer};

use crate::constants::LOG_BUFFER_CAPACITY;

/// Map the `LOG_LEVEL` environment variable onto a tracing level.
///
/// Accepts `DEBUG|INFO|WARNING|ERROR|CRITICAL` (case-insensitive), defaults
/// to `INFO`. `CRITICAL` has no tracing equivalent and maps to `ERROR`.
pub fn requested_level() -> Level {
    match std::env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_uppercase()
        .as_str()
    {
        "DEBUG" => Level::DEBUG,
        "WARNING" => Level::WARN,
        "ERROR" | "CRITICAL" => Level::ERROR,
        _ => Level::INFO,
    }
}

struct State {
    entries: VecDeque<String>,
    capacity: usize,

    /// Capture level while streaming; `None` when not streaming.
    active: Option<Level>,
}

/// Thread-safe bounded buffer of formatted log lines.
pub struct LogBuffer {
    state: Mutex<State>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                active: None,
            }),
        })
    }

    /// Begin capturing records at `level` and below.
    ///
    /// Idempotent: a second start while already streaming keeps the original
    /// level, mirroring how the capture must not be reconfigured mid-job.
    pub fn start(&self, level: Level) {
        let mut state = self.lock();
        if state.active.is_none() {
            state.active = Some(level);
        }
    }

    /// Stop capturing. Buffered lines remain until drained.
    pub fn stop(&self) {
        self.lock().active = None;
    }

    /// Append a formatted line, evicting the oldest on overflow.
    pub fn push(&self, line: String) {
        let mut state = self.lock();
        if state.entries.len() == state.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(line);
    }

    /// Join and clear all buffered lines.
    pub fn drain(&self) -> String {
        let mut state = self.lock();
        let lines = state.entries.drain(..).collect::<Vec<_>>();
        lines.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn record(&self, event: &Event<'_>) {
        let level = {
            let state = self.lock();
            match state.active {
                Some(level) => level,
                None => return,
            }
        };
        let metadata = event.metadata();
        if *metadata.level() > level {
            return;
        }

        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));

        let now = jiff::Timestamp::now();
        let line = format!(
            "{} - {} - {} - {message}",
            now.round(jiff::Unit::Millisecond).unwrap_or(now),
            metadata.level(),
            metadata.target(),
        );
        self.push(line);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding this lock only loses log lines.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        }
    }
}

/// Subscriber layer feeding a [`LogBuffer`].
pub struct BufferLayer {
    buffer: Arc<LogBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.buffer.record(event);
    }
}

static GLOBAL: OnceLock<Arc<LogBuffer>> = OnceLock::new();

/// The process-global buffer the handler streams into.
pub fn global() -> &'static Arc<LogBuffer> {
    GLOBAL.get_or_init(|| LogBuffer::new(LOG_BUFFER_CAPACITY))
}

/// Layer over the process-global buffer, for subscriber installation.
pub fn layer() -> BufferLayer {
    BufferLayer::new(Arc::clone(global()))
}

/// Begin capturing on the process-global buffer.
pub fn start_streaming(level: Level) {
    global().start(level);
}

/// Stop capturing on the process-global buffer.
pub fn stop_streaming() {
    global().stop();
}

/// Drain the process-global buffer.
pub fn drain_streamed_logs() -> String {
    global().drain()
}
