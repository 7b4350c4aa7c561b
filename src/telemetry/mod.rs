use std::collections::HashMap;
use std::sync::Mutex;

/// Per-origin accumulator of response-body bytes, keyed by the `Referer`
/// value (or raw URL) the worker charged.
///
/// Records are refcounted by the workers currently charging them: the last
/// `close` for an origin removes the record and emits its line, so nothing
/// is emitted while a worker could still add bytes, and every charged byte
/// is emitted exactly once. Zero-byte origins are dropped silently.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    records: Mutex<HashMap<String, TeleRecord>>,
}

#[derive(Debug, Default)]
struct TeleRecord {
    bytes: u64,
    active_workers: u32,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker as charging `origin`.
    pub fn start(&self, origin: &str) {
        let mut records = self.records.lock().expect("telemetry lock poisoned");
        records.entry(origin.to_string()).or_default().active_workers += 1;
    }

    pub fn update(&self, origin: &str, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut records = self.records.lock().expect("telemetry lock poisoned");
        records.entry(origin.to_string()).or_default().bytes += bytes;
    }

    /// Drops one worker's claim on `origin`; the last one out emits.
    pub fn close(&self, origin: &str) -> Option<(String, u64)> {
        let mut records = self.records.lock().expect("telemetry lock poisoned");
        let record = records.get_mut(origin)?;
        record.active_workers = record.active_workers.saturating_sub(1);
        if record.active_workers > 0 {
            return None;
        }
        let record = records.remove(origin)?;
        drop(records);
        emit(origin.to_string(), record.bytes)
    }

    /// Shutdown path: every nonzero record is emitted and the store cleared.
    pub fn close_all(&self) -> Vec<(String, u64)> {
        let drained: Vec<(String, TeleRecord)> = {
            let mut records = self.records.lock().expect("telemetry lock poisoned");
            records.drain().collect()
        };
        drained
            .into_iter()
            .filter_map(|(origin, record)| emit(origin, record.bytes))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("telemetry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn emit(origin: String, bytes: u64) -> Option<(String, u64)> {
    if bytes == 0 {
        return None;
    }
    println!("{origin}, {bytes}");
    Some((origin, bytes))
}
