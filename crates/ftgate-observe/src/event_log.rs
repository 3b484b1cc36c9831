use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::{Event, EventSink};

pub const EVENT_LOG_SCHEMA: &str = "ftgate-event-log-v1";

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    schema: &'static str,
    kind: &'static str,
    session_id: String,
    client_addr: &'a str,
    origin_addr: &'a str,
    occurred_at_unix_ms: u128,
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct JsonLineSink {
    writer: Mutex<BufWriter<File>>,
    write_error_count: AtomicU64,
}

impl JsonLineSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            write_error_count: AtomicU64::new(0),
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().expect("lock poisoned").flush()
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_error_count.load(Ordering::Relaxed)
    }

    fn write_event(&self, event: &Event) -> io::Result<()> {
        let record = EventRecord {
            schema: EVENT_LOG_SCHEMA,
            kind: event.kind.as_str(),
            session_id: event.scope.session_id.to_string(),
            client_addr: &event.scope.client_addr,
            origin_addr: &event.scope.origin_addr,
            occurred_at_unix_ms: event.occurred_at_unix_ms,
            attributes: &event.attributes,
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|error| io::Error::other(format!("serialize event record: {error}")))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().expect("lock poisoned");
        writer.write_all(&line)?;
        writer.flush()
    }
}

impl EventSink for JsonLineSink {
    fn emit(&self, event: Event) {
        if self.write_event(&event).is_err() {
            self.write_error_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use uuid::Uuid;

    use super::super::{Event, EventSink, EventType, SessionScope};
    use super::JsonLineSink;

    fn unique_log_path() -> PathBuf {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
        std::env::temp_dir().join(format!(
            "ftgate-event-log-{}-{}.jsonl",
            std::process::id(),
            now.as_nanos()
        ))
    }

    #[test]
    fn writes_one_json_line_per_event() {
        let path = unique_log_path();
        let sink = JsonLineSink::create(&path).expect("create sink");

        let scope = SessionScope {
            session_id: Uuid::new_v4(),
            client_addr: "127.0.0.1:50000".to_string(),
            origin_addr: "ftp.internal:21".to_string(),
        };
        sink.emit(Event::new(EventType::SessionOpened, scope.clone()));
        sink.emit(
            Event::new(EventType::CommandForwarded, scope)
                .with_attribute("line", "PASS ********"),
        );
        sink.flush().expect("flush");

        let contents = fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["schema"], "ftgate-event-log-v1");
        assert_eq!(first["kind"], "session_opened");

        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert_eq!(second["kind"], "command_forwarded");
        assert_eq!(second["attributes"]["line"], "PASS ********");
        assert_eq!(sink.write_error_count(), 0);

        fs::remove_file(&path).expect("cleanup");
    }
}
