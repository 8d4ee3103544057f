//! Durable CSV output
//!
//! One row per finalized call. The column order below is consumed by the
//! downstream analysis stage by name, and multi-valued columns are split on
//! `"; "`, so neither may change.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::Result;
use crate::record::CallRecord;

pub const CSV_HEADER: &str = "CallTime,CallId,DestinationDomain,ResolvedDestinationIp,CallStatus,ResponseCode,ContactHeaderIps,RecordRouteIps,ViaHeaderIps,SdpMediaIps,ServerHeader,UserAgent,AllDetectedIps";

/// Separator inside multi-valued columns.
pub const MULTI_VALUE_SEPARATOR: &str = "; ";

const CALL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Destination for finalized call records.
pub trait RecordSink: Send + Sync {
    fn try_append(&self, record: &CallRecord) -> Result<()>;

    /// Best-effort append: failures are logged and the record is dropped.
    fn append(&self, record: &CallRecord) {
        if let Err(e) = self.try_append(record) {
            error!(call_id = %record.call_id, error = %e, "Error logging call data");
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn join_unique<'a>(values: impl IntoIterator<Item = &'a String>) -> String {
    let unique: IndexSet<&str> = values.into_iter().map(String::as_str).collect();
    unique.into_iter().collect::<Vec<_>>().join(MULTI_VALUE_SEPARATOR)
}

/// Renders one record as a CSV line, without the trailing newline.
pub fn format_row(record: &CallRecord) -> String {
    let status = record.call_status.map(|s| s.as_str()).unwrap_or("");
    let fields = [
        record.call_time.format(CALL_TIME_FORMAT).to_string(),
        record.call_id.clone(),
        record.destination_domain.clone(),
        record.resolved_destination_ip.clone(),
        status.to_string(),
        record.response_code.clone(),
        join_unique(&record.contact_ips),
        join_unique(&record.record_route_ips),
        join_unique(&record.via_header_ips),
        join_unique(&record.sdp_media_ips),
        record.server_header.clone(),
        record.user_agent.clone(),
        join_unique(&record.all_detected_ips),
    ];
    fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(",")
}

#[derive(Debug)]
struct CsvState {
    header_written: bool,
    rows: u64,
}

impl CsvState {
    // The header is marked written as soon as it is on disk, so a failed row
    // write never causes it to be repeated.
    fn write_row<W: Write>(&mut self, out: &mut W, existing_len: u64, line: &str) -> io::Result<()> {
        if existing_len > 0 {
            self.header_written = true;
        }
        if !self.header_written {
            out.write_all(CSV_HEADER.as_bytes())?;
            out.write_all(b"\n")?;
            self.header_written = true;
        }
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        self.rows += 1;
        Ok(())
    }
}

/// Append-only CSV file with a single header line.
///
/// All appends go through one mutex, so concurrent writers can neither
/// interleave partial lines nor emit the header twice.
#[derive(Debug)]
pub struct CsvFileSink {
    path: PathBuf,
    state: Mutex<CsvState>,
}

impl CsvFileSink {
    /// Appends to `path`. A non-empty existing file is assumed to carry the header.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let header_written = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        Self {
            path,
            state: Mutex::new(CsvState {
                header_written,
                rows: 0,
            }),
        }
    }

    /// Creates `directory` if needed and names the file after the run start time.
    pub fn in_directory(directory: impl AsRef<Path>, started: DateTime<Utc>) -> Result<Self> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;
        let file_name = format!("call_ips_{}.csv", started.format("%Y%m%d_%H%M%S"));
        Ok(Self::new(directory.join(file_name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.state.lock().rows
    }

    fn open(&self) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(&self.path)?)
    }
}

impl RecordSink for CsvFileSink {
    fn try_append(&self, record: &CallRecord) -> Result<()> {
        let line = format_row(record);

        {
            let mut state = self.state.lock();
            let mut file = self.open()?;
            let existing_len = file.metadata()?.len();
            state.write_row(&mut file, existing_len, &line)?;
        }

        info!(
            call_id = %record.call_id,
            total_ips = record.all_detected_ips.len(),
            "Logged IP data for call {}. Total IPs detected: {}",
            record.call_id,
            record.all_detected_ips.len()
        );
        if record.has_evidence() {
            info!(
                call_id = %record.call_id,
                "  Detected IPs: {}",
                record.all_detected_ips.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
            );
        }
        Ok(())
    }
}

/// In-memory sink that keeps every appended record.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<CallRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }

    /// The CSV text the records would produce, header first.
    pub fn lines(&self) -> Vec<String> {
        let records = self.records.lock();
        let mut lines = Vec::with_capacity(records.len() + 1);
        if !records.is_empty() {
            lines.push(CSV_HEADER.to_string());
        }
        lines.extend(records.iter().map(format_row));
        lines
    }
}

impl RecordSink for MemorySink {
    fn try_append(&self, record: &CallRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordSeed, ResponseSummary, CallDelta};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn sample() -> CallRecord {
        let mut record = CallRecord::new("abc", &RecordSeed::new("sip.example.com", "203.0.113.1"));
        record.call_time = Utc.with_ymd_and_hms(2025, 9, 1, 12, 3, 7).unwrap();
        record.apply(&CallDelta {
            remote_ip: Some("203.0.113.3".to_string()),
            contact_ips: vec!["203.0.113.2".to_string(), "203.0.113.2".to_string()],
            server_header: Some("Acme \"Edge\" 1.0".to_string()),
            response: Some(ResponseSummary::new(200, "OK")),
            ..Default::default()
        });
        record
    }

    #[test]
    fn test_format_row() {
        assert_eq!(
            format_row(&sample()),
            "\"2025-09-01 12:03:07\",\"abc\",\"sip.example.com\",\"203.0.113.1\",\"Success\",\"200 OK\",\
\"203.0.113.2\",\"\",\"\",\"\",\"Acme \"\"Edge\"\" 1.0\",\"\",\"203.0.113.3; 203.0.113.2\""
        );
    }

    #[test]
    fn test_header_has_thirteen_columns() {
        assert_eq!(CSV_HEADER.split(',').count(), 13);
        assert!(CSV_HEADER.starts_with("CallTime,CallId,"));
        assert!(CSV_HEADER.ends_with(",AllDetectedIps"));
    }

    #[test]
    fn test_file_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvFileSink::new(dir.path().join("out.csv"));
        sink.append(&sample());
        sink.append(&sample());

        let text = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(sink.rows_written(), 2);
    }

    #[test]
    fn test_existing_file_is_not_given_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        CsvFileSink::new(&path).append(&sample());
        CsvFileSink::new(&path).append(&sample());

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches(CSV_HEADER).count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_file_created_after_sink_is_not_given_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = CsvFileSink::new(&path);
        fs::write(&path, format!("{}\n", CSV_HEADER)).unwrap();

        sink.append(&sample());

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches(CSV_HEADER).count(), 1);
        assert_eq!(text.lines().count(), 2);
    }

    /// Accepts a fixed number of writes, then fails.
    struct FlakyWriter {
        buf: Vec<u8>,
        writes_left: usize,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.writes_left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.writes_left -= 1;
            self.buf.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_row_after_header_does_not_repeat_header() {
        let mut state = CsvState {
            header_written: false,
            rows: 0,
        };
        let line = format_row(&sample());
        let mut out = FlakyWriter {
            buf: Vec::new(),
            writes_left: 2,
        };

        // header and its newline go through, the row does not
        assert!(state.write_row(&mut out, 0, &line).is_err());
        assert!(state.header_written);
        assert_eq!(state.rows, 0);

        out.writes_left = usize::MAX;
        let len = out.buf.len() as u64;
        state.write_row(&mut out, len, &line).unwrap();

        let text = String::from_utf8(out.buf).unwrap();
        assert_eq!(text.matches(CSV_HEADER).count(), 1);
        assert_eq!(state.rows, 1);
    }

    #[test]
    fn test_in_directory_names_file_by_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let started = Utc.with_ymd_and_hms(2025, 9, 1, 12, 3, 7).unwrap();
        let sink = CsvFileSink::in_directory(dir.path().join("logs"), started).unwrap();
        assert!(sink.path().ends_with("logs/call_ips_20250901_120307.csv"));
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_io_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending
        let sink = CsvFileSink::new(dir.path());
        assert!(sink.try_append(&sample()).is_err());
        sink.append(&sample());
        assert_eq!(sink.rows_written(), 0);
    }

    #[test]
    fn test_concurrent_appends_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CsvFileSink::new(dir.path().join("out.csv")));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        sink.append(&sample());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let text = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 161);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.iter().filter(|l| **l == CSV_HEADER).count(), 1);
        assert!(lines[1..].iter().all(|l| l.starts_with("\"2025-09-01 12:03:07\"")));
    }

    #[test]
    fn test_memory_sink_lines() {
        let sink = MemorySink::new();
        assert!(sink.lines().is_empty());
        sink.append(&sample());
        let lines = sink.lines();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 2);
    }
}
