use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Column names of the statistics log, in order
pub const LOG_HEADER: [&str; 8] = [
    "municipio", "formato", "dispositivo", "ip", "duracion", "resolucion", "estado", "created_at",
];

/// Column names of the aggregated export
pub const EXPORT_HEADER: [&str; 5] = ["Municipio", "Formato", "Dispositivo", "Mes", "Total"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Error(String),
}

impl Outcome {
    pub fn as_log_value(&self) -> String {
        match self {
            Outcome::Success => "success".to_string(),
            Outcome::Error(detail) => format!("error:{}", detail),
        }
    }
}

/// One line of the statistics log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub municipality: String,
    pub format: String,
    pub device: String,
    pub ip: String,
    pub duration_seconds: Option<f64>,
    pub resolution: Option<String>,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

impl StatisticsRecord {
    fn to_csv_row(&self) -> String {
        let fields = [
            self.municipality.clone(),
            self.format.clone(),
            self.device.clone(),
            self.ip.clone(),
            self.duration_seconds.map(|d| d.to_string()).unwrap_or_default(),
            self.resolution.clone().unwrap_or_default(),
            self.outcome.as_log_value(),
            self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        ];
        csv_line(&fields)
    }
}

/// Quote a field if it contains a delimiter, quote or line break
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_line<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = fields.iter()
        .map(|f| csv_escape(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

/// Split CSV text into records, honouring quoted fields with embedded line breaks
pub(crate) fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

/// Append-only CSV log shared by every worker
pub struct StatisticsRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StatisticsRecorder {
    pub fn new(path: PathBuf) -> Self {
        StatisticsRecorder { path, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; the header is written first when the log is new
    pub fn append(&self, record: &StatisticsRecord) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("statistics lock poisoned"))?;

        let needs_header = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let mut buf = String::new();
        if needs_header {
            buf.push_str(&csv_line(&LOG_HEADER));
        }
        buf.push_str(&record.to_csv_row());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open statistics log: {}", self.path.display()))?;

        // Single write so a record is never split across concurrent appends
        file.write_all(buf.as_bytes())
            .with_context(|| format!("Failed to append to statistics log: {}", self.path.display()))?;

        debug!("Recorded {} / {} -> {}", record.municipality, record.format, record.outcome.as_log_value());
        Ok(())
    }
}

/// One row of the aggregated export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub municipality: String,
    pub format: String,
    pub device: String,
    pub month: String,
    pub total: u64,
}

/// Count log records grouped by municipality, format, device and month (`YYYY-MM`)
pub fn summarize_log(path: &Path) -> Result<Vec<SummaryRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read statistics log: {}", path.display()))?;
    Ok(summarize(&text))
}

fn summarize(text: &str) -> Vec<SummaryRow> {
    let mut records = parse_csv(text).into_iter();
    let header = match records.next() {
        Some(h) => h,
        None => return Vec::new(),
    };

    let column = |name: &str| header.iter().position(|h| h == name);
    let (Some(m), Some(f), Some(d), Some(c)) =
        (column("municipio"), column("formato"), column("dispositivo"), column("created_at"))
    else {
        warn!("Statistics log has an unexpected header: {:?}", header);
        return Vec::new();
    };

    let mut counts: BTreeMap<(String, String, String, String), u64> = BTreeMap::new();
    for row in records {
        let (Some(municipality), Some(format), Some(device), Some(created)) =
            (row.get(m), row.get(f), row.get(d), row.get(c))
        else {
            warn!("Skipping malformed statistics row: {:?}", row);
            continue;
        };
        let month: String = created.chars().take(7).collect();
        *counts
            .entry((municipality.clone(), format.clone(), device.clone(), month))
            .or_insert(0) += 1;
    }

    counts.into_iter()
        .map(|((municipality, format, device, month), total)| SummaryRow {
            municipality,
            format,
            device,
            month,
            total,
        })
        .collect()
}

/// Write the export as CSV
pub fn write_export<W: Write>(rows: &[SummaryRow], mut out: W) -> Result<()> {
    out.write_all(csv_line(&EXPORT_HEADER).as_bytes())?;
    for row in rows {
        let total = row.total.to_string();
        let fields = [&row.municipality, &row.format, &row.device, &row.month, &total];
        out.write_all(csv_line(&fields).as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn record(municipality: &str, outcome: Outcome, month: u32) -> StatisticsRecord {
        let success = outcome == Outcome::Success;
        StatisticsRecord {
            municipality: municipality.to_string(),
            format: "square".to_string(),
            device: "mobile (Android)".to_string(),
            ip: "10.0.0.1".to_string(),
            duration_seconds: success.then_some(12.5),
            resolution: success.then(|| "720x720".to_string()),
            outcome,
            timestamp: Utc.with_ymd_and_hms(2024, month, 3, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_first_append_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = StatisticsRecorder::new(dir.path().join("stats.csv"));

        recorder.append(&record("Springfield", Outcome::Success, 1)).unwrap();
        recorder.append(&record("Springfield", Outcome::Error("boom".into()), 1)).unwrap();

        let text = std::fs::read_to_string(recorder.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "municipio,formato,dispositivo,ip,duracion,resolucion,estado,created_at");
        assert_eq!(lines[1], "Springfield,square,mobile (Android),10.0.0.1,12.5,720x720,success,2024-01-03 10:00:00");
        assert_eq!(lines[2], "Springfield,square,mobile (Android),10.0.0.1,,,error:boom,2024-01-03 10:00:00");
    }

    #[test]
    fn test_fields_with_commas_round_trip_through_export() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = StatisticsRecorder::new(dir.path().join("stats.csv"));
        let detail = "Error: \"x264\" failed,\nsee log".to_string();
        recorder.append(&record("Villa, Norte", Outcome::Error(detail), 2)).unwrap();

        let rows = summarize_log(recorder.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].municipality, "Villa, Norte");
        assert_eq!(rows[0].month, "2024-02");
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(StatisticsRecorder::new(dir.path().join("stats.csv")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        recorder.append(&record(&format!("Town {}", i), Outcome::Success, 3)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let text = std::fs::read_to_string(recorder.path()).unwrap();
        let records = parse_csv(&text);
        assert_eq!(records.len(), 1 + 8 * 25);
        assert!(records.iter().all(|r| r.len() == LOG_HEADER.len()));
        assert_eq!(records.iter().filter(|r| r[0] == "municipio").count(), 1);
    }

    #[test]
    fn test_summary_groups_by_month() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = StatisticsRecorder::new(dir.path().join("stats.csv"));
        recorder.append(&record("Springfield", Outcome::Success, 1)).unwrap();
        recorder.append(&record("Springfield", Outcome::Success, 1)).unwrap();
        recorder.append(&record("Springfield", Outcome::Success, 2)).unwrap();
        recorder.append(&record("Shelbyville", Outcome::Error("x".into()), 2)).unwrap();

        let rows = summarize_log(recorder.path()).unwrap();
        let flat: Vec<(&str, &str, u64)> = rows.iter()
            .map(|r| (r.municipality.as_str(), r.month.as_str(), r.total))
            .collect();
        assert_eq!(flat, vec![
            ("Shelbyville", "2024-02", 1),
            ("Springfield", "2024-01", 2),
            ("Springfield", "2024-02", 1),
        ]);

        let mut out = Vec::new();
        write_export(&rows, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Municipio,Formato,Dispositivo,Mes,Total\r\n"));
        assert!(text.contains("Springfield,square,mobile (Android),2024-01,2\r\n"));
    }

    #[test]
    fn test_missing_log_summarizes_to_nothing() {
        assert!(summarize_log(Path::new("/nonexistent/stats.csv")).unwrap().is_empty());
    }
}
