//! Quality-of-service monitor: per-tuple latency records, written one CSV row per completed
//! tuple, one file per operator name.
//!
//! A record transitions `input_buffered` -> `input_dispatched` -> `result_received`; the last
//! transition removes it from the active set and hands it to a dedicated background thread for
//! CSV output, keeping file I/O off both the async I/O loop and the operator dispatcher thread.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use coarsetime::Instant;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RecordKey {
    operator_id: Uuid,
    source_stream_id: Uuid,
    source_sequence_no: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatsRecord {
    operator_id: Uuid,
    operator_name: String,
    source_stream_id: Uuid,
    batch_no: Option<u64>,
    input_buffered_at: Option<f64>,
    input_dispatched_at: Option<f64>,
    result_received_at: Option<f64>,
}

impl RuntimeStatsRecord {
    fn new(operator_id: Uuid, operator_name: String, source_stream_id: Uuid) -> Self {
        Self {
            operator_id,
            operator_name,
            source_stream_id,
            batch_no: None,
            input_buffered_at: None,
            input_dispatched_at: None,
            result_received_at: None,
        }
    }
}

struct QosMonitorInner {
    active: Mutex<HashMap<RecordKey, RuntimeStatsRecord>>,
    started_at: Instant,
    writer_tx: std::sync::mpsc::Sender<RuntimeStatsRecord>,
}

#[derive(Clone)]
pub struct QosMonitor(Arc<QosMonitorInner>);

impl QosMonitor {
    pub fn new(data_path: PathBuf) -> Self {
        let (writer_tx, writer_rx) = std::sync::mpsc::channel::<RuntimeStatsRecord>();
        std::thread::Builder::new()
            .name("estuary-qos-writer".to_string())
            .spawn(move || run_csv_writer(data_path, writer_rx))
            .expect("failed to spawn QoS CSV writer thread");

        Self(Arc::new(QosMonitorInner {
            active: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            writer_tx,
        }))
    }

    fn elapsed_secs(&self) -> f64 {
        self.0.started_at.elapsed().as_f64()
    }

    pub fn input_buffered(&self, operator_id: Uuid, operator_name: String, source_stream_id: Uuid, sequence_no: u64) {
        let key = RecordKey {
            operator_id,
            source_stream_id,
            source_sequence_no: sequence_no,
        };
        let at = self.elapsed_secs();
        let mut active = self.0.active.lock();
        let record = active
            .entry(key)
            .or_insert_with(|| RuntimeStatsRecord::new(operator_id, operator_name, source_stream_id));
        record.input_buffered_at = Some(at);
    }

    pub fn input_dispatched(
        &self,
        operator_id: Uuid,
        operator_name: String,
        source_stream_id: Uuid,
        sequence_no: u64,
        batch_no: u64,
    ) {
        let key = RecordKey {
            operator_id,
            source_stream_id,
            source_sequence_no: sequence_no,
        };
        let at = self.elapsed_secs();
        let mut active = self.0.active.lock();
        let record = active
            .entry(key)
            .or_insert_with(|| RuntimeStatsRecord::new(operator_id, operator_name, source_stream_id));
        record.batch_no = Some(batch_no);
        record.input_dispatched_at = Some(at);
    }

    pub fn result_received(&self, operator_id: Uuid, operator_name: String, source_stream_id: Uuid, sequence_no: u64) {
        let key = RecordKey {
            operator_id,
            source_stream_id,
            source_sequence_no: sequence_no,
        };
        let at = self.elapsed_secs();
        let record = {
            let mut active = self.0.active.lock();
            let record = active
                .entry(key.clone())
                .or_insert_with(|| RuntimeStatsRecord::new(operator_id, operator_name, source_stream_id));
            record.result_received_at = Some(at);
            active.remove(&key)
        };
        if let Some(record) = record {
            if self.0.writer_tx.send(record).is_err() {
                warn!("QoS CSV writer thread has exited, dropping completed record");
            }
        }
    }
}

fn run_csv_writer(data_path: PathBuf, rx: std::sync::mpsc::Receiver<RuntimeStatsRecord>) {
    if let Err(e) = std::fs::create_dir_all(&data_path) {
        warn!(error = %e, path = %data_path.display(), "failed to create QoS data directory");
        return;
    }
    let mut writers: HashMap<String, csv::Writer<std::fs::File>> = HashMap::new();

    while let Ok(record) = rx.recv() {
        let writer = match writers.entry(record.operator_name.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let path = data_path.join(format!("rtstats_{}.csv", record.operator_name));
                let is_new = !path.exists();
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => {
                        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
                        if is_new {
                            let _ = writer.write_record([
                                "operator_id",
                                "operator_name",
                                "source_stream_id",
                                "batch_no",
                                "input_buffered_at",
                                "input_dispatched_at",
                                "result_received_at",
                            ]);
                            let _ = writer.flush();
                        }
                        e.insert(writer)
                    }
                    Err(err) => {
                        warn!(error = %err, path = %path.display(), "failed to open QoS CSV file");
                        continue;
                    }
                }
            }
        };

        let row = [
            record.operator_id.to_string(),
            record.operator_name.clone(),
            record.source_stream_id.to_string(),
            record.batch_no.map(|b| b.to_string()).unwrap_or_default(),
            record.input_buffered_at.map(|t| t.to_string()).unwrap_or_default(),
            record.input_dispatched_at.map(|t| t.to_string()).unwrap_or_default(),
            record.result_received_at.map(|t| t.to_string()).unwrap_or_default(),
        ];
        if writer.write_record(row).is_err() || writer.flush().is_err() {
            warn!(operator = %record.operator_name, "failed to write QoS CSV row");
        }
    }
}
