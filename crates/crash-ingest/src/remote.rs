// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote-fed report source.
//!
//! In addition to local landing-zone discovery, this source drains a message
//! queue whose messages point at compressed bundles in an object store. Each
//! bundle is unpacked into the landing zone and then flows through the same
//! local discovery, dedup and FIFO machinery as directly-landed reports.
//! Draining only runs while the FIFO has headroom, so back-pressure reaches
//! all the way to the remote queue.

use crate::bundle::{self, CrashBundle};
use crate::context::CrashContext;
use crate::dedup::DedupIndex;
use crate::queue::{LandingZoneQueue, QueueSettings, ReportQueue};
use crate::store::{MessageQueueClient, ObjectStoreClient, QueueMessage};
use async_trait::async_trait;
use crash_telemetry::CounterRegistry;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const COUNTER_MESSAGES_DRAINED: &str = "remote.messages_drained";
pub const COUNTER_RECORDS_UNPACKED: &str = "remote.records_unpacked";
pub const COUNTER_RECORDS_DUPLICATE: &str = "remote.records_duplicate";
pub const COUNTER_RECORDS_MALFORMED: &str = "remote.records_malformed";
pub const COUNTER_RECORDS_EMPTY: &str = "remote.records_empty";
pub const COUNTER_MESSAGES_MALFORMED: &str = "remote.messages_malformed";
pub const COUNTER_FETCH_ERRORS: &str = "remote.fetch_errors";

const RECEIVE_BATCH: usize = 10;
/// Upper bound on queue batches consumed in one discovery pass, so a broken
/// delete endpoint cannot pin a pass in an endless redelivery loop.
const MAX_BATCHES_PER_PASS: usize = 8;

pub struct RemoteQueue {
    local: LandingZoneQueue,
    store: ObjectStoreClient,
    queue: MessageQueueClient,
    dedup: Arc<DedupIndex>,
    telemetry: Arc<CounterRegistry>,
}

impl RemoteQueue {
    pub fn new(
        name: &str,
        landing_zone: impl Into<std::path::PathBuf>,
        settings: QueueSettings,
        dedup: Arc<DedupIndex>,
        telemetry: Arc<CounterRegistry>,
        store: ObjectStoreClient,
        queue: MessageQueueClient,
    ) -> Self {
        let local = LandingZoneQueue::new(
            name,
            landing_zone,
            settings,
            dedup.clone(),
            telemetry.clone(),
        );
        RemoteQueue {
            local,
            store,
            queue,
            dedup,
            telemetry,
        }
    }

    /// Pulls queue messages and unpacks their bundles while the FIFO has
    /// headroom. Transient fetch errors leave the message in the queue for
    /// redelivery; only fully consumed or hopeless messages are deleted.
    async fn drain_remote(&self) {
        let mut batches = 0;
        while self.local.has_headroom() && batches < MAX_BATCHES_PER_PASS {
            batches += 1;
            let messages = match self.queue.receive(RECEIVE_BATCH).await {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Failed to receive queue messages: {e}");
                    self.telemetry.incr(COUNTER_FETCH_ERRORS);
                    return;
                }
            };
            if messages.is_empty() {
                return;
            }

            for message in messages {
                match self.consume_message(&message).await {
                    MessageOutcome::Consumed | MessageOutcome::Poison => {
                        if let Err(e) = self.queue.delete(&message.receipt).await {
                            warn!("Failed to delete message {}: {e}", message.receipt);
                        }
                        self.telemetry.incr(COUNTER_MESSAGES_DRAINED);
                    }
                    MessageOutcome::Retry => {
                        // Left visible for redelivery.
                        self.telemetry.incr(COUNTER_FETCH_ERRORS);
                    }
                }
            }
        }
    }

    async fn consume_message(&self, message: &QueueMessage) -> MessageOutcome {
        let Some((bucket, key)) = message.body.split_once(',') else {
            warn!("Malformed queue message body: {:?}", message.body);
            self.telemetry.incr(COUNTER_MESSAGES_MALFORMED);
            return MessageOutcome::Poison;
        };

        let object = match self.store.get(bucket.trim(), key.trim()).await {
            Ok(object) => object,
            Err(e) => {
                error!("Failed to fetch {bucket}/{key}: {e}");
                return MessageOutcome::Retry;
            }
        };

        let envelope = match bundle::gzip_decompress(&object, bundle::MAX_DECOMPRESSED_BYTES) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Undecodable object {bucket}/{key}: {e}");
                self.telemetry.incr(COUNTER_RECORDS_MALFORMED);
                return MessageOutcome::Poison;
            }
        };

        let records = match bundle::decode_records(&envelope) {
            Ok(records) => records,
            Err(e) => {
                warn!("Undecodable record envelope in {bucket}/{key}: {e}");
                self.telemetry.incr(COUNTER_RECORDS_MALFORMED);
                return MessageOutcome::Poison;
            }
        };

        for record in records {
            self.unpack_record(&record, self.local.landing_zone());
        }
        MessageOutcome::Consumed
    }

    /// Unpacks one record's bundle. A malformed record is counted and
    /// skipped; it never aborts the rest of the batch.
    fn unpack_record(&self, record: &bundle::Record, landing_zone: &Path) {
        if record.payload.is_empty() {
            self.telemetry.incr(COUNTER_RECORDS_EMPTY);
            return;
        }

        let payload = match bundle::zlib_decompress(&record.payload, bundle::MAX_DECOMPRESSED_BYTES)
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Record {}: payload decompression failed: {e}", record.id);
                self.telemetry.incr(COUNTER_RECORDS_MALFORMED);
                return;
            }
        };

        let crash_bundle = match CrashBundle::parse(&payload) {
            Ok(crash_bundle) => crash_bundle,
            Err(e) => {
                warn!("Record {}: rejected bundle: {e}", record.id);
                self.telemetry.incr(COUNTER_RECORDS_MALFORMED);
                return;
            }
        };

        // Not an error: a second producer already delivered this report.
        if self.dedup.contains(&crash_bundle.directory_name) {
            debug!(
                "Record {}: report {} already admitted, dropping",
                record.id, crash_bundle.directory_name
            );
            self.telemetry.incr(COUNTER_RECORDS_DUPLICATE);
            return;
        }

        match crash_bundle.unpack_into(landing_zone) {
            Ok(dir) => {
                debug!("Record {} unpacked into {}", record.id, dir.display());
                self.telemetry.incr(COUNTER_RECORDS_UNPACKED);
            }
            Err(e) => {
                error!("Record {}: unpack failed: {e}", record.id);
                self.telemetry.incr(COUNTER_RECORDS_MALFORMED);
            }
        }
    }
}

enum MessageOutcome {
    /// Bundle landed; delete the message.
    Consumed,
    /// Permanently undecodable; delete so it cannot loop forever.
    Poison,
    /// Transient failure; leave for redelivery.
    Retry,
}

#[async_trait]
impl ReportQueue for RemoteQueue {
    fn name(&self) -> &str {
        self.local.name()
    }

    fn landing_zone(&self) -> &Path {
        self.local.landing_zone()
    }

    async fn check_for_new_reports(&self) -> usize {
        // Remote draining shares the pass with local discovery and respects
        // the same watermarks.
        self.drain_remote().await;
        self.local.check_for_new_reports().await
    }

    async fn try_dequeue(&self) -> Option<CrashContext> {
        self.local.try_dequeue().await
    }

    async fn clean_landing_zone(&self) {
        self.local.clean_landing_zone().await;
    }

    async fn shutdown(&self) {
        self.local.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{encode_records, Record, BUNDLE_MARKER};
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn compress_gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn compress_zlib(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn bundle_bytes(dir: &str, file_name: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BUNDLE_MARKER);
        for s in [dir, "f"] {
            out.extend_from_slice(&(s.len() as i32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        out.extend_from_slice(&(data.len() as i32).to_le_bytes());
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&(file_name.len() as i32).to_le_bytes());
        out.extend_from_slice(file_name.as_bytes());
        out.extend_from_slice(&(data.len() as i32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn remote_queue(
        tmp: &TempDir,
        zone: &Path,
        store_url: &str,
        queue_url: &str,
    ) -> (RemoteQueue, Arc<CounterRegistry>) {
        let telemetry = Arc::new(CounterRegistry::new());
        let dedup = Arc::new(DedupIndex::new(tmp.path().join("reports.index"), 14));
        let queue = RemoteQueue::new(
            "remote",
            zone,
            QueueSettings::default(),
            dedup,
            telemetry.clone(),
            ObjectStoreClient::new(store_url).unwrap(),
            MessageQueueClient::new(queue_url).unwrap(),
        );
        (queue, telemetry)
    }

    #[tokio::test]
    async fn drains_message_unpacks_bundle_and_admits_report() {
        let tmp = TempDir::new().unwrap();
        let zone = tmp.path().join("landing");
        std::fs::create_dir(&zone).unwrap();

        let legacy = "BranchName=main\nChangeList=42\n";
        let envelope = encode_records(&[Record {
            id: 1,
            routing: "crash-uploads/batch-1".to_string(),
            payload: compress_zlib(&bundle_bytes(
                "CR-REMOTE-0001",
                crate::context::LEGACY_METADATA_FILE,
                legacy.as_bytes(),
            )),
        }]);

        let mut server = mockito::Server::new_async().await;
        // First receive returns the announcement, later receives drain empty.
        let served = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let served_clone = served.clone();
        let _messages = server
            .mock("GET", mockito::Matcher::Regex("^/messages".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                if served_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    br#"[{"receipt":"r-1","body":"crash-uploads,batch-1.bin"}]"#.to_vec()
                } else {
                    b"[]".to_vec()
                }
            })
            .create_async()
            .await;
        let _object = server
            .mock("GET", "/crash-uploads/batch-1.bin")
            .with_status(200)
            .with_body(compress_gzip(&envelope))
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/messages/r-1")
            .with_status(200)
            .create_async()
            .await;

        let (queue, telemetry) = remote_queue(&tmp, &zone, &server.url(), &server.url());

        let outstanding = queue.check_for_new_reports().await;
        assert_eq!(outstanding, 1);
        assert!(zone.join("CR-REMOTE-0001").is_dir());
        assert_eq!(telemetry.counter(COUNTER_RECORDS_UNPACKED), 1);

        let context = queue.try_dequeue().await.unwrap();
        assert_eq!(context.report_id, "CR-REMOTE-0001");
        assert_eq!(context.branch_name, "main");
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn duplicate_record_dropped_silently() {
        let tmp = TempDir::new().unwrap();
        let zone = tmp.path().join("landing");
        std::fs::create_dir(&zone).unwrap();

        let (queue, telemetry) = remote_queue(&tmp, &zone, "http://127.0.0.1:1", "http://127.0.0.1:1");
        queue.dedup.try_add("CR-REMOTE-0001");

        let record = Record {
            id: 9,
            routing: String::new(),
            payload: compress_zlib(&bundle_bytes("CR-REMOTE-0001", "x.txt", b"data")),
        };
        queue.unpack_record(&record, &zone);

        assert_eq!(telemetry.counter(COUNTER_RECORDS_DUPLICATE), 1);
        assert!(!zone.join("CR-REMOTE-0001").exists());
    }

    #[tokio::test]
    async fn malformed_record_counted_but_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let zone = tmp.path().join("landing");
        std::fs::create_dir(&zone).unwrap();

        let (queue, telemetry) = remote_queue(&tmp, &zone, "http://127.0.0.1:1", "http://127.0.0.1:1");

        queue.unpack_record(
            &Record {
                id: 1,
                routing: String::new(),
                payload: vec![0xde, 0xad, 0xbe, 0xef],
            },
            &zone,
        );
        queue.unpack_record(
            &Record {
                id: 2,
                routing: String::new(),
                payload: Vec::new(),
            },
            &zone,
        );

        assert_eq!(telemetry.counter(COUNTER_RECORDS_MALFORMED), 1);
        assert_eq!(telemetry.counter(COUNTER_RECORDS_EMPTY), 1);
    }

    #[tokio::test]
    async fn malformed_message_is_deleted_as_poison() {
        let tmp = TempDir::new().unwrap();
        let zone = tmp.path().join("landing");
        std::fs::create_dir(&zone).unwrap();

        let mut server = mockito::Server::new_async().await;
        let served = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let served_clone = served.clone();
        let _messages = server
            .mock("GET", mockito::Matcher::Regex("^/messages".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                if served_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    br#"[{"receipt":"r-9","body":"no-separator-here"}]"#.to_vec()
                } else {
                    b"[]".to_vec()
                }
            })
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/messages/r-9")
            .with_status(200)
            .create_async()
            .await;

        let (queue, telemetry) = remote_queue(&tmp, &zone, &server.url(), &server.url());
        queue.check_for_new_reports().await;

        assert_eq!(telemetry.counter(COUNTER_MESSAGES_MALFORMED), 1);
        delete.assert_async().await;
    }
}
