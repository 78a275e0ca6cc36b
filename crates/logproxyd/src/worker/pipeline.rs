//! Record pipeline inside a worker.
//!
//! ```text
//! RecordSource ──▶ producer task ──▶ bounded queue ──▶ sender task ──▶ client
//!                                                          (Data frames)
//! ```
//!
//! The pipeline ends when the source is exhausted and the queue is drained,
//! when the client closes its side, or on the first fatal error.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use logproxy_protocol::{DataBatch, FrameCodec, Message};

use super::handoff::WorkerSettings;
use super::WorkerError;

/// Produces opaque change records.
#[async_trait]
pub trait RecordSource: Send + 'static {
    /// Returns the next record, or `None` once the source is exhausted.
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>, WorkerError>;
}

// ============================================================================
// Command source
// ============================================================================

/// Runs the log reader as `sh -c <command>`.
///
/// The tenant configuration is written to the reader's stdin, which is then
/// closed, while records are already being read. The reader emits records on stdout as `len:u32 BE` + bytes.
pub struct CommandSource {
    child: Child,
    stdout: BufReader<ChildStdout>,
    max_record: usize,
}

impl CommandSource {
    pub async fn start(command: &str, oblog_config: &str, max_record: usize) -> Result<Self, WorkerError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Source)?;

        // fed from its own task: the reader may fill stdout before it
        // finishes reading stdin
        if let Some(mut stdin) = child.stdin.take() {
            let config = format!("{oblog_config}\n");
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(config.as_bytes()).await {
                    debug!(error = %e, "Log reader did not take its configuration");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Source(std::io::Error::other("reader stdout unavailable")))?;

        info!(pid = ?child.id(), command, "Log reader started");
        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            max_record,
        })
    }
}

#[async_trait]
impl RecordSource for CommandSource {
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>, WorkerError> {
        let mut len = [0u8; 4];
        match self.stdout.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let status = self.child.wait().await.map_err(WorkerError::Source)?;
                debug!(status = %status, "Log reader finished");
                return if status.success() {
                    Ok(None)
                } else {
                    Err(WorkerError::SourceExited(status.to_string()))
                };
            }
            Err(e) => return Err(WorkerError::Source(e)),
        }

        let len = u32::from_be_bytes(len) as usize;
        if len > self.max_record {
            return Err(WorkerError::RecordTooLarge {
                size: len,
                max: self.max_record,
            });
        }

        let mut record = vec![0u8; len];
        self.stdout
            .read_exact(&mut record)
            .await
            .map_err(WorkerError::Source)?;
        Ok(Some(record))
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Counters reported when the pipeline stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub records: u64,
    pub batches: u64,
}

/// How the pipeline ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    SourceExhausted(PipelineStats),
    PeerClosed,
}

/// Streams records from `source` to the client on `stream`.
pub async fn run_pipeline<S: RecordSource>(
    source: S,
    stream: TcpStream,
    settings: &WorkerSettings,
    version: u16,
) -> Result<PipelineEnd, WorkerError> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(settings.record_queue_size.max(1));

    let mut producer = tokio::spawn(produce(source, tx));
    let mut sender = tokio::spawn(send(rx, writer, settings.clone(), version));

    tokio::select! {
        sent = &mut sender => {
            let stats = sent.map_err(WorkerError::task)??;
            let produced = producer.await.map_err(WorkerError::task)??;
            debug!(produced, "Producer finished");
            info!(records = stats.records, batches = stats.batches, "Source exhausted");
            Ok(PipelineEnd::SourceExhausted(stats))
        }
        produced = &mut producer => {
            // a failed source aborts without draining
            let produced = produced.map_err(WorkerError::task)??;
            let stats = sender.await.map_err(WorkerError::task)??;
            debug!(produced, "Producer finished");
            info!(records = stats.records, batches = stats.batches, "Source exhausted");
            Ok(PipelineEnd::SourceExhausted(stats))
        }
        _ = watch_peer(reader) => {
            info!("Client closed the connection");
            producer.abort();
            sender.abort();
            Ok(PipelineEnd::PeerClosed)
        }
    }
}

async fn produce<S: RecordSource>(mut source: S, tx: mpsc::Sender<Vec<u8>>) -> Result<u64, WorkerError> {
    let mut count = 0u64;
    while let Some(record) = source.next_record().await? {
        if tx.send(record).await.is_err() {
            break;
        }
        count += 1;
    }
    Ok(count)
}

async fn send(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: OwnedWriteHalf,
    settings: WorkerSettings,
    version: u16,
) -> Result<PipelineStats, WorkerError> {
    let codec = FrameCodec::new(settings.max_packet_bytes);
    let limit = settings.max_packet_bytes as usize;
    let send_timeout = Duration::from_micros(settings.send_timeout_us);
    let mut stats = PipelineStats::default();
    let mut carry: Option<Vec<u8>> = None;

    loop {
        let first = match carry.take() {
            Some(record) => record,
            None => match rx.recv().await {
                Some(record) => record,
                None => break,
            },
        };

        let mut batch = DataBatch::new(vec![first]);
        if batch.encoded_len() > limit {
            return Err(WorkerError::RecordTooLarge {
                size: batch.encoded_len(),
                max: limit,
            });
        }

        while batch.records.len() < settings.send_batch_size {
            let Ok(record) = rx.try_recv() else {
                break;
            };
            if batch.encoded_len() + 4 + record.len() > limit {
                carry = Some(record);
                break;
            }
            batch.records.push(record);
        }

        stats.records += batch.records.len() as u64;
        stats.batches += 1;
        if settings.verbose_packet {
            trace!(records = batch.records.len(), bytes = batch.encoded_len(), "Batch ready");
        }
        if settings.readonly {
            continue;
        }

        let bytes = codec.encode(&Message::Data(batch).to_frame(version))?;
        timeout(send_timeout, writer.write_all(&bytes))
            .await
            .map_err(|_| WorkerError::SendTimeout)?
            .map_err(WorkerError::Send)?;
    }

    Ok(stats)
}

/// Resolves once the client closes its side or the socket fails.
async fn watch_peer(mut reader: OwnedReadHalf) {
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => trace!(bytes = n, "Ignoring client bytes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logproxy_protocol::{FrameHeader, MessageType, HEADER_LEN};
    use std::collections::VecDeque;
    use tokio::net::TcpListener;

    struct VecSource(VecDeque<Vec<u8>>);

    #[async_trait]
    impl RecordSource for VecSource {
        async fn next_record(&mut self) -> Result<Option<Vec<u8>>, WorkerError> {
            Ok(self.0.pop_front())
        }
    }

    struct EndlessSource;

    #[async_trait]
    impl RecordSource for EndlessSource {
        async fn next_record(&mut self) -> Result<Option<Vec<u8>>, WorkerError> {
            std::future::pending::<()>().await;
            Ok(None)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl RecordSource for FailingSource {
        async fn next_record(&mut self) -> Result<Option<Vec<u8>>, WorkerError> {
            Err(WorkerError::SourceExited("exit status: 3".to_string()))
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            reader_command: None,
            record_queue_size: 16,
            send_batch_size: 2,
            send_timeout_us: 1_000_000,
            max_packet_bytes: 1024,
            readonly: false,
            verbose: false,
            verbose_packet: true,
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    async fn read_batch(client: &mut TcpStream) -> Option<(FrameHeader, DataBatch)> {
        let mut header = [0u8; HEADER_LEN];
        if client.read_exact(&mut header).await.is_err() {
            return None;
        }
        let codec = FrameCodec::new(1024);
        let header = codec.decode_header(&header).unwrap();
        let mut payload = vec![0u8; header.size as usize];
        client.read_exact(&mut payload).await.unwrap();
        let frame = logproxy_protocol::Frame::new(header.msg_type, header.version, payload);
        match Message::from_frame(&frame).unwrap() {
            Message::Data(batch) => Some((header, batch)),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_records_are_batched() {
        let (server, mut client) = pair().await;
        let records: VecDeque<Vec<u8>> = (0..5).map(|i| format!("r{i}").into_bytes()).collect();

        let end = run_pipeline(VecSource(records), server, &settings(), 1).await.unwrap();
        assert_eq!(
            end,
            PipelineEnd::SourceExhausted(PipelineStats { records: 5, batches: 3 })
        );

        let mut received = Vec::new();
        while let Some((header, batch)) = read_batch(&mut client).await {
            assert_eq!(header.msg_type, MessageType::Data);
            assert_eq!(header.version, 1);
            assert!(batch.records.len() <= 2);
            received.extend(batch.records);
        }
        assert_eq!(received.len(), 5);
        assert_eq!(received[4], b"r4".to_vec());
    }

    #[tokio::test]
    async fn test_batches_respect_packet_limit() {
        let (server, mut client) = pair().await;
        let mut settings = settings();
        settings.send_batch_size = 100;
        settings.max_packet_bytes = 64;
        let records: VecDeque<Vec<u8>> = (0..4).map(|_| vec![7u8; 20]).collect();

        run_pipeline(VecSource(records), server, &settings, 2).await.unwrap();

        let mut frames = 0;
        while let Some((header, _)) = read_batch(&mut client).await {
            assert!(header.size <= 64);
            frames += 1;
        }
        assert!(frames >= 2);
    }

    #[tokio::test]
    async fn test_oversized_record_fails() {
        let (server, _client) = pair().await;
        let records = VecDeque::from(vec![vec![0u8; 2048]]);
        let err = run_pipeline(VecSource(records), server, &settings(), 2).await.unwrap_err();
        assert!(matches!(err, WorkerError::RecordTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_readonly_sends_nothing() {
        let (server, mut client) = pair().await;
        let mut settings = settings();
        settings.readonly = true;
        let records = VecDeque::from(vec![b"a".to_vec(), b"b".to_vec()]);

        let end = run_pipeline(VecSource(records), server, &settings, 2).await.unwrap();
        assert!(matches!(end, PipelineEnd::SourceExhausted(PipelineStats { records: 2, .. })));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_stops_pipeline() {
        let (server, client) = pair().await;
        drop(client);
        let end = run_pipeline(EndlessSource, server, &settings(), 2).await.unwrap();
        assert_eq!(end, PipelineEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_source_failure_is_reported() {
        let (server, _client) = pair().await;
        let err = run_pipeline(FailingSource, server, &settings(), 2).await.unwrap_err();
        assert!(matches!(err, WorkerError::SourceExited(_)));
    }

    #[tokio::test]
    async fn test_command_source_reads_framed_records() {
        let mut source = CommandSource::start(
            r"cat >/dev/null; printf '\000\000\000\002hi\000\000\000\000'",
            "cluster_user=u",
            1024,
        )
        .await
        .unwrap();

        assert_eq!(source.next_record().await.unwrap(), Some(b"hi".to_vec()));
        assert_eq!(source.next_record().await.unwrap(), Some(Vec::new()));
        assert_eq!(source.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_command_source_streams_while_config_is_written() {
        // both pipes overflow unless stdout is drained during the write
        let config = "x".repeat(256 * 1024);
        let mut source = CommandSource::start(
            r"printf '\000\003\015\100'; head -c 200000 /dev/zero; cat >/dev/null",
            &config,
            262_144,
        )
        .await
        .unwrap();

        let record = timeout(Duration::from_secs(10), source.next_record())
            .await
            .expect("reader stalled")
            .unwrap()
            .unwrap();
        assert_eq!(record.len(), 200_000);
        let end = timeout(Duration::from_secs(10), source.next_record())
            .await
            .expect("reader stalled")
            .unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_command_source_failure() {
        let mut source = CommandSource::start("cat >/dev/null; exit 3", "", 1024).await.unwrap();
        assert!(matches!(
            source.next_record().await,
            Err(WorkerError::SourceExited(_))
        ));
    }
}
