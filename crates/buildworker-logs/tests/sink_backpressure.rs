use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use buildworker_core::{BackoffPolicy, LogWriter, LogWriterErrorKind};
use buildworker_logs::{
    LogPart, LogPartTransport, LogSink, LogSinkConfig, SinkLogWriter, TransportError,
    TransportErrorKind,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Transport {
    parts: Mutex<Vec<LogPart>>,
    down: AtomicBool,
}

#[async_trait]
impl LogPartTransport for Transport {
    async fn publish(&self, parts: &[LogPart]) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportErrorKind::UnexpectedStatus { status: 503 }.into());
        }
        self.parts.lock().extend_from_slice(parts);
        Ok(())
    }
}

fn sink(transport: Arc<Transport>, max: usize, shutdown: &CancellationToken) -> LogSink {
    let config = LogSinkConfig {
        max_buffer_size: max,
        flush_interval: Duration::from_secs(3600),
        retry: BackoffPolicy {
            first: Duration::from_millis(1),
            max: Duration::from_millis(2),
            factor: 1.0,
            max_elapsed: Some(Duration::from_millis(5)),
        },
    };
    LogSink::spawn(transport, config, shutdown.clone())
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_writers_share_sink_and_parts_arrive_in_order() {
    let transport = Arc::new(Transport::default());
    let shutdown = CancellationToken::new();
    let sink = sink(transport.clone(), 10, &shutdown);

    let a = SinkLogWriter::new(sink.clone(), 1, "tok-a", Duration::from_secs(60));
    let b = SinkLogWriter::new(sink.clone(), 2, "tok-b", Duration::from_secs(60));
    for _ in 0..4 {
        a.write(b"a").await.unwrap();
        b.write(b"b").await.unwrap();
    }
    a.close().await.unwrap();
    b.close().await.unwrap();

    assert!(eventually(|| sink.is_empty()).await);
    let parts = transport.parts.lock().clone();
    assert_eq!(parts.len(), 10);
    for job_id in [1, 2] {
        let numbers: Vec<u64> = parts
            .iter()
            .filter(|p| p.job_id == job_id)
            .map(|p| p.number)
            .collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_dead_transport_fails_writes_once_sink_is_full() {
    let transport = Arc::new(Transport::default());
    transport.down.store(true, Ordering::SeqCst);
    let shutdown = CancellationToken::new();
    let sink = sink(transport.clone(), 5, &shutdown);
    let writer = SinkLogWriter::new(sink.clone(), 9, "tok", Duration::from_secs(60));

    let mut failure = None;
    for _ in 0..20 {
        if let Err(err) = writer.write(b"line\n").await {
            failure = Some(err);
            break;
        }
    }
    let err = failure.expect("writes should fail once the sink is full");
    assert!(matches!(err.kind(), LogWriterErrorKind::SinkFull { max: 5 }));

    transport.down.store(false, Ordering::SeqCst);
    sink.flush().await.unwrap();
    assert!(sink.is_empty());
    assert_eq!(transport.parts.lock().len(), 5);
    shutdown.cancel();
}
