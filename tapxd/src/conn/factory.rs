use super::http;
use bytes::Bytes;
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tapx_core::events::{ConnId, Direction, SocketEvent};
use tapx_core::models::TestCase;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct FactorySettings {
    pub mailbox_capacity: usize,
    pub silence_flush: Duration,
    pub dropped_events_metric: String,
    pub test_cases_metric: String,
}

/// Turn per-socket kernel events into HTTP test cases.
///
/// One worker task and one bounded mailbox per live connection id. The event
/// producer is never blocked: a full mailbox drops the event, counted and
/// logged. Per-connection emission order is strict FIFO; nothing is ordered
/// across connections.
pub async fn run_factory(
    mut events: mpsc::Receiver<SocketEvent>,
    cases: mpsc::Sender<TestCase>,
    settings: FactorySettings,
    token: CancellationToken,
) {
    let mut mailboxes: HashMap<ConnId, mpsc::Sender<(Direction, Bytes)>> = HashMap::new();
    let mut workers = JoinSet::new();
    let names = Arc::new(AtomicU64::new(0));

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            SocketEvent::Open { conn_id } => {
                if mailboxes.contains_key(&conn_id) {
                    warn!(conn_id, "duplicate open event; keeping existing worker");
                    continue;
                }
                let (tx, rx) = mpsc::channel(settings.mailbox_capacity);
                mailboxes.insert(conn_id, tx);
                workers.spawn(worker(
                    conn_id,
                    rx,
                    cases.clone(),
                    settings.clone(),
                    names.clone(),
                ));
            }
            SocketEvent::Data {
                conn_id,
                direction,
                payload,
            } => {
                let Some(mailbox) = mailboxes.get(&conn_id) else {
                    warn!(conn_id, "data event for unknown connection");
                    continue;
                };
                if let Err(err) = mailbox.try_send((direction, payload)) {
                    match err {
                        mpsc::error::TrySendError::Full(_) => {
                            counter!(settings.dropped_events_metric.clone()).increment(1);
                            warn!(conn_id, "worker mailbox full; dropping data event");
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            debug!(conn_id, "worker already gone; dropping data event");
                        }
                    }
                }
            }
            SocketEvent::Close { conn_id } => {
                // Dropping the sender closes the mailbox; the worker drains
                // what is queued, flushes, and exits.
                mailboxes.remove(&conn_id);
            }
        }
    }

    drop(mailboxes);
    while workers.join_next().await.is_some() {}
}

async fn worker(
    conn_id: ConnId,
    mut mailbox: mpsc::Receiver<(Direction, Bytes)>,
    cases: mpsc::Sender<TestCase>,
    settings: FactorySettings,
    names: Arc<AtomicU64>,
) {
    let mut request = Vec::new();
    let mut response = Vec::new();
    let mut last_direction: Option<Direction> = None;

    loop {
        match timeout(settings.silence_flush, mailbox.recv()).await {
            Err(_) => {
                // Quiet line after a response: assume the exchange is done.
                if last_direction == Some(Direction::Egress) {
                    flush(conn_id, &mut request, &mut response, &cases, &settings, &names).await;
                }
                last_direction = None;
            }
            Ok(None) => {
                if last_direction == Some(Direction::Egress) {
                    flush(conn_id, &mut request, &mut response, &cases, &settings, &names).await;
                }
                return;
            }
            Ok(Some((direction, payload))) => {
                if direction == Direction::Ingress && last_direction == Some(Direction::Egress) {
                    flush(conn_id, &mut request, &mut response, &cases, &settings, &names).await;
                }
                match direction {
                    Direction::Ingress => request.extend_from_slice(&payload),
                    Direction::Egress => response.extend_from_slice(&payload),
                }
                last_direction = Some(direction);
            }
        }
    }
}

/// Emit the accumulated pair if it parses, then reset the accumulators.
/// Pairs missing either side are skipped; malformed pairs are logged and
/// dropped without stopping the worker.
async fn flush(
    conn_id: ConnId,
    request: &mut Vec<u8>,
    response: &mut Vec<u8>,
    cases: &mpsc::Sender<TestCase>,
    settings: &FactorySettings,
    names: &AtomicU64,
) {
    if request.is_empty() || response.is_empty() {
        request.clear();
        response.clear();
        return;
    }
    let raw_request = std::mem::take(request);
    let raw_response = std::mem::take(response);

    let parsed_request = match http::parse_request(&raw_request) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(conn_id, error = %err, "failed to parse captured request");
            return;
        }
    };
    let parsed_response = match http::parse_response(&raw_response) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(conn_id, error = %err, "failed to parse captured response");
            return;
        }
    };

    let n = names.fetch_add(1, Ordering::Relaxed);
    let case = TestCase::new(format!("test-{n}"), parsed_request, parsed_response);
    counter!(settings.test_cases_metric.clone()).increment(1);
    debug!(
        conn_id,
        name = %case.name,
        method = %case.request.method,
        status = case.response.status,
        "captured test case"
    );
    if cases.send(case).await.is_err() {
        warn!(conn_id, "test case channel closed; capture lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> FactorySettings {
        FactorySettings {
            mailbox_capacity: 16,
            silence_flush: Duration::from_millis(100),
            dropped_events_metric: "test_factory_dropped".to_string(),
            test_cases_metric: "test_factory_cases".to_string(),
        }
    }

    fn data(conn_id: ConnId, direction: Direction, bytes: &'static [u8]) -> SocketEvent {
        SocketEvent::Data {
            conn_id,
            direction,
            payload: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn emits_pair_on_direction_flip() {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (case_tx, mut case_rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let factory = tokio::spawn(run_factory(event_rx, case_tx, settings(), token.clone()));

        event_tx.send(SocketEvent::Open { conn_id: 42 }).await.unwrap();
        event_tx
            .send(data(42, Direction::Ingress, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"))
            .await
            .unwrap();
        event_tx
            .send(data(
                42,
                Direction::Egress,
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            ))
            .await
            .unwrap();
        event_tx
            .send(data(42, Direction::Ingress, b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n"))
            .await
            .unwrap();

        let case = case_rx.recv().await.expect("test case");
        assert_eq!(case.response.status, 200);
        assert_eq!(case.response.body, b"ok");
        assert_eq!(case.request.method, "GET");
        assert_eq!(case.request.path, "/");

        drop(event_tx);
        factory.await.unwrap();
    }

    #[tokio::test]
    async fn close_flushes_the_pending_pair() {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (case_tx, mut case_rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let factory = tokio::spawn(run_factory(event_rx, case_tx, settings(), token.clone()));

        event_tx.send(SocketEvent::Open { conn_id: 7 }).await.unwrap();
        event_tx
            .send(data(7, Direction::Ingress, b"GET /x HTTP/1.1\r\nHost: y\r\n\r\n"))
            .await
            .unwrap();
        event_tx
            .send(data(
                7,
                Direction::Egress,
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
            ))
            .await
            .unwrap();
        event_tx.send(SocketEvent::Close { conn_id: 7 }).await.unwrap();

        let case = case_rx.recv().await.expect("test case");
        assert_eq!(case.response.status, 404);
        assert_eq!(case.request.path, "/x");

        drop(event_tx);
        factory.await.unwrap();
    }

    #[tokio::test]
    async fn silence_flushes_after_egress() {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (case_tx, mut case_rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let factory = tokio::spawn(run_factory(event_rx, case_tx, settings(), token.clone()));

        event_tx.send(SocketEvent::Open { conn_id: 9 }).await.unwrap();
        event_tx
            .send(data(9, Direction::Ingress, b"GET /s HTTP/1.1\r\nHost: z\r\n\r\n"))
            .await
            .unwrap();
        event_tx
            .send(data(
                9,
                Direction::Egress,
                b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n",
            ))
            .await
            .unwrap();

        // No further events: the silence flush fires.
        let case = tokio::time::timeout(Duration::from_secs(2), case_rx.recv())
            .await
            .expect("flush within silence window")
            .expect("test case");
        assert_eq!(case.response.status, 204);

        drop(event_tx);
        factory.await.unwrap();
    }

    #[tokio::test]
    async fn pair_without_request_is_not_emitted() {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (case_tx, mut case_rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let factory = tokio::spawn(run_factory(event_rx, case_tx, settings(), token.clone()));

        event_tx.send(SocketEvent::Open { conn_id: 3 }).await.unwrap();
        event_tx
            .send(data(
                3,
                Direction::Egress,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            ))
            .await
            .unwrap();
        event_tx.send(SocketEvent::Close { conn_id: 3 }).await.unwrap();
        drop(event_tx);
        factory.await.unwrap();

        assert!(case_rx.recv().await.is_none());
    }
}
