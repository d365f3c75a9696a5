use hec_client::{ClientError, Event, HecClient, HecConfig, WaitStrategy};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INGEST_PATH: &str = "/services/collector/event";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn shutdown_drains_queued_records_within_the_deadline() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = HecConfig {
        url: format!("{}{}", server.uri(), INGEST_PATH),
        flush_time: Duration::from_secs(60),
        ..HecConfig::default()
    };
    let client = HecClient::new(config).unwrap();
    client.push_event(Event::new("drain me")).unwrap();
    client.push_event(Event::new("me too")).unwrap();

    let summary = client.shutdown(Some(Duration::from_secs(5))).await;
    assert!(summary.drained);
    assert_eq!(summary.cancelled_flushes, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(client.flush_stats().sent_messages, 2);
}

#[tokio::test]
async fn shutdown_cancels_a_flush_stuck_in_retries() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = HecConfig {
        url: format!("{}{}", server.uri(), INGEST_PATH),
        flush_time: Duration::from_secs(60),
        max_retries: 100,
        // Long waits between retries, so the flush is mid-sleep when the
        // shutdown deadline hits.
        retry_wait_time: WaitStrategy::Constant(Duration::from_secs(60)),
        ..HecConfig::default()
    };
    let client = HecClient::new(config).unwrap();
    client.push_event(Event::new("stuck")).unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.flush().await })
    };
    // Give the flush time to fail its first attempt and start sleeping.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.in_flight_flushes(), 1);

    let summary = client.shutdown(Some(Duration::ZERO)).await;
    assert!(!summary.drained);
    assert_eq!(summary.cancelled_flushes, 1);

    // The completion signal fires with the cancellation sentinel and the
    // flush has left the active set.
    let outcome = waiter.await.unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
    assert_eq!(client.in_flight_flushes(), 0);
    assert_eq!(client.flush_stats().sent_messages, 0);
}

#[tokio::test]
async fn push_after_shutdown_fails_synchronously() {
    init_tracing();
    let server = MockServer::start().await;
    let config = HecConfig {
        url: format!("{}{}", server.uri(), INGEST_PATH),
        ..HecConfig::default()
    };
    let client = HecClient::new(config).unwrap();
    client.shutdown(None).await;

    let error = client.push_event(Event::new("too late")).unwrap_err();
    assert!(matches!(error, ClientError::Shutdown));
    assert!(!client.is_active());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    init_tracing();
    let server = MockServer::start().await;
    let config = HecConfig {
        url: format!("{}{}", server.uri(), INGEST_PATH),
        ..HecConfig::default()
    };
    let client = HecClient::new(config).unwrap();

    let first = client.shutdown(Some(Duration::from_millis(50))).await;
    let second = client.shutdown(Some(Duration::from_millis(50))).await;
    assert!(first.drained);
    assert!(second.drained);
    assert_eq!(second.cancelled_flushes, 0);
}

#[tokio::test]
async fn shutdown_without_deadline_cancels_immediately() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = HecConfig {
        url: format!("{}{}", server.uri(), INGEST_PATH),
        flush_time: Duration::from_secs(60),
        max_retries: 100,
        retry_wait_time: WaitStrategy::Constant(Duration::from_secs(60)),
        ..HecConfig::default()
    };
    let client = HecClient::new(config).unwrap();
    client.push_event(Event::new("abandoned")).unwrap();
    let flusher = {
        let client = client.clone();
        tokio::spawn(async move { client.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let summary = client.shutdown(None).await;
    assert_eq!(summary.cancelled_flushes, 1);
    assert!(flusher.await.unwrap().unwrap_err().is_cancelled());
}
