use ping_service::pb::PingRequest;
use ping_service::{TestServiceClient, TestServiceServer};
use ping_service_impl::PingServiceImpl;
use splice_core::{CallContext, ContentSubtype, ProxyServer, Route, RouteDecision};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request};


type InMemoryBackend = TestServiceServer<PingServiceImpl>;

/// A client calling, in memory, a proxy in front of an in-memory backend.
fn in_memory(
    service: PingServiceImpl,
) -> TestServiceClient<ContentSubtype<ProxyServer<impl splice_core::Director>>> {
    let backend = TestServiceServer::new(service);
    let director = move |ctx: &CallContext, _: &str| -> RouteDecision<InMemoryBackend> {
        Ok(Route::new(ctx.outgoing(), backend.clone()))
    };

    TestServiceClient::new(ContentSubtype::proxy(ProxyServer::builder(director).build()))
}

fn ping(value: &str, sleep_time_ms: i32) -> PingRequest {
    PingRequest {
        value: value.to_string(),
        sleep_time_ms,
    }
}

#[tokio::test]
async fn test_caller_cancellation_tears_down_the_backend_call() {
    let service = PingServiceImpl::default();
    let mut client = in_memory(service.clone());

    let (tx, rx) = mpsc::channel(1);
    let mut stream = client
        .ping_stream(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    tx.send(ping("first", 0)).await.unwrap();
    assert_eq!(stream.message().await.unwrap().unwrap().counter, 0);

    // The caller goes away while its request stream is still open.
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), service.stream_broken.notified())
        .await
        .expect("the backend call must be torn down");
    drop(tx);
}

#[tokio::test]
async fn test_caller_deadline_is_enforced() {
    let service = PingServiceImpl::default();
    let mut client = in_memory(service.clone());

    let mut request = Request::new(ping("slow", 2_000));
    request.set_timeout(Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let status = client.ping(request).await.unwrap_err();

    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_deadline_expiring_mid_stream_resets_the_backend() {
    let service = PingServiceImpl::default();
    let mut client = in_memory(service.clone());

    let (tx, rx) = mpsc::channel(4);
    let mut request = Request::new(ReceiverStream::new(rx));
    request.set_timeout(Duration::from_millis(300));

    let mut stream = client.ping_stream(request).await.unwrap().into_inner();

    tx.send(ping("fast", 0)).await.unwrap();
    assert_eq!(stream.message().await.unwrap().unwrap().value, "fast");

    tx.send(ping("slow", 1_000)).await.unwrap();
    let status = stream.message().await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);

    tokio::time::timeout(Duration::from_secs(5), service.stream_broken.notified())
        .await
        .expect("the backend call must be torn down");
}
