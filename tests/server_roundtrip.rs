// tests/server_roundtrip.rs

mod common;
use crate::common::fake_worker::{read_queue, send_lines, send_records};
use crate::common::recorder::Recorder;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;

use tokio::sync::mpsc;

use qa::errors::QaError;
use qa::protocol::{Record, Status, TestFilter, TestFinish};
use qa::server::{NO_LONGER_RUNNING, ServerAddress, Server};

type TestResult = Result<(), Box<dyn Error>>;

fn passing(filter: &str) -> Record {
    Record::from(&TestFinish::new(format!("test {filter}"), TestFilter::new(filter), Status::Pass))
}

#[tokio::test]
async fn test_sink_streams_worker_records_into_visitor() -> TestResult {
    init_tracing();
    let server = Server::bind_loopback().await?;
    let recorder = Recorder::new();

    let (address, completion) = server.decode(recorder.boxed()).await?;
    assert_eq!(address.addr, server.local_addr());

    send_records(&address, &[passing("a:1"), passing("a:2")]).await?;
    with_timeout(completion).await??;

    assert_eq!(recorder.finish_labels(), vec!["test a:1", "test a:2"]);
    assert_eq!(recorder.recorded().ends, vec![None]);
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_sinks_are_routed_by_token() -> TestResult {
    init_tracing();
    let server = Server::bind_loopback().await?;
    let first = Recorder::new();
    let second = Recorder::new();

    let (addr_a, done_a) = server.decode(first.boxed()).await?;
    let (addr_b, done_b) = server.decode(second.boxed()).await?;
    assert_ne!(addr_a.token, addr_b.token);

    let for_b = [passing("b:1")];
    let for_a = [passing("a:1"), passing("a:2")];
    let (a, b) = tokio::join!(send_records(&addr_b, &for_b), send_records(&addr_a, &for_a));
    a?;
    b?;
    with_timeout(done_a).await??;
    with_timeout(done_b).await??;

    assert_eq!(first.finish_labels(), vec!["test a:1", "test a:2"]);
    assert_eq!(second.finish_labels(), vec!["test b:1"]);
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_exposed_queue_delivers_lines_until_closed() -> TestResult {
    init_tracing();
    let server = Server::bind_loopback().await?;
    let (tx, rx) = mpsc::channel(4);
    let (address, completion) = server.expose(rx).await?;

    tx.send(r#"{"workerEnvs":[]}"#.to_string()).await?;
    tx.send(r#"[{},["--seed","1"]]"#.to_string()).await?;

    let reader = tokio::spawn({
        let address = address.clone();
        async move { read_queue(&address).await }
    });
    tx.send("third".to_string()).await?;
    drop(tx);

    let lines = with_timeout(reader).await??;
    assert_eq!(lines, vec![r#"{"workerEnvs":[]}"#, r#"[{},["--seed","1"]]"#, "third"]);
    with_timeout(completion).await??;
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_malformed_worker_output_fails_the_sink() -> TestResult {
    init_tracing();
    let server = Server::bind_loopback().await?;
    let recorder = Recorder::new();
    let (address, completion) = server.decode(recorder.boxed()).await?;

    let _ = send_lines(&address, &["not json".to_string()]).await;
    let result = with_timeout(completion).await?;

    assert!(matches!(result, Err(QaError::Protocol(_))));
    assert_eq!(recorder.recorded().ends.len(), 1);
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_close_ends_pending_visitors() -> TestResult {
    init_tracing();
    let server = Server::bind_loopback().await?;
    let recorder = Recorder::new();
    let (_address, completion) = server.decode(recorder.boxed()).await?;

    server.close().await;

    match with_timeout(completion).await? {
        Err(QaError::ServerClosed(msg)) => assert_eq!(msg, NO_LONGER_RUNNING),
        other => panic!("Expected ServerClosed, got: {:?}", other),
    }
    let ends = recorder.recorded().ends;
    assert_eq!(ends.len(), 1);
    assert!(ends[0].as_deref().unwrap().contains(NO_LONGER_RUNNING));

    assert!(matches!(
        server.decode(Recorder::new().boxed()).await,
        Err(QaError::ServerNotRunning)
    ));
    Ok(())
}

#[tokio::test]
async fn test_unknown_token_leaves_registrations_untouched() -> TestResult {
    init_tracing();
    let server = Server::bind_loopback().await?;
    let recorder = Recorder::new();
    let (address, completion) = server.decode(recorder.boxed()).await?;

    let stranger = ServerAddress {
        token: "0000000000000000".to_string(),
        addr: address.addr,
    };
    // The server hangs up on strangers; the write may or may not observe it.
    let _ = send_records(&stranger, &[passing("x:1")]).await;

    send_records(&address, &[passing("a:1")]).await?;
    with_timeout(completion).await??;
    assert_eq!(recorder.finish_labels(), vec!["test a:1"]);
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_retires_unclaimed_sink() -> TestResult {
    init_tracing();
    let server = Server::bind_loopback().await?;
    let recorder = Recorder::new();
    let (address, completion) = server.decode(recorder.boxed()).await?;

    server.cancel(&address)?;

    assert!(matches!(with_timeout(completion).await?, Err(QaError::Transport(_))));
    assert_eq!(recorder.recorded().ends.len(), 1);
    server.close().await;
    Ok(())
}
