//! Readiness probing against a local HTTP stub.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbox_runtime::{
    HttpLivenessCheck, InvocationCommand, LivenessError, ProcessSupervisor, ReadinessProbe,
    RuntimeError, SupervisedProcess,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve `/alive`, answering 503 for the first `failures` requests.
async fn alive_stub(failures: usize) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; 2048];
            let read = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..read]).to_string();

            let status = if !request.starts_with("GET /alive ") {
                "404 Not Found"
            } else if counter.fetch_add(1, Ordering::SeqCst) < failures {
                "503 Service Unavailable"
            } else {
                "200 OK"
            };
            let response =
                format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), hits)
}

async fn sleeping_process(supervisor: &ProcessSupervisor) -> SupervisedProcess {
    let command = InvocationCommand::from_parts(
        vec!["/bin/sh".into(), "-c".into(), "exec sleep 30".into()],
        [("PATH".to_string(), "/usr/bin:/bin".to_string())].into(),
    )
    .unwrap();
    supervisor.start(&command, None).await.unwrap()
}

#[tokio::test]
async fn succeeds_on_the_first_healthy_answer() {
    let (url, hits) = alive_stub(2).await;
    let supervisor = ProcessSupervisor::new(Duration::from_secs(2), Duration::from_secs(1));
    let mut process = sleeping_process(&supervisor).await;
    let check = HttpLivenessCheck::new(Duration::from_secs(2)).unwrap();

    ReadinessProbe::new(Duration::from_millis(20))
        .wait_until_alive(&mut process, &check, &url, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    supervisor.stop(process).await;
}

#[tokio::test]
async fn unhealthy_server_times_out_with_last_status() {
    let (url, _hits) = alive_stub(usize::MAX).await;
    let supervisor = ProcessSupervisor::new(Duration::from_secs(2), Duration::from_secs(1));
    let mut process = sleeping_process(&supervisor).await;
    let check = HttpLivenessCheck::new(Duration::from_secs(2)).unwrap();

    let started = Instant::now();
    let err = ReadinessProbe::new(Duration::from_millis(50))
        .wait_until_alive(&mut process, &check, &url, Duration::from_millis(500))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(matches!(
        err,
        RuntimeError::Timeout {
            last_error: Some(LivenessError::Status { status: 503, .. }),
            ..
        }
    ));
    supervisor.stop(process).await;
}

#[tokio::test]
async fn trailing_slash_in_base_url_is_tolerated() {
    let (url, _hits) = alive_stub(0).await;
    let supervisor = ProcessSupervisor::default();
    let mut process = sleeping_process(&supervisor).await;
    let check = HttpLivenessCheck::new(Duration::from_secs(2)).unwrap();

    ReadinessProbe::default()
        .wait_until_alive(&mut process, &check, &format!("{url}/"), Duration::from_secs(5))
        .await
        .unwrap();
    supervisor.stop(process).await;
}
