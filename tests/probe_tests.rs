use portsweep::probe::{Probe, TcpConnectProbe};
use portsweep::types::{ProbeOutcome, Target};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn listening_port_is_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let probe = TcpConnectProbe::default();
    let outcome = probe
        .probe(&Target::new("127.0.0.1"), port, Duration::from_millis(500))
        .await;
    assert_eq!(outcome, ProbeOutcome::Open);
}

#[tokio::test]
async fn refused_port_is_closed() {
    let port = closed_port().await;
    let probe = TcpConnectProbe::default();
    let outcome = probe
        .probe(&Target::new("127.0.0.1"), port, Duration::from_millis(500))
        .await;
    assert_eq!(outcome, ProbeOutcome::Closed);
}

#[tokio::test]
async fn unresolvable_host_is_error() {
    let probe = TcpConnectProbe::new(Duration::from_millis(1500));
    let outcome = probe
        .probe(&Target::new("no-such-host.invalid"), 80, Duration::from_millis(50))
        .await;
    assert!(matches!(outcome, ProbeOutcome::Error(_)), "got {outcome:?}");
}

#[tokio::test]
async fn silent_address_returns_within_timeout() {
    // Usually black-holed; some networks answer for any address through a proxy.
    let timeout = Duration::from_millis(50);
    let probe = TcpConnectProbe::default();
    let start = Instant::now();
    let outcome = probe.probe(&Target::new("10.255.255.1"), 81, timeout).await;
    let elapsed = start.elapsed();
    assert!(elapsed < timeout + Duration::from_millis(500), "took {elapsed:?}");
    if elapsed >= timeout {
        assert_eq!(outcome, ProbeOutcome::Closed);
    }
}
