use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use coh_core::{ExecAction, HttpGetAction, PortRef, ProbeHandler, ProbeSpec, TcpSocketAction};
use coh_probe::{ExecRunner, HealthVerdict, Member, Prober, StatusHaProber};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn member(port: u16) -> Member {
    Member {
        name: "storage-0".into(),
        namespace: "ns".into(),
        ip: Some("127.0.0.1".into()),
        ready: true,
        ports: BTreeMap::from([("health".to_string(), port as i32)]),
    }
}

fn http_probe(timeout: i32) -> ProbeSpec {
    ProbeSpec {
        handler: ProbeHandler::HttpGet(HttpGetAction {
            path: "/ha".into(),
            port: PortRef::Name("health".into()),
            host: None,
            scheme: None,
            headers: BTreeMap::new(),
        }),
        timeout_seconds: Some(timeout),
    }
}

/// Serve one canned HTTP response per connection.
async fn serve(status: &'static str, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = sock.write_all(resp.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    port
}

#[tokio::test]
async fn http_2xx_is_safe() {
    let port = serve("200 OK", "{}").await;
    let v = StatusHaProber::new("coherence").probe(&member(port), &http_probe(5)).await;
    assert_eq!(v, HealthVerdict::Safe);
}

#[tokio::test]
async fn http_non_2xx_reports_endangered_services() {
    let port = serve("400 Bad Request", r#"{"endangered":["PartitionedCache"]}"#).await;
    let v = StatusHaProber::new("coherence").probe(&member(port), &http_probe(5)).await;
    assert_eq!(v, HealthVerdict::Unsafe { endangered: vec!["PartitionedCache".into()] });
}

#[tokio::test]
async fn http_silence_times_out_as_unknown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });
    let v = StatusHaProber::new("coherence").probe(&member(port), &http_probe(1)).await;
    assert!(matches!(v, HealthVerdict::Unknown(_)), "{v:?}");
}

#[tokio::test]
async fn tcp_connect_and_refusal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let tcp = |port: u16| ProbeSpec {
        handler: ProbeHandler::TcpSocket(TcpSocketAction { port: PortRef::Number(port as i32), host: None }),
        timeout_seconds: Some(2),
    };
    let prober = StatusHaProber::new("coherence");
    assert_eq!(prober.probe(&member(open), &tcp(open)).await, HealthVerdict::Safe);

    let closed = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    assert_eq!(prober.probe(&member(closed), &tcp(closed)).await, HealthVerdict::Unsafe { endangered: vec![] });
}

struct ExitWith(Result<i32, String>);

#[async_trait]
impl ExecRunner for ExitWith {
    async fn exec(&self, _m: &Member, container: &str, command: &[String]) -> Result<i32, String> {
        assert_eq!(container, "coherence");
        assert_eq!(command, ["check"]);
        self.0.clone()
    }
}

#[tokio::test]
async fn exec_maps_exit_codes() {
    let probe = ProbeSpec { handler: ProbeHandler::Exec(ExecAction { command: vec!["check".into()] }), timeout_seconds: None };
    let m = member(1);
    let ok = StatusHaProber::new("coherence").with_exec(Arc::new(ExitWith(Ok(0))));
    assert_eq!(ok.probe(&m, &probe).await, HealthVerdict::Safe);
    let bad = StatusHaProber::new("coherence").with_exec(Arc::new(ExitWith(Ok(2))));
    assert_eq!(bad.probe(&m, &probe).await, HealthVerdict::Unsafe { endangered: vec![] });
    let broken = StatusHaProber::new("coherence").with_exec(Arc::new(ExitWith(Err("no pod".into()))));
    assert!(matches!(broken.probe(&m, &probe).await, HealthVerdict::Unknown(_)));
    assert!(matches!(StatusHaProber::new("coherence").probe(&m, &probe).await, HealthVerdict::Unknown(_)));
}
