//! Network placer against a loopback far end built on the same SIP transport

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rvoip_ip_trace::prelude::*;
use rvoip_load_tester::uac::{media_target, session_description};
use rvoip_load_tester::{DriverSettings, DriverStats, LoadDriver, NetworkSettings, SipPlacer};
use rvoip_sip_core::builder::SimpleResponseBuilder;
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Message, Method, Request, StatusCode};
use rvoip_sip_transport::{Transport, TransportEvent, UdpTransport};

struct Loopback;

#[async_trait]
impl AddressResolver for Loopback {
    async fn lookup(&self, _host: &str) -> rvoip_ip_trace::Result<Vec<IpAddr>> {
        Ok(vec!["127.0.0.1".parse().unwrap()])
    }
}

/// What the far end saw during one call.
#[derive(Debug, Default)]
struct FarEndLog {
    methods: Vec<Method>,
    rtp_received: usize,
}

struct FarEnd {
    addr: SocketAddr,
    task: JoinHandle<FarEndLog>,
}

/// Answers one INVITE with 100 and `status`, streaming a few RTP packets
/// toward the offer when it answers.
async fn far_end(status: u16) -> FarEnd {
    let (transport, events) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
    let addr = transport.local_addr().unwrap();
    let task = tokio::spawn(serve(transport, events, status));
    FarEnd { addr, task }
}

async fn serve(transport: UdpTransport, mut events: mpsc::Receiver<TransportEvent>, status: u16) -> FarEndLog {
    let media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let media_port = media.local_addr().unwrap().port();
    let mut log = FarEndLog::default();

    while let Some(event) = events.recv().await {
        let TransportEvent::MessageReceived { message: Message::Request(request), source, .. } = event else {
            continue;
        };
        let method = request.method();
        log.methods.push(method.clone());

        match method {
            Method::Invite => {
                reply(&transport, &request, source, 100, false, media_port).await;
                reply(&transport, &request, source, status, true, media_port).await;
                if status >= 300 {
                    continue;
                }
                let offer = media_target(&String::from_utf8_lossy(request.body())).unwrap();
                for seq in 0..3u8 {
                    let mut packet = vec![0u8; 172];
                    packet[0] = 0x80;
                    packet[3] = seq;
                    media.send_to(&packet, offer).await.unwrap();
                }
            }
            Method::Bye => {
                reply(&transport, &request, source, 200, false, media_port).await;
                break;
            }
            Method::Ack if status >= 300 => break,
            _ => {}
        }
    }

    // Count what the placer streamed at us during the hold
    let mut buf = [0u8; 2048];
    while let Ok(Ok(_)) = tokio::time::timeout(Duration::from_millis(10), media.recv_from(&mut buf)).await {
        log.rtp_received += 1;
    }
    transport.close().await.unwrap();
    log
}

async fn reply(transport: &UdpTransport, request: &Request, source: SocketAddr, status: u16, tagged: bool, media_port: u16) {
    let local = transport.local_addr().unwrap();
    let mut builder = SimpleResponseBuilder::response_from_request(request, StatusCode::from_u16(status).unwrap(), None)
        .header(TypedHeader::Server(vec!["loopback-uas".to_string()]));
    if tagged {
        let to_uri = request.to().unwrap().address().uri().to_string();
        builder = builder.to("", &to_uri, Some("uas-tag"));
    }
    if tagged && status < 300 {
        builder = builder
            .contact(&format!("sip:uas@{}", local), None)
            .content_type("application/sdp")
            .body(session_description(local.ip(), media_port));
    }
    transport
        .send_message(Message::Response(builder.build()), source)
        .await
        .unwrap();
}

fn network_settings(remote_port: u16) -> NetworkSettings {
    NetworkSettings {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        public_ip: None,
        remote_port,
        rtp_port: 0,
        transaction_timeout: Duration::from_secs(2),
        hangup_delay: Duration::from_millis(200),
        username: "loadtest".to_string(),
        user_agent: "rvoip-load-tester/test".to_string(),
    }
}

async fn run_one_call(far: &FarEnd) -> (DriverStats, IngestStats, Vec<CallRecord>) {
    let placer = Arc::new(SipPlacer::bind(network_settings(far.addr.port())).await.unwrap());
    let store = Arc::new(CallRecordStore::new());
    let sink = Arc::new(MemorySink::new());
    let tracker = Arc::new(CallLifecycleTracker::new(store.clone(), sink.clone()).with_resolver(Arc::new(Loopback)));
    let (trace, ingest) = TraceIngestor::new(store.clone()).spawn(64);

    let settings = DriverSettings {
        destination_domain: "loopback.test".to_string(),
        target_uri: "sip:loopback.test".to_string(),
        call_count: 1,
        call_delay: Duration::from_millis(10),
        call_timeout: Duration::from_secs(5),
        cleanup_delay: Duration::from_millis(50),
        settle_timeout: Duration::from_secs(1),
    };
    let driver = LoadDriver::new(settings, tracker, trace, placer.clone());
    let stats = driver.run().await;
    drop(driver);
    placer.close().await.unwrap();

    (stats, ingest.shutdown().await, sink.records())
}

#[tokio::test]
async fn test_answered_call_over_loopback() {
    let far = far_end(200).await;
    let (stats, ingest, records) = run_one_call(&far).await;
    let log = far.task.await.unwrap();

    assert_eq!(stats.answered, 1);
    assert_eq!(stats.rows, 1);
    assert_eq!(log.methods, vec![Method::Invite, Method::Ack, Method::Bye]);
    assert!(log.rtp_received > 0);
    assert_eq!(ingest.failed, 0);
    assert!(ingest.media >= 1);

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.resolved_destination_ip, "127.0.0.1");
    assert_eq!(record.call_status, Some(CallStatus::Success));
    assert!(record.response_code.starts_with("200"));
    assert_eq!(record.server_header, "loopback-uas");
    assert!(record.user_agent.starts_with("rvoip-load-tester/"));
    assert!(record.sdp_media_ips.contains(&"127.0.0.1".to_string()));
    assert_eq!(record.rtp_ips, vec!["127.0.0.1".to_string()]);
}

#[tokio::test]
async fn test_rejected_call_over_loopback() {
    let far = far_end(486).await;
    let (stats, _ingest, records) = run_one_call(&far).await;
    let log = far.task.await.unwrap();

    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.answered, 0);
    assert_eq!(log.methods, vec![Method::Invite, Method::Ack]);
    assert_eq!(log.rtp_received, 0);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].call_status, Some(CallStatus::ClientError));
    assert!(records[0].response_code.starts_with("486"));
    assert!(records[0].rtp_ips.is_empty());
}
