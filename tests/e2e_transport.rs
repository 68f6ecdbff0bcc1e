//! End-to-end transport tests.
//!
//! These tests run a bound daemon on real sockets and drive it with an
//! initiator that owns its own session cache, the way a separate process
//! would.

use std::sync::Arc;
use std::time::Duration;

use secman::auth::{AuthRegistry, ClaimToBe};
use secman::config::{Permission, SecurityConfig};
use secman::error::ErrorStack;
use secman::protocol::{
    AcceptOutcome, CommandAcceptor, CommandInitiator, CommandRequest, RequirementLevel,
};
use secman::server::{CommandTable, Daemon, EchoHandler};
use secman::session::SessionService;
use secman::transport::{DatagramPacket, WireMessage, MAX_DATAGRAM_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// Find an available port for testing
async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Started daemon and what the tests need to reach it
struct Running {
    addr: String,
    admin: String,
    sessions: Arc<SessionService>,
}

async fn start_daemon() -> Running {
    let port = find_available_port().await;
    let addr = format!("127.0.0.1:{port}");

    let mut config = SecurityConfig::default();
    config.default.authentication = RequirementLevel::Required;
    config.default.encryption = RequirementLevel::Required;
    config.server.tcp_addr = addr.clone();
    config.server.udp_addr = Some(addr.clone());
    config.server.admin_addr = Some("127.0.0.1:0".into());

    let mut commands = CommandTable::new();
    commands.register(421, "QUERY", Permission::Read, Arc::new(EchoHandler));

    let bound = Daemon::new(Arc::new(config), commands)
        .bind()
        .await
        .unwrap();
    let running = Running {
        addr,
        admin: bound.admin_addr().unwrap().to_string(),
        sessions: bound.daemon().sessions().clone(),
    };
    tokio::spawn(async move {
        let _ = bound.serve().await;
    });
    running
}

fn client() -> CommandInitiator {
    let mut auth = AuthRegistry::new();
    auth.register(Arc::new(ClaimToBe::new("alice")));
    CommandInitiator::new(
        Arc::new(SecurityConfig::default()),
        Arc::new(SessionService::new()),
    )
    .with_auth(Arc::new(auth))
}

#[tokio::test]
async fn test_tcp_command_negotiates_then_resumes() {
    let daemon = start_daemon().await;
    let initiator = client();
    let request = CommandRequest::new(daemon.addr.clone(), 421);

    let payloads: [&[u8]; 2] = [b"first", b"second"];
    for (round, payload) in payloads.into_iter().enumerate() {
        let mut errors = ErrorStack::new();
        let (mut channel, outcome) = timeout(
            Duration::from_secs(5),
            initiator.connect(&request, &mut errors),
        )
        .await
        .expect("connect timed out")
        .expect("command failed");
        assert_eq!(outcome.resumed, round > 0);
        assert!(channel.is_encrypted());

        channel.send(&WireMessage::data(payload)).await.unwrap();
        let reply = channel.recv().await.unwrap().into_data().unwrap();
        assert_eq!(reply, payload);
        channel.close().await.unwrap();
    }

    let cached = initiator.sessions().summaries().await;
    assert_eq!(cached.len(), 1);
    let served = daemon.sessions.summaries().await;
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].id, cached[0].id);
    assert_eq!(served[0].user.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_udp_notice_reaches_return_address() {
    let daemon = start_daemon().await;
    let initiator = client();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let return_addr = socket.local_addr().unwrap().to_string();
    let request = CommandRequest::new(daemon.addr.clone(), 421).with_return_address(return_addr);

    let mut errors = ErrorStack::new();
    let datagram = timeout(
        Duration::from_secs(5),
        initiator.start_datagram(&request, &mut errors),
    )
    .await
    .expect("bootstrap timed out")
    .expect("bootstrap failed");
    assert!(datagram.bootstrapped());
    let session_id = datagram.session_id().unwrap().to_string();
    assert!(daemon.sessions.contains(&session_id).await);

    // drop the daemon's copy, then send on the stale session
    assert!(daemon.sessions.invalidate_key(&session_id).await);
    let bytes = datagram.finish().unwrap().to_bytes().unwrap();
    socket.send_to(&bytes, daemon.addr.as_str()).await.unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no notice arrived")
        .unwrap();
    let notice = DatagramPacket::from_bytes(&buf[..len]).unwrap();

    let local = CommandAcceptor::new(
        Arc::new(SecurityConfig::default()),
        initiator.sessions().clone(),
        Arc::new(CommandTable::new()),
    );
    let outcome = local
        .accept_datagram(&notice, &daemon.addr, &mut errors)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AcceptOutcome::Invalidated {
            session_id: Some(session_id),
            removed: true,
        }
    );
    assert!(initiator.sessions().is_empty().await);
}

#[tokio::test]
async fn test_stream_resume_of_lost_session_notifies_return_address() {
    let daemon = start_daemon().await;
    let initiator = client();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let return_addr = socket.local_addr().unwrap().to_string();
    let request = CommandRequest::new(daemon.addr.clone(), 421).with_return_address(return_addr);

    let mut errors = ErrorStack::new();
    let (mut channel, outcome) = initiator.connect(&request, &mut errors).await.unwrap();
    channel.send(&WireMessage::data(b"first")).await.unwrap();
    channel.recv().await.unwrap();
    channel.close().await.unwrap();
    let session_id = outcome.session_id.unwrap();

    // the daemon restarts its cache; our resume is now stale
    assert_eq!(daemon.sessions.invalidate_all().await, 1);
    let (mut channel, outcome) = timeout(
        Duration::from_secs(5),
        initiator.connect(&request, &mut errors),
    )
    .await
    .expect("connect timed out")
    .unwrap();
    assert!(outcome.resumed);
    let err = timeout(Duration::from_secs(5), channel.recv())
        .await
        .expect("no reply to the resume")
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");
    assert!(initiator.sessions().is_empty().await);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no notice arrived")
        .unwrap();
    let notice = DatagramPacket::from_bytes(&buf[..len]).unwrap();
    let local = CommandAcceptor::new(
        Arc::new(SecurityConfig::default()),
        Arc::new(SessionService::new()),
        Arc::new(CommandTable::new()),
    );
    let outcome = local
        .accept_datagram(&notice, &daemon.addr, &mut errors)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AcceptOutcome::Invalidated {
            session_id: Some(session_id),
            removed: false,
        }
    );

    // the next command negotiates afresh
    let (_, outcome) = initiator.connect(&request, &mut errors).await.unwrap();
    assert!(!outcome.resumed);
    assert!(outcome.session_id.is_some());
}

#[tokio::test]
async fn test_admin_health_over_http() {
    let daemon = start_daemon().await;

    let mut stream = TcpStream::connect(&daemon.admin).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("admin request timed out")
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sessions"], 0);
}

#[tokio::test]
async fn test_connect_refused_is_transport_failure() {
    let port = find_available_port().await;
    let initiator = client();

    let mut errors = ErrorStack::new();
    let err = initiator
        .connect(
            &CommandRequest::new(format!("127.0.0.1:{port}"), 421),
            &mut errors,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSPORT_FAILURE");
    assert!(errors.has_code("TRANSPORT_FAILURE"));
}
