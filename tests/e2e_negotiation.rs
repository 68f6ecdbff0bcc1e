//! End-to-end negotiation tests.
//!
//! A real initiator talks to a real acceptor over an in-memory stream, so
//! every round of policy exchange, authentication and session caching runs
//! exactly as it would over TCP.

use std::sync::Arc;

use secman::auth::{AuthRegistry, ClaimToBe};
use secman::config::{Permission, SecurityConfig};
use secman::crypto::{ChaChaCipher, CipherCapability};
use secman::error::{ErrorStack, Result, SecManError};
use secman::protocol::{
    AcceptOutcome, CommandAcceptor, CommandInitiator, CommandOutcome, CommandRequest,
    RequirementLevel, ReturnCode,
};
use secman::server::{CommandTable, EchoHandler};
use secman::session::SessionService;
use secman::transport::{ReliableChannel, WireMessage};
use tokio::task::JoinHandle;

const ACCEPTOR_ADDR: &str = "127.0.0.1:9618";

fn commands() -> Arc<CommandTable> {
    let mut table = CommandTable::new();
    table
        .register(421, "QUERY", Permission::Read, Arc::new(EchoHandler))
        .register(422, "UPDATE", Permission::Write, Arc::new(EchoHandler));
    Arc::new(table)
}

fn secure_acceptor() -> Arc<CommandAcceptor> {
    let mut config = SecurityConfig::default();
    config.default.authentication = RequirementLevel::Required;
    config.default.encryption = RequirementLevel::Required;
    Arc::new(CommandAcceptor::new(
        Arc::new(config),
        Arc::new(SessionService::new()),
        commands(),
    ))
}

fn initiator_as(name: &str, config: SecurityConfig) -> CommandInitiator {
    let mut auth = AuthRegistry::new();
    auth.register(Arc::new(ClaimToBe::new(name)));
    CommandInitiator::new(Arc::new(config), Arc::new(SessionService::new()))
        .with_auth(Arc::new(auth))
}

fn pair() -> (ReliableChannel, ReliableChannel) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let cipher: Arc<dyn CipherCapability> = Arc::new(ChaChaCipher::new());
    (
        ReliableChannel::new(a, ACCEPTOR_ADDR, cipher.clone()),
        ReliableChannel::new(b, "127.0.0.1:40001", cipher),
    )
}

/// Run one command on the acceptor side in the background
fn serve_one(
    acceptor: Arc<CommandAcceptor>,
    mut channel: ReliableChannel,
) -> JoinHandle<(Result<AcceptOutcome>, ErrorStack)> {
    tokio::spawn(async move {
        let mut errors = ErrorStack::new();
        let outcome = acceptor.accept_stream(&mut channel, &mut errors).await;
        (outcome, errors)
    })
}

/// Start `request`, echo one payload and return both sides' outcomes
async fn echo(
    initiator: &CommandInitiator,
    acceptor: &Arc<CommandAcceptor>,
    request: &CommandRequest,
    payload: &[u8],
) -> (CommandOutcome, AcceptOutcome, bool) {
    let (mut client, server) = pair();
    let server = serve_one(acceptor.clone(), server);

    let mut errors = ErrorStack::new();
    let outcome = initiator
        .start_command(&mut client, request, &mut errors)
        .await
        .unwrap();
    client.send(&WireMessage::data(payload)).await.unwrap();
    let reply = client.recv().await.unwrap().into_data().unwrap();
    assert_eq!(reply, payload);

    let (accepted, server_errors) = server.await.unwrap();
    assert!(server_errors.is_empty(), "acceptor errors: {server_errors}");
    (outcome, accepted.unwrap(), client.is_encrypted())
}

#[tokio::test]
async fn test_authenticated_session_then_resume() {
    let acceptor = secure_acceptor();
    let initiator = initiator_as("alice", SecurityConfig::default());
    let request = CommandRequest::new(ACCEPTOR_ADDR, 421);

    let (first, accepted, encrypted) = echo(&initiator, &acceptor, &request, b"first").await;
    assert!(first.negotiated);
    assert!(!first.resumed);
    assert!(encrypted);
    assert_eq!(first.remote_user.as_deref(), Some("alice"));
    let session_id = first.session_id.clone().unwrap();
    let AcceptOutcome::Completed {
        identity,
        new_session,
        session_id: accepted_id,
        ..
    } = accepted
    else {
        panic!("expected completion, got {accepted:?}");
    };
    assert!(new_session);
    assert_eq!(identity.as_deref(), Some("alice"));
    assert_eq!(accepted_id.as_deref(), Some(session_id.as_str()));
    assert!(acceptor.sessions().contains(&session_id).await);

    let (second, accepted, encrypted) = echo(&initiator, &acceptor, &request, b"second").await;
    assert!(second.resumed);
    assert!(encrypted);
    assert_eq!(second.session_id.as_deref(), Some(session_id.as_str()));
    assert_eq!(second.remote_user.as_deref(), Some("alice"));
    assert_eq!(
        accepted,
        AcceptOutcome::Completed {
            command: 421,
            session_id: Some(session_id),
            identity: Some("alice".into()),
            new_session: false,
        }
    );
    assert_eq!(acceptor.sessions().len().await, 1);
}

#[tokio::test]
async fn test_session_covers_granted_commands_only() {
    let mut config = SecurityConfig::default();
    config.default.authentication = RequirementLevel::Required;
    config
        .authorization
        .insert(Permission::Write, vec!["alice".into()]);
    let acceptor = Arc::new(CommandAcceptor::new(
        Arc::new(config),
        Arc::new(SessionService::new()),
        commands(),
    ));

    // alice holds WRITE, so the session made for 421 also covers 422
    let alice = initiator_as("alice", SecurityConfig::default());
    let read = CommandRequest::new(ACCEPTOR_ADDR, 421);
    let write = CommandRequest::new(ACCEPTOR_ADDR, 422);
    let (first, _, _) = echo(&alice, &acceptor, &read, b"read").await;
    let (second, _, _) = echo(&alice, &acceptor, &write, b"write").await;
    assert!(!first.resumed);
    assert!(second.resumed);
    assert_eq!(second.session_id, first.session_id);

    // bob gets no READ rule at all once the table is non-empty
    let bob = initiator_as("bob", SecurityConfig::default());
    let (mut client, server) = pair();
    let server = serve_one(acceptor.clone(), server);
    let mut errors = ErrorStack::new();
    let err = bob
        .start_command(&mut client, &CommandRequest::new(ACCEPTOR_ADDR, 422), &mut errors)
        .await
        .unwrap_err();
    assert!(matches!(err, SecManError::AuthorizationDenied { .. }));
    server.await.unwrap().0.unwrap();
    assert!(bob.sessions().is_empty().await);
    assert_eq!(acceptor.sessions().len().await, 1);
}

#[tokio::test]
async fn test_ungranted_command_negotiates_again() {
    let acceptor = secure_acceptor();
    let initiator = initiator_as("alice", SecurityConfig::default());
    let (first, _, _) = echo(
        &initiator,
        &acceptor,
        &CommandRequest::new(ACCEPTOR_ADDR, 421),
        b"read",
    )
    .await;
    assert!(first.session_id.is_some());

    // the cached session lists only 421, so 422 starts a full negotiation
    let (mut client, server) = pair();
    let server = serve_one(acceptor.clone(), server);
    let mut errors = ErrorStack::new();
    let err = initiator
        .start_command(&mut client, &CommandRequest::new(ACCEPTOR_ADDR, 422), &mut errors)
        .await
        .unwrap_err();
    assert!(matches!(err, SecManError::AuthorizationDenied { .. }));
    assert!(client.frames_received() > 1);
    server.await.unwrap().0.unwrap();
    assert_eq!(initiator.sessions().len().await, 1);
}

#[tokio::test]
async fn test_policy_conflict_reported_on_both_sides() {
    let acceptor = secure_acceptor();
    let mut config = SecurityConfig::default();
    config.default.encryption = RequirementLevel::Never;
    let initiator = initiator_as("alice", config);

    let (mut client, server) = pair();
    let server = serve_one(acceptor.clone(), server);

    let mut errors = ErrorStack::new();
    let err = initiator
        .start_command(&mut client, &CommandRequest::new(ACCEPTOR_ADDR, 421), &mut errors)
        .await
        .unwrap_err();
    assert!(matches!(err, SecManError::PolicyConflict(_)));
    assert!(errors.has_code("POLICY_CONFLICT"));
    assert!(initiator.sessions().is_empty().await);

    let (accepted, server_errors) = server.await.unwrap();
    assert!(matches!(
        accepted.unwrap(),
        AcceptOutcome::Rejected {
            command: 421,
            code: ReturnCode::Denied,
            ..
        }
    ));
    assert!(server_errors.has_code("POLICY_CONFLICT"));
    assert!(acceptor.sessions().is_empty().await);
}

#[tokio::test]
async fn test_unauthorized_command_denied() {
    let acceptor = Arc::new(CommandAcceptor::new(
        Arc::new(SecurityConfig::default()),
        Arc::new(SessionService::new()),
        commands(),
    ));
    let initiator = initiator_as("mallory", SecurityConfig::default());

    let (mut client, server) = pair();
    let server = serve_one(acceptor.clone(), server);

    let mut errors = ErrorStack::new();
    let err = initiator
        .start_command(&mut client, &CommandRequest::new(ACCEPTOR_ADDR, 422), &mut errors)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecManError::AuthorizationDenied {
            code: ReturnCode::Denied,
            ..
        }
    ));
    assert!(errors.has_code("AUTHORIZATION_DENIED"));
    assert!(initiator.sessions().is_empty().await);

    let (accepted, _) = server.await.unwrap();
    assert!(matches!(
        accepted.unwrap(),
        AcceptOutcome::Rejected {
            command: 422,
            code: ReturnCode::Denied,
            ..
        }
    ));
    assert!(acceptor.sessions().is_empty().await);
}

async fn assert_query_answers(acceptor: Arc<CommandAcceptor>) {
    let initiator = initiator_as("bob", SecurityConfig::default());

    for (command, expected) in [(421, true), (422, false)] {
        let (mut client, server) = pair();
        let server = serve_one(acceptor.clone(), server);

        let mut errors = ErrorStack::new();
        let allowed = initiator
            .query(&mut client, &CommandRequest::new(ACCEPTOR_ADDR, command), &mut errors)
            .await
            .unwrap();
        assert_eq!(allowed, expected, "command {command}");
        server.await.unwrap().0.unwrap();
    }

    // queries never create sessions
    assert!(initiator.sessions().is_empty().await);
    assert!(acceptor.sessions().is_empty().await);
}

#[tokio::test]
async fn test_sec_query_reports_authorization() {
    assert_query_answers(Arc::new(CommandAcceptor::new(
        Arc::new(SecurityConfig::default()),
        Arc::new(SessionService::new()),
        commands(),
    )))
    .await;
}

#[tokio::test]
async fn test_sec_query_under_required_encryption() {
    assert_query_answers(secure_acceptor()).await;
}

#[tokio::test]
async fn test_stream_resume_of_lost_session_renegotiates() {
    let acceptor = secure_acceptor();
    let initiator = initiator_as("alice", SecurityConfig::default());
    let request = CommandRequest::new(ACCEPTOR_ADDR, 421).with_return_address("127.0.0.1:7000");

    let (first, _, _) = echo(&initiator, &acceptor, &request, b"first").await;
    let old_id = first.session_id.unwrap();
    assert_eq!(acceptor.sessions().invalidate_all().await, 1);

    // the resume goes out unanswered; the first read learns the session is gone
    let (mut client, server) = pair();
    let server = serve_one(acceptor.clone(), server);
    let mut errors = ErrorStack::new();
    let outcome = initiator
        .start_command(&mut client, &request, &mut errors)
        .await
        .unwrap();
    assert!(outcome.resumed);
    let err = client.recv().await.unwrap_err();
    assert!(matches!(err, SecManError::SessionNotFound(_)));
    assert!(initiator.sessions().is_empty().await);

    let (accepted, _) = server.await.unwrap();
    let AcceptOutcome::SessionNotFound(notice) = accepted.unwrap() else {
        panic!("expected a session-not-found notice");
    };
    assert_eq!(notice.session_id, old_id);
    assert_eq!(notice.return_address.as_deref(), Some("127.0.0.1:7000"));

    let (again, _, encrypted) = echo(&initiator, &acceptor, &request, b"again").await;
    assert!(!again.resumed);
    assert!(encrypted);
    assert_ne!(again.session_id.as_deref(), Some(old_id.as_str()));
}

#[tokio::test]
async fn test_raw_command_when_initiator_skips_negotiation() {
    let acceptor = Arc::new(CommandAcceptor::new(
        Arc::new(SecurityConfig::default()),
        Arc::new(SessionService::new()),
        commands(),
    ));
    let initiator = initiator_as("carol", SecurityConfig::default());

    let (outcome, accepted, encrypted) = echo(
        &initiator,
        &acceptor,
        &CommandRequest::new(ACCEPTOR_ADDR, 421).raw(),
        b"raw",
    )
    .await;
    assert!(!outcome.negotiated);
    assert!(!encrypted);
    assert_eq!(
        accepted,
        AcceptOutcome::Completed {
            command: 421,
            session_id: None,
            identity: None,
            new_session: false,
        }
    );
}

#[tokio::test]
async fn test_incoming_sessions_bound_to_return_address() {
    let acceptor = secure_acceptor();
    let alice = initiator_as("alice", SecurityConfig::default());
    let bob = initiator_as("bob", SecurityConfig::default());

    let from_alice = CommandRequest::new(ACCEPTOR_ADDR, 421).with_return_address("10.0.0.5:9618");
    let (session, _, _) = echo(&alice, &acceptor, &from_alice, b"alice").await;
    echo(&bob, &acceptor, &CommandRequest::new(ACCEPTOR_ADDR, 421), b"bob").await;
    assert_eq!(acceptor.sessions().len().await, 2);

    // the channel's source address never names a session
    assert_eq!(acceptor.sessions().invalidate_host("127.0.0.1:40001").await, 0);
    assert_eq!(acceptor.sessions().invalidate_host("10.0.0.5:9618").await, 1);
    assert!(!acceptor
        .sessions()
        .contains(session.session_id.as_deref().unwrap())
        .await);
    assert_eq!(acceptor.sessions().len().await, 1);
}
