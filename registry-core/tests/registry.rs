//! End-to-end tests against a running registry server

use registry_core::protocol::{REPLY_ERROR, SERVER_MAGIC_BYTE};
use registry_core::{
    EventKind, Identity, Location, MemberEndpoint, RegistryClient, RegistryConfig, RegistryError,
    Server,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const IMPLEMENTATION: &str = "ipl-2.3";

fn config() -> RegistryConfig {
    RegistryConfig::new("127.0.0.1:0".parse().unwrap())
        .with_connect_timeout(Duration::from_secs(2))
        .with_push_interval(Duration::from_millis(200))
}

struct TestMember {
    endpoint: MemberEndpoint,
    identity: Identity,
    join_time: u64,
}

async fn join(client: &RegistryClient, pool: &str) -> TestMember {
    let endpoint = MemberEndpoint::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let reply = client
        .join(
            pool,
            IMPLEMENTATION,
            endpoint.local_addr(),
            "node@rack".parse().unwrap(),
            vec![1, 2],
        )
        .await
        .unwrap();
    endpoint.set_identity(reply.identity.clone());
    TestMember {
        endpoint,
        identity: reply.identity,
        join_time: reply.join_time,
    }
}

#[tokio::test]
async fn test_basic_churn() {
    let mut server = Server::start(config()).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let a = join(&client, "churn").await;
    let b = join(&client, "churn").await;
    let c = join(&client, "churn").await;
    assert_eq!(
        [a.join_time, b.join_time, c.join_time],
        [0, 1, 2]
    );
    assert_eq!(c.identity.location().to_string(), "node@rack");

    client.leave(&b.identity).await.unwrap();
    assert_eq!(server.get_pool("churn").unwrap().event_time(), 4);

    // every remaining member eventually sees the leave
    for member in [&a, &c] {
        assert!(member
            .endpoint
            .wait_for_event_time(4, Duration::from_secs(5))
            .await);
        let events = member.endpoint.events();
        let leave = events.iter().find(|e| e.time == 3).unwrap();
        assert_eq!(leave.kind, EventKind::Leave);
        assert_eq!(leave.subjects, vec![b.identity.clone()]);
    }

    // a was there from the start and saw every event in order
    let times: Vec<_> = a.endpoint.events().iter().map(|e| e.time).collect();
    assert_eq!(times, vec![0, 1, 2, 3]);

    let state = client.get_state(&a.identity, Some(a.join_time)).await.unwrap();
    assert_eq!(state.members, vec![a.identity.clone(), c.identity.clone()]);
    assert_eq!(state.event_time, 4);

    server.shutdown();
}

#[tokio::test]
async fn test_election_race() {
    let mut server = Server::start(config()).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let a = join(&client, "race").await;
    let b = join(&client, "race").await;

    let (won_a, won_b) = tokio::join!(
        client.elect(&a.identity, "leader"),
        client.elect(&b.identity, "leader")
    );
    let winner = won_a.unwrap();
    assert_eq!(won_b.unwrap(), winner);

    let pool = server.get_pool("race").unwrap();
    let time = pool.event_time();
    let loser = if winner == a.identity { &b } else { &a };
    assert_eq!(client.elect(&loser.identity, "leader").await.unwrap(), winner);
    assert_eq!(pool.event_time(), time);
    assert_eq!(pool.event_count(EventKind::Elect), 1);

    // the winner leaving frees the label
    client.leave(&winner).await.unwrap();
    assert_eq!(pool.event_count(EventKind::UnElect), 1);
    assert_eq!(
        client.elect(&loser.identity, "leader").await.unwrap(),
        loser.identity
    );

    server.shutdown();
}

#[tokio::test]
async fn test_sequence_numbers_and_signals() {
    let mut server = Server::start(config()).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let a = join(&client, "seq").await;
    let b = join(&client, "seq").await;

    assert_eq!(client.sequence_number(&a.identity, None).await.unwrap(), 0);
    assert_eq!(client.sequence_number(&b.identity, None).await.unwrap(), 1);
    assert_eq!(
        client.sequence_number(&b.identity, Some("jobs")).await.unwrap(),
        0
    );
    assert_eq!(
        client.sequence_number(&a.identity, Some("jobs")).await.unwrap(),
        1
    );
    assert_eq!(client.sequence_number(&a.identity, None).await.unwrap(), 2);

    client
        .signal(&a.identity, "checkpoint", &[b.identity.clone()])
        .await
        .unwrap();
    let state = client.get_state(&b.identity, Some(b.join_time)).await.unwrap();
    assert_eq!(state.signals.len(), 1);
    assert_eq!(state.signals[0].label.as_deref(), Some("checkpoint"));

    client.heartbeat(&a.identity).await.unwrap();

    server.shutdown();
}

#[tokio::test]
async fn test_failure_detection() {
    let config = config().with_heartbeat_interval(Duration::from_millis(100));
    let mut server = Server::start(config).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let alive = join(&client, "detect").await;
    let silent = join(&client, "detect").await;
    silent.endpoint.set_responsive(false);

    let pool = server.get_pool("detect").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pool.is_member(&silent.identity) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!pool.is_member(&silent.identity));
    assert!(pool.is_member(&alive.identity));
    assert_eq!(pool.event_count(EventKind::Died), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_suspicion_wakes_detector() {
    // long enough that only the suspicion can trigger a ping
    let config = config().with_heartbeat_interval(Duration::from_secs(60));
    let mut server = Server::start(config).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let a = join(&client, "suspect").await;
    let b = join(&client, "suspect").await;
    b.endpoint.set_responsive(false);

    client.maybe_dead(&a.identity, &b.identity).await.unwrap();

    let pool = server.get_pool("suspect").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while pool.is_member(&b.identity) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!pool.is_member(&b.identity));
    assert!(pool.is_member(&a.identity));
    assert_eq!(pool.event_count(EventKind::Died), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_reported_death_is_idempotent() {
    let mut server = Server::start(config()).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let a = join(&client, "dead").await;
    let b = join(&client, "dead").await;
    let c = join(&client, "dead").await;

    client.dead(&a.identity, &b.identity).await.unwrap();
    client.dead(&c.identity, &b.identity).await.unwrap();
    client.maybe_dead(&a.identity, &b.identity).await.unwrap();

    let pool = server.get_pool("dead").unwrap();
    assert_eq!(pool.event_count(EventKind::Died), 1);
    assert_eq!(pool.size(), 2);

    server.shutdown();
}

#[tokio::test]
async fn test_ended_pool_rejects_join() {
    let mut server = Server::start(config()).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let only = join(&client, "short").await;
    client.leave(&only.identity).await.unwrap();
    assert!(server.get_pool("short").unwrap().has_ended());

    let err = client
        .join(
            "short",
            IMPLEMENTATION,
            "127.0.0.1:1".parse().unwrap(),
            Location::default(),
            Vec::new(),
        )
        .await
        .unwrap_err();
    match err {
        RegistryError::Protocol(message) => assert!(message.contains("already ended")),
        other => panic!("Expected error reply, got {:?}", other),
    }

    // other pools are unaffected
    join(&client, "other").await;

    server.shutdown();
}

#[tokio::test]
async fn test_join_with_other_implementation_is_refused() {
    let mut server = Server::start(config()).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let first = join(&client, "mixed").await;

    let err = client
        .join(
            "mixed",
            "mpj-1.0",
            "127.0.0.1:1".parse().unwrap(),
            Location::default(),
            Vec::new(),
        )
        .await
        .unwrap_err();
    match err {
        RegistryError::Protocol(message) => {
            assert!(message.contains("mpj-1.0"));
            assert!(message.contains(IMPLEMENTATION));
        }
        other => panic!("Expected error reply, got {:?}", other),
    }

    let pool = server.get_pool("mixed").unwrap();
    assert_eq!(pool.members(), vec![first.identity.clone()]);
    assert_eq!(pool.event_count(EventKind::Join), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_unknown_pool_and_malformed_request() {
    let mut server = Server::start(config()).await.unwrap();
    let client = RegistryClient::new(server.local_addr());

    let stranger = Identity::new(
        "0",
        "missing",
        "127.0.0.1:1".parse().unwrap(),
        Location::default(),
        Vec::new(),
    );
    match client.heartbeat(&stranger).await.unwrap_err() {
        RegistryError::Protocol(message) => assert!(message.contains("not found")),
        other => panic!("Expected error reply, got {:?}", other),
    }

    // garbage closes only its own connection
    let mut raw = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .unwrap();
    raw.write_all(&[0xff, 0x00, 0x00]).await.unwrap();
    let mut rest = Vec::new();
    let _ = raw.read_to_end(&mut rest).await;

    join(&client, "still-serving").await;
    assert!(server.registry().statistics().failed() >= 1);

    server.shutdown();
}

#[tokio::test]
async fn test_unknown_opcode_gets_error_reply() {
    let mut server = Server::start(config()).await.unwrap();

    let mut raw = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .unwrap();
    raw.write_all(&[SERVER_MAGIC_BYTE, 0x2a]).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), raw.read_u8())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, REPLY_ERROR);

    let len = raw.read_u16().await.unwrap() as usize;
    let mut message = vec![0; len];
    raw.read_exact(&mut message).await.unwrap();
    assert!(String::from_utf8(message).unwrap().contains("42"));

    server.shutdown();
}
