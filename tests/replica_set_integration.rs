//! Replica-set integration tests over TLS
//!
//! Three in-process members share one server certificate. Statuses are
//! changed on the fly to simulate elections and failover.
//!
//! Run with: cargo test --test replica_set_integration

mod common;

use common::*;
use docwire::topology::{ServerRole, TopologyEvent};
use docwire::{
    Client, ClientOptions, ConnectErrorKind, Endpoint, Error, ReadPreference, TopologyError,
};
use std::time::{Duration, Instant};

const SET: &str = "rs0";

struct ReplicaSet {
    pki: Pki,
    a: TestServer,
    b: TestServer,
    c: TestServer,
}

impl ReplicaSet {
    /// `a` primary, `b` and `c` secondaries; every member lists all three
    async fn start() -> Self {
        let pki = Pki::new("replica set ca");
        let config = server_config(&pki.localhost(), None);
        let a = TestServer::start(Negotiation::Tls(config.clone()), Default::default()).await;
        let b = TestServer::start(Negotiation::Tls(config.clone()), Default::default()).await;
        let c = TestServer::start(Negotiation::Tls(config), Default::default()).await;

        let set = Self { pki, a, b, c };
        set.elect(&set.a.endpoint());
        set
    }

    fn members(&self) -> Vec<Endpoint> {
        vec![self.a.endpoint(), self.b.endpoint(), self.c.endpoint()]
    }

    /// Make `primary` the only primary
    fn elect(&self, primary: &Endpoint) {
        let hosts = self.members();
        for server in [&self.a, &self.b, &self.c] {
            let is_primary = server.endpoint() == *primary;
            server.set_status(member_status(SET, is_primary, &hosts));
        }
    }

    /// URI seeded with `a` and `b` only; `c` must be discovered
    fn uri(&self, extra: &str) -> String {
        format!(
            "mongodb://{}/?ssl=true&replicaSet={}&heartbeatFrequencyMS=50{}",
            seed_list(&[&self.a, &self.b]),
            SET,
            extra
        )
    }

    fn options(&self) -> ClientOptions {
        ClientOptions::builder()
            .ssl_ca(self.pki.ca_pem().into_bytes())
            .connect_timeout(Duration::from_secs(2))
            .server_selection_timeout(Duration::from_secs(5))
            .build()
    }
}

#[tokio::test]
async fn test_connects_to_primary_and_discovers_members() {
    let rs = ReplicaSet::start().await;
    let client = Client::connect(&rs.uri(""), rs.options()).await.unwrap();

    assert_eq!(client.current_primary(), Some(rs.a.endpoint()));
    let conn = client.acquire().await.unwrap();
    assert_eq!(conn.endpoint(), &rs.a.endpoint());
    assert!(conn.is_encrypted());
    drop(conn);

    let monitor = client.topology().expect("replica set client has a monitor");
    let c = rs.c.endpoint();
    let role = monitor
        .wait_until(Duration::from_secs(5), |state| {
            state
                .role_of(&c)
                .filter(|role| *role == ServerRole::Secondary)
        })
        .await
        .unwrap();
    assert_eq!(role, Some(ServerRole::Secondary));

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.set_name(), Some(SET));
    assert_eq!(snapshot.servers().count(), 3);

    client.close().await;
}

#[tokio::test]
async fn test_secondary_read_preference() {
    let rs = ReplicaSet::start().await;
    let client = Client::connect(&rs.uri("&readPreference=secondary"), rs.options())
        .await
        .unwrap();

    assert_eq!(client.read_preference(), ReadPreference::Secondary);
    let conn = client.acquire().await.unwrap();
    assert_ne!(conn.endpoint(), &rs.a.endpoint());
    assert!(conn.server_status().secondary);
}

#[tokio::test]
async fn test_failover_moves_to_new_primary() {
    let rs = ReplicaSet::start().await;
    let client = Client::connect(&rs.uri(""), rs.options()).await.unwrap();
    let monitor = client.topology().unwrap();
    let mut events = monitor.subscribe();

    let old = rs.a.endpoint();
    assert_eq!(client.current_primary(), Some(old.clone()));

    rs.a.stop();
    let role = monitor
        .wait_for_role_change(&old, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(role, ServerRole::Unreachable);

    rs.elect(&rs.b.endpoint());
    let primary = monitor
        .wait_for_primary(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(primary, rs.b.endpoint());

    let conn = client.acquire().await.unwrap();
    assert_eq!(conn.endpoint(), &rs.b.endpoint());

    // The unreachable member's pool was emptied by the event watcher
    let cleared = eventually(Duration::from_secs(2), || {
        client
            .pool(&old)
            .map(|pool| pool.status().idle == 0)
            .unwrap_or(true)
    })
    .await;
    assert!(cleared);

    let mut saw_unreachable = false;
    let mut saw_election = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TopologyEvent::Unreachable { endpoint, .. } if endpoint == old => {
                saw_unreachable = true
            }
            TopologyEvent::PrimaryElected { endpoint } if endpoint == rs.b.endpoint() => {
                saw_election = true
            }
            _ => {}
        }
    }
    assert!(saw_unreachable);
    assert!(saw_election);
}

#[tokio::test]
async fn test_restarted_member_rejoins_as_secondary() {
    let rs = ReplicaSet::start().await;
    let client = Client::connect(&rs.uri(""), rs.options()).await.unwrap();
    let monitor = client.topology().unwrap();
    let c = rs.c.endpoint();

    monitor
        .wait_until(Duration::from_secs(5), |s| {
            s.role_of(&c).filter(|r| *r == ServerRole::Secondary)
        })
        .await
        .unwrap()
        .expect("c discovered");

    rs.c.stop();
    let role = monitor
        .wait_for_role_change(&c, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(role, ServerRole::Unreachable);

    rs.c.restart().await;
    monitor.request_check();
    let role = monitor
        .wait_for_role_change(&c, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(role, ServerRole::Secondary);
}

#[tokio::test]
async fn test_untrusted_members_fail_fast() {
    let rs = ReplicaSet::start().await;
    let stranger = Pki::new("not the replica set ca");
    let options = ClientOptions::builder()
        .ssl_ca(stranger.ca_pem().into_bytes())
        .server_selection_timeout(Duration::from_secs(20))
        .build();

    let started = Instant::now();
    let err = Client::connect(&rs.uri(""), options).await.unwrap_err();

    assert_eq!(err.connect_kind(), Some(ConnectErrorKind::ChainInvalid));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "validation failures must not wait out server selection"
    );
}

#[tokio::test]
async fn test_no_primary_times_out() {
    let rs = ReplicaSet::start().await;
    let hosts = rs.members();
    for server in [&rs.a, &rs.b, &rs.c] {
        server.set_status(member_status(SET, false, &hosts));
    }

    let err = Client::connect(&rs.uri("&serverSelectionTimeoutMS=300"), {
        ClientOptions::builder()
            .ssl_ca(rs.pki.ca_pem().into_bytes())
            .build()
    })
    .await
    .unwrap_err();

    match err {
        Error::Topology(TopologyError::NoPrimary { set_name }) => {
            assert_eq!(set_name.as_deref(), Some(SET));
        }
        other => panic!("expected NoPrimary, got {}", other),
    }
}

#[tokio::test]
async fn test_wrong_set_name_is_not_selected() {
    let rs = ReplicaSet::start().await;
    let hosts = rs.members();
    rs.a.set_status(member_status("other", true, &hosts));

    let err = Client::connect(&rs.uri("&serverSelectionTimeoutMS=500"), {
        ClientOptions::builder()
            .ssl_ca(rs.pki.ca_pem().into_bytes())
            .build()
    })
    .await
    .unwrap_err();

    assert!(
        matches!(err, Error::Topology(TopologyError::NoPrimary { .. })),
        "got {}",
        err
    );
}

#[tokio::test]
async fn test_secondary_hanging_up_keeps_primary_available() {
    let rs = ReplicaSet::start().await;
    let client = Client::connect(&rs.uri(""), rs.options()).await.unwrap();
    let monitor = client.topology().unwrap();
    let b = rs.b.endpoint();

    // b's port now accepts TCP and closes it before negotiating
    rs.b.stop();
    let mut listener = None;
    for _ in 0..100 {
        if let Ok(bound) = tokio::net::TcpListener::bind((LOCALHOST, b.port())).await {
            listener = Some(bound);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let listener = listener.expect("rebind stopped member");
    let hang_up = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let role = monitor
        .wait_until(Duration::from_secs(5), |state| {
            state
                .role_of(&b)
                .filter(|role| *role == ServerRole::Unreachable)
        })
        .await
        .unwrap();
    assert_eq!(role, Some(ServerRole::Unreachable));

    tokio::time::sleep(Duration::from_millis(600)).await;
    let failure = monitor.snapshot().server(&b).and_then(|s| s.error.clone());
    assert!(
        failure.as_ref().map_or(true, |f| f.is_retriable()),
        "hang-up recorded as {:?}",
        failure
    );
    assert_eq!(client.current_primary(), Some(rs.a.endpoint()));

    let conn = client.acquire().await.expect("primary stays reachable");
    assert_eq!(conn.endpoint(), &rs.a.endpoint());
    drop(conn);

    client.close().await;
    hang_up.abort();
}
