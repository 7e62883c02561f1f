//! Handshake and data flow through simulated resolver paths

mod common;

use std::time::Duration;

use common::{server, PathProfile, Resolver};
use socketace::dns::RecordType;
use socketace::{
    ClientOptions, DnsClient, DnsTransport, Encoder, Overrides, QueryType, ServerOptions,
    TunnelStream,
};
use std::sync::Arc;

fn client(overrides: Overrides) -> DnsClient {
    DnsClient::new(ClientOptions {
        domain: common::DOMAIN.into(),
        overrides,
        poll_interval: Duration::from_millis(50),
        lazy_poll_interval: Duration::from_millis(50),
        round_trip_timeout: Duration::from_secs(2),
    })
}

#[tokio::test]
async fn test_end_to_end_over_classic_udp_limit() {
    let server = server(ServerOptions::default());
    let resolver = Resolver::new(server.clone(), PathProfile::default());
    let transport: Arc<dyn DnsTransport> = resolver.clone();

    let conn = client(Overrides::default())
        .connect(transport)
        .await
        .expect("handshake should succeed");

    let serializer = conn.serializer();
    assert!(serializer.user_id.is_some());
    assert!(serializer.upstream.encoder.is_some());
    assert!(serializer.downstream.encoder.is_some());
    assert!(serializer.downstream.fragment_size > 0);
    assert!(serializer.downstream.fragment_size <= 768);
    assert!(!serializer.use_edns0, "512-octet path cannot carry the EDNS0 test");

    let writer = tokio::spawn(async move {
        conn.write(b"hello").await.expect("write should be acknowledged");
        conn
    });

    let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept())
        .await
        .expect("session should be accepted")
        .expect("server is running");
    let mut buf = [0u8; 16];
    let n = accepted.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    let conn = writer.await.unwrap();
    let reply = tokio::spawn(async move {
        accepted.write(b"world").await.unwrap();
        accepted
    });
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .expect("reply should arrive")
        .unwrap();
    assert_eq!(&buf[..n], b"world");
    reply.await.unwrap();

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_case_folding_resolver_pins_base32_upstream() {
    let server = server(ServerOptions::default());
    let profile = PathProfile {
        fold_case: true,
        ..Default::default()
    };
    let transport: Arc<dyn DnsTransport> = Resolver::new(server, profile);

    let conn = client(Overrides::default()).connect(transport).await.unwrap();
    assert_eq!(conn.serializer().upstream_encoder(), Encoder::Base32);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_pinned_overrides_are_used_verbatim() {
    let server = server(ServerOptions::default());
    let resolver = Resolver::new(server, PathProfile::default());
    let transport: Arc<dyn DnsTransport> = resolver.clone();

    let overrides = Overrides {
        query_type: Some(QueryType::Txt),
        upstream_encoder: Some(Encoder::Base32),
        downstream_encoder: Some(Encoder::Base64),
        fragment_size: Some(200),
        ..Default::default()
    };
    let conn = client(overrides).connect(transport).await.unwrap();

    let serializer = conn.serializer();
    assert_eq!(serializer.query_type(), QueryType::Txt);
    assert_eq!(serializer.upstream_encoder(), Encoder::Base32);
    assert_eq!(serializer.downstream_encoder(), Encoder::Base64);
    assert_eq!(serializer.downstream.fragment_size, 200);

    // no encoder tests; the only fragment test is the EDNS0 one
    let commands = resolver.commands();
    assert!(!commands.contains(&b'z'));
    assert!(!commands.contains(&b'y'));
    assert_eq!(commands.iter().filter(|&&c| c == b'f').count(), 1);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_blocked_query_types_fall_back_to_txt() {
    let server = server(ServerOptions::default());
    let profile = PathProfile {
        blocked: vec![RecordType::NULL, QueryType::Private.record_type()],
        ..Default::default()
    };
    let transport: Arc<dyn DnsTransport> = Resolver::new(server, profile);

    let conn = client(Overrides::default()).connect(transport).await.unwrap();
    assert_eq!(conn.serializer().query_type(), QueryType::Txt);
    assert_ne!(conn.serializer().downstream_encoder(), Encoder::Raw);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_unreliable_downstream_encoder_falls_back_to_base32() {
    let server = server(ServerOptions::default());
    let profile = PathProfile {
        blocked: vec![RecordType::NULL, QueryType::Private.record_type()],
        mangle_txt_over: Some(200),
        ..Default::default()
    };
    let transport: Arc<dyn DnsTransport> = Resolver::new(server.clone(), profile);

    let conn = client(Overrides::default()).connect(transport).await.unwrap();
    assert_eq!(conn.serializer().query_type(), QueryType::Txt);
    assert_eq!(conn.serializer().downstream_encoder(), Encoder::Base32);
    assert!(conn.serializer().downstream.fragment_size >= 82);
    // the abandoned first handshake gave its user back
    assert_eq!(server.user_count().await, 1);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_lost_version_reply_costs_no_extra_user() {
    let server = server(ServerOptions::default());
    let profile = PathProfile {
        lose_first_reply: Some(b'v'),
        ..Default::default()
    };
    let resolver = Resolver::new(server.clone(), profile);
    let transport: Arc<dyn DnsTransport> = resolver.clone();

    let conn = client(Overrides::default()).connect(transport).await.unwrap();
    let versions = resolver.commands().iter().filter(|&&c| c == b'v').count();
    assert_eq!(versions, 2, "the lost reply should be retried once");
    assert_eq!(server.user_count().await, 1);
    conn.close().await.unwrap();
    assert_eq!(server.user_count().await, 0);
}

#[tokio::test]
async fn test_full_server_rejects_handshake() {
    let server = server(ServerOptions {
        max_users: 1,
        ..Default::default()
    });
    let first: Arc<dyn DnsTransport> = Resolver::new(server.clone(), PathProfile::default());
    let _conn = client(Overrides::default()).connect(first).await.unwrap();

    let second: Arc<dyn DnsTransport> = Resolver::new(server, PathProfile::default());
    let err = client(Overrides::default()).connect(second).await.unwrap_err();
    assert!(err.to_string().contains("version"), "{}", err);
}
