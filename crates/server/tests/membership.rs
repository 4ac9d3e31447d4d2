//! Membership service tests over real gRPC.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use tonic::Code;

use webmesh_proto::proto::{GetCurrentConsensusRequest, LeaveRequest};

use common::{authenticated_join, join_request, membership_client, TestCluster, TestNode};

#[tokio::test(flavor = "multi_thread")]
async fn test_join_allocates_sequential_addresses() {
    let cluster = TestCluster::bootstrap(1).await;
    let leader = cluster.leader().expect("leader");
    let mut client = membership_client(leader.addr).await.expect("client");

    for (name, expected) in [("m1", "172.16.0.1/32"), ("m2", "172.16.0.2/32"), ("m3", "172.16.0.3/32")] {
        let joiner_addr = format!("127.0.0.1:{}", common::free_port_base())
            .parse()
            .expect("addr");
        let response = client
            .join(authenticated_join(join_request(name, joiner_addr, true)))
            .await
            .expect("join")
            .into_inner();
        assert_eq!(response.address_ipv4, expected);
        assert_eq!(response.mesh_domain, "webmesh.internal");
        assert!(!response.address_ipv6.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_idempotent_and_key_conflict() {
    let cluster = TestCluster::bootstrap(1).await;
    let leader = cluster.leader().expect("leader");
    let mut client = membership_client(leader.addr).await.expect("client");
    let joiner_addr = "127.0.0.1:1".parse().expect("addr");

    let first = client
        .join(authenticated_join(join_request("m1", joiner_addr, true)))
        .await
        .expect("join")
        .into_inner();
    let second = client
        .join(authenticated_join(join_request("m1", joiner_addr, true)))
        .await
        .expect("identical join is a no-op")
        .into_inner();
    assert_eq!(first.address_ipv4, second.address_ipv4);
    assert_eq!(first.address_ipv6, second.address_ipv6);

    let mut conflicting = join_request("m1", joiner_addr, true);
    conflicting.public_key = "different-key".to_string();
    let err = client
        .join(authenticated_join(conflicting))
        .await
        .expect_err("key conflict rejected");
    assert_eq!(err.code(), Code::AlreadyExists);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_without_identity_denied() {
    let cluster = TestCluster::bootstrap(1).await;
    let leader = cluster.leader().expect("leader");
    let mut client = membership_client(leader.addr).await.expect("client");

    let err = client
        .join(join_request("m1", "127.0.0.1:1".parse().unwrap(), true))
        .await
        .expect_err("anonymous join denied");
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_static_ipv4_override() {
    let cluster = TestCluster::bootstrap_with(1, |config| {
        config.static_ipv4 = vec!["n7=172.16.0.50/32".to_string()];
    })
    .await;
    let leader = cluster.leader().expect("leader");
    let mut client = membership_client(leader.addr).await.expect("client");

    let response = client
        .join(authenticated_join(join_request(
            "n7",
            "127.0.0.1:1".parse().unwrap(),
            true,
        )))
        .await
        .expect("join")
        .into_inner();
    assert_eq!(response.address_ipv4, "172.16.0.50/32");

    // The next dynamic allocation skips the static address.
    let next = client
        .join(authenticated_join(join_request(
            "m1",
            "127.0.0.1:2".parse().unwrap(),
            true,
        )))
        .await
        .expect("join")
        .into_inner();
    assert_eq!(next.address_ipv4, "172.16.0.1/32");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leave_removes_node_and_is_idempotent() {
    let cluster = TestCluster::bootstrap(1).await;
    let leader = cluster.leader().expect("leader");
    let mut client = membership_client(leader.addr).await.expect("client");

    client
        .join(authenticated_join(join_request(
            "m1",
            "127.0.0.1:1".parse().unwrap(),
            true,
        )))
        .await
        .expect("join");
    assert!(leader.db.peers().get("m1").await.is_ok());

    let leave = |id: &str| {
        let mut request = tonic::Request::new(LeaveRequest { id: id.to_string() });
        request
            .metadata_mut()
            .insert("webmesh-node-id", id.parse().expect("metadata"));
        request
    };
    client.leave(leave("m1")).await.expect("leave");
    assert!(leader.db.peers().get("m1").await.is_err());
    assert!(leader
        .db
        .leases()
        .get("m1")
        .await
        .expect("lease lookup")
        .is_none());

    // Second leave of the unknown node still returns OK.
    client.leave(leave("m1")).await.expect("leave again");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_without_proxy_redirects_join() {
    let cluster = TestCluster::bootstrap(3).await;
    let follower = cluster.followers().first().copied().expect("follower");
    let mut client = membership_client(follower.addr).await.expect("client");

    let err = client
        .join(authenticated_join(join_request(
            "m1",
            "127.0.0.1:1".parse().unwrap(),
            true,
        )))
        .await
        .expect_err("non-leader rejects without proxy");
    assert_eq!(err.code(), Code::FailedPrecondition);
    // The leader address rides along so the client can redial.
    let leader = cluster.leader().expect("leader");
    assert!(err.message().contains(&leader.addr.to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_with_proxy_forwards_join() {
    let cluster = TestCluster::bootstrap_with(3, |config| {
        config.leader_proxy = true;
    })
    .await;
    cluster
        .wait_for_applied(1, Duration::from_secs(10))
        .await
        .then_some(())
        .expect("settled");
    let follower = cluster.followers().first().copied().expect("follower");
    let mut client = membership_client(follower.addr).await.expect("client");

    let response = client
        .join(authenticated_join(join_request(
            "m1",
            "127.0.0.1:1".parse().unwrap(),
            true,
        )))
        .await
        .expect("proxied join")
        .into_inner();
    assert_eq!(response.address_ipv4, "172.16.0.1/32");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_voter_join_and_consensus_listing() {
    let cluster = TestCluster::bootstrap(3).await;
    let leader = cluster.leader().expect("leader");

    let joiner_addr = format!("127.0.0.1:{}", common::free_port_base())
        .parse()
        .expect("addr");
    let joiner = TestNode::start("n4", joiner_addr, |_| {}).await;

    let mut client = membership_client(leader.addr).await.expect("client");
    client
        .join(authenticated_join(join_request("n4", joiner.addr, false)))
        .await
        .expect("voter join");

    let consensus = client
        .get_current_consensus(GetCurrentConsensusRequest {})
        .await
        .expect("consensus")
        .into_inner();
    assert_eq!(consensus.members.len(), 4);
    assert!(!consensus.leader.is_empty());
    let voters = consensus.members.iter().filter(|m| m.voter).count();
    assert_eq!(voters, 4);

    joiner.kill().await;
}
