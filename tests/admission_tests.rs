#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

//! Admission semantics: the policy engine over a real store and routing
//! table, end to end from `(src, proxy, protocol, login)` to a decision.

mod common;

use chrono::{Datelike, Utc};
use common::{Gateway, gateway, ip, ssh_policy};
use gatehouse::core::stay::Protocol;
use gatehouse::policy::{Decision, DenyReason, ScopeKind, WeeklySchedule};
use gatehouse::store::{AuditKind, AuditQuery, GroupKind, NewAudit};

/// Seed the S1 world: alice at 100.64.0.20, backend db-01 behind proxy
/// 10.0.160.129, server group `prod` containing db-01, and a policy for
/// alice on `prod` with logins = [postgres].
async fn seed_s1(gw: &Gateway) -> (uuid::Uuid, uuid::Uuid) {
    let dir = gw.store.directory();
    let alice = dir
        .create_person("alice", "Alice", "alice@example.com")
        .await
        .unwrap();
    dir.add_source_ip(alice.id, "100.64.0.20/32".parse().unwrap(), "laptop")
        .await
        .unwrap();

    let db01 = dir
        .create_backend("db-01", "192.0.2.10", None, true, false)
        .await
        .unwrap();
    gw.routing
        .bind(ip("10.0.160.129"), db01.id, "tests")
        .await
        .unwrap();

    let prod = dir
        .create_group(GroupKind::Server, "prod", None)
        .await
        .unwrap();
    dir.add_server_group_member(prod.id, db01.id).await.unwrap();

    let mut policy = ssh_policy(alice.id, ScopeKind::ServerGroup, prod.id);
    policy.ssh_logins = vec!["postgres".to_owned()];
    gw.store.policies().create(&policy).await.unwrap();

    (alice.id, policy.id)
}

#[tokio::test]
async fn s1_admits_ssh_via_group_policy() {
    let gw = gateway().await;
    let (alice_id, policy_id) = seed_s1(&gw).await;

    let decision = gw
        .engine
        .decide(ip("100.64.0.20"), ip("10.0.160.129"), Protocol::Ssh, Some("postgres"))
        .await
        .unwrap();

    let Decision::Admit(admission) = decision else {
        panic!("expected admit, got {decision:?}");
    };
    assert_eq!(admission.person_id, alice_id);
    assert_eq!(admission.policy_id, policy_id);
    assert_eq!(admission.backend.name, "db-01");
    assert!(!admission.allow_port_forwarding, "S1 grants no forwarding");
    assert_eq!(admission.ssh_login_filter, vec!["postgres".to_owned()]);
    assert!(admission.valid_until.is_some());

    // Opening the stay persists it and writes the admission audit row.
    let stay = gw
        .registry
        .open(
            &admission,
            Protocol::Ssh,
            ip("100.64.0.20"),
            ip("10.0.160.129"),
            Some("postgres".into()),
            "alice",
        )
        .await
        .unwrap();
    let row = gw.store.stays().by_id(stay.id()).await.unwrap().unwrap();
    assert!(row.is_active());
    assert_eq!(row.policy_id, policy_id);

    let audit = gw.audit.query(&AuditQuery::default()).await.unwrap();
    assert!(
        audit
            .iter()
            .any(|r| r.kind == AuditKind::Admission && r.admitted)
    );
}

#[tokio::test]
async fn s2_denies_wrong_login_with_audit_row() {
    let gw = gateway().await;
    seed_s1(&gw).await;

    let decision = gw
        .engine
        .decide(ip("100.64.0.20"), ip("10.0.160.129"), Protocol::Ssh, Some("root"))
        .await
        .unwrap();

    let Decision::Deny(reason) = decision else {
        panic!("root must not be admitted");
    };
    assert_eq!(reason, DenyReason::LoginNotPermitted);

    // The front-end writes exactly one audit row per denied accept.
    gw.audit
        .record(NewAudit {
            actor: None,
            kind: AuditKind::Admission,
            source_ip: Some(ip("100.64.0.20")),
            backend_id: None,
            protocol: Some(Protocol::Ssh),
            admitted: false,
            reason: reason.to_string(),
            detail: "login 'root' on 10.0.160.129".to_owned(),
        })
        .await
        .unwrap();

    let denies = gw
        .audit
        .query(&AuditQuery {
            source_ip: Some(ip("100.64.0.20")),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(denies.len(), 1);
    assert!(!denies[0].admitted);
    assert_eq!(denies[0].reason, "login_not_permitted");

    // No stay was created.
    assert!(gw.store.stays().list(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn s6_revocation_denies_subsequent_connects() {
    let gw = gateway().await;
    let (_, policy_id) = seed_s1(&gw).await;

    assert!(
        gw.engine
            .decide(ip("100.64.0.20"), ip("10.0.160.129"), Protocol::Ssh, Some("postgres"))
            .await
            .unwrap()
            .is_admit()
    );

    gw.store.policies().revoke(policy_id, "ops").await.unwrap();

    let decision = gw
        .engine
        .decide(ip("100.64.0.20"), ip("10.0.160.129"), Protocol::Ssh, Some("postgres"))
        .await
        .unwrap();
    let Decision::Deny(reason) = decision else {
        panic!("revoked policy must not admit");
    };
    assert_eq!(reason, DenyReason::NoMatchingPolicy);
}

#[tokio::test]
async fn unknown_source_and_unbound_proxy_have_their_own_reasons() {
    let gw = gateway().await;
    seed_s1(&gw).await;

    let Decision::Deny(reason) = gw
        .engine
        .decide(ip("203.0.113.9"), ip("10.0.160.129"), Protocol::Ssh, None)
        .await
        .unwrap()
    else {
        panic!("unknown source admitted");
    };
    assert_eq!(reason, DenyReason::NoPersonForSourceIp);

    let Decision::Deny(reason) = gw
        .engine
        .decide(ip("100.64.0.20"), ip("10.0.160.200"), Protocol::Ssh, None)
        .await
        .unwrap()
    else {
        panic!("unbound proxy admitted");
    };
    assert_eq!(reason, DenyReason::NoBackendForProxyIp);
}

#[tokio::test]
async fn protocol_mismatch_is_protocol_not_allowed() {
    let gw = gateway().await;
    seed_s1(&gw).await;

    // db-01 has RDP disabled entirely.
    let Decision::Deny(reason) = gw
        .engine
        .decide(ip("100.64.0.20"), ip("10.0.160.129"), Protocol::Rdp, None)
        .await
        .unwrap()
    else {
        panic!("rdp admitted against ssh-only backend");
    };
    assert_eq!(reason, DenyReason::ProtocolNotAllowed);
}

#[tokio::test]
async fn most_specific_failure_wins_across_candidates() {
    let gw = gateway().await;
    let dir = gw.store.directory();

    let carol = dir
        .create_person("carol", "Carol", "carol@example.com")
        .await
        .unwrap();
    dir.add_source_ip(carol.id, "100.64.0.50/32".parse().unwrap(), "desk")
        .await
        .unwrap();
    let backend = dir
        .create_backend("app-01", "192.0.2.20", None, true, false)
        .await
        .unwrap();
    gw.routing
        .bind(ip("10.0.160.131"), backend.id, "tests")
        .await
        .unwrap();

    // One candidate already expired, one rejects the login. The reported
    // reason is the one closest to admission.
    let mut expired = ssh_policy(carol.id, ScopeKind::Server, backend.id);
    expired.starts_at = Utc::now() - chrono::Duration::hours(10);
    expired.ends_at = Some(Utc::now() - chrono::Duration::hours(2));
    gw.store.policies().create(&expired).await.unwrap();

    let mut wrong_login = ssh_policy(carol.id, ScopeKind::Server, backend.id);
    wrong_login.ssh_logins = vec!["deploy".to_owned()];
    gw.store.policies().create(&wrong_login).await.unwrap();

    let Decision::Deny(reason) = gw
        .engine
        .decide(ip("100.64.0.50"), ip("10.0.160.131"), Protocol::Ssh, Some("root"))
        .await
        .unwrap()
    else {
        panic!("must deny");
    };
    assert_eq!(reason, DenyReason::LoginNotPermitted);
}

#[tokio::test]
async fn schedule_window_gates_admission() {
    let gw = gateway().await;
    let dir = gw.store.directory();

    let dave = dir
        .create_person("dave", "Dave", "dave@example.com")
        .await
        .unwrap();
    dir.add_source_ip(dave.id, "100.64.0.60/32".parse().unwrap(), "desk")
        .await
        .unwrap();
    let backend = dir
        .create_backend("app-02", "192.0.2.21", None, true, false)
        .await
        .unwrap();
    gw.routing
        .bind(ip("10.0.160.132"), backend.id, "tests")
        .await
        .unwrap();

    // A one-minute window on a weekday at least two days away from now,
    // so the test is deterministic regardless of when it runs.
    let today = Utc::now().weekday().num_days_from_monday();
    let far_day = (today + 3) % 7;
    let mut policy = ssh_policy(dave.id, ScopeKind::Server, backend.id);
    policy.schedule = Some(WeeklySchedule {
        days: 1 << far_day,
        start: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        end: chrono::NaiveTime::from_hms_opt(0, 1, 0).unwrap(),
        zone: chrono_tz::Tz::UTC,
    });
    gw.store.policies().create(&policy).await.unwrap();

    let Decision::Deny(reason) = gw
        .engine
        .decide(ip("100.64.0.60"), ip("10.0.160.132"), Protocol::Ssh, None)
        .await
        .unwrap()
    else {
        panic!("outside the window must deny");
    };
    assert_eq!(reason, DenyReason::OutsideSchedule);
}

#[tokio::test]
async fn group_graph_operations_guard_cycles_and_depth() {
    let gw = gateway().await;
    let dir = gw.store.directory();

    let root = dir
        .create_group(GroupKind::Server, "root", None)
        .await
        .unwrap();
    let mid = dir
        .create_group(GroupKind::Server, "mid", Some(root.id))
        .await
        .unwrap();
    let leaf = dir
        .create_group(GroupKind::Server, "leaf", Some(mid.id))
        .await
        .unwrap();

    // Closing the loop is refused both by the engine check and at write
    // time.
    assert!(
        !gw.engine
            .validate_no_cycle(GroupKind::Server, root.id, Some(leaf.id))
            .await
            .unwrap()
    );
    assert!(
        dir.set_group_parent(GroupKind::Server, root.id, Some(leaf.id))
            .await
            .is_err()
    );

    // The closure of the root covers the whole chain.
    let closure = gw
        .engine
        .group_closure(GroupKind::Server, root.id)
        .await
        .unwrap();
    assert!(closure.contains(&root.id));
    assert!(closure.contains(&mid.id));
    assert!(closure.contains(&leaf.id));

    // A sibling re-parent is fine.
    assert!(
        gw.engine
            .validate_no_cycle(GroupKind::Server, leaf.id, Some(root.id))
            .await
            .unwrap()
    );
    dir.set_group_parent(GroupKind::Server, leaf.id, Some(root.id))
        .await
        .unwrap();
}

#[tokio::test]
async fn user_group_policies_cover_members_transitively() {
    let gw = gateway().await;
    let dir = gw.store.directory();

    let erin = dir
        .create_person("erin", "Erin", "erin@example.com")
        .await
        .unwrap();
    dir.add_source_ip(erin.id, "100.64.0.70/32".parse().unwrap(), "desk")
        .await
        .unwrap();
    let backend = dir
        .create_backend("app-03", "192.0.2.22", None, true, false)
        .await
        .unwrap();
    gw.routing
        .bind(ip("10.0.160.133"), backend.id, "tests")
        .await
        .unwrap();

    // erin ∈ dba ⊂ ops; the grant is on ops.
    let ops = dir.create_group(GroupKind::User, "ops", None).await.unwrap();
    let dba = dir
        .create_group(GroupKind::User, "dba", Some(ops.id))
        .await
        .unwrap();
    dir.add_user_group_member(dba.id, erin.id).await.unwrap();

    let mut policy = ssh_policy(ops.id, ScopeKind::Server, backend.id);
    policy.subject_kind = gatehouse::policy::SubjectKind::UserGroup;
    gw.store.policies().create(&policy).await.unwrap();

    assert!(
        gw.engine
            .decide(ip("100.64.0.70"), ip("10.0.160.133"), Protocol::Ssh, Some("erin"))
            .await
            .unwrap()
            .is_admit()
    );
}
