#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

//! Stay lifecycle: expiry, revocation fan-out, RDP dedup, and the
//! startup sweep, over fully wired components.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Gateway, gateway, ip, ssh_policy};
use gatehouse::core::expiry::ExpiryTicker;
use gatehouse::core::registry::{SessionRegistry, StayEvent};
use gatehouse::core::stay::{Protocol, SessionKind, TerminationReason};
use gatehouse::policy::{Decision, ScopeKind};
use tokio_util::sync::CancellationToken;

/// Seed a person, a bound backend, and a policy whose grant lasts `ttl`.
async fn seed_short_grant(
    gw: &Gateway,
    protocol: Protocol,
    ttl: chrono::Duration,
) -> gatehouse::policy::Admission {
    let dir = gw.store.directory();
    let bob = dir
        .create_person("bob", "Bob", "bob@example.com")
        .await
        .unwrap();
    dir.add_source_ip(bob.id, "100.64.0.39/32".parse().unwrap(), "desk")
        .await
        .unwrap();

    let backend = dir
        .create_backend(
            "win-01",
            "192.0.2.30",
            None,
            protocol == Protocol::Ssh,
            protocol == Protocol::Rdp,
        )
        .await
        .unwrap();
    gw.routing
        .bind(ip("10.0.160.130"), backend.id, "tests")
        .await
        .unwrap();

    let mut policy = ssh_policy(bob.id, ScopeKind::Server, backend.id);
    policy.protocol = Some(protocol);
    policy.ends_at = Some(Utc::now() + ttl);
    gw.store.policies().create(&policy).await.unwrap();

    let decision = gw
        .engine
        .decide(ip("100.64.0.39"), ip("10.0.160.130"), protocol, None)
        .await
        .unwrap();
    match decision {
        Decision::Admit(admission) => admission,
        Decision::Deny(reason) => panic!("seed grant denied: {reason}"),
    }
}

#[tokio::test]
async fn s3_expiry_warns_then_kills_within_two_seconds() {
    let gw = gateway().await;
    let admission = seed_short_grant(&gw, Protocol::Ssh, chrono::Duration::milliseconds(1500)).await;

    let stay = gw
        .registry
        .open(
            &admission,
            Protocol::Ssh,
            ip("100.64.0.39"),
            ip("10.0.160.130"),
            Some("bob".into()),
            "bob",
        )
        .await
        .unwrap();
    let mut events = stay.subscribe();

    let ticker = ExpiryTicker::new(Arc::clone(&gw.registry), Arc::clone(&gw.engine));
    let cancel = CancellationToken::new();
    let ticker_task = tokio::spawn(ticker.run(cancel.clone()));

    // A grant this short collapses the warning ladder to the one-minute
    // line; it must precede the kill, and the kill must be observed
    // within the 2 s bound of the expiry instant.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(3500);
    let mut saw_warning = false;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("termination not observed in time")
            .unwrap();
        match event {
            StayEvent::Warning { minutes } => {
                assert_eq!(minutes, 1);
                saw_warning = true;
            }
            StayEvent::Terminate { reason } => {
                assert_eq!(reason, TerminationReason::PolicyExpired);
                break;
            }
        }
    }
    assert!(saw_warning, "expiry must be preceded by a warning line");

    // The front-end reacts to the signal; the record keeps the signal's
    // reason even though the connection close looks client-initiated.
    stay.finish(TerminationReason::ClientClosed).await.unwrap();
    let row = gw.store.stays().by_id(stay.id()).await.unwrap().unwrap();
    assert_eq!(row.termination_reason, Some(TerminationReason::PolicyExpired));

    cancel.cancel();
    let _ = ticker_task.await;
}

#[tokio::test]
async fn revocation_reaches_live_stays_within_two_seconds() {
    let gw = gateway().await;
    let admission = seed_short_grant(&gw, Protocol::Ssh, chrono::Duration::hours(8)).await;

    let stay = gw
        .registry
        .open(
            &admission,
            Protocol::Ssh,
            ip("100.64.0.39"),
            ip("10.0.160.130"),
            Some("bob".into()),
            "bob",
        )
        .await
        .unwrap();
    let mut events = stay.subscribe();

    let ticker = ExpiryTicker::new(Arc::clone(&gw.registry), Arc::clone(&gw.engine));
    let cancel = CancellationToken::new();
    let ticker_task = tokio::spawn(ticker.run(cancel.clone()));

    // Revocation arrives through the store, as the CLI does it from
    // another process.
    gw.store
        .policies()
        .revoke(admission.policy_id, "ops")
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("revocation not observed within 2s")
        .unwrap();
    assert_eq!(
        event,
        StayEvent::Terminate {
            reason: TerminationReason::Revoked
        }
    );

    stay.finish(TerminationReason::ClientClosed).await.unwrap();
    let row = gw.store.stays().by_id(stay.id()).await.unwrap().unwrap();
    assert_eq!(row.termination_reason, Some(TerminationReason::Revoked));

    cancel.cancel();
    let _ = ticker_task.await;
}

#[tokio::test]
async fn s4_rdp_subconnections_dedup_into_one_stay() {
    let gw = gateway().await;
    let admission = seed_short_grant(&gw, Protocol::Rdp, chrono::Duration::hours(8)).await;

    let mut handles = Vec::new();
    let mut session_ids = Vec::new();
    for _ in 0..4 {
        let handle = gw
            .registry
            .open(
                &admission,
                Protocol::Rdp,
                ip("100.64.0.39"),
                ip("10.0.160.130"),
                None,
                "bob",
            )
            .await
            .unwrap();
        session_ids.push(handle.open_session(SessionKind::Rdp).await.unwrap());
        handles.push(handle);
    }

    let stay_id = handles[0].id();
    assert!(handles.iter().all(|h| h.id() == stay_id), "one stay");
    assert_eq!(
        gw.store.stays().sessions_of(stay_id).await.unwrap().len(),
        4
    );

    // Bringing the last connection down arms the 10 s linger; the stay
    // is still live right after.
    for (handle, session_id) in handles.iter().zip(&session_ids) {
        handle.close_session(*session_id).await.unwrap();
    }
    let row = gw.store.stays().by_id(stay_id).await.unwrap().unwrap();
    assert!(row.is_active(), "stay survives the reconnect window");
}

#[tokio::test]
async fn startup_sweep_closes_stays_from_a_dead_process() {
    let gw = gateway().await;
    let admission = seed_short_grant(&gw, Protocol::Ssh, chrono::Duration::hours(8)).await;

    let stay = gw
        .registry
        .open(
            &admission,
            Protocol::Ssh,
            ip("100.64.0.39"),
            ip("10.0.160.130"),
            None,
            "bob",
        )
        .await
        .unwrap();
    let stay_id = stay.id();

    // A new registry over the same store stands in for a process restart.
    let _restarted = SessionRegistry::new(Arc::clone(&gw.store)).await.unwrap();

    let row = gw.store.stays().by_id(stay_id).await.unwrap().unwrap();
    assert!(!row.is_active());
    assert_eq!(row.termination_reason, Some(TerminationReason::Error));
}
