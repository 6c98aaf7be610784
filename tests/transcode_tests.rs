#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

//! Transcode queue: caps, rush ordering, and a worker run against a
//! stand-in transcoder binary.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Gateway, gateway, ip};
use gatehouse::core::errors::GatewayError;
use gatehouse::core::stay::{Protocol, Stay, TerminationReason};
use gatehouse::store::JobStatus;
use gatehouse::transcode::{JobLimits, TranscodeQueue};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Insert a closed RDP stay and return its id.
async fn closed_rdp_stay(gw: &Gateway) -> Uuid {
    let stay = Stay::open(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Protocol::Rdp,
        ip("100.64.0.39"),
        ip("10.0.160.130"),
    );
    gw.store.stays().insert_admitted(&stay, "bob").await.unwrap();
    gw.store
        .stays()
        .close(stay.id, TerminationReason::ClientClosed, None, 0, 0, 0)
        .await
        .unwrap();
    stay.id
}

#[tokio::test]
async fn s5_queue_caps_and_rush_ordering() {
    let gw = gateway().await;
    let queue = TranscodeQueue::new(
        Arc::clone(&gw.store),
        Arc::clone(&gw.config),
        JobLimits::default(),
    );

    // Two jobs claimed by workers, ten waiting: the queue is at capacity.
    let mut jobs = Vec::new();
    for _ in 0..2 {
        let stay_id = closed_rdp_stay(&gw).await;
        jobs.push(queue.enqueue(stay_id).await.unwrap());
        gw.store.transcode().claim().await.unwrap().unwrap();
    }
    for _ in 0..10 {
        let stay_id = closed_rdp_stay(&gw).await;
        jobs.push(queue.enqueue(stay_id).await.unwrap());
    }

    let (pending, running) = gw.store.transcode().counts().await.unwrap();
    assert_eq!((pending, running), (10, 2));

    // The thirteenth submission is refused outright.
    let stay_id = closed_rdp_stay(&gw).await;
    let overflow = queue.enqueue(stay_id).await;
    assert!(matches!(
        overflow,
        Err(GatewayError::ResourceExhausted { .. })
    ));

    // Rushing the last job promotes it past nine older pending jobs.
    let rushed = queue.rush(jobs[11].id).await.unwrap();
    assert!(rushed.priority > 0);

    let next = gw.store.transcode().claim().await.unwrap().unwrap();
    assert_eq!(next.id, jobs[11].id);

    // After the rushed job, FIFO order resumes.
    let next = gw.store.transcode().claim().await.unwrap().unwrap();
    assert_eq!(next.id, jobs[2].id);
}

#[tokio::test]
async fn enqueue_validates_the_stay() {
    let gw = gateway().await;
    let queue = TranscodeQueue::new(
        Arc::clone(&gw.store),
        Arc::clone(&gw.config),
        JobLimits::default(),
    );

    assert!(matches!(
        queue.enqueue(Uuid::new_v4()).await,
        Err(GatewayError::NotFound { .. })
    ));

    // Open stays cannot be transcoded yet.
    let stay = Stay::open(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Protocol::Rdp,
        ip("100.64.0.39"),
        ip("10.0.160.130"),
    );
    gw.store.stays().insert_admitted(&stay, "bob").await.unwrap();
    assert!(matches!(
        queue.enqueue(stay.id).await,
        Err(GatewayError::Conflict { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn worker_runs_a_job_to_done_with_progress() {
    let gw = gateway().await;

    // Stand-in transcoder: reports two frames, then copies the replay to
    // the output path.
    let bin = gw.dir.path().join("fake-transcode");
    std::fs::write(
        &bin,
        "#!/bin/sh\necho \"frame 1 of 2\"\necho \"frame 2 of 2\"\ncp \"$1\" \"$2\"\n",
    )
    .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut config = common::test_config(gw.dir.path().to_path_buf());
    config.transcoder_bin = bin;
    let config = Arc::new(config);
    config.ensure_dirs().unwrap();

    let stay_id = closed_rdp_stay(&gw).await;
    let replay = config.rdp_replay_path(stay_id);
    std::fs::write(&replay, b"opaque replay bytes").unwrap();

    let queue = TranscodeQueue::new(Arc::clone(&gw.store), Arc::clone(&config), JobLimits::default());
    let job = queue.enqueue(stay_id).await.unwrap();

    let cancel = CancellationToken::new();
    let workers = tokio::spawn(Arc::clone(&queue).run_workers(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let finished = loop {
        let current = gw.store.transcode().by_id(job.id).await.unwrap().unwrap();
        match current.status {
            JobStatus::Done => break current,
            JobStatus::Failed => panic!("job failed: {:?}", current.error),
            _ if tokio::time::Instant::now() > deadline => {
                panic!("job did not finish: {current:?}")
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    };

    assert_eq!((finished.progress, finished.total), (2, 2));
    let output = finished.output_path.expect("output path recorded");
    assert_eq!(output, config.rdp_mp4_path(stay_id));
    assert_eq!(std::fs::read(&output).unwrap(), b"opaque replay bytes");
    // The tempfile was renamed, not left behind.
    assert!(!output.with_extension("mp4.part").exists());

    cancel.cancel();
    let _ = workers.await;
}
