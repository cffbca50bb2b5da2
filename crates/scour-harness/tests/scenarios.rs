//! Whole-cluster scenarios: one simulated leader plus engines driven through
//! the operator surface, asserting reports, repairs, and bookmarks.

use std::time::Duration;

use scour_check::seq::seq_origin;
use scour_check::StartRequest;
use scour_core::policy::PolicyEntry;
use scour_core::types::{
    InconsistClass, InstanceStatus, PoolStatus, RepairAction, StartFlags, TargetState,
};
use scour_core::{CheckError, LEADER_RANK};
use scour_harness::{init_tracing, SimCluster, SimWorld};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(30);

fn pool_uuid(tail: u8) -> Uuid {
    Uuid::from_u128(tail as u128)
}

/// Orphan pool, auto-readd: engines hold the pool with a valid PS clue, the
/// MS has never heard of it. Default policy re-registers it and the check
/// runs to completion.
#[tokio::test(start_paused = true)]
async fn orphan_pool_auto_readd() {
    init_tracing();
    let world = SimWorld::new();
    let orphan = pool_uuid(1);
    world.add_healthy_pool(orphan, &[3], &[3], Some("alpha"));

    let cluster = SimCluster::new(&[0, 1, 3], world).await.unwrap();
    cluster.start(StartFlags::default()).await.unwrap();

    let report = cluster
        .sink
        .wait_for(InconsistClass::PoolNonexistOnMs, WAIT)
        .await
        .expect("orphan pool report");
    assert_eq!(report.action, RepairAction::Readd);
    assert_eq!(report.pool_uuid.as_deref(), Some(orphan.to_string().as_str()));

    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await,
        "instance should complete"
    );
    assert_eq!(cluster.leader.instance().bk.lock().await.phase.to_string(), "done");

    // One MS re-registration happened and the pool came back exported.
    assert_eq!(*cluster.world.ms_registered.lock().unwrap(), vec![orphan]);
    assert!(cluster.world.ms.lock().unwrap().contains_key(&orphan));
    let pool = cluster.world.pool(orphan).unwrap();
    assert!(pool.exported);

    // The leader's pool bookmark finished CHECKED.
    let bk = cluster
        .leader
        .instance()
        .store
        .fetch_pool(orphan)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bk.status, PoolStatus::Checked);
}

/// Dangling pool under dryrun: the MS lists a pool no engine has. The
/// default repair is reported but the deregistration is not executed.
#[tokio::test(start_paused = true)]
async fn dangling_pool_dryrun() {
    init_tracing();
    let world = SimWorld::new();
    let dangling = pool_uuid(2);
    world.register_on_ms(dangling, None);

    let cluster = SimCluster::new(&[0, 1], world).await.unwrap();
    cluster
        .start(StartFlags {
            dryrun: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let report = cluster
        .sink
        .wait_for(InconsistClass::PoolNonexistOnEngine, WAIT)
        .await
        .expect("dangling pool report");
    assert_eq!(report.action, RepairAction::Discard);
    assert_eq!(report.rank, LEADER_RANK);

    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await
    );

    // Dryrun: no deregistration reached the MS.
    assert!(cluster.world.ms_deregistered.lock().unwrap().is_empty());
    assert!(cluster.world.ms.lock().unwrap().contains_key(&dangling));

    let bk = cluster
        .leader
        .instance()
        .store
        .fetch_pool(dangling)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bk.phase.to_string(), "done");
    assert_eq!(bk.statistics.repaired, 1);
    assert_eq!(bk.statistics.failed, 0);
}

/// Interactive label conflict: the operator chooses TRUST_PS with for-all;
/// the policy persists and a later conflict of the same class resolves
/// without prompting.
#[tokio::test(start_paused = true)]
async fn interactive_label_conflict_for_all() {
    init_tracing();
    let world = SimWorld::new();
    let first = pool_uuid(0x11);
    world.add_healthy_pool(first, &[1, 2], &[1, 2], Some("alpha"));
    world.register_on_ms(first, Some("beta"));

    let cluster = SimCluster::new(&[0, 1, 2], world).await.unwrap();

    cluster
        .leader
        .start(StartRequest {
            ranks: vec![0, 1, 2],
            policies: vec![PolicyEntry {
                class: InconsistClass::PoolBadLabel,
                action: RepairAction::Interact,
            }],
            pools: Vec::new(),
            flags: StartFlags::default(),
            phase_limit: None,
        })
        .await
        .unwrap();

    let report = cluster
        .sink
        .wait_for(InconsistClass::PoolBadLabel, WAIT)
        .await
        .expect("label conflict report");
    assert_eq!(report.action, RepairAction::Interact);
    assert_eq!(
        report.act_choices,
        vec![
            RepairAction::TrustMs,
            RepairAction::TrustPs,
            RepairAction::Ignore
        ]
    );
    assert_eq!(report.act_msgs.len(), 3);

    cluster
        .leader
        .act(report.seq, RepairAction::TrustPs, true)
        .await
        .unwrap();

    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await
    );
    // The PS label won; the pending table drained.
    assert_eq!(
        cluster.world.ms.lock().unwrap().get(&first).cloned().flatten(),
        Some("alpha".to_string())
    );
    assert!(cluster.leader.instance().pending.read().await.is_empty());

    let (policies, _) = cluster.leader.prop().await.unwrap();
    let label_policy = policies
        .iter()
        .find(|entry| entry.class == InconsistClass::PoolBadLabel)
        .unwrap();
    assert_eq!(label_policy.action, RepairAction::TrustPs);

    // A second instance with a fresh conflict of the same class resolves
    // from the persisted policy, no interaction.
    let second = pool_uuid(0x12);
    cluster
        .world
        .add_healthy_pool(second, &[1, 2], &[1, 2], Some("gamma"));
    cluster.world.register_on_ms(second, Some("delta"));

    cluster
        .start(StartFlags {
            reset: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    let reports = loop {
        let reports: Vec<_> = cluster
            .sink
            .reports_of(InconsistClass::PoolBadLabel)
            .into_iter()
            .filter(|report| report.pool_uuid.as_deref() == Some(second.to_string().as_str()))
            .collect();
        if !reports.is_empty() {
            break reports;
        }
        assert!(tokio::time::Instant::now() < deadline, "no second-pool report");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(reports[0].action, RepairAction::TrustPs);
    assert!(reports[0].act_choices.is_empty());

    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await
    );
    assert_eq!(
        cluster.world.ms.lock().unwrap().get(&second).cloned().flatten(),
        Some("gamma".to_string())
    );
}

/// Rank death during the check: the first dead rank is evicted with group
/// version gen − 1 and unrelated pools keep going; losing the unique PS
/// replica of a pool fails that pool.
#[tokio::test(start_paused = true)]
async fn rank_death_during_check() {
    init_tracing();
    let world = SimWorld::new();
    let survivor_pool = pool_uuid(0x41);
    world.add_healthy_pool(survivor_pool, &[0, 1, 7], &[0, 1], Some("alpha"));
    world.register_on_ms(survivor_pool, Some("beta"));
    let doomed_pool = pool_uuid(0x42);
    world.add_healthy_pool(doomed_pool, &[8], &[8], Some("gamma"));
    world.register_on_ms(doomed_pool, Some("delta"));

    let cluster = SimCluster::new(&[0, 1, 7, 8], world).await.unwrap();
    cluster
        .leader
        .start(StartRequest {
            ranks: vec![0, 1, 7, 8],
            policies: vec![PolicyEntry {
                class: InconsistClass::PoolBadLabel,
                action: RepairAction::Interact,
            }],
            pools: Vec::new(),
            flags: StartFlags::default(),
            phase_limit: None,
        })
        .await
        .unwrap();

    // Both pools park on their label interactions.
    let deadline = tokio::time::Instant::now() + WAIT;
    let reports = loop {
        let reports = cluster.sink.reports_of(InconsistClass::PoolBadLabel);
        if reports.len() >= 2 {
            break reports;
        }
        assert!(tokio::time::Instant::now() < deadline, "label reports missing");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let gen = cluster.leader.instance().gen().await;

    // Rank 7 dies; it leads no pool service.
    cluster.kill(7);
    let deadline = tokio::time::Instant::now() + WAIT;

    while cluster.transport.group_version() != (gen as u32).wrapping_sub(1) {
        assert!(tokio::time::Instant::now() < deadline, "mark not published");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        *cluster.leader.instance().ranks.lock().await,
        vec![0, 1, 8]
    );
    assert_eq!(cluster.leader_status().await, InstanceStatus::Running);

    // Rank 8 dies too: the unique replica of the doomed pool.
    cluster.kill(8);
    while cluster.transport.group_version() != (gen as u32).wrapping_sub(2) {
        assert!(tokio::time::Instant::now() < deadline, "second mark not published");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Release both pools; the survivor completes, the doomed one fails.
    for report in reports {
        let _ = cluster
            .leader
            .act(report.seq, RepairAction::TrustMs, false)
            .await;
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let survivor = cluster
            .leader
            .instance()
            .store
            .fetch_pool(survivor_pool)
            .await
            .unwrap();
        let doomed = cluster
            .leader
            .instance()
            .store
            .fetch_pool(doomed_pool)
            .await
            .unwrap();
        let survivor_done = survivor
            .as_ref()
            .is_some_and(|bk| bk.status == PoolStatus::Checked);
        let doomed_failed = doomed
            .as_ref()
            .is_some_and(|bk| bk.status == PoolStatus::Failed);
        if survivor_done && doomed_failed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pools did not settle: {survivor:?} / {doomed:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Crash and rejoin: a restarted engine finds its bookmark RUNNING, pauses
/// it, rejoins the live instance, and resumes at the persisted phase with
/// an empty pending table.
#[tokio::test(start_paused = true)]
async fn crash_and_rejoin() {
    init_tracing();
    let world = SimWorld::new();
    let pool = pool_uuid(0x51);
    world.add_healthy_pool(pool, &[1], &[1], Some("alpha"));
    world.register_on_ms(pool, Some("alpha"));
    let cont = Uuid::from_u128(0xc1);
    world.add_container(pool, cont, true);
    {
        let mut pools = world.pools.lock().unwrap();
        let rec = pools.get_mut(&pool).unwrap();
        rec.cont_ps_labels.insert(cont, Some("ps-side".into()));
        rec.cont_target_labels.insert(cont, Some("tgt-side".into()));
    }

    let mut cluster = SimCluster::new(&[0, 1], world).await.unwrap();
    cluster
        .leader
        .start(StartRequest {
            ranks: vec![0, 1],
            policies: vec![PolicyEntry {
                class: InconsistClass::ContBadLabel,
                action: RepairAction::Interact,
            }],
            pools: Vec::new(),
            flags: StartFlags::default(),
            phase_limit: None,
        })
        .await
        .unwrap();

    // The engine-side container interaction parks the pool worker.
    let first = cluster
        .sink
        .wait_for(InconsistClass::ContBadLabel, WAIT)
        .await
        .expect("container label report");
    assert_eq!(seq_origin(first.seq), 1);
    assert_eq!(first.rank, 1);

    // Crash rank 1 and bring a fresh process up on the same sys DB.
    let engine = cluster.restart_engine(1).await.unwrap();
    assert_eq!(
        engine.instance().bk.lock().await.status,
        InstanceStatus::Paused,
        "RUNNING at boot must be rewritten to PAUSED"
    );
    assert!(engine.instance().pending.read().await.is_empty());

    engine.rejoin().await.unwrap();
    assert!(engine.instance().sched_running());
    assert!(engine.instance().orphan_done());
    let resumed_phase = engine
        .instance()
        .store
        .fetch_pool(pool)
        .await
        .unwrap()
        .unwrap()
        .phase;
    assert!(resumed_phase >= scour_core::types::CheckPhase::ContList);

    // The resumed worker re-detects the conflict; answer it and finish.
    let deadline = tokio::time::Instant::now() + WAIT;
    let second = loop {
        let reports = cluster.sink.reports_of(InconsistClass::ContBadLabel);
        if let Some(report) = reports.into_iter().find(|report| report.seq != first.seq) {
            break report;
        }
        assert!(tokio::time::Instant::now() < deadline, "no resumed report");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    cluster
        .leader
        .act(second.seq, RepairAction::TrustPs, false)
        .await
        .unwrap();

    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await
    );
    let rec = cluster.world.pool(pool).unwrap();
    assert_eq!(
        rec.cont_target_labels.get(&cont).cloned().flatten(),
        Some("ps-side".to_string())
    );
}

/// Report-sequence collision: the second interactive report with a stolen
/// sequence is refused with AGAIN; regenerating yields two live pendings.
#[tokio::test(start_paused = true)]
async fn report_seq_collision() {
    init_tracing();
    let world = SimWorld::new();
    let pool = pool_uuid(0x61);
    world.add_healthy_pool(pool, &[1, 2], &[1, 2], Some("alpha"));
    world.register_on_ms(pool, Some("beta"));

    let cluster = SimCluster::new(&[0, 1, 2], world).await.unwrap();
    cluster
        .leader
        .start(StartRequest {
            ranks: vec![0, 1, 2],
            policies: vec![PolicyEntry {
                class: InconsistClass::PoolBadLabel,
                action: RepairAction::Interact,
            }],
            pools: Vec::new(),
            flags: StartFlags::default(),
            phase_limit: None,
        })
        .await
        .unwrap();

    let parked = cluster
        .sink
        .wait_for(InconsistClass::PoolBadLabel, WAIT)
        .await
        .expect("parked interaction");

    // A remote report re-using the same sequence collides.
    let gen = cluster.leader.instance().gen().await;
    let mut unit = scour_core::report::ReportUnit::new(
        gen,
        InconsistClass::ContBadLabel,
        RepairAction::Interact,
        1,
    );
    unit.seq = parked.seq;
    unit.pool = Some(pool);
    unit.options = vec![RepairAction::Discard, RepairAction::Ignore];
    let collision = cluster.leader.report(&mut unit, false).await;
    assert_eq!(collision, Err(CheckError::Again));

    // Regenerate (seq 0) and retry: two distinct sequences are pending.
    unit.seq = 0;
    cluster.leader.report(&mut unit, false).await.unwrap();
    assert_ne!(unit.seq, parked.seq);
    assert_eq!(cluster.leader.instance().pending.read().await.len(), 2);

    // Unwind so the instance can finish. No engine ever parked on the
    // synthetic report, so the remote leg of the act may miss.
    let _ = cluster.leader.act(unit.seq, RepairAction::Ignore, false).await;
    cluster
        .leader
        .act(parked.seq, RepairAction::TrustMs, false)
        .await
        .unwrap();
    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await
    );
}

/// Stop is idempotent: the second stop at the same generation answers
/// ALREADY and changes nothing.
#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    init_tracing();
    let world = SimWorld::new();
    let pool = pool_uuid(0x71);
    world.add_healthy_pool(pool, &[1], &[1], Some("alpha"));
    world.register_on_ms(pool, Some("beta"));

    let cluster = SimCluster::new(&[0, 1], world).await.unwrap();
    cluster
        .leader
        .start(StartRequest {
            ranks: vec![0, 1],
            policies: vec![PolicyEntry {
                class: InconsistClass::PoolBadLabel,
                action: RepairAction::Interact,
            }],
            pools: Vec::new(),
            flags: StartFlags::default(),
            phase_limit: None,
        })
        .await
        .unwrap();
    cluster
        .sink
        .wait_for(InconsistClass::PoolBadLabel, WAIT)
        .await
        .expect("parked interaction");

    // The instance is visibly running before the stop.
    let query = cluster.leader.query(0, Vec::new()).await.unwrap();
    assert_eq!(query.status, InstanceStatus::Running);
    assert_eq!(
        query.pool_summary(),
        vec![(pool, PoolStatus::Checking)],
        "the parked pool is still being checked"
    );

    cluster.leader.stop(0, Vec::new()).await.unwrap();
    assert_eq!(cluster.leader_status().await, InstanceStatus::Stopped);

    let again = cluster.leader.stop(0, Vec::new()).await;
    assert_eq!(again, Err(CheckError::Already));
    assert_eq!(cluster.leader_status().await, InstanceStatus::Stopped);

    let bk = cluster
        .leader
        .instance()
        .store
        .fetch_pool(pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bk.status, PoolStatus::Stopped);
}

/// No-quorum boundaries: with a computable advice replica the interaction
/// offers TRUST_PS; with no service state at all it offers only
/// DISCARD/IGNORE.
#[tokio::test(start_paused = true)]
async fn no_quorum_option_sets() {
    init_tracing();
    let world = SimWorld::new();

    // Three-replica cohort with a single surviving replica: no majority,
    // but an advice index exists.
    let lame = pool_uuid(0x81);
    world.add_healthy_pool(lame, &[1, 2], &[1, 2, 3], Some("alpha"));
    world.register_on_ms(lame, Some("alpha"));
    {
        let mut pools = world.pools.lock().unwrap();
        let rec = pools.get_mut(&lame).unwrap();
        rec.shards.get_mut(&2).unwrap().svc = None;
    }

    // No shard carries service state at all.
    let dead = pool_uuid(0x82);
    world.add_healthy_pool(dead, &[1, 2], &[1, 2], Some("beta"));
    world.register_on_ms(dead, Some("beta"));
    {
        let mut pools = world.pools.lock().unwrap();
        let rec = pools.get_mut(&dead).unwrap();
        for shard in rec.shards.values_mut() {
            shard.svc = None;
        }
    }

    let cluster = SimCluster::new(&[0, 1, 2], world).await.unwrap();
    cluster
        .leader
        .start(StartRequest {
            ranks: vec![0, 1, 2],
            policies: vec![PolicyEntry {
                class: InconsistClass::PoolLessSvcWithoutQuorum,
                action: RepairAction::Interact,
            }],
            pools: Vec::new(),
            flags: StartFlags::default(),
            phase_limit: None,
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    let reports = loop {
        let reports = cluster
            .sink
            .reports_of(InconsistClass::PoolLessSvcWithoutQuorum);
        if reports.len() >= 2 {
            break reports;
        }
        assert!(tokio::time::Instant::now() < deadline, "quorum reports missing");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let lame_report = reports
        .iter()
        .find(|report| report.pool_uuid.as_deref() == Some(lame.to_string().as_str()))
        .expect("report for the lame pool");
    assert_eq!(
        lame_report.act_choices,
        vec![
            RepairAction::TrustPs,
            RepairAction::Discard,
            RepairAction::Ignore
        ]
    );

    let dead_report = reports
        .iter()
        .find(|report| report.pool_uuid.as_deref() == Some(dead.to_string().as_str()))
        .expect("report for the dead pool");
    assert_eq!(
        dead_report.act_choices,
        vec![RepairAction::Discard, RepairAction::Ignore]
    );

    // Unwind.
    for report in &reports {
        let _ = cluster
            .leader
            .act(report.seq, RepairAction::Ignore, false)
            .await;
    }
    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await
    );
}

/// Every engine-originated report encodes its origin rank in the sequence.
#[tokio::test(start_paused = true)]
async fn report_seq_carries_origin_rank() {
    init_tracing();
    let world = SimWorld::new();
    let pool = pool_uuid(0x91);
    world.add_healthy_pool(pool, &[1, 2], &[1, 2], Some("alpha"));
    world.register_on_ms(pool, Some("alpha"));
    // An orphan target on rank 2: present locally, DOWN in the map.
    {
        let mut pools = world.pools.lock().unwrap();
        let rec = pools.get_mut(&pool).unwrap();
        let shard = rec.shards.get_mut(&2).unwrap();
        shard.targets = vec![TargetState::Normal, TargetState::Normal];
        let dom = rec
            .map
            .domains
            .iter_mut()
            .find(|dom| dom.rank == 2)
            .unwrap();
        dom.targets.push(scour_core::poolmap::MapTarget {
            index: 1,
            state: scour_core::poolmap::MapEntryState::DownOut,
            fseq: 0,
            checked: false,
        });
    }

    let cluster = SimCluster::new(&[0, 1, 2], world).await.unwrap();
    cluster.start(StartFlags::default()).await.unwrap();

    let report = cluster
        .sink
        .wait_for(InconsistClass::EngineDownInMap, WAIT)
        .await
        .expect("orphan target report");
    assert_eq!(report.action, RepairAction::Discard);
    assert_eq!(seq_origin(report.seq), report.rank);

    assert!(
        cluster
            .wait_leader_status(InstanceStatus::Completed, WAIT)
            .await
    );
}
