//! Collective-RPC helpers.
//!
//! One aggregation rule everywhere: a hard error from any child propagates
//! (first one wins), flag fields OR together, subordinate arrays
//! concatenate. Transient transport errors are retried with a 1 s back-off
//! until the instance pauses.

use std::time::Duration;

use scour_core::clue::PoolClue;
use scour_core::ports::ClusterTransport;
use scour_core::rpc::{
    ActIn, CheckReply, CheckRequest, ContListIn, MarkIn, PoolMbsIn, PoolShardInfo, PoolStartIn,
    QueryIn, StartIn, StopIn,
};
use scour_core::types::Rank;
use scour_core::{CheckError, Result};
use uuid::Uuid;

use crate::instance::{merge_ins_info, MergedInfo};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Send to one rank, retrying transient errors until `keep_going` fails.
pub async fn unicast_retry(
    transport: &dyn ClusterTransport,
    rank: Rank,
    req: CheckRequest,
    keep_going: impl Fn() -> bool,
) -> Result<CheckReply> {
    loop {
        match transport.unicast(rank, req.clone()).await {
            Err(err) if err.is_transient() => {
                if !keep_going() {
                    return Err(CheckError::Interrupted);
                }
                tracing::debug!(rank, opcode = req.opcode(), %err, "transient RPC error, retrying");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            other => return other,
        }
    }
}

fn unexpected(reply: CheckReply) -> CheckError {
    CheckError::Internal(format!("unexpected reply variant: {reply:?}"))
}

/// Aggregated START result.
#[derive(Debug, Default)]
pub struct StartAggregate {
    /// (origin rank, clue) for every shard reported by any engine.
    pub clues: Vec<(Rank, PoolClue)>,
    /// Ranks that had nothing to check for this instance.
    pub idle_ranks: Vec<Rank>,
}

pub async fn start_remote(
    transport: &dyn ClusterTransport,
    ranks: &[Rank],
    req: StartIn,
) -> Result<StartAggregate> {
    let replies = transport
        .collective(ranks, CheckRequest::Start(req))
        .await;
    let mut agg = StartAggregate::default();
    for (rank, reply) in replies {
        match reply? {
            CheckReply::Start(out) => {
                if out.nothing_to_do {
                    agg.idle_ranks.push(rank);
                }
                agg.clues
                    .extend(out.clues.into_iter().map(|clue| (rank, clue)));
            }
            other => return Err(unexpected(other)),
        }
    }
    Ok(agg)
}

/// Returns whether any engine actually stopped a pool.
pub async fn stop_remote(
    transport: &dyn ClusterTransport,
    ranks: &[Rank],
    gen: u64,
    pools: Vec<Uuid>,
) -> Result<bool> {
    let replies = transport
        .collective(ranks, CheckRequest::Stop(StopIn { gen, pools }))
        .await;
    let mut stopped = false;
    for (_, reply) in replies {
        match reply {
            Ok(CheckReply::Stop(out)) => stopped |= out.pool_stopped,
            // An engine whose instance already finished has nothing to stop.
            Err(CheckError::Already) | Err(CheckError::NotApplicable) => {}
            Ok(other) => return Err(unexpected(other)),
            Err(err) => return Err(err),
        }
    }
    Ok(stopped)
}

pub async fn query_remote(
    transport: &dyn ClusterTransport,
    ranks: &[Rank],
    gen: u64,
    pools: Vec<Uuid>,
    seed: MergedInfo,
) -> Result<(MergedInfo, Vec<PoolShardInfo>)> {
    let replies = transport
        .collective(ranks, CheckRequest::Query(QueryIn { gen, pools }))
        .await;
    let mut merged = seed;
    let mut shards = Vec::new();
    for (_, reply) in replies {
        match reply? {
            CheckReply::Query(out) => {
                merge_ins_info(
                    &mut merged,
                    MergedInfo {
                        gen: out.gen,
                        status: out.status,
                        phase: out.phase,
                    },
                );
                shards.extend(out.shards);
            }
            other => return Err(unexpected(other)),
        }
    }
    shards.sort_by(|a, b| (a.pool, a.rank).cmp(&(b.pool, b.rank)));
    Ok((merged, shards))
}

pub async fn mark_remote(
    transport: &dyn ClusterTransport,
    ranks: &[Rank],
    req: MarkIn,
) -> Result<()> {
    let replies = transport.collective(ranks, CheckRequest::Mark(req)).await;
    for (_, reply) in replies {
        match reply? {
            CheckReply::Mark => {}
            other => return Err(unexpected(other)),
        }
    }
    Ok(())
}

/// Unicast to the originating rank, or collective when `for_all`.
pub async fn act_remote(
    transport: &dyn ClusterTransport,
    ranks: &[Rank],
    origin: Rank,
    req: ActIn,
) -> Result<()> {
    if req.for_all {
        let replies = transport.collective(ranks, CheckRequest::Act(req)).await;
        for (_, reply) in replies {
            match reply? {
                CheckReply::Act => {}
                other => return Err(unexpected(other)),
            }
        }
        Ok(())
    } else {
        match transport.unicast(origin, CheckRequest::Act(req)).await? {
            CheckReply::Act => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

pub async fn cont_list_remote(
    transport: &dyn ClusterTransport,
    ranks: &[Rank],
    req: ContListIn,
) -> Result<Vec<Uuid>> {
    let replies = transport
        .collective(ranks, CheckRequest::ContList(req))
        .await;
    let mut conts = Vec::new();
    for (_, reply) in replies {
        match reply? {
            CheckReply::ContList(out) => conts.extend(out.conts),
            other => return Err(unexpected(other)),
        }
    }
    Ok(conts)
}

pub async fn pool_start_remote(
    transport: &dyn ClusterTransport,
    ranks: &[Rank],
    req: PoolStartIn,
) -> Result<()> {
    let replies = transport
        .collective(ranks, CheckRequest::PoolStart(req))
        .await;
    for (_, reply) in replies {
        match reply? {
            CheckReply::PoolStart => {}
            other => return Err(unexpected(other)),
        }
    }
    Ok(())
}

/// Deliver POOL_MBS to the pool-service leader.
///
/// The PS leader may still be electing; loop over the candidate ranks with a
/// small interval (split across the cohort) until one accepts, following any
/// redirect hint first. Only one RPC is in flight at a time per pool.
pub async fn pool_mbs_remote(
    transport: &dyn ClusterTransport,
    candidates: &[Rank],
    req: PoolMbsIn,
    keep_going: impl Fn() -> bool,
) -> Result<()> {
    if candidates.is_empty() {
        return Err(CheckError::Invalid("no PS candidates".into()));
    }
    let interval = Duration::from_millis(1000 / candidates.len() as u64);
    let mut idx = 0usize;
    let mut hinted: Option<Rank> = None;

    loop {
        if !keep_going() {
            return Err(CheckError::Interrupted);
        }
        let rank = hinted.take().unwrap_or(candidates[idx % candidates.len()]);
        match transport
            .unicast(rank, CheckRequest::PoolMbs(req.clone()))
            .await
        {
            Ok(CheckReply::PoolMbs(out)) => match out.svc_hint {
                // A hint pointing back means the service is not up yet.
                Some(hint) if hint != rank => {
                    hinted = Some(hint);
                    continue;
                }
                _ => return Ok(()),
            },
            Ok(other) => return Err(unexpected(other)),
            Err(CheckError::NotLeader) => {
                idx += 1;
                tokio::time::sleep(interval).await;
            }
            Err(err) if err.is_transient() => {
                idx += 1;
                tokio::time::sleep(interval).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scour_core::iv::{IvMessage, IvSync};
    use scour_core::rpc::{StartOut, StopOut};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Transport double with scripted per-rank replies.
    struct ScriptedTransport {
        replies: Mutex<Vec<(Rank, Result<CheckReply>)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterTransport for ScriptedTransport {
        async fn unicast(&self, rank: Rank, _req: CheckRequest) -> Result<CheckReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            let pos = replies
                .iter()
                .position(|(r, _)| *r == rank)
                .ok_or(CheckError::TimedOut)?;
            replies.remove(pos).1
        }

        async fn collective(
            &self,
            ranks: &[Rank],
            _req: CheckRequest,
        ) -> Vec<(Rank, Result<CheckReply>)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            ranks
                .iter()
                .map(|rank| {
                    let pos = replies.iter().position(|(r, _)| r == rank);
                    match pos {
                        Some(pos) => replies.remove(pos),
                        None => (*rank, Err(CheckError::TimedOut)),
                    }
                })
                .collect()
        }

        async fn iv_update(&self, _origin: Rank, _msg: IvMessage, _sync: IvSync) -> Result<()> {
            Ok(())
        }

        async fn update_group(&self, _ranks: &[Rank], _version: u32) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_aggregation_concatenates_and_collects_idle_ranks() {
        let transport = ScriptedTransport {
            replies: Mutex::new(vec![
                (
                    1,
                    Ok(CheckReply::Start(StartOut {
                        nothing_to_do: false,
                        clues: vec![],
                    })),
                ),
                (
                    2,
                    Ok(CheckReply::Start(StartOut {
                        nothing_to_do: true,
                        clues: vec![],
                    })),
                ),
            ]),
            calls: AtomicUsize::new(0),
        };
        let req = StartIn {
            gen: 1,
            flags: Default::default(),
            reset_all: false,
            reset_noncomp: false,
            orphan_pool: false,
            phase_limit: None,
            leader: 0,
            ranks: vec![1, 2],
            policies: vec![],
            pools: vec![],
            iv_uuid: Uuid::nil(),
        };
        let agg = start_remote(&transport, &[1, 2], req).await.unwrap();
        assert_eq!(agg.idle_ranks, vec![2]);
    }

    #[tokio::test]
    async fn start_aggregation_is_order_insensitive() {
        use scour_core::clue::{PoolClue, PoolDir};

        let clue = |rank: Rank| PoolClue {
            pool: Uuid::from_u128(rank as u128),
            rank,
            dir: PoolDir::Normal,
            phase: None,
            label: None,
            label_seq: 0,
            svc: None,
            svc_busy: false,
            targets: Vec::new(),
        };
        let replies = |ranks: [Rank; 2]| {
            Mutex::new(
                ranks
                    .iter()
                    .map(|&rank| {
                        (
                            rank,
                            Ok(CheckReply::Start(StartOut {
                                nothing_to_do: false,
                                clues: vec![clue(rank)],
                            })),
                        )
                    })
                    .collect::<Vec<_>>(),
            )
        };
        let req = StartIn {
            gen: 1,
            flags: Default::default(),
            reset_all: false,
            reset_noncomp: false,
            orphan_pool: false,
            phase_limit: None,
            leader: 0,
            ranks: vec![1, 2],
            policies: vec![],
            pools: vec![],
            iv_uuid: Uuid::nil(),
        };

        let forward = ScriptedTransport {
            replies: replies([1, 2]),
            calls: AtomicUsize::new(0),
        };
        let backward = ScriptedTransport {
            replies: replies([2, 1]),
            calls: AtomicUsize::new(0),
        };
        let mut a = start_remote(&forward, &[1, 2], req.clone())
            .await
            .unwrap()
            .clues;
        let mut b = start_remote(&backward, &[2, 1], req).await.unwrap().clues;
        a.sort_by_key(|(rank, _)| *rank);
        b.sort_by_key(|(rank, _)| *rank);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn stop_aggregation_ors_the_flag() {
        let transport = ScriptedTransport {
            replies: Mutex::new(vec![
                (1, Ok(CheckReply::Stop(StopOut { pool_stopped: false }))),
                (2, Ok(CheckReply::Stop(StopOut { pool_stopped: true }))),
            ]),
            calls: AtomicUsize::new(0),
        };
        let stopped = stop_remote(&transport, &[1, 2], 9, vec![]).await.unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn first_hard_error_propagates() {
        let transport = ScriptedTransport {
            replies: Mutex::new(vec![
                (1, Err(CheckError::NoHandle)),
                (2, Ok(CheckReply::Stop(StopOut { pool_stopped: true }))),
            ]),
            calls: AtomicUsize::new(0),
        };
        assert_eq!(
            stop_remote(&transport, &[1, 2], 9, vec![]).await,
            Err(CheckError::NoHandle)
        );
    }

    #[tokio::test]
    async fn unicast_retry_gives_up_when_paused() {
        let transport = ScriptedTransport {
            replies: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        };
        let result = unicast_retry(
            &transport,
            1,
            CheckRequest::Stop(StopIn {
                gen: 0,
                pools: vec![],
            }),
            || false,
        )
        .await;
        assert_eq!(result, Err(CheckError::Interrupted));
    }
}
