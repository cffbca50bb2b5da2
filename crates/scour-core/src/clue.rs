//! Pool-service clues.
//!
//! A clue is one rank's local view of a pool: which directory set the shard
//! lives in, the labels it knows, and, when the shard hosts a pool-service
//! replica, the replica's consensus state. The leader gathers the clues of
//! all shards, picks an advice replica, and decides whether the pool service
//! still has quorum.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CheckPhase, Rank, TargetState};

/// Which on-disk directory set the shard was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolDir {
    Normal,
    /// Created but never fully set up.
    Newborn,
    /// Destruction started but never finished.
    Zombie,
}

/// Consensus-state descriptor of one pool-service replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvcClue {
    pub term: u64,
    pub last_index: u64,
    pub replicas: Vec<Rank>,
}

/// One rank's report about one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolClue {
    pub pool: Uuid,
    pub rank: Rank,
    pub dir: PoolDir,
    /// Phase the shard had reached in a prior instance; `None` when the pool
    /// is reported only as an orphan candidate outside the check list.
    pub phase: Option<CheckPhase>,
    pub label: Option<String>,
    pub label_seq: u64,
    /// Present when the shard hosts a PS replica and it could be read.
    pub svc: Option<SvcClue>,
    /// The local PS is still shutting down; the shard cannot be used yet.
    pub svc_busy: bool,
    /// Per-target local states, index-aligned with the pool map.
    pub targets: Vec<TargetState>,
}

/// The leader's verdict over a pool's collected clues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClueVerdict {
    /// Index into the clue vector of the chosen replica.
    pub advice: usize,
    /// Majority of the replica cohort is present at the chosen term.
    pub healthy: bool,
}

/// Select the advice replica and assess quorum.
///
/// The replica with the highest (term, last_index) wins. Quorum holds when a
/// strict majority of that replica's cohort reported a clue at the same term.
/// Returns `None` when no clue carries service state at all: the pool
/// service is unreachable and no advice is computable.
pub fn evaluate_clues(clues: &[PoolClue]) -> Option<ClueVerdict> {
    let mut advice: Option<usize> = None;

    for (idx, clue) in clues.iter().enumerate() {
        let Some(svc) = &clue.svc else { continue };
        match advice {
            None => advice = Some(idx),
            Some(best) => {
                let cur = clues[best].svc.as_ref().expect("advice has svc state");
                if (svc.term, svc.last_index) > (cur.term, cur.last_index) {
                    advice = Some(idx);
                }
            }
        }
    }

    let advice = advice?;
    let best = clues[advice].svc.as_ref().expect("advice has svc state");

    let present = clues
        .iter()
        .filter(|clue| {
            best.replicas.contains(&clue.rank)
                && clue.svc.as_ref().is_some_and(|svc| svc.term == best.term)
        })
        .count();

    Some(ClueVerdict {
        advice,
        healthy: present * 2 > best.replicas.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clue(rank: Rank, svc: Option<SvcClue>) -> PoolClue {
        PoolClue {
            pool: Uuid::nil(),
            rank,
            dir: PoolDir::Normal,
            phase: Some(CheckPhase::Prepare),
            label: None,
            label_seq: 0,
            svc,
            svc_busy: false,
            targets: Vec::new(),
        }
    }

    #[test]
    fn picks_highest_term_then_index() {
        let clues = vec![
            clue(
                0,
                Some(SvcClue {
                    term: 3,
                    last_index: 10,
                    replicas: vec![0, 1, 2],
                }),
            ),
            clue(
                1,
                Some(SvcClue {
                    term: 3,
                    last_index: 17,
                    replicas: vec![0, 1, 2],
                }),
            ),
            clue(2, None),
        ];
        let verdict = evaluate_clues(&clues).unwrap();
        assert_eq!(verdict.advice, 1);
    }

    #[test]
    fn quorum_needs_strict_majority() {
        let cohort = vec![0, 1, 2];
        let svc = |term| SvcClue {
            term,
            last_index: 1,
            replicas: cohort.clone(),
        };
        let healthy = evaluate_clues(&[clue(0, Some(svc(2))), clue(1, Some(svc(2)))]).unwrap();
        assert!(healthy.healthy);

        let lone = evaluate_clues(&[clue(0, Some(svc(2))), clue(1, None)]).unwrap();
        assert!(!lone.healthy);
    }

    #[test]
    fn no_svc_state_means_no_advice() {
        assert!(evaluate_clues(&[clue(0, None), clue(1, None)]).is_none());
        assert!(evaluate_clues(&[]).is_none());
    }
}
