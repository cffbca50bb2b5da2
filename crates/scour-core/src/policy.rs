//! Repair policies: the persisted class-to-action mapping plus the rules
//! that fold a new start request into the persisted property record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::error::{CheckError, Result};
use crate::types::{CheckPhase, InconsistClass, PropertyFlags, Rank, RepairAction, StartFlags};

/// One class/action pair as supplied by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub class: InconsistClass,
    pub action: RepairAction,
}

/// The full class-to-action table. Every class always has an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMap {
    actions: BTreeMap<InconsistClass, RepairAction>,
}

impl Default for PolicyMap {
    fn default() -> Self {
        let actions = InconsistClass::iter()
            .map(|class| (class, RepairAction::Default))
            .collect();
        Self { actions }
    }
}

impl PolicyMap {
    pub fn action_for(&self, class: InconsistClass) -> RepairAction {
        self.actions
            .get(&class)
            .copied()
            .unwrap_or(RepairAction::Default)
    }

    pub fn set(&mut self, class: InconsistClass, action: RepairAction) {
        self.actions.insert(class, action);
    }

    pub fn entries(&self) -> Vec<PolicyEntry> {
        self.actions
            .iter()
            .map(|(&class, &action)| PolicyEntry { class, action })
            .collect()
    }

    /// Replace the whole table. Either every class is rewritten or none:
    /// an empty list keeps the persisted policies.
    pub fn overwrite(&mut self, entries: &[PolicyEntry]) {
        if entries.is_empty() {
            return;
        }
        for class in InconsistClass::iter() {
            self.actions.insert(class, RepairAction::Default);
        }
        for entry in entries {
            self.actions.insert(entry.class, entry.action);
        }
    }
}

/// The persisted process-wide property record, shared by all pools of the
/// current instance. Written atomically together with the ranks list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub leader: Rank,
    pub flags: PropertyFlags,
    pub policies: PolicyMap,
    /// Check only up to this phase; `None` means run the full pipeline.
    pub phase_limit: Option<CheckPhase>,
    /// How many ranks take part in the instance.
    pub rank_count: u32,
}

impl Property {
    pub fn new(leader: Rank) -> Self {
        Self {
            leader,
            flags: PropertyFlags::default(),
            policies: PolicyMap::default(),
            phase_limit: None,
            rank_count: 0,
        }
    }

    /// Fold a start request into the property. DRYRUN is per instance and
    /// must be re-specified each time; NO_FAILOUT / NO_AUTO clear their
    /// persisted counterparts; RESET and ORPHAN_POOL are never stored.
    pub fn prepare(
        &mut self,
        leader: Rank,
        flags: StartFlags,
        phase_limit: Option<CheckPhase>,
        policies: &[PolicyEntry],
        rank_count: u32,
    ) -> Result<()> {
        if flags.failout && flags.no_failout {
            return Err(CheckError::Invalid(
                "failout and no-failout are mutually exclusive".into(),
            ));
        }
        if flags.auto && flags.no_auto {
            return Err(CheckError::Invalid(
                "auto and no-auto are mutually exclusive".into(),
            ));
        }

        self.leader = leader;
        self.flags.dryrun = flags.dryrun;
        if flags.no_failout {
            self.flags.failout = false;
        } else if flags.failout {
            self.flags.failout = true;
        }
        if flags.no_auto {
            self.flags.auto = false;
        } else if flags.auto {
            self.flags.auto = true;
        }
        self.phase_limit = phase_limit;
        self.rank_count = rank_count;
        self.policies.overwrite(policies);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_policy_list_keeps_previous_policies() {
        let mut prop = Property::new(0);
        prop.policies
            .set(InconsistClass::PoolBadLabel, RepairAction::TrustPs);
        prop.prepare(0, StartFlags::default(), None, &[], 3).unwrap();
        assert_eq!(
            prop.policies.action_for(InconsistClass::PoolBadLabel),
            RepairAction::TrustPs
        );
    }

    #[test]
    fn overwrite_resets_unlisted_classes() {
        let mut prop = Property::new(0);
        prop.policies
            .set(InconsistClass::PoolBadLabel, RepairAction::TrustPs);
        prop.prepare(
            0,
            StartFlags::default(),
            None,
            &[PolicyEntry {
                class: InconsistClass::ContBadLabel,
                action: RepairAction::TrustTarget,
            }],
            3,
        )
        .unwrap();
        assert_eq!(
            prop.policies.action_for(InconsistClass::PoolBadLabel),
            RepairAction::Default
        );
        assert_eq!(
            prop.policies.action_for(InconsistClass::ContBadLabel),
            RepairAction::TrustTarget
        );
    }

    #[test]
    fn no_flags_clear_persisted_modes() {
        let mut prop = Property::new(0);
        let on = StartFlags {
            failout: true,
            auto: true,
            ..Default::default()
        };
        prop.prepare(0, on, None, &[], 2).unwrap();
        assert!(prop.flags.failout);
        assert!(prop.flags.auto);

        let off = StartFlags {
            no_failout: true,
            no_auto: true,
            ..Default::default()
        };
        prop.prepare(0, off, None, &[], 2).unwrap();
        assert!(!prop.flags.failout);
        assert!(!prop.flags.auto);
    }

    #[test]
    fn dryrun_must_be_respecified() {
        let mut prop = Property::new(0);
        let dry = StartFlags {
            dryrun: true,
            ..Default::default()
        };
        prop.prepare(0, dry, None, &[], 2).unwrap();
        assert!(prop.flags.dryrun);
        prop.prepare(0, StartFlags::default(), None, &[], 2).unwrap();
        assert!(!prop.flags.dryrun);
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        let mut prop = Property::new(0);
        let bad = StartFlags {
            failout: true,
            no_failout: true,
            ..Default::default()
        };
        assert!(matches!(
            prop.prepare(0, bad, None, &[], 1),
            Err(CheckError::Invalid(_))
        ));
    }
}
