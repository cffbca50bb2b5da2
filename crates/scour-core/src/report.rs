//! Inconsistency reports.
//!
//! A `ReportUnit` is what a detector hands to the report pathway; the
//! rendered `CheckReport` is what the controller receives through the report
//! sink. Per-class fields are optional and elided from the payload when
//! absent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{InconsistClass, Rank, RepairAction};

/// Raw report as produced by a detector on the leader or an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportUnit {
    pub gen: u64,
    /// 0 asks the report pathway to allocate a sequence.
    pub seq: u64,
    pub class: InconsistClass,
    pub action: RepairAction,
    /// Failure text of the repair attempt; `None` when it succeeded or no
    /// repair was attempted yet.
    pub result: Option<String>,
    pub rank: Rank,
    pub target: Option<u32>,
    pub pool: Option<Uuid>,
    pub pool_label: Option<String>,
    pub cont: Option<Uuid>,
    pub cont_label: Option<String>,
    pub obj: Option<String>,
    pub dkey: Option<String>,
    pub akey: Option<String>,
    pub msg: String,
    /// Offered decisions when `action == Interact`.
    pub options: Vec<RepairAction>,
    /// Aligned free text describing each offered decision.
    pub details: Vec<String>,
}

impl ReportUnit {
    pub fn new(gen: u64, class: InconsistClass, action: RepairAction, rank: Rank) -> Self {
        Self {
            gen,
            seq: 0,
            class,
            action,
            result: None,
            rank,
            target: None,
            pool: None,
            pool_label: None,
            cont: None,
            cont_label: None,
            obj: None,
            dkey: None,
            akey: None,
            msg: String::new(),
            options: Vec::new(),
            details: Vec::new(),
        }
    }
}

/// Rendered report delivered to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub seq: u64,
    pub class: InconsistClass,
    pub action: RepairAction,
    pub result: Option<String>,
    pub rank: Rank,
    pub target: Option<u32>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cont_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cont_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub akey: Option<String>,
    pub msg: String,
    pub act_choices: Vec<RepairAction>,
    pub act_details: Vec<String>,
    pub act_msgs: Vec<String>,
}

impl CheckReport {
    /// Render a report unit with the given (already allocated) sequence.
    pub fn render(unit: &ReportUnit, seq: u64) -> Self {
        let act_msgs = if unit.action == RepairAction::Interact {
            unit.options.iter().map(|opt| opt.describe().to_string()).collect()
        } else {
            Vec::new()
        };

        Self {
            seq,
            class: unit.class,
            action: unit.action,
            result: unit.result.clone(),
            rank: unit.rank,
            target: unit.target,
            timestamp: Utc::now().to_rfc3339(),
            pool_uuid: unit.pool.map(|uuid| uuid.to_string()),
            pool_label: unit.pool_label.clone(),
            cont_uuid: unit.cont.map(|uuid| uuid.to_string()),
            cont_label: unit.cont_label.clone(),
            objid: unit.obj.clone(),
            dkey: unit.dkey.clone(),
            akey: unit.akey.clone(),
            msg: unit.msg.clone(),
            act_choices: unit.options.clone(),
            act_details: unit.details.clone(),
            act_msgs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interact_report_carries_choice_descriptions() {
        let mut unit = ReportUnit::new(
            1,
            InconsistClass::PoolNonexistOnMs,
            RepairAction::Interact,
            3,
        );
        unit.options = vec![
            RepairAction::Readd,
            RepairAction::Discard,
            RepairAction::Ignore,
        ];
        unit.details = vec!["Re-add the orphan pool back to MS [suggested].".into()];

        let report = CheckReport::render(&unit, 99);
        assert_eq!(report.seq, 99);
        assert_eq!(report.act_choices.len(), 3);
        assert_eq!(report.act_msgs.len(), 3);
        assert_eq!(report.act_msgs[0], RepairAction::Readd.describe());
    }

    #[test]
    fn non_interact_report_has_no_choice_messages() {
        let unit = ReportUnit::new(1, InconsistClass::ContBadLabel, RepairAction::TrustPs, 2);
        let report = CheckReport::render(&unit, 5);
        assert!(report.act_choices.is_empty());
        assert!(report.act_msgs.is_empty());
    }

    #[test]
    fn absent_fields_are_elided_from_the_payload() {
        let unit = ReportUnit::new(1, InconsistClass::Unknown, RepairAction::Ignore, 0);
        let json = serde_json::to_string(&CheckReport::render(&unit, 1)).unwrap();
        assert!(!json.contains("pool_uuid"));
        assert!(!json.contains("dkey"));
    }
}
