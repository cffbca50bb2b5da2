//! Report upcall to the controller.

use scour_core::ports::ReportSink;
use scour_core::report::{CheckReport, ReportUnit};
use scour_core::Result;

/// Render the unit with its allocated sequence and deliver it.
pub async fn report_upcall(sink: &dyn ReportSink, unit: &ReportUnit, seq: u64) -> Result<()> {
    let report = CheckReport::render(unit, seq);
    let result = sink.report(report).await;
    match &result {
        Ok(()) => tracing::info!(
            gen = unit.gen,
            seq,
            class = %unit.class,
            action = %unit.action,
            "report upcall delivered"
        ),
        Err(err) => tracing::error!(gen = unit.gen, seq, %err, "report upcall failed"),
    }
    result
}
