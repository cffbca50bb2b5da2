//! Capturing report sink.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use scour_core::ports::ReportSink;
use scour_core::report::CheckReport;
use scour_core::types::InconsistClass;
use scour_core::Result;
use tokio::sync::Notify;

/// Records every report the leader delivers; tests poll it.
#[derive(Default)]
pub struct CapturingSink {
    reports: Mutex<Vec<CheckReport>>,
    notify: Notify,
}

impl CapturingSink {
    pub fn reports(&self) -> Vec<CheckReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn reports_of(&self, class: InconsistClass) -> Vec<CheckReport> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|report| report.class == class)
            .cloned()
            .collect()
    }

    /// Wait until a report of the class shows up, or time out.
    pub async fn wait_for(&self, class: InconsistClass, timeout: Duration) -> Option<CheckReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(report) = self.reports_of(class).into_iter().next() {
                return Some(report);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl ReportSink for CapturingSink {
    async fn report(&self, report: CheckReport) -> Result<()> {
        self.reports.lock().unwrap().push(report);
        self.notify.notify_waiters();
        Ok(())
    }
}
