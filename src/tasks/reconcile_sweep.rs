use crate::engine::{CompareFilter, Engine};
use crate::notifications::PushKind;
use crate::reconciliation::{Classification, ComparisonRow};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::interval;

/// Classification counts for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepSummary {
    pub total: usize,
    pub by_classification: BTreeMap<Classification, usize>,
    /// Keys whose totals differ by more than the minor band.
    pub major_keys: Vec<String>,
}

pub fn summarize(rows: &[ComparisonRow]) -> SweepSummary {
    let mut summary = SweepSummary {
        total: rows.len(),
        ..Default::default()
    };

    for row in rows {
        *summary.by_classification.entry(row.classification).or_insert(0) += 1;
        if row.classification == Classification::MajorDiscrepancy {
            summary.major_keys.push(format!(
                "{}/{}/{}",
                row.key.constituency, row.key.category, row.key.polling_center_id
            ));
        }
    }

    summary
}

/// Run one comparison pass and publish its summary.
pub async fn sweep_once(engine: &Engine) -> Option<SweepSummary> {
    let rows = match engine.compare(&CompareFilter::default()).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("Reconciliation sweep failed: {}", e);
            return None;
        }
    };

    let summary = summarize(&rows);
    info!(
        "Reconciliation sweep compared {} key(s): {:?}",
        summary.total, summary.by_classification
    );
    for key in &summary.major_keys {
        warn!("Major discrepancy between internal and official totals at {}", key);
    }

    match serde_json::to_value(&summary) {
        Ok(data) => {
            engine
                .dispatcher()
                .broadcast(PushKind::AnalyticsUpdate, serde_json::json!({ "reconciliation": data }));
        }
        Err(e) => warn!("Could not encode sweep summary: {}", e),
    }

    Some(summary)
}

pub async fn run_sweep_task(engine: Arc<Engine>, every: StdDuration) {
    info!("Starting reconciliation sweep every {}s", every.as_secs());
    let mut interval = interval(every);

    loop {
        interval.tick().await; // Wait for the next interval tick
        sweep_once(&engine).await;
    }
}
