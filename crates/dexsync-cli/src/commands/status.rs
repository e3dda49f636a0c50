use serde::Serialize;

use crate::commands::common::{
    count_flags, format_record_line, format_timestamp, open_durable, Context, FlagCounts,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub db_path: String,
    pub device_id: String,
    pub checkpoint: Option<i64>,
    pub last_activity_time: Option<i64>,
    pub saved_at: Option<i64>,
    pub counts: FlagCounts,
}

pub async fn run_status(as_json: bool, context: &Context) -> Result<(), CliError> {
    let durable = open_durable(&context.db_path).await?;
    let stored = durable.load_ownership().await?;
    let report = StatusReport {
        db_path: durable
            .path()
            .unwrap_or(context.db_path.as_path())
            .display()
            .to_string(),
        device_id: durable.device_id().await?.to_string(),
        checkpoint: durable.load_checkpoint().await?,
        last_activity_time: durable.load_last_activity().await?,
        saved_at: stored.as_ref().map(|stored| stored.saved_at),
        counts: stored
            .as_ref()
            .map(|stored| count_flags(&stored.instances))
            .unwrap_or_default(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for line in format_status_lines(&report) {
        println!("{line}");
    }
    if let Some(stored) = stored {
        for (key, record) in &stored.instances {
            println!("{}", format_record_line(key.as_str(), record));
        }
    }
    Ok(())
}

pub fn format_status_lines(report: &StatusReport) -> Vec<String> {
    let counts = &report.counts;
    vec![
        format!("database:       {}", report.db_path),
        format!("device:         {}", report.device_id),
        format!("checkpoint:     {}", format_timestamp(report.checkpoint)),
        format!(
            "last activity:  {}",
            format_timestamp(report.last_activity_time)
        ),
        format!(
            "records:        {} ({} owned, {} for trade, {} wanted, {} unowned)",
            counts.records, counts.owned, counts.for_trade, counts.wanted, counts.unowned
        ),
    ]
}
