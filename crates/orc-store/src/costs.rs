use chrono::Utc;
use serde::{Deserialize, Serialize};

use orc_core::types::{BudgetStatus, CostEntry};

use crate::store::{Result, Store, StoreError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    fn strftime(&self) -> &'static str {
        match self {
            Granularity::Day => "%Y-%m-%d",
            Granularity::Week => "%Y-W%W",
            Granularity::Month => "%Y-%m",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostByModel {
    pub model: String,
    pub cost_usd: f64,
    pub total_tokens: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBucket {
    pub bucket: String,
    pub cost_usd: f64,
    pub total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Cost recording & budgets
// ---------------------------------------------------------------------------

impl Store {
    /// Record one agent turn. The per-day (model, phase) aggregate is rolled
    /// up in the same transaction, so the log and the aggregate can never
    /// disagree.
    pub async fn record_cost(&self, entry: &CostEntry) -> Result<()> {
        let project_id = entry.project_id.clone();
        let task_id = entry.task_id.to_string();
        let phase = entry.phase.clone();
        let model = entry.model.clone();
        let iteration = entry.iteration;
        let cost_usd = entry.cost_usd;
        let input = entry.input_tokens;
        let output = entry.output_tokens;
        let cache_creation = entry.cache_creation_tokens;
        let cache_read = entry.cache_read_tokens;
        let total = entry.total_tokens;
        let timestamp = entry.timestamp.to_rfc3339();
        let day = entry.timestamp.format("%Y-%m-%d").to_string();

        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO cost_log
                     (project_id, task_id, phase, model, iteration, cost_usd,
                      input_tokens, output_tokens, cache_creation_tokens,
                      cache_read_tokens, total_tokens, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    rusqlite::params![
                        project_id,
                        task_id,
                        phase,
                        model,
                        iteration,
                        cost_usd,
                        input,
                        output,
                        cache_creation,
                        cache_read,
                        total,
                        timestamp,
                    ],
                )?;
                tx.execute(
                    "INSERT INTO cost_aggregates (day, model, phase, cost_usd, total_tokens, entries)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)
                     ON CONFLICT(day, model, phase) DO UPDATE SET
                         cost_usd = cost_usd + ?4,
                         total_tokens = total_tokens + ?5,
                         entries = entries + 1",
                    rusqlite::params![day, model, phase, cost_usd, total],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn cost_by_model(&self, project_id: &str) -> Result<Vec<CostByModel>> {
        let project = project_id.to_string();
        let rows: Vec<(String, f64, i64, i64)> = self
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT model, SUM(cost_usd), SUM(total_tokens), COUNT(*)
                     FROM cost_log WHERE project_id = ?1
                     GROUP BY model ORDER BY SUM(cost_usd) DESC",
                )?;
                let rows = stmt
                    .query_map([&project], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(model, cost_usd, tokens, entries)| CostByModel {
                model,
                cost_usd,
                total_tokens: tokens as u64,
                entries: entries as u64,
            })
            .collect())
    }

    pub async fn cost_timeseries(
        &self,
        project_id: &str,
        granularity: Granularity,
    ) -> Result<Vec<CostBucket>> {
        let project = project_id.to_string();
        let fmt = granularity.strftime();
        let rows: Vec<(String, f64, i64)> = self
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT strftime('{fmt}', timestamp), SUM(cost_usd), SUM(total_tokens)
                     FROM cost_log WHERE project_id = ?1
                     GROUP BY 1 ORDER BY 1"
                ))?;
                let rows = stmt
                    .query_map([&project], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, cost_usd, tokens)| CostBucket {
                bucket,
                cost_usd,
                total_tokens: tokens as u64,
            })
            .collect())
    }

    pub async fn set_budget(
        &self,
        project_id: &str,
        monthly_limit_usd: f64,
        alert_threshold: f64,
    ) -> Result<()> {
        let project = project_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cost_budgets (project_id, monthly_limit_usd, alert_threshold, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(project_id) DO UPDATE SET
                         monthly_limit_usd = ?2, alert_threshold = ?3, updated_at = ?4",
                    rusqlite::params![project, monthly_limit_usd, alert_threshold, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Budget status for the current calendar month. `None` when no budget
    /// has been configured for the project.
    pub async fn budget_status(&self, project_id: &str) -> Result<Option<BudgetStatus>> {
        let project = project_id.to_string();
        let row: Option<(f64, f64, f64)> = self
            .connection()
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let budget: Option<(f64, f64)> = conn
                    .query_row(
                        "SELECT monthly_limit_usd, alert_threshold
                         FROM cost_budgets WHERE project_id = ?1",
                        [&project],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((limit, threshold)) = budget else {
                    return Ok(None);
                };
                let spent: f64 = conn.query_row(
                    "SELECT COALESCE(SUM(cost_usd), 0) FROM cost_log
                     WHERE project_id = ?1
                       AND strftime('%Y-%m', timestamp) = strftime('%Y-%m', 'now')",
                    [&project],
                    |row| row.get(0),
                )?;
                Ok(Some((limit, threshold, spent)))
            })
            .await?;

        Ok(row.map(|(limit, threshold, spent)| {
            let percent_used = if limit > 0.0 { spent / limit * 100.0 } else { 0.0 };
            BudgetStatus {
                limit_usd: limit,
                spent_usd: spent,
                percent_used,
                at_alert: limit > 0.0 && spent >= limit * threshold,
                over_budget: spent > limit,
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::id::TaskId;
    use orc_core::types::TokenUsage;

    fn entry(cost: f64, model: &str) -> CostEntry {
        CostEntry::from_usage(
            "proj",
            TaskId::new(1),
            "implement",
            model,
            1,
            cost,
            &TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_creation_tokens: 1_000,
                cache_read_tokens: 10_000,
            },
        )
    }

    #[tokio::test]
    async fn record_rolls_up_aggregate() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_cost(&entry(1.0, "sonnet")).await.unwrap();
        store.record_cost(&entry(2.0, "sonnet")).await.unwrap();
        store.record_cost(&entry(4.0, "opus")).await.unwrap();

        let by_model = store.cost_by_model("proj").await.unwrap();
        assert_eq!(by_model.len(), 2);
        // Sorted by cost, descending.
        assert_eq!(by_model[0].model, "opus");
        assert!((by_model[0].cost_usd - 4.0).abs() < 1e-9);
        assert_eq!(by_model[1].entries, 2);
        assert_eq!(by_model[1].total_tokens, 2 * 11_150);
    }

    #[tokio::test]
    async fn timeseries_buckets_by_day() {
        let store = Store::open_in_memory().await.unwrap();
        store.record_cost(&entry(1.5, "sonnet")).await.unwrap();
        let series = store
            .cost_timeseries("proj", Granularity::Day)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert!((series[0].cost_usd - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn budget_alert_and_overrun() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.budget_status("proj").await.unwrap().is_none());

        store.set_budget("proj", 20.0, 0.8).await.unwrap();
        store.record_cost(&entry(17.0, "sonnet")).await.unwrap();

        let status = store.budget_status("proj").await.unwrap().unwrap();
        assert!(status.at_alert);
        assert!(!status.over_budget);
        assert!((status.percent_used - 85.0).abs() < 1e-9);

        // One more expensive turn pushes it over; recording still succeeds.
        store.record_cost(&entry(4.0, "sonnet")).await.unwrap();
        let status = store.budget_status("proj").await.unwrap().unwrap();
        assert!(status.over_budget);
        assert!(status.spent_usd > 20.0);
    }
}
