//! SQLite persistence for normalized snapshots.
//!
//! Every table is keyed by its natural key and written with
//! `INSERT … ON CONFLICT … DO UPDATE`, so saving the same snapshot twice
//! leaves the tables unchanged. All writes of one snapshot share one
//! transaction.

use std::fmt::Display;
use std::path::Path;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::types::{
    DailyProgressRecord, DataSource, MonthlyStatusRecord, ProcessingTimePercentiles, Snapshot,
    Status, SummaryStats,
};

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Row counts written by one save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub daily: usize,
    pub monthly: usize,
    pub summary: bool,
    pub processing_times: bool,
}

impl Display for SaveStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} daily, {} monthly, summary: {}, processing times: {}",
            self.daily,
            self.monthly,
            if self.summary { "yes" } else { "no" },
            if self.processing_times { "yes" } else { "no" }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklySummary {
    pub week_start: NaiveDate,
    pub total_applications: u64,
    pub avg_daily_applications: f64,
    pub days_recorded: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlySummary {
    pub year: i32,
    pub month: String,
    pub total_count: u64,
    pub pending_count: u64,
    pub daily_change: i64,
    pub is_active: bool,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        log::debug!("Opening database {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        log::debug!("Database schema initialized");
        Ok(Self { conn })
    }

    pub fn save(&mut self, snapshot: &Snapshot) -> Result<SaveStats, StoreError> {
        let tx = self.conn.transaction()?;
        let stats = write_snapshot(&tx, snapshot)?;
        tx.commit()?;
        log::info!("Saved snapshot for {}: {}", snapshot.as_of, stats);
        Ok(stats)
    }

    /// Saves a snapshot that came from a staged document and marks the
    /// document as processed, in the same transaction.
    pub fn save_document(
        &mut self,
        document_key: &str,
        snapshot: &Snapshot,
    ) -> Result<SaveStats, StoreError> {
        let tx = self.conn.transaction()?;
        let stats = write_snapshot(&tx, snapshot)?;
        tx.execute(
            "INSERT INTO processed_documents (document_key, as_of_date)
             VALUES (?1, ?2)
             ON CONFLICT(document_key) DO UPDATE SET
                 as_of_date = excluded.as_of_date,
                 processed_at = CURRENT_TIMESTAMP",
            params![document_key, snapshot.as_of],
        )?;
        tx.commit()?;
        log::info!(
            "Saved document {} for {}: {}",
            document_key,
            snapshot.as_of,
            stats
        );
        Ok(stats)
    }

    pub fn is_document_processed(&self, document_key: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_documents WHERE document_key = ?1",
                [document_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn daily_progress(&self) -> Result<Vec<DailyProgressRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT date, day_of_week, total_applications FROM daily_progress ORDER BY date",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DailyProgressRecord {
                date: row.get(0)?,
                day_of_week: row.get(1)?,
                total: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn monthly_status(&self) -> Result<Vec<MonthlyStatusRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT month, year, status, count, daily_change, is_active
             FROM monthly_status ORDER BY year, month, status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MonthlyStatusRecord {
                month_name: row.get(0)?,
                year: row.get(1)?,
                status: Status::from(row.get::<_, String>(2)?),
                count: row.get(3)?,
                daily_change: row.get(4)?,
                is_active: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn summary_for(&self, record_date: NaiveDate) -> Result<Option<SummaryStats>, StoreError> {
        let summary = self
            .conn
            .query_row(
                "SELECT record_date, total_applications, pending_applications,
                        pending_percentage, changes_today, completed_today
                 FROM summary_stats WHERE record_date = ?1",
                [record_date],
                |row| {
                    Ok(SummaryStats {
                        record_date: row.get(0)?,
                        total_applications: row.get(1)?,
                        pending_applications: row.get(2)?,
                        pending_percentage: row.get(3)?,
                        changes_today: row.get(4)?,
                        completed_today: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(summary)
    }

    pub fn processing_times_for(
        &self,
        record_date: NaiveDate,
    ) -> Result<Option<ProcessingTimePercentiles>, StoreError> {
        let times = self
            .conn
            .query_row(
                "SELECT record_date, percentile_30, percentile_50, percentile_80
                 FROM processing_times WHERE record_date = ?1",
                [record_date],
                |row| {
                    Ok(ProcessingTimePercentiles {
                        as_of_date: row.get(0)?,
                        p30: row.get(1)?,
                        p50: row.get(2)?,
                        p80: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(times)
    }

    /// Sources that recorded historical percentiles for `reference_date`.
    pub fn historical_sources(&self, reference_date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT data_source FROM historical_processing_times
             WHERE reference_date = ?1 ORDER BY data_source",
        )?;
        let rows = stmt.query_map([reference_date], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn weekly_summary(&self) -> Result<Vec<WeeklySummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT week_start, total_applications, avg_daily_applications, days_recorded
             FROM weekly_summary",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WeeklySummary {
                week_start: row.get(0)?,
                total_applications: row.get(1)?,
                avg_daily_applications: row.get(2)?,
                days_recorded: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn monthly_summary(&self) -> Result<Vec<MonthlySummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT year, month, total_count, pending_count, daily_change, is_active
             FROM monthly_summary",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MonthlySummary {
                year: row.get(0)?,
                month: row.get(1)?,
                total_count: row.get(2)?,
                pending_count: row.get(3)?,
                daily_change: row.get(4)?,
                is_active: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn write_snapshot(tx: &Transaction<'_>, snapshot: &Snapshot) -> Result<SaveStats, StoreError> {
    let mut stats = SaveStats::default();

    for day in &snapshot.daily {
        tx.execute(
            "INSERT INTO daily_progress (date, day_of_week, total_applications)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(date) DO UPDATE SET
                 day_of_week = excluded.day_of_week,
                 total_applications = excluded.total_applications",
            params![day.date, day.day_of_week, day.total],
        )?;
        stats.daily += 1;
    }

    for record in &snapshot.monthly {
        tx.execute(
            "INSERT INTO monthly_status (month, year, status, count, daily_change, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(month, year, status) DO UPDATE SET
                 count = excluded.count,
                 daily_change = excluded.daily_change,
                 is_active = excluded.is_active",
            params![
                record.month_name,
                record.year,
                record.status.as_str(),
                record.count,
                record.daily_change,
                record.is_active
            ],
        )?;
        stats.monthly += 1;
    }

    if let Some(summary) = &snapshot.summary {
        tx.execute(
            "INSERT INTO summary_stats (record_date, total_applications, pending_applications,
                                        pending_percentage, changes_today, completed_today)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(record_date) DO UPDATE SET
                 total_applications = excluded.total_applications,
                 pending_applications = excluded.pending_applications,
                 pending_percentage = excluded.pending_percentage,
                 changes_today = excluded.changes_today,
                 completed_today = excluded.completed_today",
            params![
                summary.record_date,
                summary.total_applications,
                summary.pending_applications,
                summary.pending_percentage,
                summary.changes_today,
                summary.completed_today
            ],
        )?;
        stats.summary = true;
    }

    if let Some(times) = &snapshot.processing_times {
        // imported percentiles describe past decisions, not the page on that day
        if snapshot.source != DataSource::HistoricalImport {
            tx.execute(
                "INSERT INTO processing_times (record_date, percentile_30, percentile_50, percentile_80)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(record_date) DO UPDATE SET
                     percentile_30 = excluded.percentile_30,
                     percentile_50 = excluded.percentile_50,
                     percentile_80 = excluded.percentile_80",
                params![times.as_of_date, times.p30, times.p50, times.p80],
            )?;
        }
        tx.execute(
            "INSERT INTO historical_processing_times
                 (reference_date, data_source, percentile_30, percentile_50, percentile_80)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(reference_date, data_source) DO UPDATE SET
                 percentile_30 = excluded.percentile_30,
                 percentile_50 = excluded.percentile_50,
                 percentile_80 = excluded.percentile_80",
            params![
                times.as_of_date,
                snapshot.source.as_str(),
                times.p30,
                times.p50,
                times.p80
            ],
        )?;
        stats.processing_times = true;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(month: &str, status: Status, count: u64, daily_change: i64) -> MonthlyStatusRecord {
        MonthlyStatusRecord {
            month_name: month.to_string(),
            year: 2025,
            status,
            count,
            daily_change,
            is_active: month == "Mar",
        }
    }

    fn snapshot() -> Snapshot {
        let as_of = date(2025, 3, 9);
        Snapshot {
            as_of,
            source: DataSource::Scrape,
            daily: vec![
                DailyProgressRecord {
                    date: date(2025, 3, 8),
                    day_of_week: "Saturday".to_string(),
                    total: 56,
                },
                DailyProgressRecord {
                    date: date(2025, 3, 9),
                    day_of_week: "Sunday".to_string(),
                    total: 18,
                },
            ],
            monthly: vec![
                record("Mar", Status::AnalystReview, 1250, 310),
                record("Mar", Status::Certified, 12, 3),
                record("Feb", Status::Denied, 22, 2),
            ],
            summary: Some(SummaryStats {
                record_date: as_of,
                total_applications: 1284,
                pending_applications: 1250,
                pending_percentage: 97.35,
                changes_today: 315,
                completed_today: 5,
            }),
            processing_times: Some(ProcessingTimePercentiles {
                as_of_date: as_of,
                p30: 42,
                p50: 64,
                p80: 90,
            }),
        }
    }

    fn dump(store: &Store) -> (Vec<DailyProgressRecord>, Vec<MonthlyStatusRecord>) {
        (
            store.daily_progress().unwrap(),
            store.monthly_status().unwrap(),
        )
    }

    #[test]
    fn test_save_and_read_back() {
        let mut store = Store::open_in_memory().unwrap();
        let stats = store.save(&snapshot()).unwrap();

        assert_eq!(
            stats,
            SaveStats {
                daily: 2,
                monthly: 3,
                summary: true,
                processing_times: true
            }
        );

        let (daily, monthly) = dump(&store);
        assert_eq!(daily, snapshot().daily);
        assert_eq!(monthly.len(), 3);
        assert_eq!(
            store.summary_for(date(2025, 3, 9)).unwrap(),
            snapshot().summary
        );
        assert_eq!(
            store.processing_times_for(date(2025, 3, 9)).unwrap(),
            snapshot().processing_times
        );
        assert_eq!(
            store.historical_sources(date(2025, 3, 9)).unwrap(),
            vec!["scrape".to_string()]
        );
    }

    #[test]
    fn test_save_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        store.save(&snapshot()).unwrap();
        let first = dump(&store);
        store.save(&snapshot()).unwrap();
        assert_eq!(dump(&store), first);
    }

    #[test]
    fn test_latest_value_wins() {
        let mut store = Store::open_in_memory().unwrap();
        store.save(&snapshot()).unwrap();

        let mut updated = snapshot();
        updated.monthly = vec![record("Mar", Status::Certified, 20, 8)];
        updated.daily[1].total = 25;
        store.save(&updated).unwrap();

        let (daily, monthly) = dump(&store);
        assert_eq!(daily[1].total, 25);
        let certified = monthly
            .iter()
            .find(|r| r.month_name == "Mar" && r.status == Status::Certified)
            .unwrap();
        assert_eq!((certified.count, certified.daily_change), (20, 8));
        assert_eq!(monthly.len(), 3);
    }

    #[test]
    fn test_failed_save_rolls_back() {
        let mut store = Store::open_in_memory().unwrap();

        let mut bad = snapshot();
        // daily rows go in first, then this record fails to bind
        bad.monthly.push(record("Jan", Status::Withdrawn, u64::MAX, 0));
        assert!(store.save(&bad).is_err());

        let (daily, monthly) = dump(&store);
        assert!(daily.is_empty());
        assert!(monthly.is_empty());
        assert!(store.summary_for(date(2025, 3, 9)).unwrap().is_none());
    }

    #[test]
    fn test_document_tracking() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(!store.is_document_processed("2025-03-09T06:00:00").unwrap());

        let mut from_document = snapshot();
        from_document.source = DataSource::Document;
        store
            .save_document("2025-03-09T06:00:00", &from_document)
            .unwrap();
        store.save(&snapshot()).unwrap();

        assert!(store.is_document_processed("2025-03-09T06:00:00").unwrap());
        assert_eq!(
            store.historical_sources(date(2025, 3, 9)).unwrap(),
            vec!["document".to_string(), "scrape".to_string()]
        );
    }

    #[test]
    fn test_summary_views() {
        let mut store = Store::open_in_memory().unwrap();
        store.save(&snapshot()).unwrap();

        let weekly = store.weekly_summary().unwrap();
        // Mar 8 (Sat) and Mar 9 (Sun) share the week starting Monday Mar 3
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].week_start, date(2025, 3, 3));
        assert_eq!(weekly[0].total_applications, 74);
        assert_eq!(weekly[0].avg_daily_applications, 37.0);
        assert_eq!(weekly[0].days_recorded, 2);

        let monthly = store.monthly_summary().unwrap();
        assert_eq!(monthly.len(), 2);
        let march = monthly.iter().find(|m| m.month == "Mar").unwrap();
        assert_eq!(march.total_count, 1262);
        assert_eq!(march.pending_count, 1250);
        assert_eq!(march.daily_change, 313);
        assert!(march.is_active);
    }

    #[test]
    fn test_monthly_summary_in_calendar_order() {
        let mut store = Store::open_in_memory().unwrap();
        let mut months = snapshot();
        months.monthly = ["Jan", "Sep", "Mar", "Dec"]
            .into_iter()
            .map(|m| record(m, Status::Certified, 1, 0))
            .collect();
        months.monthly.push(MonthlyStatusRecord {
            year: 2024,
            ..record("Nov", Status::Certified, 1, 0)
        });
        store.save(&months).unwrap();

        let order: Vec<(i32, String)> = store
            .monthly_summary()
            .unwrap()
            .into_iter()
            .map(|m| (m.year, m.month))
            .collect();
        assert_eq!(
            order,
            vec![
                (2025, "Dec".to_string()),
                (2025, "Sep".to_string()),
                (2025, "Mar".to_string()),
                (2025, "Jan".to_string()),
                (2024, "Nov".to_string()),
            ]
        );
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perm.db");
        {
            let mut store = Store::open(&path).unwrap();
            store.save(&snapshot()).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.daily_progress().unwrap().len(), 2);
    }
}
