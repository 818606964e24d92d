//! Quota definitions and period-usage repositories (spec.md §4.3, C3).

use sqlx::FromRow;

use crate::cache::period_key;
use crate::db::DbPool;
use crate::types::{Quota, QuotaPeriod, QuotaType, QuotaUsage};

#[derive(Debug, FromRow)]
struct QuotaRow {
    id: i64,
    user_id: i64,
    quota_type: String,
    period: String,
    limit_value: sqlx::types::BigDecimal,
    active: bool,
}

impl From<QuotaRow> for Quota {
    fn from(row: QuotaRow) -> Self {
        Quota {
            id: row.id,
            user_id: row.user_id,
            quota_type: parse_quota_type(&row.quota_type),
            period: parse_period(&row.period),
            limit_value: row.limit_value.to_string().parse().unwrap_or(0.0),
            active: row.active,
        }
    }
}

fn parse_quota_type(s: &str) -> QuotaType {
    match s {
        "tokens" => QuotaType::Tokens,
        "cost" => QuotaType::Cost,
        _ => QuotaType::Requests,
    }
}

fn parse_period(s: &str) -> QuotaPeriod {
    match s {
        "minute" => QuotaPeriod::Minute,
        "hour" => QuotaPeriod::Hour,
        "day" => QuotaPeriod::Day,
        "month" => QuotaPeriod::Month,
        _ => QuotaPeriod::Total,
    }
}

fn quota_type_str(t: QuotaType) -> &'static str {
    match t {
        QuotaType::Requests => "requests",
        QuotaType::Tokens => "tokens",
        QuotaType::Cost => "cost",
    }
}

fn period_str(p: QuotaPeriod) -> &'static str {
    match p {
        QuotaPeriod::Minute => "minute",
        QuotaPeriod::Hour => "hour",
        QuotaPeriod::Day => "day",
        QuotaPeriod::Month => "month",
        QuotaPeriod::Total => "total",
    }
}

pub struct QuotaRepository {
    pool: DbPool,
}

impl QuotaRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list_active_for_user(&self, user_id: i64) -> Result<Vec<Quota>, sqlx::Error> {
        let rows = sqlx::query_as::<_, QuotaRow>(
            "SELECT id, user_id, quota_type, period, limit_value, active FROM quotas WHERE user_id = $1 AND active",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Admin listing surface (spec.md §6 `/admin/quotas`): every quota for a
    /// user, active or not.
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Quota>, sqlx::Error> {
        let rows = sqlx::query_as::<_, QuotaRow>(
            "SELECT id, user_id, quota_type, period, limit_value, active FROM quotas WHERE user_id = $1 ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn create(
        &self,
        user_id: i64,
        quota_type: QuotaType,
        period: QuotaPeriod,
        limit_value: f64,
    ) -> Result<Quota, sqlx::Error> {
        let row = sqlx::query_as::<_, QuotaRow>(
            r#"
            INSERT INTO quotas (user_id, quota_type, period, limit_value, active)
            VALUES ($1, $2, $3, $4, true)
            RETURNING id, user_id, quota_type, period, limit_value, active
            "#,
        )
        .bind(user_id)
        .bind(quota_type_str(quota_type))
        .bind(period_str(period))
        .bind(sqlx::types::BigDecimal::try_from(limit_value).unwrap_or_default())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE quotas SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// The `(period_start, period_end)` window a usage row belongs to, derived
/// from the same calendar alignment the cache layer uses for `period_key`.
fn period_bounds(period: QuotaPeriod, at: chrono::DateTime<chrono::Utc>) -> (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) {
    use chrono::{Duration, TimeZone, Timelike, Datelike};
    match period {
        QuotaPeriod::Minute => {
            let start = at.with_second(0).unwrap().with_nanosecond(0).unwrap();
            (start, start + Duration::minutes(1))
        }
        QuotaPeriod::Hour => {
            let start = at.with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap();
            (start, start + Duration::hours(1))
        }
        QuotaPeriod::Day => {
            let start = at.with_hour(0).unwrap().with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap();
            (start, start + Duration::days(1))
        }
        QuotaPeriod::Month => {
            let start = at.with_day(1).unwrap().with_hour(0).unwrap().with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap();
            let next = if start.month() == 12 {
                chrono::Utc.with_ymd_and_hms(start.year() + 1, 1, 1, 0, 0, 0).unwrap()
            } else {
                chrono::Utc.with_ymd_and_hms(start.year(), start.month() + 1, 1, 0, 0, 0).unwrap()
            };
            (start, next)
        }
        QuotaPeriod::Total => (chrono::DateTime::<chrono::Utc>::MIN_UTC, chrono::DateTime::<chrono::Utc>::MAX_UTC),
    }
}

#[derive(Debug, FromRow)]
struct QuotaUsageRow {
    id: i64,
    quota_id: i64,
    user_id: i64,
    used_value: sqlx::types::BigDecimal,
    period_start: chrono::DateTime<chrono::Utc>,
    period_end: chrono::DateTime<chrono::Utc>,
}

impl From<QuotaUsageRow> for QuotaUsage {
    fn from(row: QuotaUsageRow) -> Self {
        QuotaUsage {
            id: row.id,
            quota_id: row.quota_id,
            user_id: row.user_id,
            used_value: row.used_value.to_string().parse().unwrap_or(0.0),
            period_start: row.period_start,
            period_end: row.period_end,
        }
    }
}

pub struct QuotaUsageRepository {
    pool: DbPool,
}

impl QuotaUsageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_current(
        &self,
        quota_id: i64,
        period: QuotaPeriod,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<QuotaUsage>, sqlx::Error> {
        let (start, end) = period_bounds(period, at);
        let row = sqlx::query_as::<_, QuotaUsageRow>(
            "SELECT id, quota_id, user_id, used_value, period_start, period_end FROM quota_usage WHERE quota_id = $1 AND period_start = $2 AND period_end = $3",
        )
        .bind(quota_id)
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Upsert a single `(quota, period-window)` usage row by adding `delta`
    /// on conflict. One round trip per distinct quota per flushed batch
    /// (spec.md §4.3: the consumer batches many events into one statement
    /// per group).
    pub async fn increment(
        &self,
        quota_id: i64,
        user_id: i64,
        period: QuotaPeriod,
        at: chrono::DateTime<chrono::Utc>,
        delta: f64,
    ) -> Result<QuotaUsage, sqlx::Error> {
        let (start, end) = period_bounds(period, at);
        let row = sqlx::query_as::<_, QuotaUsageRow>(
            r#"
            INSERT INTO quota_usage (quota_id, user_id, used_value, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (quota_id, period_start, period_end)
            DO UPDATE SET used_value = quota_usage.used_value + EXCLUDED.used_value
            RETURNING id, quota_id, user_id, used_value, period_start, period_end
            "#,
        )
        .bind(quota_id)
        .bind(user_id)
        .bind(sqlx::types::BigDecimal::try_from(delta).unwrap_or_default())
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    #[test]
    fn test_day_bounds_span_24h() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 5, 14, 37, 22).unwrap();
        let (start, end) = period_bounds(QuotaPeriod::Day, at);
        assert_eq!(start.format("%H:%M:%S").to_string(), "00:00:00");
        assert_eq!((end - start).num_hours(), 24);
    }

    #[test]
    fn test_month_bounds_roll_year() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 12, 15, 0, 0, 0).unwrap();
        let (_, end) = period_bounds(QuotaPeriod::Month, at);
        assert_eq!(end.year(), 2027);
        assert_eq!(end.month(), 1);
    }

    #[test]
    fn test_type_and_period_roundtrip_strings() {
        assert_eq!(quota_type_str(parse_quota_type("tokens")), "tokens");
        assert_eq!(period_str(parse_period("month")), "month");
        let _ = period_key(QuotaPeriod::Day, chrono::Utc::now());
    }
}
