//! Alert persistence with fingerprint dedupe
//!
//! A trigger for a fingerprint that already has an open alert (ACTIVE or
//! ACKNOWLEDGED) bumps that row instead of inserting a new one. A clear
//! resolves every open row with the fingerprint.

use super::types::{AlertCategory, AlertKey, AlertSignal, AlertStatus, Severity, SystemAlert};
use crate::pipeline::db::{SqliteStore, StoreError};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Outcome of applying one batch of signals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertChanges {
    pub raised: Vec<String>,
    pub resolved: usize,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Open a new alert or bump the open one with the same fingerprint.
    async fn raise(
        &self,
        key: &AlertKey,
        severity: Severity,
        message: &str,
        value: Option<f64>,
        now_ms: i64,
    ) -> Result<SystemAlert, StoreError>;

    /// Resolve every open alert with `fingerprint`. Returns how many changed.
    async fn resolve(&self, fingerprint: &str, now_ms: i64) -> Result<usize, StoreError>;

    /// `false` if no ACTIVE alert has that id.
    async fn acknowledge(&self, alert_id: &str, now_ms: i64) -> Result<bool, StoreError>;

    async fn get_alert(&self, alert_id: &str) -> Result<Option<SystemAlert>, StoreError>;

    /// Most recently seen first; `status = None` lists everything.
    async fn list_alerts(&self, status: Option<AlertStatus>, limit: usize) -> Result<Vec<SystemAlert>, StoreError>;

    async fn apply(&self, signals: &[AlertSignal], now_ms: i64) -> Result<AlertChanges, StoreError> {
        let mut changes = AlertChanges::default();
        for signal in signals {
            let key = signal.key();
            match signal {
                AlertSignal::Trigger {
                    severity,
                    message,
                    value,
                    ..
                } => {
                    let alert = self.raise(key, *severity, message, *value, now_ms).await?;
                    changes.raised.push(alert.alert_id);
                }
                AlertSignal::Clear(_) => {
                    changes.resolved += self.resolve(&key.fingerprint(), now_ms).await?;
                }
            }
        }
        Ok(changes)
    }
}

const ALERT_COLUMNS: &str = "alert_id, category, chain, metric, fingerprint, severity, status, message, value, \
                             occurrence_count, first_occurrence_at, last_occurrence_at, resolved_at, acknowledged_at";

type RawAlert = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<f64>,
    i64,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

fn read_raw_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAlert> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn decode_alert(raw: RawAlert) -> Result<SystemAlert, StoreError> {
    let (
        alert_id,
        category,
        chain,
        metric,
        fingerprint,
        severity,
        status,
        message,
        value,
        occurrence_count,
        first_occurrence_at,
        last_occurrence_at,
        resolved_at,
        acknowledged_at,
    ) = raw;

    Ok(SystemAlert {
        category: AlertCategory::parse(&category).ok_or_else(|| StoreError::Corrupt {
            column: "system_alerts.category",
            value: category.clone(),
        })?,
        severity: Severity::parse(&severity).ok_or_else(|| StoreError::Corrupt {
            column: "system_alerts.severity",
            value: severity.clone(),
        })?,
        status: AlertStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            column: "system_alerts.status",
            value: status.clone(),
        })?,
        alert_id,
        chain,
        metric,
        fingerprint,
        message,
        value,
        occurrence_count: occurrence_count as u64,
        first_occurrence_at,
        last_occurrence_at,
        resolved_at,
        acknowledged_at,
    })
}

fn load_alert(conn: &Connection, alert_id: &str) -> Result<Option<SystemAlert>, StoreError> {
    let sql = format!("SELECT {} FROM system_alerts WHERE alert_id = ?1", ALERT_COLUMNS);
    conn.query_row(&sql, params![alert_id], read_raw_alert)
        .optional()?
        .map(decode_alert)
        .transpose()
}

fn new_alert_id() -> String {
    format!("alert_{:016x}", rand::random::<u64>())
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn raise(
        &self,
        key: &AlertKey,
        severity: Severity,
        message: &str,
        value: Option<f64>,
        now_ms: i64,
    ) -> Result<SystemAlert, StoreError> {
        let fingerprint = key.fingerprint();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let open: Option<String> = tx
            .query_row(
                "SELECT alert_id FROM system_alerts
                 WHERE fingerprint = ?1 AND status IN ('ACTIVE', 'ACKNOWLEDGED')
                 ORDER BY last_occurrence_at DESC LIMIT 1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;

        let alert_id = match open {
            Some(alert_id) => {
                tx.execute(
                    "UPDATE system_alerts
                     SET occurrence_count = occurrence_count + 1,
                         last_occurrence_at = ?2,
                         severity = ?3,
                         message = ?4,
                         value = ?5
                     WHERE alert_id = ?1",
                    params![alert_id, now_ms, severity.as_str(), message, value],
                )?;
                log::debug!("🔁 Alert {} repeated ({})", fingerprint, alert_id);
                alert_id
            }
            None => {
                let alert_id = new_alert_id();
                tx.execute(
                    r#"
                    INSERT INTO system_alerts (
                        alert_id, category, chain, metric, fingerprint, severity, status,
                        message, value, occurrence_count, first_occurrence_at, last_occurrence_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'ACTIVE', ?7, ?8, 1, ?9, ?9)
                    "#,
                    params![
                        alert_id,
                        key.category.as_str(),
                        key.chain,
                        key.metric,
                        fingerprint,
                        severity.as_str(),
                        message,
                        value,
                        now_ms,
                    ],
                )?;
                log::warn!("🚨 [{}] {}: {}", severity.as_str(), fingerprint, message);
                alert_id
            }
        };

        let alert = load_alert(&tx, &alert_id)?.ok_or_else(|| StoreError::Corrupt {
            column: "system_alerts.alert_id",
            value: alert_id.clone(),
        })?;
        tx.commit()?;
        Ok(alert)
    }

    async fn resolve(&self, fingerprint: &str, now_ms: i64) -> Result<usize, StoreError> {
        let resolved = self.conn().execute(
            "UPDATE system_alerts SET status = 'RESOLVED', resolved_at = ?2
             WHERE fingerprint = ?1 AND status IN ('ACTIVE', 'ACKNOWLEDGED')",
            params![fingerprint, now_ms],
        )?;
        if resolved > 0 {
            log::info!("✅ Alert resolved: {}", fingerprint);
        }
        Ok(resolved)
    }

    async fn acknowledge(&self, alert_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE system_alerts SET status = 'ACKNOWLEDGED', acknowledged_at = ?2
             WHERE alert_id = ?1 AND status = 'ACTIVE'",
            params![alert_id, now_ms],
        )?;
        Ok(changed > 0)
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<SystemAlert>, StoreError> {
        load_alert(&self.conn(), alert_id)
    }

    async fn list_alerts(&self, status: Option<AlertStatus>, limit: usize) -> Result<Vec<SystemAlert>, StoreError> {
        let sql = format!(
            "SELECT {} FROM system_alerts WHERE (?1 IS NULL OR status = ?1)
             ORDER BY last_occurrence_at DESC, id DESC LIMIT ?2",
            ALERT_COLUMNS
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let raws: Vec<RawAlert> = stmt
            .query_map(params![status.map(|s| s.as_str()), limit as i64], read_raw_alert)?
            .collect::<Result<_, _>>()?;
        raws.into_iter().map(decode_alert).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_support::temp_store;

    fn lag_key() -> AlertKey {
        AlertKey::new(AlertCategory::ChainLag, "ethereum", "block_lag")
    }

    #[tokio::test]
    async fn test_repeated_trigger_dedupes() {
        let (_tmp, store) = temp_store();

        let first = store.raise(&lag_key(), Severity::Warning, "60 behind", Some(60.0), 1_000).await.unwrap();
        let second = store.raise(&lag_key(), Severity::Critical, "250 behind", Some(250.0), 2_000).await.unwrap();

        assert_eq!(first.alert_id, second.alert_id);
        assert!(first.alert_id.starts_with("alert_"));
        assert_eq!(second.occurrence_count, 2);
        assert_eq!(second.first_occurrence_at, 1_000);
        assert_eq!(second.last_occurrence_at, 2_000);
        assert_eq!(second.severity, Severity::Critical);
        assert_eq!(second.value, Some(250.0));
        assert_eq!(store.list_alerts(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_resolves_and_next_trigger_opens_new() {
        let (_tmp, store) = temp_store();
        let first = store.raise(&lag_key(), Severity::Warning, "lag", None, 1).await.unwrap();

        let changes = store
            .apply(&[AlertSignal::Clear(lag_key())], 2)
            .await
            .unwrap();
        assert_eq!(changes.resolved, 1);

        let resolved = store.get_alert(&first.alert_id).await.unwrap().unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.resolved_at, Some(2));

        // Clearing again is a no-op
        assert_eq!(store.resolve(&lag_key().fingerprint(), 3).await.unwrap(), 0);

        let changes = store
            .apply(
                &[AlertSignal::Trigger {
                    key: lag_key(),
                    severity: Severity::Warning,
                    message: "lag again".to_string(),
                    value: None,
                }],
                4,
            )
            .await
            .unwrap();
        assert_eq!(changes.raised.len(), 1);
        assert_ne!(changes.raised[0], first.alert_id);

        let active = store.list_alerts(Some(AlertStatus::Active), 10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].message, "lag again");
    }

    #[tokio::test]
    async fn test_acknowledge() {
        let (_tmp, store) = temp_store();
        let alert = store.raise(&lag_key(), Severity::Warning, "lag", None, 1).await.unwrap();

        assert!(store.acknowledge(&alert.alert_id, 5).await.unwrap());
        assert!(!store.acknowledge(&alert.alert_id, 6).await.unwrap());
        assert!(!store.acknowledge("alert_missing", 6).await.unwrap());

        // Still open: repeats bump the acknowledged row
        let again = store.raise(&lag_key(), Severity::Warning, "lag", None, 7).await.unwrap();
        assert_eq!(again.alert_id, alert.alert_id);
        assert_eq!(again.status, AlertStatus::Acknowledged);
        assert_eq!(again.acknowledged_at, Some(5));

        assert_eq!(store.resolve(&lag_key().fingerprint(), 8).await.unwrap(), 1);
        assert!(store.list_alerts(Some(AlertStatus::Acknowledged), 10).await.unwrap().is_empty());
    }
}
