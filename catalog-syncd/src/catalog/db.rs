use std::collections::HashSet;
use std::path::Path;
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use shared::types::{LayerRemoval, RemovedServiceRecord, ServiceDescriptor, ServiceType, TypeFilter};
use crate::error::CatalogError;

type Result<T, E = CatalogError> = std::result::Result<T, E>;

const SERVICE_COLUMNS: &str = "service_key, label, url, folder, type, state";
const REMOVED_COLUMNS: &str =
    "service_key, label, url, folder, type, state, removed_at, removed_by, layers_removed";

/// Addresses one record by key. Without a region the key must be unique
/// across regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSelector {
    pub key: String,
    pub region: Option<String>,
}

impl ServiceSelector {
    pub fn new(key: impl Into<String>, region: Option<String>) -> Self {
        Self { key: key.into(), region }
    }
}

/// Row count for one (region, type) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogStat {
    pub state: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub count: u64,
}

pub struct CatalogDb {
    conn: Connection,
}

impl CatalogDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                service_key TEXT NOT NULL CHECK (service_key <> ''),
                state       TEXT NOT NULL,
                type        TEXT NOT NULL,
                label       TEXT NOT NULL,
                url         TEXT NOT NULL,
                folder      TEXT NOT NULL DEFAULT 'Root',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (service_key, state, type)
            );

            CREATE INDEX IF NOT EXISTS idx_services_state_type ON services(state, type);

            CREATE TABLE IF NOT EXISTS removed_services (
                service_key    TEXT NOT NULL,
                state          TEXT NOT NULL,
                type           TEXT NOT NULL,
                label          TEXT NOT NULL,
                url            TEXT NOT NULL,
                folder         TEXT NOT NULL DEFAULT 'Root',
                removed_at     TEXT NOT NULL,
                removed_by     TEXT,
                layers_removed TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (service_key, state, type)
            );

            CREATE INDEX IF NOT EXISTS idx_removed_at ON removed_services(removed_at);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Live services, optionally restricted to a region, sorted by folder then label
    pub fn list_by_region(&self, region: Option<&str>, filter: TypeFilter) -> Result<Vec<ServiceDescriptor>> {
        let mut clauses = Vec::new();
        let mut args: Vec<&str> = Vec::new();
        if let Some(region) = region {
            clauses.push("state = ?");
            args.push(region);
        }
        if let TypeFilter::Only(service_type) = filter {
            clauses.push("type = ?");
            args.push(service_type.as_str());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM services{} ORDER BY folder, label, service_key",
            SERVICE_COLUMNS, where_sql
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let services = stmt
            .query_map(params_from_iter(args), row_to_descriptor)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services)
    }

    pub fn list_all(&self) -> Result<Vec<ServiceDescriptor>> {
        self.list_by_region(None, TypeFilter::All)
    }

    /// Keys a sync must not insert again: live services plus removed ones, so
    /// a crawl never resurrects what an administrator took out.
    pub fn existing_keys(&self, region: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT service_key FROM services WHERE state = ?1
             UNION
             SELECT service_key FROM removed_services WHERE state = ?1",
        )?;
        let keys = stmt
            .query_map([region], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    /// Upsert `descriptors` into `region` in one transaction. On conflict only
    /// label, url and folder change. Any failure leaves the table untouched.
    pub fn bulk_upsert(&mut self, region: &str, descriptors: &[ServiceDescriptor]) -> Result<usize> {
        self.upsert_rows(descriptors.iter().map(|d| (region, d)))
    }

    /// Like [`bulk_upsert`](Self::bulk_upsert) but each descriptor keeps its own region
    pub fn upsert_descriptors(&mut self, descriptors: &[ServiceDescriptor]) -> Result<usize> {
        self.upsert_rows(descriptors.iter().map(|d| (d.region.as_str(), d)))
    }

    fn upsert_rows<'a>(
        &mut self,
        rows: impl Iterator<Item = (&'a str, &'a ServiceDescriptor)>,
    ) -> Result<usize> {
        let now = timestamp(Utc::now());
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO services (service_key, state, type, label, url, folder, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(service_key, state, type) DO UPDATE SET
                    label = excluded.label,
                    url = excluded.url,
                    folder = excluded.folder,
                    updated_at = excluded.updated_at
                "#,
            )?;
            for (region, d) in rows {
                count += stmt.execute(params![
                    &d.key,
                    region,
                    d.service_type.as_str(),
                    &d.label,
                    &d.url,
                    &d.folder,
                    &now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Move a live service to the removed set
    pub fn remove(
        &mut self,
        selector: &ServiceSelector,
        removed_by: Option<String>,
        layers_removed: Vec<LayerRemoval>,
    ) -> Result<RemovedServiceRecord> {
        let tx = self.conn.transaction()?;
        let service = single(select_live(&tx, selector)?, &selector.key)?;

        let record = RemovedServiceRecord {
            service,
            removed_at: Utc::now(),
            removed_by,
            layers_removed,
        };
        let layers_json = serde_json::to_string(&record.layers_removed)?;
        let s = &record.service;

        // A record removed earlier under the same identity is superseded
        tx.execute(
            &format!("INSERT OR REPLACE INTO removed_services ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)", REMOVED_COLUMNS),
            params![
                &s.key,
                &s.label,
                &s.url,
                &s.folder,
                s.service_type.as_str(),
                &s.region,
                timestamp(record.removed_at),
                &record.removed_by,
                layers_json,
            ],
        )?;
        tx.execute(
            "DELETE FROM services WHERE service_key = ?1 AND state = ?2 AND type = ?3",
            params![&s.key, &s.region, s.service_type.as_str()],
        )?;
        tx.commit()?;

        tracing::info!(key = %s.key, region = %s.region, "Removed service");
        Ok(record)
    }

    /// Move a removed service back to the live set. Refuses when a live service
    /// with the same key exists in that region; both records stay as they are.
    pub fn restore(&mut self, selector: &ServiceSelector) -> Result<ServiceDescriptor> {
        let tx = self.conn.transaction()?;
        let record = single(select_removed(&tx, selector)?, &selector.key)?;
        let s = record.service;

        let live: u32 = tx.query_row(
            "SELECT COUNT(*) FROM services WHERE service_key = ?1 AND state = ?2",
            params![&s.key, &s.region],
            |row| row.get(0),
        )?;
        if live > 0 {
            return Err(CatalogError::Conflict { key: s.key, region: s.region });
        }

        let now = timestamp(Utc::now());
        tx.execute(
            "INSERT INTO services (service_key, state, type, label, url, folder, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![&s.key, &s.region, s.service_type.as_str(), &s.label, &s.url, &s.folder, now],
        )?;
        tx.execute(
            "DELETE FROM removed_services WHERE service_key = ?1 AND state = ?2 AND type = ?3",
            params![&s.key, &s.region, s.service_type.as_str()],
        )?;
        tx.commit()?;

        tracing::info!(key = %s.key, region = %s.region, "Restored service");
        Ok(s)
    }

    /// Irreversibly drop one removed record
    pub fn permanently_delete(&mut self, selector: &ServiceSelector) -> Result<()> {
        let tx = self.conn.transaction()?;
        let record = single(select_removed(&tx, selector)?, &selector.key)?;
        let s = &record.service;
        tx.execute(
            "DELETE FROM removed_services WHERE service_key = ?1 AND state = ?2 AND type = ?3",
            params![&s.key, &s.region, s.service_type.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop every removed record, optionally for one region only
    pub fn clear_all_removed(&self, region: Option<&str>) -> Result<usize> {
        let count = match region {
            Some(region) => self.conn.execute("DELETE FROM removed_services WHERE state = ?1", [region])?,
            None => self.conn.execute("DELETE FROM removed_services", [])?,
        };
        Ok(count)
    }

    /// Removed records, most recent first
    pub fn list_removed(&self, region: Option<&str>) -> Result<Vec<RemovedServiceRecord>> {
        let selector_sql = if region.is_some() { " WHERE state = ?1" } else { "" };
        let sql = format!(
            "SELECT {} FROM removed_services{} ORDER BY removed_at DESC, service_key",
            REMOVED_COLUMNS, selector_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(region), row_to_removed)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Garbage-collect removed records older than `cutoff`
    pub fn purge_removed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count = self.conn.execute(
            "DELETE FROM removed_services WHERE removed_at < ?1",
            [timestamp(cutoff)],
        )?;
        Ok(count)
    }

    /// Move every live service of `region` from folder `old` to `new`
    pub fn rename_folder(&self, old: &str, new: &str, region: &str) -> Result<usize> {
        let new = new.trim();
        if new.is_empty() {
            return Err(CatalogError::Invalid("new folder name is empty".to_string()));
        }
        let count = self.conn.execute(
            "UPDATE services SET folder = ?1, updated_at = ?4 WHERE folder = ?2 AND state = ?3",
            params![new, old, region, timestamp(Utc::now())],
        )?;
        Ok(count)
    }

    pub fn rename_service(&mut self, selector: &ServiceSelector, new_label: &str) -> Result<ServiceDescriptor> {
        let new_label = new_label.trim();
        if new_label.is_empty() {
            return Err(CatalogError::Invalid("new label is empty".to_string()));
        }

        let tx = self.conn.transaction()?;
        let mut service = single(select_live(&tx, selector)?, &selector.key)?;
        tx.execute(
            "UPDATE services SET label = ?1, updated_at = ?2
             WHERE service_key = ?3 AND state = ?4 AND type = ?5",
            params![
                new_label,
                timestamp(Utc::now()),
                &service.key,
                &service.region,
                service.service_type.as_str(),
            ],
        )?;
        tx.commit()?;

        service.label = new_label.to_string();
        Ok(service)
    }

    /// Live service counts grouped by region and type
    pub fn stats(&self) -> Result<Vec<CatalogStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT state, type, COUNT(*) FROM services GROUP BY state, type ORDER BY state, type",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(CatalogStat {
                    state: row.get(0)?,
                    service_type: parse_type(row, 1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    // Fixed width so text comparison orders chronologically
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn select_live(conn: &Connection, selector: &ServiceSelector) -> Result<Vec<ServiceDescriptor>> {
    let sql = format!(
        "SELECT {} FROM services WHERE service_key = ?1 AND (?2 IS NULL OR state = ?2)",
        SERVICE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![&selector.key, &selector.region], row_to_descriptor)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn select_removed(conn: &Connection, selector: &ServiceSelector) -> Result<Vec<RemovedServiceRecord>> {
    let sql = format!(
        "SELECT {} FROM removed_services WHERE service_key = ?1 AND (?2 IS NULL OR state = ?2)",
        REMOVED_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![&selector.key, &selector.region], row_to_removed)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Exactly one match, or NotFound / Ambiguous
fn single<T>(mut rows: Vec<T>, key: &str) -> Result<T> {
    match rows.len() {
        0 => Err(CatalogError::NotFound { key: key.to_string() }),
        1 => Ok(rows.remove(0)),
        _ => Err(CatalogError::Ambiguous { key: key.to_string() }),
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_type(row: &rusqlite::Row, idx: usize) -> Result<ServiceType, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn row_to_descriptor(row: &rusqlite::Row) -> Result<ServiceDescriptor, rusqlite::Error> {
    Ok(ServiceDescriptor {
        key: row.get(0)?,
        label: row.get(1)?,
        url: row.get(2)?,
        folder: row.get(3)?,
        service_type: parse_type(row, 4)?,
        region: row.get(5)?,
    })
}

fn row_to_removed(row: &rusqlite::Row) -> Result<RemovedServiceRecord, rusqlite::Error> {
    let removed_at_str: String = row.get(6)?;
    let layers_json: String = row.get(8)?;

    let removed_at = DateTime::parse_from_rfc3339(&removed_at_str)
        .map_err(|e| conversion_error(6, e))?
        .with_timezone(&Utc);
    let layers_removed = serde_json::from_str(&layers_json).map_err(|e| conversion_error(8, e))?;

    Ok(RemovedServiceRecord {
        service: row_to_descriptor(row)?,
        removed_at,
        removed_by: row.get(7)?,
        layers_removed,
    })
}
