use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use shared::types::DnsCacheEntry;
use chrono::{DateTime, Utc};

pub struct DnsStore {
    conn: Connection,
}

impl DnsStore {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS dns_entries (
                hostname    TEXT PRIMARY KEY,
                addresses   TEXT NOT NULL,
                valid_until TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Replace the stored cache with `entries` in a single transaction
    pub fn replace_all(&mut self, entries: &[DnsCacheEntry]) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to start transaction")?;
        tx.execute("DELETE FROM dns_entries", [])
            .context("Failed to clear dns entries")?;

        for entry in entries {
            let addresses_json = serde_json::to_string(&entry.addresses)
                .context("Failed to serialize addresses")?;
            tx.execute(
                "INSERT INTO dns_entries (hostname, addresses, valid_until) VALUES (?1, ?2, ?3)",
                params![&entry.hostname, &addresses_json, entry.valid_until.to_rfc3339()],
            )
            .with_context(|| format!("Failed to insert {}", entry.hostname))?;
        }

        tx.commit().context("Failed to commit dns entries")?;
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<DnsCacheEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hostname, addresses, valid_until FROM dns_entries")
            .context("Failed to prepare query")?;

        let entries = stmt
            .query_map([], |row| Self::row_to_entry(row))
            .context("Failed to query dns entries")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect dns entries")?;

        Ok(entries)
    }

    #[cfg(test)]
    pub fn get(&self, hostname: &str) -> Result<Option<DnsCacheEntry>> {
        use rusqlite::OptionalExtension;

        let result = self
            .conn
            .query_row(
                "SELECT hostname, addresses, valid_until FROM dns_entries WHERE hostname = ?1",
                params![hostname],
                |row| Self::row_to_entry(row),
            )
            .optional()
            .context("Failed to query dns entry")?;

        Ok(result)
    }

    /// Delete entries whose validity ended before `cutoff`
    pub fn prune_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count = self.conn.execute(
            "DELETE FROM dns_entries WHERE valid_until < ?1",
            params![cutoff.to_rfc3339()],
        )
        .context("Failed to prune expired dns entries")?;

        Ok(count as u64)
    }

    fn row_to_entry(row: &rusqlite::Row) -> Result<DnsCacheEntry, rusqlite::Error> {
        let addresses_json: String = row.get(1)?;
        let valid_until_str: String = row.get(2)?;

        let addresses = serde_json::from_str(&addresses_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        let valid_until = DateTime::parse_from_rfc3339(&valid_until_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .with_timezone(&Utc);

        Ok(DnsCacheEntry {
            hostname: row.get(0)?,
            addresses,
            valid_until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_entry(hostname: &str, valid_for_secs: i64) -> DnsCacheEntry {
        DnsCacheEntry {
            hostname: hostname.to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42))],
            valid_until: Utc::now() + chrono::Duration::seconds(valid_for_secs),
        }
    }

    #[test]
    fn test_replace_and_load() {
        let mut db = DnsStore::open(":memory:").unwrap();
        db.replace_all(&[test_entry("printer.local", 600), test_entry("octopi.home", 600)])
            .unwrap();

        let loaded = db.load_all().unwrap();
        assert_eq!(loaded.len(), 2);

        let printer = db.get("printer.local").unwrap().unwrap();
        assert_eq!(printer.addresses, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42))]);
    }

    #[test]
    fn test_replace_drops_missing_entries() {
        let mut db = DnsStore::open(":memory:").unwrap();
        db.replace_all(&[test_entry("a.local", 600), test_entry("b.local", 600)]).unwrap();
        db.replace_all(&[test_entry("b.local", 600)]).unwrap();

        assert!(db.get("a.local").unwrap().is_none());
        assert!(db.get("b.local").unwrap().is_some());
    }

    #[test]
    fn test_prune_expired() {
        let mut db = DnsStore::open(":memory:").unwrap();
        db.replace_all(&[test_entry("old.local", -3600), test_entry("fresh.local", 600)])
            .unwrap();

        let pruned = db.prune_expired(Utc::now()).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(db.load_all().unwrap().len(), 1);
    }
}
