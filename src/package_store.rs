// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::sync::Mutex;

use log::debug;
use rusqlite::{params, Connection};

use crate::errors::EdmResult;

/// One persisted driver package row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPackageRecord {
    /// Component name + `-` + access token id; stable across reinstalls of
    /// the same signing identity.
    pub driver_uid: String,
    pub user_id: i64,
    pub app_index: i64,
    /// Encoded `PackageKey` of the driver component.
    pub package_component_key: String,
    pub package_name: String,
    pub component_name: String,
    /// Serialized `DriverDescriptor` envelope.
    pub driver_info_json: String,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS driver_package (
    driver_uid TEXT PRIMARY KEY NOT NULL,
    user_id INTEGER NOT NULL,
    app_index INTEGER NOT NULL,
    package_component_key TEXT NOT NULL,
    package_name TEXT NOT NULL,
    component_name TEXT NOT NULL,
    driver_info_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_driver_package_name ON driver_package (package_name);
";

/// SQLite-backed store of driver package records.
///
/// Mutations that touch a whole package run in one transaction, so a
/// concurrent reader never observes a half-replaced package.
pub struct PkgStore {
    conn: Mutex<Connection>,
}

impl PkgStore {
    pub fn open(path: &Path) -> EdmResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> EdmResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> EdmResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Replaces the rows of one package (or of all packages when no name
    /// is given) with the given records, atomically.
    pub fn replace_package_records(
        &self,
        package_name: Option<&str>,
        records: &[DriverPackageRecord],
    ) -> EdmResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        match package_name {
            Some(name) => {
                tx.execute("DELETE FROM driver_package WHERE package_name = ?1", params![name])?;
            }
            None => {
                tx.execute("DELETE FROM driver_package", [])?;
            }
        }
        for record in records {
            tx.execute(
                "INSERT OR REPLACE INTO driver_package
                 (driver_uid, user_id, app_index, package_component_key,
                  package_name, component_name, driver_info_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.driver_uid,
                    record.user_id,
                    record.app_index,
                    record.package_component_key,
                    record.package_name,
                    record.component_name,
                    record.driver_info_json,
                ],
            )?;
        }
        tx.commit()?;
        debug!(
            "replaced {} driver package rows for {}",
            records.len(),
            package_name.unwrap_or("<all>")
        );
        Ok(())
    }

    /// Deletes every row of one package. Returns the number of rows gone.
    pub fn delete_package_records(&self, package_name: &str) -> EdmResult<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted =
            conn.execute("DELETE FROM driver_package WHERE package_name = ?1", params![package_name])?;
        debug!("deleted {} driver package rows for {}", deleted, package_name);
        Ok(deleted)
    }

    /// Reads back stored records, optionally filtered by driver uid.
    pub fn query_records(&self, driver_uid: Option<&str>) -> EdmResult<Vec<DriverPackageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match driver_uid {
            Some(_) => conn.prepare(
                "SELECT driver_uid, user_id, app_index, package_component_key,
                        package_name, component_name, driver_info_json
                 FROM driver_package WHERE driver_uid = ?1",
            )?,
            None => conn.prepare(
                "SELECT driver_uid, user_id, app_index, package_component_key,
                        package_name, component_name, driver_info_json
                 FROM driver_package ORDER BY rowid",
            )?,
        };
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(DriverPackageRecord {
                driver_uid: row.get(0)?,
                user_id: row.get(1)?,
                app_index: row.get(2)?,
                package_component_key: row.get(3)?,
                package_name: row.get(4)?,
                component_name: row.get(5)?,
                driver_info_json: row.get(6)?,
            })
        };
        let rows = match driver_uid {
            Some(uid) => stmt.query_map(params![uid], map_row)?,
            None => stmt.query_map([], map_row)?,
        };
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uid: &str, package: &str, component: &str) -> DriverPackageRecord {
        DriverPackageRecord {
            driver_uid: uid.to_string(),
            user_id: 100,
            app_index: 0,
            package_component_key: format!("{}-{}", package, component),
            package_name: package.to_string(),
            component_name: component.to_string(),
            driver_info_json: r#"{"bus":"usb","vendor":"","version":"","description":"","vids":[1],"pids":[2]}"#.to_string(),
        }
    }

    #[test]
    fn records_round_trip_through_the_store() {
        let store = PkgStore::open_in_memory().unwrap();
        let rec = record("entry-1", "com.acme.driver", "entry");
        store.replace_package_records(Some("com.acme.driver"), &[rec.clone()]).unwrap();

        let all = store.query_records(None).unwrap();
        assert_eq!(all, vec![rec.clone()]);
        let by_uid = store.query_records(Some("entry-1")).unwrap();
        assert_eq!(by_uid, vec![rec]);
        assert!(store.query_records(Some("other")).unwrap().is_empty());
    }

    #[test]
    fn replace_swaps_a_package_without_touching_others() {
        let store = PkgStore::open_in_memory().unwrap();
        store
            .replace_package_records(
                Some("com.acme.driver"),
                &[record("a-1", "com.acme.driver", "a"), record("b-1", "com.acme.driver", "b")],
            )
            .unwrap();
        store
            .replace_package_records(Some("com.other.driver"), &[record("c-1", "com.other.driver", "c")])
            .unwrap();

        store
            .replace_package_records(Some("com.acme.driver"), &[record("d-1", "com.acme.driver", "d")])
            .unwrap();

        let mut uids: Vec<_> =
            store.query_records(None).unwrap().into_iter().map(|r| r.driver_uid).collect();
        uids.sort();
        assert_eq!(uids, vec!["c-1", "d-1"]);
    }

    #[test]
    fn delete_removes_only_the_named_package() {
        let store = PkgStore::open_in_memory().unwrap();
        store
            .replace_package_records(None, &[record("a-1", "com.acme.driver", "a"), record("c-1", "com.other.driver", "c")])
            .unwrap();
        assert_eq!(store.delete_package_records("com.acme.driver").unwrap(), 1);
        let all = store.query_records(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].package_name, "com.other.driver");
        assert_eq!(store.delete_package_records("com.acme.driver").unwrap(), 0);
    }
}
