// System catalog.
//
// The catalog lives on page 0 of the data file:
//
//   magic "LDB1" | version u32 | next_page_id u32 | free_list_head u32 |
//   payload_len u32 | payload (bincode)
//
// The payload holds table and index entries. CREATE TABLE persists its
// entry only after the table's first heap page exists; a failed create
// leaves no entry behind.

use crate::common::{IndexOid, PageId, TableOid, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPoolManager;
use crate::types::schema::Schema;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const CATALOG_MAGIC: &[u8; 4] = b"LDB1";
const CATALOG_VERSION: u32 = 1;
const CATALOG_PAGE: PageId = 0;
const HEADER_LEN: usize = 20;

/// One table's catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub oid: TableOid,
    pub schema: Schema,
    pub first_page_id: PageId,
}

/// One index's catalog entry. Index structures themselves are maintained
/// outside the engine core; the catalog records their definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub oid: IndexOid,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CatalogPayload {
    next_table_oid: TableOid,
    next_index_oid: IndexOid,
    tables: Vec<TableInfo>,
    indexes: Vec<IndexInfo>,
}

#[derive(Default)]
struct CatalogInner {
    tables: HashMap<String, TableInfo>,
    indexes: HashMap<String, IndexInfo>,
    next_table_oid: TableOid,
    next_index_oid: IndexOid,
}

/// The catalog manager.
pub struct Catalog {
    bp: Arc<BufferPoolManager>,
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    /// Loads the catalog from page 0, initializing a fresh header when the
    /// page has never been written.
    pub fn load(bp: Arc<BufferPoolManager>) -> Result<Self> {
        let catalog = Self {
            bp,
            inner: RwLock::new(CatalogInner {
                next_table_oid: 1,
                next_index_oid: 1,
                ..Default::default()
            }),
        };
        let frame = catalog.bp.fetch_page(CATALOG_PAGE)?;
        let bytes = {
            let page = frame.page.read();
            page.data.to_vec()
        };
        catalog.bp.unpin_page(CATALOG_PAGE, false);

        if &bytes[0..4] == CATALOG_MAGIC {
            let payload_len =
                u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
            if HEADER_LEN + payload_len > PAGE_SIZE {
                return Err(DbError::Catalog("corrupt catalog header".to_string()));
            }
            let (payload, _) = bincode::serde::decode_from_slice::<CatalogPayload, _>(
                &bytes[HEADER_LEN..HEADER_LEN + payload_len],
                bincode::config::standard(),
            )?;
            let mut inner = catalog.inner.write();
            inner.next_table_oid = payload.next_table_oid;
            inner.next_index_oid = payload.next_index_oid;
            for mut table in payload.tables {
                table.schema.rebuild_index();
                inner.tables.insert(table.name.clone(), table);
            }
            for index in payload.indexes {
                inner.indexes.insert(index.name.clone(), index);
            }
            drop(inner);
        } else {
            catalog.persist()?;
        }
        Ok(catalog)
    }

    /// Serializes the catalog into page 0 and forces it to disk.
    pub fn persist(&self) -> Result<()> {
        let payload = {
            let inner = self.inner.read();
            let mut tables: Vec<TableInfo> = inner.tables.values().cloned().collect();
            tables.sort_by_key(|t| t.oid);
            let mut indexes: Vec<IndexInfo> = inner.indexes.values().cloned().collect();
            indexes.sort_by_key(|i| i.oid);
            CatalogPayload {
                next_table_oid: inner.next_table_oid,
                next_index_oid: inner.next_index_oid,
                tables,
                indexes,
            }
        };
        let encoded = bincode::serde::encode_to_vec(&payload, bincode::config::standard())?;
        if HEADER_LEN + encoded.len() > PAGE_SIZE {
            return Err(DbError::Catalog(format!(
                "catalog payload of {} bytes exceeds the header page",
                encoded.len()
            )));
        }

        let frame = self.bp.fetch_page(CATALOG_PAGE)?;
        {
            let mut page = frame.page.write();
            page.data.fill(0);
            page.data[0..4].copy_from_slice(CATALOG_MAGIC);
            page.data[4..8].copy_from_slice(&CATALOG_VERSION.to_le_bytes());
            // Mirror of the allocator cursor; informational.
            page.data[8..12].copy_from_slice(&0u32.to_le_bytes());
            page.data[12..16].copy_from_slice(&0u32.to_le_bytes());
            page.data[16..20].copy_from_slice(&(encoded.len() as u32).to_le_bytes());
            page.data[HEADER_LEN..HEADER_LEN + encoded.len()].copy_from_slice(&encoded);
        }
        self.bp.unpin_page(CATALOG_PAGE, true);
        self.bp.flush_page(CATALOG_PAGE)?;
        Ok(())
    }

    /// Writes the allocator cursor into the persisted header (SAVE path).
    pub fn persist_with_next_page(&self, next_page_id: PageId) -> Result<()> {
        self.persist()?;
        let frame = self.bp.fetch_page(CATALOG_PAGE)?;
        {
            let mut page = frame.page.write();
            page.data[8..12].copy_from_slice(&next_page_id.to_le_bytes());
        }
        self.bp.unpin_page(CATALOG_PAGE, true);
        self.bp.flush_page(CATALOG_PAGE)
    }

    /// Creates a table whose first heap page is already allocated.
    pub fn create_table(
        &self,
        name: &str,
        schema: Schema,
        first_page_id: PageId,
    ) -> Result<TableInfo> {
        {
            let inner = self.inner.read();
            if inner.tables.contains_key(name) {
                return Err(DbError::AlreadyExists(format!("table {}", name)));
            }
        }
        if schema.is_empty() {
            return Err(DbError::Semantic("a table needs at least one column".to_string()));
        }
        let info = {
            let mut inner = self.inner.write();
            let oid = inner.next_table_oid;
            inner.next_table_oid += 1;
            let info = TableInfo {
                name: name.to_string(),
                oid,
                schema,
                first_page_id,
            };
            inner.tables.insert(name.to_string(), info.clone());
            info
        };
        if let Err(e) = self.persist() {
            // A failed create leaves no catalog entry.
            self.inner.write().tables.remove(name);
            return Err(e);
        }
        Ok(info)
    }

    pub fn get_table(&self, name: &str) -> Result<TableInfo> {
        self.inner
            .read()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))
    }

    pub fn drop_table(&self, name: &str) -> Result<TableInfo> {
        let info = {
            let mut inner = self.inner.write();
            let info = inner
                .tables
                .remove(name)
                .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;
            inner.indexes.retain(|_, idx| idx.table != name);
            info
        };
        self.persist()?;
        Ok(info)
    }

    pub fn list_tables(&self) -> Vec<TableInfo> {
        let mut tables: Vec<TableInfo> = self.inner.read().tables.values().cloned().collect();
        tables.sort_by_key(|t| t.oid);
        tables
    }

    pub fn create_index(
        &self,
        name: &str,
        table: &str,
        columns: Vec<String>,
        unique: bool,
    ) -> Result<IndexInfo> {
        let table_info = self.get_table(table)?;
        for column in &columns {
            if table_info.schema.index_of(column).is_none() {
                return Err(DbError::NotFound(format!(
                    "column {} in table {}",
                    column, table
                )));
            }
        }
        let info = {
            let mut inner = self.inner.write();
            if inner.indexes.contains_key(name) {
                return Err(DbError::AlreadyExists(format!("index {}", name)));
            }
            let oid = inner.next_index_oid;
            inner.next_index_oid += 1;
            let info = IndexInfo {
                name: name.to_string(),
                oid,
                table: table.to_string(),
                columns,
                unique,
            };
            inner.indexes.insert(name.to_string(), info.clone());
            info
        };
        if let Err(e) = self.persist() {
            self.inner.write().indexes.remove(name);
            return Err(e);
        }
        Ok(info)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner
                .indexes
                .remove(name)
                .ok_or_else(|| DbError::NotFound(format!("index {}", name)))?;
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use crate::transaction::wal::WalManager;
    use crate::types::schema::Column;
    use crate::types::value::DataType;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Text).primary_key(),
            Column::new("v", DataType::Integer),
        ])
    }

    fn pool(dir: &tempfile::TempDir) -> Arc<BufferPoolManager> {
        let disk = Arc::new(DiskManager::open(dir.path().join("data.db")).unwrap());
        let wal = Arc::new(WalManager::open(dir.path().join("wal.log")).unwrap());
        Arc::new(BufferPoolManager::new(16, disk, wal))
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = tempdir().unwrap();
        let bp = pool(&dir);
        let catalog = Catalog::load(bp.clone()).unwrap();
        let (first, _frame) = bp.new_page().unwrap();
        bp.unpin_page(first, true);
        let info = catalog.create_table("t", schema(), first).unwrap();
        assert_eq!(info.oid, 1);
        assert_eq!(catalog.get_table("t").unwrap().first_page_id, first);
        assert!(matches!(
            catalog.create_table("t", schema(), first),
            Err(DbError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_save_reload_roundtrip() {
        let dir = tempdir().unwrap();
        let bp = pool(&dir);
        let first = {
            let catalog = Catalog::load(bp.clone()).unwrap();
            let (first, _frame) = bp.new_page().unwrap();
            bp.unpin_page(first, true);
            catalog.create_table("people", schema(), first).unwrap();
            catalog
                .create_index("people_id", "people", vec!["id".to_string()], true)
                .unwrap();
            bp.flush_all().unwrap();
            first
        };
        // Reload through a fresh pool over the same file.
        let bp2 = {
            let disk = Arc::new(DiskManager::open(dir.path().join("data.db")).unwrap());
            let wal = Arc::new(WalManager::open(dir.path().join("wal.log")).unwrap());
            Arc::new(BufferPoolManager::new(16, disk, wal))
        };
        let catalog = Catalog::load(bp2).unwrap();
        let info = catalog.get_table("people").unwrap();
        assert_eq!(info.first_page_id, first);
        assert_eq!(info.schema, schema());
        assert_eq!(info.schema.index_of("v"), Some(1));
        let tables = catalog.list_tables();
        assert_eq!(tables.len(), 1);
    }

    #[test]
    fn test_drop_table_removes_indexes() {
        let dir = tempdir().unwrap();
        let bp = pool(&dir);
        let catalog = Catalog::load(bp.clone()).unwrap();
        let (first, _frame) = bp.new_page().unwrap();
        bp.unpin_page(first, true);
        catalog.create_table("t", schema(), first).unwrap();
        catalog
            .create_index("t_id", "t", vec!["id".to_string()], true)
            .unwrap();
        catalog.drop_table("t").unwrap();
        assert!(catalog.get_table("t").is_err());
        assert!(catalog.drop_index("t_id").is_err());
    }

    #[test]
    fn test_unknown_index_column_rejected() {
        let dir = tempdir().unwrap();
        let bp = pool(&dir);
        let catalog = Catalog::load(bp.clone()).unwrap();
        let (first, _frame) = bp.new_page().unwrap();
        bp.unpin_page(first, true);
        catalog.create_table("t", schema(), first).unwrap();
        assert!(catalog
            .create_index("bad", "t", vec!["missing".to_string()], false)
            .is_err());
    }
}
