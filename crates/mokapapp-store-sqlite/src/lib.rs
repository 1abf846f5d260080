#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use mokapapp_core::{DerivedPanel, ItemCategory, PanelError, PanelGateway, PanelRows};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

/// `ItemCategoryIndex1ID` of panel keys in the Item table.
pub const PANEL_KEY_CATEGORY: i64 = 48;
/// `ItemCategoryIndex1ID` of panel versions in the Item table.
pub const PANEL_VERSION_CATEGORY: i64 = 61;
/// Moka user id recorded as checker on automated inserts.
pub const MOKA_USER: &str = "1201865448";
/// `NGSPanel.PanelType` of registry-sourced panels.
pub const PANELAPP_PANEL_TYPE: i64 = 2;

// Item.Item is case-insensitive, like the production collation. Lookups force
// BINARY so legacy `245_amber` never matches `245_Amber`.
const MOKA_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS Item (
    ItemID INTEGER PRIMARY KEY AUTOINCREMENT,
    Item TEXT NOT NULL COLLATE NOCASE,
    ItemCategoryIndex1ID INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS GenesHGNC_current (
    HGNCID TEXT PRIMARY KEY,
    ApprovedSymbol TEXT
);

CREATE TABLE IF NOT EXISTS NGSPanel (
    NGSPanelID INTEGER PRIMARY KEY AUTOINCREMENT,
    Category INTEGER NOT NULL REFERENCES Item(ItemID),
    SubCategory INTEGER NOT NULL REFERENCES Item(ItemID),
    Panel TEXT NOT NULL,
    PanelCode TEXT NOT NULL,
    Active INTEGER NOT NULL CHECK (Active IN (0, 1)),
    Checker1 TEXT,
    CheckDate TEXT,
    PanelType INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ngspanel_category ON NGSPanel(Category, PanelType);

CREATE TABLE IF NOT EXISTS NGSPanelGenes (
    NGSPanelGenesID INTEGER PRIMARY KEY AUTOINCREMENT,
    NGSPanelID INTEGER NOT NULL REFERENCES NGSPanel(NGSPanelID),
    HGNCID TEXT NOT NULL REFERENCES GenesHGNC_current(HGNCID),
    Symbol TEXT,
    Checker TEXT,
    CheckDate TEXT
);
";

const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("Item", &["ItemID", "Item", "ItemCategoryIndex1ID"]),
    ("GenesHGNC_current", &["HGNCID"]),
    (
        "NGSPanel",
        &[
            "NGSPanelID",
            "Category",
            "SubCategory",
            "Panel",
            "PanelCode",
            "Active",
            "Checker1",
            "CheckDate",
            "PanelType",
        ],
    ),
    (
        "NGSPanelGenes",
        &["NGSPanelID", "HGNCID", "Symbol", "Checker", "CheckDate"],
    ),
];

pub struct SqliteMokaStore {
    conn: Connection,
}

impl SqliteMokaStore {
    /// Opens an existing Moka database. The schema is checked, never created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "opened Moka database");
        Ok(store)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        ensure_moka_compatibility(&conn)?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn item_set(&self, category: i64) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT Item FROM Item WHERE ItemCategoryIndex1ID = ?1")?;
        let rows = stmt.query_map(params![category], |row| row.get::<_, String>(0))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }

    fn hgnc_ids(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare("SELECT HGNCID FROM GenesHGNC_current")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }

    fn rows_by_key(&self) -> Result<BTreeMap<String, PanelRows>> {
        let mut stmt = self.conn.prepare(
            "SELECT k.Item, v.Item, n.Active
             FROM NGSPanel AS n
             JOIN Item AS k ON k.ItemID = n.Category
             JOIN Item AS v ON v.ItemID = n.SubCategory
             WHERE n.PanelType = ?1 AND k.ItemCategoryIndex1ID = ?2",
        )?;
        let rows = stmt.query_map(params![PANELAPP_PANEL_TYPE, PANEL_KEY_CATEGORY], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
            ))
        })?;

        let mut panels: BTreeMap<String, PanelRows> = BTreeMap::new();
        for (key, version, active) in collect_rows(rows)? {
            panels
                .entry(key)
                .or_default()
                .entry(version)
                .and_modify(|current| *current |= active)
                .or_insert(active);
        }
        Ok(panels)
    }

    fn active_row_exists(&self, key: &str, version: Option<&str>) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1
                 FROM NGSPanel AS n
                 JOIN Item AS k ON k.ItemID = n.Category
                 JOIN Item AS v ON v.ItemID = n.SubCategory
                 WHERE k.Item = ?1 COLLATE BINARY
                   AND k.ItemCategoryIndex1ID = ?2
                   AND (?3 IS NULL OR v.Item = ?3 COLLATE BINARY)
                   AND n.PanelType = ?4
                   AND n.Active = 1
                 LIMIT 1",
                params![key, PANEL_KEY_CATEGORY, version, PANELAPP_PANEL_TYPE],
                |_| Ok(()),
            )
            .optional()
            .with_context(|| format!("failed to query active state of {key}"))?
            .is_some();
        Ok(exists)
    }

    fn add_items(&mut self, items: &BTreeSet<String>, category: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO Item (Item, ItemCategoryIndex1ID) VALUES (?1, ?2)")?;
            for item in items {
                stmt.execute(params![item, category])
                    .with_context(|| format!("failed to insert item {item} ({category})"))?;
            }
        }
        tx.commit().context("failed to commit item insert")?;
        debug!(count = items.len(), category, "inserted items");
        Ok(())
    }

    fn add_panel_row(&mut self, panel: &DerivedPanel) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let key_id = item_id(&tx, panel.key(), PANEL_KEY_CATEGORY)?;
        let version_id = item_id(&tx, panel.version(), PANEL_VERSION_CATEGORY)?;

        tx.execute(
            "INSERT INTO NGSPanel
                (Category, SubCategory, Panel, PanelCode, Active, Checker1, CheckDate, PanelType)
             VALUES (?1, ?2, ?3, 'Pan', 1, ?4, CURRENT_TIMESTAMP, ?5)",
            params![key_id, version_id, panel.name(), MOKA_USER, PANELAPP_PANEL_TYPE],
        )
        .with_context(|| format!("failed to insert NGSPanel row for {}", panel.key()))?;
        let panel_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE NGSPanel SET PanelCode = PanelCode || NGSPanelID WHERE NGSPanelID = ?1",
            params![panel_id],
        )
        .context("failed to assign PanelCode")?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO NGSPanelGenes (NGSPanelID, HGNCID, Symbol, Checker, CheckDate)
                 VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)",
            )?;
            for gene in panel.genes() {
                stmt.execute(params![panel_id, gene.hgnc_id, gene.symbol, MOKA_USER])
                    .with_context(|| {
                        format!("failed to insert gene {} for {}", gene.hgnc_id, panel.key())
                    })?;
            }
        }

        tx.commit().context("failed to commit panel insert")?;
        info!(
            key = panel.key(),
            version = panel.version(),
            ngs_panel_id = panel_id,
            genes = panel.genes().len(),
            "inserted NGSPanel row"
        );
        Ok(panel_id)
    }

    fn set_inactive(&mut self, key: &str) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE NGSPanel SET Active = 0
                 WHERE PanelType = ?1
                   AND Category IN (
                       SELECT ItemID FROM Item
                       WHERE Item = ?2 COLLATE BINARY AND ItemCategoryIndex1ID = ?3
                   )",
                params![PANELAPP_PANEL_TYPE, key, PANEL_KEY_CATEGORY],
            )
            .with_context(|| format!("failed to deactivate {key}"))?;
        debug!(key, rows = changed, "deactivated panel rows");
        Ok(changed)
    }

    fn set_only_active(&mut self, key: &str, version: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        let key_id = item_id(&tx, key, PANEL_KEY_CATEGORY)?;
        let version_id = item_id(&tx, version, PANEL_VERSION_CATEGORY)?;

        let matching: i64 = tx.query_row(
            "SELECT COUNT(*) FROM NGSPanel
             WHERE Category = ?1 AND SubCategory = ?2 AND PanelType = ?3",
            params![key_id, version_id, PANELAPP_PANEL_TYPE],
            |row| row.get(0),
        )?;
        if matching == 0 {
            return Err(anyhow!("no NGSPanel row for {key} version {version}"));
        }

        // One statement, so the key is never observed with zero active rows.
        tx.execute(
            "UPDATE NGSPanel
             SET Active = CASE WHEN SubCategory = ?2 THEN 1 ELSE 0 END
             WHERE Category = ?1 AND PanelType = ?3",
            params![key_id, version_id, PANELAPP_PANEL_TYPE],
        )
        .with_context(|| format!("failed to set {key} version {version} as only active"))?;
        tx.commit().context("failed to commit activation")?;
        debug!(key, version, "set only active version");
        Ok(())
    }
}

impl PanelGateway for SqliteMokaStore {
    fn known_keys(&self) -> Result<BTreeSet<String>, PanelError> {
        self.item_set(PANEL_KEY_CATEGORY).map_err(persistence)
    }

    fn known_versions(&self) -> Result<BTreeSet<String>, PanelError> {
        self.item_set(PANEL_VERSION_CATEGORY).map_err(persistence)
    }

    fn known_hgnc_ids(&self) -> Result<BTreeSet<String>, PanelError> {
        self.hgnc_ids().map_err(persistence)
    }

    fn panel_rows(&self) -> Result<BTreeMap<String, PanelRows>, PanelError> {
        self.rows_by_key().map_err(persistence)
    }

    fn is_active(&self, key: &str) -> Result<bool, PanelError> {
        self.active_row_exists(key, None).map_err(persistence)
    }

    fn is_active_version(&self, key: &str, version: &str) -> Result<bool, PanelError> {
        self.active_row_exists(key, Some(version)).map_err(persistence)
    }

    fn insert_items(
        &mut self,
        items: &BTreeSet<String>,
        category: ItemCategory,
    ) -> Result<(), PanelError> {
        let index = match category {
            ItemCategory::PanelKey => PANEL_KEY_CATEGORY,
            ItemCategory::PanelVersion => PANEL_VERSION_CATEGORY,
        };
        self.add_items(items, index).map_err(persistence)
    }

    fn insert_row(&mut self, panel: &DerivedPanel) -> Result<(), PanelError> {
        self.add_panel_row(panel).map(|_| ()).map_err(persistence)
    }

    fn deactivate_all(&mut self, key: &str) -> Result<(), PanelError> {
        self.set_inactive(key).map(|_| ()).map_err(persistence)
    }

    fn activate_only(&mut self, key: &str, version: &str) -> Result<(), PanelError> {
        self.set_only_active(key, version).map_err(persistence)
    }
}

fn persistence(err: anyhow::Error) -> PanelError {
    PanelError::Persistence(format!("{err:#}"))
}

fn item_id(tx: &Transaction<'_>, item: &str, category: i64) -> Result<i64> {
    tx.query_row(
        "SELECT ItemID FROM Item
         WHERE Item = ?1 COLLATE BINARY AND ItemCategoryIndex1ID = ?2
         ORDER BY ItemID
         LIMIT 1",
        params![item, category],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to look up item {item}"))?
    .ok_or_else(|| anyhow!("item {item} missing from Item table (category {category})"))
}

fn ensure_moka_compatibility(conn: &Connection) -> Result<()> {
    for (table_name, columns) in REQUIRED_COLUMNS {
        if !table_exists(conn, table_name)? {
            return Err(anyhow!(
                "Moka compatibility check failed: expected table {table_name}"
            ));
        }
        ensure_table_has_columns(conn, table_name, columns)?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "Moka compatibility check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Creates the Moka tables this crate reads and writes. For tests and local
/// development databases only; production schemas are never touched.
pub fn seed_moka_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(MOKA_SCHEMA)
        .context("failed to create Moka schema")?;
    Ok(())
}

pub fn seed_hgnc_ids(conn: &Connection, hgnc_ids: &[&str]) -> Result<()> {
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO GenesHGNC_current (HGNCID) VALUES (?1)")?;
    for hgnc_id in hgnc_ids {
        stmt.execute(params![hgnc_id])
            .with_context(|| format!("failed to seed HGNC id {hgnc_id}"))?;
    }
    Ok(())
}
