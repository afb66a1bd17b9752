use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{debug, warn};

use crate::config::LockPolicy;
use crate::encoding::Partitioning;
use crate::error::StorageError;
use crate::geometry::sky;
use crate::table::RowBlock;
use crate::types::{CellId, LOCK_SUFFIX, RowId, TABLET_EXTENSION, TableSchema};

use super::lock::CellLock;
use super::tablet::Tablet;

/// Label of a time slice in tablet file names.
pub fn slice_label(slice: u32) -> String {
    if slice == 0 {
        "static".to_string()
    } else {
        format!("T{slice:04}")
    }
}

/// Parse a slice label produced by [`slice_label`].
pub fn parse_slice_label(label: &str) -> Option<u32> {
    if label == "static" {
        return Some(0);
    }
    label.strip_prefix('T')?.parse().ok()
}

/// The lock file guarding a tablet.
pub fn lock_path(tablet: &Path) -> PathBuf {
    let mut p = tablet.as_os_str().to_owned();
    p.push(LOCK_SUFFIX);
    PathBuf::from(p)
}

/// A tablet opened for writing together with its cell lock.
///
/// Field order matters: the tablet handle is closed before the lock is
/// released.
#[derive(Debug)]
pub struct CellWriter {
    cell: CellId,
    tablet: Tablet,
    _lock: CellLock,
}

impl CellWriter {
    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn tablet(&self) -> &Tablet {
        &self.tablet
    }

    /// Append rows, stamping fresh row ids into `primary_key` when the table
    /// has one. Returns the ids assigned (empty for non-primary tables).
    pub fn append(&mut self, rows: RowBlock) -> Result<Vec<RowId>, StorageError> {
        let n = rows.len() as u64;
        if n == 0 {
            return Ok(Vec::new());
        }
        let schema = self.tablet.schema().clone();
        let Some(pk) = schema.primary_key.as_deref() else {
            self.tablet.append(&rows, self.tablet.next_serial())?;
            return Ok(Vec::new());
        };

        let start = self.tablet.next_serial();
        let end = start + n;
        if end - 1 > u32::MAX as u64 {
            return Err(StorageError::InvariantViolation(format!(
                "serial counter of cell {} would overflow",
                self.cell
            )));
        }
        let ids: Vec<RowId> = (start..end).map(|s| self.cell.raw() | s).collect();
        let pk_type = schema
            .column_type(pk)
            .ok_or_else(|| StorageError::InvariantViolation(format!("primary key {pk} not in schema")))?;
        let mut rows = rows;
        rows.push_column(pk, pk_type, ids.clone())
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?;
        self.tablet.append(&rows, end)?;
        Ok(ids)
    }

    /// Replace the tablet contents (copy-on-write), keeping the serial counter.
    pub fn rewrite(&mut self, rows: &RowBlock) -> Result<(), StorageError> {
        self.tablet.rewrite(rows)
    }
}

/// Maps cells to tablet files below a catalog root and mediates locked writes.
#[derive(Debug, Clone)]
pub struct CellStore {
    root: PathBuf,
    partitioning: Partitioning,
    lock: LockPolicy,
}

impl CellStore {
    pub fn new(root: impl Into<PathBuf>, partitioning: Partitioning, lock: LockPolicy) -> Self {
        Self {
            root: root.into(),
            partitioning,
            lock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partitioning(&self) -> &Partitioning {
        &self.partitioning
    }

    /// Directory holding the tablets of pixel `components` (the parent's directory).
    fn pixel_dir(&self, components: &[String]) -> PathBuf {
        let mut dir = self.root.clone();
        if let Some((_, parents)) = components.split_last() {
            dir.extend(parents);
        }
        dir
    }

    /// Directory holding the children of the pixel with path `components`.
    pub fn children_dir(&self, components: &[String]) -> PathBuf {
        let mut dir = self.root.clone();
        dir.extend(components);
        dir
    }

    /// Tablet file name stem of a pixel component and table: `<q>.<table>.`
    fn tablet_prefix(component: &str, table: &str) -> String {
        format!("{component}.{table}.")
    }

    /// Deterministic tablet path of `(cell, table)`.
    pub fn tablet_path(&self, cell: CellId, table: &str) -> PathBuf {
        let d = self.partitioning.decode(cell);
        let components = sky::pixel_path(d.x, d.y, self.partitioning.level);
        let last = components.last().map(String::as_str).unwrap_or("");
        self.pixel_dir(&components).join(format!(
            "{}{}.{TABLET_EXTENSION}",
            Self::tablet_prefix(last, table),
            slice_label(d.slice)
        ))
    }

    pub fn cell_exists(&self, cell: CellId, table: &str) -> bool {
        self.tablet_path(cell.cell(), table).is_file()
    }

    /// Time slices with a tablet of `table` for the pixel `components`.
    pub fn slices_at(&self, components: &[String], table: &str) -> Result<Vec<u32>, StorageError> {
        let Some(last) = components.last() else {
            return Ok(Vec::new());
        };
        let dir = self.pixel_dir(components);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let prefix = Self::tablet_prefix(last, table);
        let suffix = format!(".{TABLET_EXTENSION}");
        let mut slices = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(label) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                if let Some(slice) = parse_slice_label(label) {
                    slices.push(slice);
                }
            }
        }
        slices.sort_unstable();
        Ok(slices)
    }

    /// Open a tablet for reading. A missing tablet is `None`.
    pub fn open_read(&self, cell: CellId, table: &str) -> Result<Option<Tablet>, StorageError> {
        Tablet::open_if_exists(&self.tablet_path(cell.cell(), table))
    }

    /// Read every committed row of a tablet. A missing tablet is `None`.
    pub fn read(&self, cell: CellId, table: &str) -> Result<Option<RowBlock>, StorageError> {
        self.open_read(cell, table)?
            .map(|t| t.read_all())
            .transpose()
    }

    fn writer_from_lock(
        &self,
        cell: CellId,
        path: PathBuf,
        lock: CellLock,
        schema: &TableSchema,
    ) -> Result<CellWriter, StorageError> {
        let tablet = if path.is_file() {
            Tablet::open(&path, true)?
        } else {
            Tablet::create(&path, schema)?
        };
        Ok(CellWriter {
            cell,
            tablet,
            _lock: lock,
        })
    }

    fn prepare(&self, cell: CellId, table: &str) -> Result<PathBuf, StorageError> {
        let path = self.tablet_path(cell.cell(), table);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Open a tablet for writing without blocking. `Ok(None)` means the cell
    /// is locked by another writer.
    pub fn try_open_write(
        &self,
        cell: CellId,
        table: &str,
        schema: &TableSchema,
    ) -> Result<Option<CellWriter>, StorageError> {
        let path = self.prepare(cell, table)?;
        match CellLock::try_acquire(&lock_path(&path))? {
            Some(lock) => self.writer_from_lock(cell.cell(), path, lock, schema).map(Some),
            None => Ok(None),
        }
    }

    /// Open a tablet for writing, waiting for the lock per the lock policy.
    pub fn open_write(
        &self,
        cell: CellId,
        table: &str,
        schema: &TableSchema,
    ) -> Result<CellWriter, StorageError> {
        let path = self.prepare(cell, table)?;
        let lock = CellLock::acquire(&lock_path(&path), &self.lock)?;
        self.writer_from_lock(cell.cell(), path, lock, schema)
    }

    /// Append pre-grouped rows to `table`, one group per target cell.
    ///
    /// Each pending cell is tried without blocking; locked cells go to the
    /// back of the queue. After a full sweep that finds every pending cell
    /// locked, the store backs off. The append fails once
    /// `max_append_attempts` consecutive tries have missed; every successful
    /// cell write restores the full budget.
    ///
    /// Returns, per group, the row ids assigned (empty for non-primary tables).
    pub fn append_groups(
        &self,
        table: &str,
        schema: &TableSchema,
        groups: Vec<(CellId, RowBlock)>,
    ) -> Result<Vec<(CellId, Vec<RowId>)>, StorageError> {
        self.append_groups_with(table, schema, groups, |_, _| {})
    }

    /// Like [`append_groups`](Self::append_groups), calling `committed` with
    /// the cell and row count of every group as soon as it is on disk. Groups
    /// reported this way stay written even when the append later fails.
    pub fn append_groups_with(
        &self,
        table: &str,
        schema: &TableSchema,
        groups: Vec<(CellId, RowBlock)>,
        mut committed: impl FnMut(CellId, usize),
    ) -> Result<Vec<(CellId, Vec<RowId>)>, StorageError> {
        let mut pending: VecDeque<(usize, CellId, RowBlock)> = groups
            .into_iter()
            .enumerate()
            .map(|(i, (cell, rows))| (i, cell, rows))
            .collect();
        let mut done: Vec<Option<(CellId, Vec<RowId>)>> = vec![None; pending.len()];
        let mut misses = 0u32;
        let mut locked_in_sweep = 0usize;

        while let Some((i, cell, rows)) = pending.pop_front() {
            match self.try_open_write(cell, table, schema)? {
                Some(mut writer) => {
                    let n = rows.len();
                    let ids = writer.append(rows)?;
                    debug!(table, cell = %cell, rows = n, "appended to cell");
                    committed(cell, n);
                    done[i] = Some((cell, ids));
                    misses = 0;
                    locked_in_sweep = 0;
                }
                None => {
                    misses += 1;
                    if misses >= self.lock.max_append_attempts {
                        warn!(table, attempts = misses, pending = pending.len() + 1, "giving up on locked cells");
                        return Err(StorageError::LockContention {
                            attempts: misses,
                            pending: pending.len() + 1,
                        });
                    }
                    pending.push_back((i, cell, rows));
                    locked_in_sweep += 1;
                    if locked_in_sweep >= pending.len() {
                        debug!(table, pending = pending.len(), "all pending cells locked, backing off");
                        thread::sleep(self.lock.backoff());
                        locked_in_sweep = 0;
                    }
                }
            }
        }

        done.into_iter()
            .map(|d| d.ok_or_else(|| StorageError::InvariantViolation("unwritten cell group".into())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;
    use tempfile::tempdir;

    fn primary_schema() -> TableSchema {
        let mut s = TableSchema::new(vec![
            ("id".to_string(), ColumnType::U64),
            ("ra".to_string(), ColumnType::F64),
            ("dec".to_string(), ColumnType::F64),
        ]);
        s.primary_key = Some("id".to_string());
        s.spatial_keys = Some(("ra".to_string(), "dec".to_string()));
        s
    }

    fn rows(n: usize) -> RowBlock {
        RowBlock::new()
            .with_column("id", ColumnType::U64, vec![0u64; n])
            .unwrap()
            .with_column("ra", ColumnType::F64, vec![10.0; n])
            .unwrap()
            .with_column("dec", ColumnType::F64, vec![20.0; n])
            .unwrap()
    }

    fn store(root: &Path) -> CellStore {
        let lock = LockPolicy {
            backoff_ms: 1,
            open_retries: Some(5),
            max_append_attempts: 20,
        };
        CellStore::new(root, Partitioning::new(6, 47892.0, 90.0).unwrap(), lock)
    }

    #[test]
    fn test_slice_labels() {
        assert_eq!(slice_label(0), "static");
        assert_eq!(slice_label(7), "T0007");
        assert_eq!(parse_slice_label("T0123"), Some(123));
        assert_eq!(parse_slice_label("static"), Some(0));
        assert_eq!(parse_slice_label("bogus"), None);
    }

    #[test]
    fn test_tablet_path_layout() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let cell = store.partitioning().cell_for_pos(10.0, 20.0, Some(48000.0));
        let path = store.tablet_path(cell, "catalog");
        let rel = path.strip_prefix(dir.path()).unwrap();
        // Five parent directories, then "<q6>.catalog.T0001.tab".
        assert_eq!(rel.components().count(), 6);
        let name = rel.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".catalog.T0001.tab"), "{name}");
        assert_eq!(lock_path(&path).extension().unwrap(), "lock");
    }

    #[test]
    fn test_serials_continue_across_appends() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let schema = primary_schema();
        let cell = store.partitioning().cell_for_pos(10.0, 20.0, None);

        let first = store.append_groups("catalog", &schema, vec![(cell, rows(5))]).unwrap();
        let second = store.append_groups("catalog", &schema, vec![(cell, rows(3))]).unwrap();
        let serials: Vec<u32> = first[0]
            .1
            .iter()
            .chain(&second[0].1)
            .map(|&id| CellId(id).serial())
            .collect();
        assert_eq!(serials, (1..=8).collect::<Vec<_>>());

        let tablet = store.open_read(cell, "catalog").unwrap().unwrap();
        assert_eq!(tablet.next_serial(), 9);
        assert_eq!(tablet.row_count(), 8);
        assert!(store.cell_exists(cell, "catalog"));
        assert!(!lock_path(tablet.path()).exists());
    }

    #[test]
    fn test_locked_cell_exhausts_attempts() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let schema = primary_schema();
        let cell = store.partitioning().cell_for_pos(10.0, 20.0, None);

        let _held = store.open_write(cell, "catalog", &schema).unwrap();
        match store.append_groups("catalog", &schema, vec![(cell, rows(1))]) {
            Err(StorageError::LockContention { attempts: 20, pending: 1 }) => {}
            other => panic!("expected LockContention, got {other:?}"),
        }
    }

    #[test]
    fn test_budget_counts_misses_since_last_write() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let schema = primary_schema();
        let pix = 2.0 / 64.0;
        let cells: Vec<CellId> = (0..25)
            .map(|i| store.partitioning().cell_for_xy_slice((i as f64 + 0.5) * pix, 0.5 * pix, 0))
            .collect();
        let held = cells[12];
        let _writer = store.open_write(held, "catalog", &schema).unwrap();

        let mut committed = Vec::new();
        let groups = cells.iter().map(|&c| (c, rows(1))).collect();
        let result = store.append_groups_with("catalog", &schema, groups, |cell, n| committed.push((cell, n)));
        match result {
            Err(StorageError::LockContention { attempts: 20, pending: 1 }) => {}
            other => panic!("expected LockContention, got {other:?}"),
        }
        assert_eq!(committed.len(), 24);
        assert!(committed.iter().all(|&(c, n)| c != held && n == 1));
        for cell in cells.iter().filter(|&&c| c != held) {
            assert_eq!(store.read(*cell, "catalog").unwrap().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_round_robin_skips_locked_cell() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let schema = primary_schema();
        let a = store.partitioning().cell_for_pos(10.0, 20.0, None);
        let b = store.partitioning().cell_for_pos(200.0, -40.0, None);

        let held = store.open_write(a, "catalog", &schema).unwrap();
        let s2 = store.clone();
        let schema2 = schema.clone();
        let handle = std::thread::spawn(move || {
            s2.append_groups("catalog", &schema2, vec![(a, rows(2)), (b, rows(1))])
        });
        // b is written while a is still locked.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !store.cell_exists(b, "catalog") && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(store.cell_exists(b, "catalog"));
        drop(held);
        let out = handle.join().unwrap();
        // Either finished after release, or ran out of attempts; b is written regardless.
        if let Ok(out) = out {
            assert_eq!(out[0].0, a);
            assert_eq!(out[0].1.len(), 2);
        }
        assert_eq!(store.read(b, "catalog").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_read_missing_cell_is_none() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let cell = store.partitioning().cell_for_pos(1.0, 1.0, None);
        assert!(store.read(cell, "catalog").unwrap().is_none());
    }
}
