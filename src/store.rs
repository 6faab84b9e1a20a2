//! Host → open ports map and its CSV checkpoint file.
//!
//! The checkpoint is rewritten wholesale after every batch through a sibling
//! temporary file and a rename, so a crash mid-flush leaves the previous
//! checkpoint intact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{ScanRecord, Target};

/// Header of the checkpoint artifact.
pub const CHECKPOINT_HEADER: [&str; 2] = ["Host IP", "Port number scanned"];

/// Discovered open ports per target, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultMap {
    entries: BTreeMap<Target, Vec<u16>>,
}

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `port` as open on `target`. Returns `false` if it was already known.
    pub fn record(&mut self, target: &Target, port: u16) -> bool {
        let ports = self.entries.entry(target.clone()).or_default();
        if ports.contains(&port) {
            return false;
        }
        ports.push(port);
        true
    }

    /// Make `target` known without any open port.
    pub fn insert_target(&mut self, target: &Target) {
        self.entries.entry(target.clone()).or_default();
    }

    /// Fold `other` into `self` with the same insert-if-absent rule as [`record`](Self::record).
    pub fn merge(&mut self, other: ResultMap) {
        for (target, ports) in other.entries {
            self.insert_target(&target);
            for port in ports {
                self.record(&target, port);
            }
        }
    }

    pub fn ports(&self, target: &Target) -> Option<&[u16]> {
        self.entries.get(target).map(Vec::as_slice)
    }

    pub fn contains(&self, target: &Target, port: u16) -> bool {
        self.ports(target).is_some_and(|p| p.contains(&port))
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Target, &[u16])> {
        self.entries.iter().map(|(t, p)| (t, p.as_slice()))
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of (target, port) pairs across all targets.
    pub fn open_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Parse a prior result artifact.
    ///
    /// Two row shapes are understood and may be mixed:
    /// - full-scan rows `target,port[,timestamp],flag`, of which only `Y` rows count
    /// - checkpoint rows `target,"[p1, p2, ...]"`
    ///
    /// Header rows and `N`/`E` rows are skipped quietly, malformed rows with a warning.
    pub fn from_reader<R: Read>(rdr: R) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(rdr);
        let mut map = ResultMap::new();

        for (idx, row) in reader.records().enumerate() {
            let line = idx + 1;
            let row = match row {
                Ok(r) => r,
                Err(e) if e.is_io_error() => return Err(e),
                Err(e) => {
                    warn!(line, error = %e, "skipping unreadable row");
                    continue;
                }
            };
            match classify_row(&row) {
                Row::Open(target, port) => {
                    map.record(&target, port);
                }
                Row::Checkpoint(target, ports) => {
                    map.insert_target(&target);
                    for port in ports {
                        map.record(&target, port);
                    }
                }
                Row::Skip => {}
                Row::Malformed(reason) => warn!(line, reason, "skipping malformed row"),
            }
        }

        Ok(map)
    }

    /// Write the checkpoint artifact: a header, then one row per target.
    pub fn write_csv<W: Write>(&self, w: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(w);
        wtr.write_record(CHECKPOINT_HEADER)?;
        for (target, ports) in self.iter() {
            let list = ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let cell = format!("[{list}]");
            wtr.write_record([target.as_str(), cell.as_str()])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

enum Row {
    Open(Target, u16),
    Checkpoint(Target, Vec<u16>),
    Skip,
    Malformed(&'static str),
}

fn classify_row(row: &csv::StringRecord) -> Row {
    if row.len() < 2 {
        return Row::Malformed("expected at least a target and a port column");
    }
    let target = &row[0];
    if target.is_empty() {
        return Row::Malformed("empty target");
    }
    if target.eq_ignore_ascii_case(CHECKPOINT_HEADER[0]) {
        return Row::Skip;
    }

    if row.len() == 2 {
        let list = &row[1];
        return match list.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            Some(inner) => match parse_port_list(inner) {
                Some(ports) => Row::Checkpoint(Target::new(target), ports),
                None => Row::Malformed("invalid port in list"),
            },
            None => Row::Malformed("missing response flag"),
        };
    }

    match &row[row.len() - 1] {
        "Y" => match row[1].parse::<u16>() {
            Ok(port) if port != 0 => Row::Open(Target::new(target), port),
            _ => Row::Malformed("invalid port"),
        },
        "N" | "E" => Row::Skip,
        _ => Row::Malformed("unknown response flag"),
    }
}

// Accepts `80, 443` as well as the quoted `'80', '443'` form older tools wrote.
fn parse_port_list(inner: &str) -> Option<Vec<u16>> {
    inner
        .split(',')
        .map(|p| p.trim().trim_matches(|c| c == '\'' || c == '"'))
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u16>().ok().filter(|&v| v != 0))
        .collect()
}

/// Receives scan output. The scheduler calls `record` for every probe and
/// `checkpoint` after every batch; an error from either halts the scan.
pub trait ScanSink: Send {
    fn record(&mut self, _record: &ScanRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn checkpoint(&mut self, map: &ResultMap) -> Result<(), StoreError>;
}

/// The checkpoint file backing a resumable scan.
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the map stored at this path. A missing file is an empty map.
    pub fn load(&self) -> Result<ResultMap, StoreError> {
        load_results(&self.path)
    }

    /// Atomically replace the file with `map`.
    pub fn flush(&self, map: &ResultMap) -> Result<(), StoreError> {
        let tmp = tmp_path(&self.path);
        let res = write_then_rename(&tmp, &self.path, map);
        if res.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        res?;
        debug!(
            path = %self.path.display(),
            targets = map.len(),
            open = map.open_count(),
            "checkpoint written"
        );
        Ok(())
    }
}

impl ScanSink for ResultStore {
    fn checkpoint(&mut self, map: &ResultMap) -> Result<(), StoreError> {
        self.flush(map)
    }
}

/// Load a seed or checkpoint file. A missing file is an empty map.
pub fn load_results(path: impl AsRef<Path>) -> Result<ResultMap, StoreError> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no prior results, starting empty");
            return Ok(ResultMap::new());
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let map = ResultMap::from_reader(file).map_err(|e| StoreError::csv(path, e))?;
    info!(
        path = %path.display(),
        targets = map.len(),
        open = map.open_count(),
        "loaded prior results"
    );
    Ok(map)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_then_rename(tmp: &Path, dest: &Path, map: &ResultMap) -> Result<(), StoreError> {
    let file = File::create(tmp).map_err(|e| StoreError::io(tmp, e))?;
    let mut w = BufWriter::new(file);
    map.write_csv(&mut w).map_err(|e| StoreError::csv(tmp, e))?;
    let file = w
        .into_inner()
        .map_err(|e| StoreError::io(tmp, e.into_error()))?;
    file.sync_all().map_err(|e| StoreError::io(tmp, e))?;
    fs::rename(tmp, dest).map_err(|e| StoreError::io(dest, e))?;
    sync_parent(dest)
}

/// Make the rename itself durable. Directories cannot be opened for syncing on
/// Windows, so there this is a no-op.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Target {
        Target::new(s)
    }

    #[test]
    fn record_is_idempotent() {
        let mut map = ResultMap::new();
        assert!(map.record(&t("10.0.0.1"), 80));
        let before = map.clone();
        assert!(!map.record(&t("10.0.0.1"), 80));
        assert_eq!(map, before);
        assert_eq!(map.ports(&t("10.0.0.1")), Some(&[80][..]));
    }

    #[test]
    fn ports_keep_discovery_order() {
        let mut map = ResultMap::new();
        map.record(&t("h"), 443);
        map.record(&t("h"), 22);
        map.record(&t("h"), 443);
        assert_eq!(map.ports(&t("h")), Some(&[443, 22][..]));
    }

    #[test]
    fn merge_unions_without_duplicates() {
        let mut a = ResultMap::new();
        a.record(&t("x"), 1);
        let mut b = ResultMap::new();
        b.record(&t("x"), 1);
        b.record(&t("x"), 2);
        b.insert_target(&t("y"));
        a.merge(b);
        assert_eq!(a.ports(&t("x")), Some(&[1, 2][..]));
        assert_eq!(a.ports(&t("y")), Some(&[][..]));
        assert_eq!(a.open_count(), 2);
    }

    #[test]
    fn seed_keeps_only_yes_rows() {
        let input = "\
Host IP,Port number scanned,Timestamp,Y/N response
10.0.0.1,22,Mon Jan  1 00:00:00 2024,N
10.0.0.1,80,Mon Jan  1 00:00:01 2024,Y
10.0.0.2,443,Y
10.0.0.3,25,2024-01-01T00:00:00Z,E
";
        let map = ResultMap::from_reader(input.as_bytes()).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains(&t("10.0.0.1"), 80));
        assert!(!map.contains(&t("10.0.0.1"), 22));
        assert!(map.contains(&t("10.0.0.2"), 443));
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let input = "\
10.0.0.1
10.0.0.2,eighty,Y
,80,Y
10.0.0.3,81,maybe
10.0.0.4,0,Y
10.0.0.5,8080,Y
";
        let map = ResultMap::from_reader(input.as_bytes()).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains(&t("10.0.0.5"), 8080));
    }

    #[test]
    fn checkpoint_rows_parse_including_quoted_ports() {
        let input = "\
Host IP,Port number scanned
10.0.0.1,\"[80, 443]\"
10.0.0.2,\"['22', '2222']\"
10.0.0.3,[]
";
        let map = ResultMap::from_reader(input.as_bytes()).unwrap();
        assert_eq!(map.ports(&t("10.0.0.1")), Some(&[80, 443][..]));
        assert_eq!(map.ports(&t("10.0.0.2")), Some(&[22, 2222][..]));
        assert_eq!(map.ports(&t("10.0.0.3")), Some(&[][..]));
    }

    #[test]
    fn checkpoint_csv_roundtrip() {
        let mut map = ResultMap::new();
        map.record(&t("10.0.0.1"), 80);
        map.record(&t("10.0.0.1"), 22);
        map.record(&t("host-b"), 8443);
        let mut buf = Vec::new();
        map.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("Host IP,Port number scanned"));
        assert!(text.contains("10.0.0.1,\"[80, 22]\""));
        assert_eq!(ResultMap::from_reader(buf.as_slice()).unwrap(), map);
    }

    #[test]
    fn flush_replaces_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open.csv");
        let store = ResultStore::new(&path);

        let mut map = ResultMap::new();
        map.record(&t("10.0.0.1"), 80);
        store.flush(&map).unwrap();
        map.record(&t("10.0.0.1"), 81);
        store.flush(&map).unwrap();

        assert_eq!(store.load().unwrap(), map);
        assert!(!dir.path().join("open.csv.tmp").exists());
    }

    #[test]
    fn flush_failure_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open.csv");
        let store = ResultStore::new(&path);
        let mut map = ResultMap::new();
        map.record(&t("10.0.0.1"), 80);
        store.flush(&map).unwrap();

        // A directory squatting on the temp name makes the next flush fail.
        fs::create_dir(dir.path().join("open.csv.tmp")).unwrap();
        map.record(&t("10.0.0.1"), 81);
        assert!(store.flush(&map).is_err());

        let on_disk = store.load().unwrap();
        assert_eq!(on_disk.ports(&t("10.0.0.1")), Some(&[80][..]));
    }

    #[cfg(unix)]
    #[test]
    fn parent_directory_sync() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_parent(&dir.path().join("open.csv")).is_ok());
        // A bare file name lives in the working directory.
        assert!(sync_parent(Path::new("open.csv")).is_ok());
        assert!(sync_parent(&dir.path().join("gone").join("open.csv")).is_err());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = load_results(dir.path().join("absent.csv")).unwrap();
        assert!(map.is_empty());
    }
}
