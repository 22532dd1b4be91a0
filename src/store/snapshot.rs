// =============================================================================
// Snapshot persistence — atomic, checksummed JSON with a backup ring
// =============================================================================
//
// The authoritative on-disk image of the engine state is a single JSON
// document:
//
//   { schema_version, open_positions: [...], closed_trades: [...],
//     metadata: {...}, checksum: "<sha256 hex>" }
//
// The checksum covers the document serialised with an empty checksum field,
// so the file stays one valid UTF-8 JSON document AND self-validates.
//
// Write protocol: serialise -> write temp sibling -> fsync -> rename over
// the live file. The previous live file is first copied into a rolling ring
// of timestamped backups (default 10) so that a corrupted write never costs
// more than one generation of state. Readers during a write observe the
// previous consistent image.
// =============================================================================

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::store::{ClosedTrade, Position};

/// Bumped whenever the persisted shape changes incompatibly.
pub const SCHEMA_VERSION: u32 = 2;

/// Free-form document metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub saved_at: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub engine_version: String,
}

/// The complete persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub schema_version: u32,
    pub open_positions: Vec<Position>,
    pub closed_trades: Vec<ClosedTrade>,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
    #[serde(default)]
    pub checksum: String,
}

impl SnapshotDocument {
    pub fn new(
        open_positions: Vec<Position>,
        closed_trades: Vec<ClosedTrade>,
        symbol: &str,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            open_positions,
            closed_trades,
            metadata: SnapshotMetadata {
                saved_at: Utc::now().to_rfc3339(),
                symbol: symbol.to_string(),
                engine_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            checksum: String::new(),
        }
    }

    /// SHA-256 over the document serialised with the checksum field blank.
    fn compute_checksum(&self) -> Result<String> {
        let mut blank = self.clone();
        blank.checksum = String::new();
        let bytes = serde_json::to_vec(&blank)
            .map_err(|e| EngineError::StatePersistenceFailure(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Validate the embedded checksum.
    pub fn checksum_ok(&self) -> bool {
        match self.compute_checksum() {
            Ok(expected) => expected == self.checksum,
            Err(_) => false,
        }
    }
}

/// Write `doc` atomically to `path`, rotating the previous live file into
/// `backup_dir` first. The ring keeps the newest `ring_size` backups.
pub fn write_snapshot(
    path: &Path,
    backup_dir: &Path,
    ring_size: usize,
    mut doc: SnapshotDocument,
) -> Result<()> {
    doc.checksum = doc.compute_checksum()?;

    let json = serde_json::to_string_pretty(&doc)
        .map_err(|e| EngineError::StatePersistenceFailure(e.to_string()))?;

    // Rotate the previous image into the backup ring before replacing it.
    if path.exists() {
        if let Err(e) = rotate_backup(path, backup_dir, ring_size) {
            // Backup failure degrades durability but must not block the
            // fresh write.
            warn!(error = %e, "snapshot backup rotation failed");
        }
    }

    let tmp_path = tmp_sibling(path);
    {
        let mut file = fs::File::create(&tmp_path)
            .map_err(|e| EngineError::StatePersistenceFailure(format!("create tmp: {e}")))?;
        file.write_all(json.as_bytes())
            .map_err(|e| EngineError::StatePersistenceFailure(format!("write tmp: {e}")))?;
        file.sync_all()
            .map_err(|e| EngineError::StatePersistenceFailure(format!("fsync tmp: {e}")))?;
    }
    fs::rename(&tmp_path, path)
        .map_err(|e| EngineError::StatePersistenceFailure(format!("rename tmp: {e}")))?;

    debug!(
        path = %path.display(),
        open = doc.open_positions.len(),
        closed = doc.closed_trades.len(),
        "snapshot written (atomic)"
    );
    Ok(())
}

/// Load and checksum-validate the snapshot at `path`.
pub fn load_snapshot(path: &Path) -> Result<SnapshotDocument> {
    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::StatePersistenceFailure(format!("read snapshot: {e}")))?;

    let doc: SnapshotDocument = serde_json::from_str(&content)
        .map_err(|e| EngineError::StatePersistenceFailure(format!("parse snapshot: {e}")))?;

    if !doc.checksum_ok() {
        return Err(EngineError::StatePersistenceFailure(format!(
            "checksum mismatch in {}",
            path.display()
        )));
    }
    Ok(doc)
}

/// Load the live snapshot, falling back through the backup ring newest
/// first when the live file is missing or corrupt. Returns `Ok(None)` when
/// nothing usable exists anywhere (fresh start).
pub fn load_with_backups(path: &Path, backup_dir: &Path) -> Result<Option<SnapshotDocument>> {
    if path.exists() {
        match load_snapshot(path) {
            Ok(doc) => return Ok(Some(doc)),
            Err(e) => warn!(error = %e, "live snapshot unusable — trying backups"),
        }
    } else {
        debug!(path = %path.display(), "no snapshot on disk");
    }

    for backup in backups_newest_first(backup_dir) {
        match load_snapshot(&backup) {
            Ok(doc) => {
                info!(backup = %backup.display(), "state restored from backup");
                return Ok(Some(doc));
            }
            Err(e) => warn!(backup = %backup.display(), error = %e, "backup unusable"),
        }
    }

    if path.exists() {
        // A snapshot existed but neither it nor any backup validated.
        return Err(EngineError::StatePersistenceFailure(
            "snapshot and all backups failed validation".into(),
        ));
    }
    Ok(None)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Copy the live snapshot into the backup ring and prune old entries.
fn rotate_backup(path: &Path, backup_dir: &Path, ring_size: usize) -> std::io::Result<()> {
    fs::create_dir_all(backup_dir)?;

    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let mut target = backup_dir.join(format!("state_{stamp}.json"));
    let mut counter = 0u32;
    while target.exists() {
        counter += 1;
        target = backup_dir.join(format!("state_{stamp}_{counter}.json"));
    }
    fs::copy(path, &target)?;

    // Prune the oldest entries beyond the ring size.
    let mut backups = backups_newest_first(backup_dir);
    while backups.len() > ring_size {
        if let Some(oldest) = backups.pop() {
            if let Err(e) = fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), error = %e, "failed to prune old backup");
            }
        }
    }
    Ok(())
}

/// All ring entries, newest first (lexicographic timestamp order).
fn backups_newest_first(backup_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(backup_dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|x| x == "json").unwrap_or(false)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("state_"))
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths.reverse();
    paths
}
