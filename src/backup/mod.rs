//! Backup — zip archive of a server's save directory.
//!
//! Backup is read-mostly and deliberately takes no operation lock; the
//! dispatcher refuses to run it while an upgrade is rewriting files. The
//! archive is written to a temp file first and persisted atomically so an
//! interrupted backup never leaves a truncated zip in the backups dir.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::profile::ProfileSnapshot;

/// Create a backup archive for the snapshot's save directory.
/// Returns the path of the written archive.
pub async fn run_backup(snapshot: &ProfileSnapshot, backups_dir: &Path) -> Result<PathBuf> {
    let save_dir = snapshot
        .save_dir
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no save directory configured"))?;
    let name = sanitize_name(&snapshot.identity.display_name);
    let backups_dir = backups_dir.to_path_buf();

    tokio::task::spawn_blocking(move || write_archive(&save_dir, &backups_dir, &name))
        .await
        .context("backup task panicked")?
}

fn write_archive(save_dir: &Path, backups_dir: &Path, name: &str) -> Result<PathBuf> {
    if !save_dir.exists() {
        anyhow::bail!("save directory does not exist: {}", save_dir.display());
    }
    std::fs::create_dir_all(backups_dir)
        .with_context(|| format!("failed to create backups dir {}", backups_dir.display()))?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let target = backups_dir.join(format!("{}-{}.zip", name, stamp));

    // Build the archive in a temp file in the same directory so the final
    // persist is a rename, not a copy.
    let tmp = tempfile::NamedTempFile::new_in(backups_dir)
        .context("failed to create temporary archive")?;
    {
        let mut zip = ZipWriter::new(tmp.as_file());
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        add_dir_recursive(&mut zip, save_dir, Path::new(""), options)?;
        zip.finish().context("failed to finalize archive")?;
    }
    tmp.persist(&target)
        .with_context(|| format!("failed to persist archive to {}", target.display()))?;

    tracing::info!("Backup written: {}", target.display());
    Ok(target)
}

fn add_dir_recursive(
    zip: &mut ZipWriter<&File>,
    root: &Path,
    rel: &Path,
    options: FileOptions,
) -> Result<()> {
    let dir = root.join(rel);
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
    {
        let entry = entry?;
        let entry_rel = rel.join(entry.file_name());
        let entry_name = entry_rel.to_string_lossy().replace('\\', "/");
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            zip.add_directory(format!("{}/", entry_name), options)?;
            add_dir_recursive(zip, root, &entry_rel, options)?;
        } else if file_type.is_file() {
            zip.start_file(entry_name, options)?;
            let mut file = File::open(entry.path())?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            zip.write_all(&buf)?;
        }
        // symlinks and other specials are skipped
    }
    Ok(())
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "server".to_string()
    } else {
        cleaned
    }
}
