//! Unpack stage: extracts archives and applies the collection selection mode.
//!
//! Archives are gzip tarballs with one top-level directory (the collection
//! number) holding `<ligand_key>.<ext>` files and an optional `.listing`
//! sidecar. A ligand's key is its file name up to the first `.`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, error, info, warn};

use super::types::{DownloadedCollection, LigandRecord, SelectionMode, UnpackedCollection};
use crate::error::{ArchiveError, StageError};
use crate::scheduler::{QueueReceiver, QueueSender, Received};

/// Prescreen sidecar file name.
pub const LISTING_FILE: &str = ".listing";

/// Result of extracting one archive.
#[derive(Debug, Default)]
pub struct ExtractedArchive {
    pub ligands: BTreeMap<String, PathBuf>,
    pub listing: Option<PathBuf>,
}

/// Runs one unpack worker until it receives a stop sentinel.
pub async fn run_unpacker(
    rx: QueueReceiver<DownloadedCollection>,
    validate: QueueSender<UnpackedCollection>,
) -> Result<(), StageError> {
    loop {
        match rx.recv().await {
            Received::Item(item) => {
                let collection = unpack(item).await?;
                validate.send(collection).await?;
            }
            Received::Idle => continue,
            Received::Stop => return Ok(()),
            Received::Closed => return Err(StageError::QueueClosed(rx.name())),
        }
    }
}

async fn unpack(item: DownloadedCollection) -> Result<UnpackedCollection, StageError> {
    let key = item.task.collection_key.clone();
    let archive_path = item.archive_path.clone();
    let scratch_dir = item.scratch_dir.clone();

    let extracted = tokio::task::spawn_blocking(move || extract_archive(&archive_path, &scratch_dir))
        .await
        .map_err(|e| StageError::Panicked(e.to_string()))?;

    let extracted = match extracted {
        Ok(extracted) => extracted,
        Err(e) => {
            error!(collection = %key, error = %e, "Cannot open collection archive; treating it as empty");
            ExtractedArchive::default()
        }
    };

    let total = extracted.ligands.len();
    let ligands = select_ligands(&key, extracted, &item.task.selection);
    info!(collection = %key, total, selected = ligands.len(), "Collection unpacked");

    Ok(UnpackedCollection {
        base_collection_key: key,
        scratch_dir: item.scratch_dir,
        ligands,
    })
}

/// Extracts every entry of `archive` below `dest` and indexes the ligands.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ExtractedArchive, ArchiveError> {
    let file = File::open(archive).map_err(|source| ArchiveError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    let malformed = |reason: String| ArchiveError::MalformedEntry {
        path: archive.to_path_buf(),
        reason,
    };

    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut extracted = ExtractedArchive::default();

    let entries = tar.entries().map_err(|e| malformed(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| malformed(e.to_string()))?;
        let entry_path = entry.path().map_err(|e| malformed(e.to_string()))?.into_owned();

        if !entry.unpack_in(dest).map_err(|e| malformed(e.to_string()))? {
            warn!(entry = %entry_path.display(), "Skipping archive entry outside the collection");
            continue;
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let Some(file_name) = entry_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let local_path = dest.join(&entry_path);

        if file_name == LISTING_FILE {
            extracted.listing = Some(local_path);
            continue;
        }

        let ligand_key = file_name.split('.').next().unwrap_or(file_name);
        if ligand_key.is_empty() {
            continue;
        }
        extracted.ligands.insert(ligand_key.to_string(), local_path);
    }

    Ok(extracted)
}

/// Applies the selection mode to an extracted collection.
pub fn select_ligands(
    collection_key: &str,
    extracted: ExtractedArchive,
    mode: &SelectionMode,
) -> BTreeMap<String, LigandRecord> {
    let record = |ligand_key: &str, path: PathBuf| LigandRecord {
        ligand_key: ligand_key.to_string(),
        path,
        collection_key: collection_key.to_string(),
        base_collection_key: collection_key.to_string(),
    };

    match mode {
        SelectionMode::Full => extracted
            .ligands
            .into_iter()
            .map(|(key, path)| {
                let ligand = record(&key, path);
                (key, ligand)
            })
            .collect(),

        SelectionMode::Named(names) => {
            let mut selected = BTreeMap::new();
            for name in names {
                match extracted.ligands.get(name) {
                    Some(path) => {
                        selected.insert(name.clone(), record(name, path.clone()));
                    }
                    None => {
                        warn!(collection = collection_key, ligand = %name, "Named ligand not in archive")
                    }
                }
            }
            selected
        }

        SelectionMode::Prescreen { cutoff } => {
            let Some(listing) = extracted.listing.as_deref() else {
                warn!(collection = collection_key, "Prescreen collection has no listing");
                return BTreeMap::new();
            };
            let mut reader = match csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_path(listing)
            {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(collection = collection_key, error = %e, "Cannot read prescreen listing");
                    return BTreeMap::new();
                }
            };

            let mut selected = BTreeMap::new();
            for (row_no, row) in reader.records().enumerate() {
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        warn!(collection = collection_key, row = row_no + 1, error = %e, "Unreadable listing row");
                        continue;
                    }
                };
                if row.iter().all(str::is_empty) {
                    continue;
                }
                let Some((screen_key, ligand_key, rank)) = parse_listing_row(&row) else {
                    warn!(collection = collection_key, row = row_no + 1, "Malformed listing row");
                    continue;
                };
                if rank >= *cutoff {
                    continue;
                }
                let Some(path) = extracted.ligands.get(ligand_key) else {
                    warn!(collection = collection_key, ligand = ligand_key, "Listed ligand not in archive");
                    continue;
                };

                let mut ligand = record(ligand_key, path.clone());
                ligand.collection_key = screen_key.to_string();
                debug!(ligand = ligand_key, collection = screen_key, rank, "Prescreen ligand kept");
                selected.insert(ligand_key.to_string(), ligand);
            }
            selected
        }
    }
}

/// Splits a `collection_key,ligand_key,rank_index` listing row.
fn parse_listing_row(row: &csv::StringRecord) -> Option<(&str, &str, u64)> {
    if row.len() != 3 {
        return None;
    }
    let (collection_key, ligand_key) = (row.get(0)?, row.get(1)?);
    if collection_key.is_empty() || ligand_key.is_empty() {
        return None;
    }
    let rank = row.get(2)?.parse().ok()?;
    Some((collection_key, ligand_key, rank))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::path::Path;

    /// Writes a collection tarball with `files` under the directory `number`.
    pub fn write_collection(path: &Path, number: &str, files: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}/{}", number, name), content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::write_collection;
    use super::*;
    use tempfile::TempDir;

    fn extracted(temp: &TempDir, files: &[(&str, &str)]) -> ExtractedArchive {
        let archive = temp.path().join("tmp.tar.gz");
        write_collection(&archive, "1", files);
        extract_archive(&archive, temp.path()).unwrap()
    }

    #[test]
    fn test_extract_indexes_ligands_and_listing() {
        let temp = TempDir::new().unwrap();
        let archive = extracted(
            &temp,
            &[
                ("Z100.pdbqt", "ATOM"),
                ("Z200.xtal.pdbqt", "ATOM"),
                (".listing", "AAAA_1,Z100,0\n"),
            ],
        );

        assert_eq!(archive.ligands.len(), 2);
        assert_eq!(archive.ligands["Z100"], temp.path().join("1/Z100.pdbqt"));
        assert!(archive.ligands.contains_key("Z200"));
        assert_eq!(archive.listing, Some(temp.path().join("1/.listing")));
        assert!(temp.path().join("1/Z200.xtal.pdbqt").exists());
    }

    #[test]
    fn test_open_failure() {
        let temp = TempDir::new().unwrap();
        let err = extract_archive(&temp.path().join("absent.tar.gz"), temp.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }));
    }

    #[test]
    fn test_named_selection_ignores_absent() {
        let temp = TempDir::new().unwrap();
        let archive = extracted(&temp, &[("Z1.pdbqt", ""), ("Z2.pdbqt", "")]);
        let selected = select_ligands(
            "AAAA_1",
            archive,
            &SelectionMode::Named(vec!["Z2".to_string(), "Z9".to_string()]),
        );
        assert_eq!(selected.keys().collect::<Vec<_>>(), vec!["Z2"]);
    }

    #[test]
    fn test_prescreen_selection() {
        let temp = TempDir::new().unwrap();
        let archive = extracted(
            &temp,
            &[
                ("Z1.pdbqt", ""),
                ("Z2.pdbqt", ""),
                ("Z3.pdbqt", ""),
                (".listing", "BBCC_4,Z1,0\nBBCC_5,Z2,3\nnot,a,row,at all\nBBCC_6,Z3,1\nBBCC_7,Z404,0\n"),
            ],
        );

        let selected = select_ligands("AAAA_1", archive, &SelectionMode::Prescreen { cutoff: 2 });

        assert_eq!(selected.len(), 2);
        assert_eq!(selected["Z1"].collection_key, "BBCC_4");
        assert_eq!(selected["Z1"].base_collection_key, "AAAA_1");
        assert_eq!(selected["Z3"].collection_key, "BBCC_6");
        assert!(!selected.contains_key("Z2"));
    }

    #[test]
    fn test_prescreen_listing_honors_quoted_fields() {
        let temp = TempDir::new().unwrap();
        let archive = extracted(
            &temp,
            &[
                ("Z1.pdbqt", ""),
                ("Z2.pdbqt", ""),
                (".listing", "\"BBCC_4,x\",\"Z1\",0\n\"Z2,a\",12\nBBCC_5 , Z2 , 1\n"),
            ],
        );

        let selected = select_ligands("AAAA_1", archive, &SelectionMode::Prescreen { cutoff: 2 });

        assert_eq!(selected.len(), 2);
        assert_eq!(selected["Z1"].collection_key, "BBCC_4,x");
        assert_eq!(selected["Z2"].collection_key, "BBCC_5");
    }

    #[tokio::test]
    async fn test_unpack_corrupt_archive_yields_empty_collection() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("tmp.tar.gz");
        std::fs::write(&archive_path, b"not a tarball").unwrap();

        let collection = unpack(DownloadedCollection {
            task: crate::pipeline::types::CollectionTask {
                collection_key: "AAAA_1".to_string(),
                locator: crate::storage::StorageLocator::SharedFs(archive_path.clone()),
                selection: SelectionMode::Full,
                expected_dockings: 2,
            },
            scratch_dir: temp.path().to_path_buf(),
            archive_path,
        })
        .await
        .unwrap();

        assert_eq!(collection.base_collection_key, "AAAA_1");
        assert!(collection.ligands.is_empty());
    }
}
