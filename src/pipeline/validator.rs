//! Validate stage: screens ligands and fans out docking tasks.
//!
//! Each ligand file is scanned once. Per line, in order:
//!
//! 1. banned-element check (when enabled)
//! 2. duplicate `ATOM` coordinates
//! 3. dynamic tranche filter on `Tranche:` lines (when enabled)
//!
//! Passing ligands produce one task per scenario replica. After the last
//! ligand of a collection the stage emits exactly one completion marker with
//! the number of tasks dispatched for it.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use super::context::JobContext;
use super::events::{CollectionMarker, FailureLog, SkipReason, SummaryEvent};
use super::types::{DockingStatus, DockingTask, LigandRecord, UnpackedCollection};
use crate::error::StageError;
use crate::scheduler::{QueueReceiver, QueueSender, Received};

/// Formats whose headers carry SMILES and heavy-atom annotations.
const ANNOTATED_FORMATS: [&str; 4] = ["pdbqt", "mol2", "pdb", "sdf"];

const NOT_AVAILABLE: &str = "N/A";

/// Runs one validate worker until it receives a stop sentinel.
pub async fn run_validator(
    ctx: Arc<JobContext>,
    rx: QueueReceiver<UnpackedCollection>,
    docking: QueueSender<DockingTask>,
    summary: QueueSender<SummaryEvent>,
) -> Result<(), StageError> {
    loop {
        match rx.recv().await {
            Received::Item(collection) => {
                validate_collection(&ctx, collection, &docking, &summary).await?
            }
            Received::Idle => continue,
            Received::Stop => return Ok(()),
            Received::Closed => return Err(StageError::QueueClosed(rx.name())),
        }
    }
}

async fn validate_collection(
    ctx: &JobContext,
    collection: UnpackedCollection,
    docking: &QueueSender<DockingTask>,
    summary: &QueueSender<SummaryEvent>,
) -> Result<(), StageError> {
    for scenario in &ctx.scenarios {
        tokio::fs::create_dir_all(collection.scratch_dir.join("output").join(&scenario.key))
            .await?;
    }

    let per_ligand = ctx.completions_per_ligand();
    let mut expected = 0u64;
    let mut skipped = 0usize;

    for ligand in collection.ligands.values() {
        let content = match tokio::fs::read(&ligand.path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(ligand = %ligand.ligand_key, error = %e, "Cannot read ligand file");
                skipped += 1;
                emit_skip(summary, ligand, format!("unreadable ligand file: {}", e)).await?;
                continue;
            }
        };

        if let Err(reason) = screen_ligand(
            &content,
            ctx.banned_elements.as_ref(),
            ctx.tranche_filter.as_ref(),
        ) {
            debug!(ligand = %ligand.ligand_key, %reason, "Ligand skipped");
            skipped += 1;
            emit_skip(summary, ligand, reason.to_string()).await?;
            continue;
        }

        let attrs = extract_attrs(
            &ctx.config.ligand_library_format,
            &content,
            &ctx.config.print_attrs_in_summary,
        );
        dispatch(ctx, &collection, ligand, attrs, docking).await?;
        expected += per_ligand;
    }

    info!(
        collection = %collection.base_collection_key,
        ligands = collection.ligands.len(),
        skipped,
        expected,
        "Collection dispatched"
    );

    summary
        .send(SummaryEvent::CollectionDone(CollectionMarker {
            base_collection_key: collection.base_collection_key,
            expected_completions: expected,
            scratch_dir: collection.scratch_dir,
        }))
        .await?;

    Ok(())
}

async fn emit_skip(
    summary: &QueueSender<SummaryEvent>,
    ligand: &LigandRecord,
    reason: String,
) -> Result<(), StageError> {
    summary
        .send(SummaryEvent::Skip(FailureLog {
            base_collection_key: ligand.base_collection_key.clone(),
            collection_key: ligand.collection_key.clone(),
            ligand_key: ligand.ligand_key.clone(),
            reason,
        }))
        .await?;
    Ok(())
}

async fn dispatch(
    ctx: &JobContext,
    collection: &UnpackedCollection,
    ligand: &LigandRecord,
    attrs: Vec<(String, String)>,
    docking: &QueueSender<DockingTask>,
) -> Result<(), StageError> {
    for scenario in &ctx.scenarios {
        for replica in 0..scenario.replicas {
            let output_dir = collection
                .scratch_dir
                .join("output")
                .join(&scenario.key)
                .join(&ligand.ligand_key)
                .join(replica.to_string());
            tokio::fs::create_dir_all(&output_dir).await?;

            docking
                .send(DockingTask {
                    scenario_key: scenario.key.clone(),
                    backend: scenario.backend.clone(),
                    program_long: scenario.program_long.clone(),
                    config_path: scenario.config_path.clone(),
                    replica,
                    ligand_key: ligand.ligand_key.clone(),
                    ligand_path: ligand.path.clone(),
                    collection_key: ligand.collection_key.clone(),
                    base_collection_key: ligand.base_collection_key.clone(),
                    output_dir,
                    timeout: ctx.config.program_timeout(),
                    threads: ctx.config.threads_per_docking,
                    attrs: attrs.clone(),
                    status: DockingStatus::Failed,
                    score: None,
                    reason: None,
                    seconds: 0.0,
                })
                .await?;
        }
    }
    Ok(())
}

/// Runs the line checks over a ligand file.
pub fn screen_ligand(
    content: &str,
    banned_elements: Option<&Regex>,
    tranche_filter: Option<&Regex>,
) -> Result<(), SkipReason> {
    let mut coordinates: HashSet<String> = HashSet::new();

    for line in content.lines() {
        if let Some(banned) = banned_elements {
            if banned.is_match(line) {
                return Err(SkipReason::DisallowedElement);
            }
        }

        if line.starts_with("ATOM") {
            let triple = line
                .split_whitespace()
                .skip(5)
                .take(3)
                .collect::<Vec<_>>()
                .join(":");
            if !coordinates.insert(triple) {
                return Err(SkipReason::DuplicateCoordinates);
            }
        }

        if let Some(filter) = tranche_filter {
            if line.contains("Tranche:") {
                if let Some(tranche) = line.split_whitespace().nth(2) {
                    if !filter.is_match(tranche) {
                        return Err(SkipReason::TrancheFilter);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Extracts the requested attributes; missing values are `N/A`.
pub fn extract_attrs(format: &str, content: &str, requested: &[String]) -> Vec<(String, String)> {
    let mut attrs: Vec<(String, Option<String>)> =
        requested.iter().map(|key| (key.clone(), None)).collect();

    if ANNOTATED_FORMATS.contains(&format) {
        for line in content.lines() {
            let line = line.trim();
            let found = if let Some((_, rest)) = line.split_once("SMILES_current:") {
                Some(("smi", rest))
            } else if let Some((_, rest)) = line.split_once("SMILES:") {
                Some(("smi", rest))
            } else {
                line.split_once("* Heavy atom count:")
                    .map(|(_, rest)| ("heavy_atom_count", rest))
            };

            if let Some((key, value)) = found {
                if let Some(slot) = attrs.iter_mut().find(|(k, _)| k == key) {
                    slot.1 = Some(value.trim().to_string());
                }
            }

            if attrs.iter().all(|(_, v)| v.is_some()) {
                break;
            }
        }
    }

    attrs
        .into_iter()
        .map(|(key, value)| (key, value.unwrap_or_else(|| NOT_AVAILABLE.to_string())))
        .collect()
}
