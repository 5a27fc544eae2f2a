//! Per-scenario summary tables.
//!
//! One row per ligand that docked successfully at least once. Replicas add
//! scores to the same row. The reduced table flattens scores, attributes and
//! tranche letters into columns in a fixed order:
//!
//! `ligand, collection_key, scenario, score_average, score_min, attr_*, tranche_*, score_*`

use std::collections::HashMap;

use crate::pipeline::types::DockingTask;

/// Accumulated results of one ligand in one scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSummaryRow {
    pub ligand: String,
    pub collection_key: String,
    pub scenario: String,
    pub scores: Vec<f64>,
    pub attrs: Vec<(String, String)>,
}

impl ScenarioSummaryRow {
    pub fn score_min(&self) -> Option<f64> {
        self.scores.iter().copied().reduce(f64::min)
    }

    pub fn score_average(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
    }

    /// Letters of the tranche part of the collection key (before `_`).
    pub fn tranche_letters(&self) -> Vec<String> {
        let tranche = self
            .collection_key
            .split_once('_')
            .map(|(tranche, _)| tranche)
            .unwrap_or(&self.collection_key);
        tranche.chars().map(String::from).collect()
    }
}

/// Successful results of one scenario, in first-seen ligand order.
#[derive(Debug, Clone, Default)]
pub struct SummaryTable {
    scenario: String,
    rows: Vec<ScenarioSummaryRow>,
    index: HashMap<String, usize>,
}

impl SummaryTable {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            ..Self::default()
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[ScenarioSummaryRow] {
        &self.rows
    }

    /// Adds the score of a successful task. Failed tasks are ignored.
    pub fn record(&mut self, task: &DockingTask) {
        let Some(score) = task.score.filter(|_| task.is_success()) else {
            return;
        };

        if let Some(&idx) = self.index.get(&task.ligand_key) {
            self.rows[idx].scores.push(score);
            return;
        }

        self.index.insert(task.ligand_key.clone(), self.rows.len());
        self.rows.push(ScenarioSummaryRow {
            ligand: task.ligand_key.clone(),
            collection_key: task.collection_key.clone(),
            scenario: self.scenario.clone(),
            scores: vec![score],
            attrs: task.attrs.clone(),
        });
    }

    /// Flattens the table into fixed columns.
    pub fn reduce(&self) -> ReducedTable {
        let mut attr_names: Vec<String> = Vec::new();
        let mut tranche_width = 0;
        let mut score_width = 0;

        let rows = self
            .rows
            .iter()
            .map(|row| {
                for (name, _) in &row.attrs {
                    if !attr_names.contains(name) {
                        attr_names.push(name.clone());
                    }
                }
                let tranche = row.tranche_letters();
                tranche_width = tranche_width.max(tranche.len());
                score_width = score_width.max(row.scores.len());

                ReducedRow {
                    ligand: row.ligand.clone(),
                    collection_key: row.collection_key.clone(),
                    scenario: row.scenario.clone(),
                    score_average: row.score_average(),
                    score_min: row.score_min(),
                    attrs: row.attrs.iter().cloned().collect(),
                    tranche,
                    scores: row.scores.clone(),
                }
            })
            .collect();

        ReducedTable {
            attr_names,
            tranche_width,
            score_width,
            rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducedRow {
    pub ligand: String,
    pub collection_key: String,
    pub scenario: String,
    pub score_average: Option<f64>,
    pub score_min: Option<f64>,
    pub attrs: HashMap<String, String>,
    pub tranche: Vec<String>,
    pub scores: Vec<f64>,
}

impl ReducedRow {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn tranche(&self, idx: usize) -> Option<&str> {
        self.tranche.get(idx).map(String::as_str)
    }

    pub fn score(&self, idx: usize) -> Option<f64> {
        self.scores.get(idx).copied()
    }
}

/// Summary table with a column layout fixed across rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedTable {
    pub attr_names: Vec<String>,
    pub tranche_width: usize,
    pub score_width: usize,
    pub rows: Vec<ReducedRow>,
}

impl ReducedTable {
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = ["ligand", "collection_key", "scenario", "score_average", "score_min"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        columns.extend(self.attr_names.iter().map(|name| format!("attr_{}", name)));
        columns.extend((0..self.tranche_width).map(|i| format!("tranche_{}", i)));
        columns.extend((0..self.score_width).map(|i| format!("score_{}", i)));
        columns
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::table;
    use super::*;
    use crate::pipeline::types::fixtures::docking_task;

    #[test]
    fn test_replicas_share_a_row() {
        let table = table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].ligand, "Z1");
        assert_eq!(table.rows()[0].scores, vec![-7.5, -8.5]);
        assert_eq!(table.rows()[0].score_min(), Some(-8.5));
        assert_eq!(table.rows()[0].score_average(), Some(-8.0));
    }

    #[test]
    fn test_failed_tasks_are_ignored() {
        let mut table = SummaryTable::new("qvina_rigid");
        let mut task = docking_task("qvina_rigid", "Z1", 0);
        task.mark_failed("timeout on Z1");
        table.record(&task);
        assert!(table.is_empty());
    }

    #[test]
    fn test_reduced_column_order() {
        let reduced = table().reduce();
        assert_eq!(
            reduced.columns(),
            vec![
                "ligand",
                "collection_key",
                "scenario",
                "score_average",
                "score_min",
                "attr_smi",
                "tranche_0",
                "tranche_1",
                "tranche_2",
                "tranche_3",
                "score_0",
                "score_1",
            ]
        );
        assert_eq!(reduced.rows[1].score(1), None);
        assert_eq!(reduced.rows[1].tranche(3), Some("B"));
        assert_eq!(reduced.rows[0].attr("smi"), Some("CCO"));
    }
}
