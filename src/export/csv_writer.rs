//! Gzip-compressed CSV summaries.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::summary::ReducedTable;
use crate::error::ExportError;

/// Writes `table` as a gzip CSV. Missing cells are left empty.
pub fn write_csv_gz(table: &ReducedTable, path: &Path) -> Result<(), ExportError> {
    let file = File::create(path)?;
    let encoder = write_csv(table, GzEncoder::new(file, Compression::default()))?;
    encoder.finish()?;
    Ok(())
}

/// Writes `table` as plain CSV into `out` and hands `out` back once flushed.
pub fn write_csv<W: Write>(table: &ReducedTable, out: W) -> Result<W, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out);
    writer.write_record(table.columns())?;

    for row in &table.rows {
        let mut cells = vec![
            row.ligand.clone(),
            row.collection_key.clone(),
            row.scenario.clone(),
            row.score_average.map(format_score).unwrap_or_default(),
            row.score_min.map(format_score).unwrap_or_default(),
        ];
        cells.extend(
            table
                .attr_names
                .iter()
                .map(|name| row.attr(name).map(str::to_string).unwrap_or_default()),
        );
        cells.extend((0..table.tranche_width).map(|i| row.tranche(i).map(str::to_string).unwrap_or_default()));
        cells.extend((0..table.score_width).map(|i| row.score(i).map(format_score).unwrap_or_default()));
        writer.write_record(&cells)?;
    }

    writer.flush()?;
    writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}

/// Formats a score so whole numbers keep one decimal (`-7.0`, not `-7`).
pub fn format_score(score: f64) -> String {
    if score.is_finite() && score.fract() == 0.0 {
        format!("{:.1}", score)
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::summary::fixtures::table;
    use crate::export::summary::SummaryTable;
    use crate::pipeline::types::fixtures::docking_task;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_csv_layout() {
        let out = write_csv(&table().reduce(), Vec::new()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "ligand,collection_key,scenario,score_average,score_min,attr_smi,tranche_0,tranche_1,tranche_2,tranche_3,score_0,score_1"
        );
        assert_eq!(lines[1], "Z1,AACB_12,qvina_rigid,-8.0,-8.5,CCO,A,A,C,B,-7.5,-8.5");
        assert_eq!(lines[2], "Z2,AACB_12,qvina_rigid,-6.0,-6.0,CCO,A,A,C,B,-6.0,");
    }

    #[test]
    fn test_attribute_with_comma_stays_one_field() {
        let mut table = SummaryTable::new("qvina_rigid");
        let mut task = docking_task("qvina_rigid", "Z1", 0);
        task.collection_key = "AACB_12".to_string();
        task.attrs = vec![("smi".to_string(), "C(C,\"N\")O".to_string())];
        task.mark_success(-7.5);
        table.record(&task);

        let out = write_csv(&table.reduce(), Vec::new()).unwrap();
        let mut reader = csv::ReaderBuilder::new().from_reader(out.as_slice());
        let headers = reader.headers().unwrap().clone();
        let record = reader.records().next().unwrap().unwrap();

        assert_eq!(record.len(), headers.len());
        let smi = headers.iter().position(|h| h == "attr_smi").unwrap();
        assert_eq!(&record[smi], "C(C,\"N\")O");
    }

    #[test]
    fn test_gzip_output() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("summary.txt.gz");
        write_csv_gz(&table().reduce(), &path).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("ligand,"));
    }
}
