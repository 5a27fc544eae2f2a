//! Parquet summaries.
//!
//! The schema is built per table: text columns for the ligand identity,
//! attributes and tranche letters, nullable `Float64` for scores.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use super::summary::ReducedTable;
use crate::error::ExportError;

/// Schema of a reduced summary table.
pub fn summary_schema(table: &ReducedTable) -> Schema {
    let mut fields = vec![
        Field::new("ligand", DataType::Utf8, false),
        Field::new("collection_key", DataType::Utf8, false),
        Field::new("scenario", DataType::Utf8, false),
        Field::new("score_average", DataType::Float64, true),
        Field::new("score_min", DataType::Float64, true),
    ];
    for name in &table.attr_names {
        fields.push(Field::new(format!("attr_{}", name), DataType::Utf8, true));
    }
    for i in 0..table.tranche_width {
        fields.push(Field::new(format!("tranche_{}", i), DataType::Utf8, true));
    }
    for i in 0..table.score_width {
        fields.push(Field::new(format!("score_{}", i), DataType::Float64, true));
    }
    Schema::new(fields)
}

fn text_column<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    let mut builder = StringBuilder::new();
    for value in values {
        match value {
            Some(v) => builder.append_value(v),
            None => builder.append_null(),
        }
    }
    Arc::new(builder.finish())
}

fn float_column(values: impl Iterator<Item = Option<f64>>) -> ArrayRef {
    let mut builder = Float64Builder::new();
    for value in values {
        builder.append_option(value);
    }
    Arc::new(builder.finish())
}

/// Converts a reduced table into an Arrow RecordBatch.
pub fn table_to_record_batch(table: &ReducedTable) -> Result<RecordBatch, ExportError> {
    let schema = Arc::new(summary_schema(table));
    let rows = &table.rows;

    let mut columns: Vec<ArrayRef> = vec![
        text_column(rows.iter().map(|r| Some(r.ligand.as_str()))),
        text_column(rows.iter().map(|r| Some(r.collection_key.as_str()))),
        text_column(rows.iter().map(|r| Some(r.scenario.as_str()))),
        float_column(rows.iter().map(|r| r.score_average)),
        float_column(rows.iter().map(|r| r.score_min)),
    ];
    for name in &table.attr_names {
        columns.push(text_column(rows.iter().map(|r| r.attr(name))));
    }
    for i in 0..table.tranche_width {
        columns.push(text_column(rows.iter().map(|r| r.tranche(i))));
    }
    for i in 0..table.score_width {
        columns.push(float_column(rows.iter().map(|r| r.score(i))));
    }

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Writes a reduced table to a ZSTD-compressed Parquet file.
pub fn write_parquet(table: &ReducedTable, output_path: &Path) -> Result<(), ExportError> {
    if table.rows.is_empty() {
        return Err(ExportError::Empty(output_path.display().to_string()));
    }

    let batch = table_to_record_batch(table)?;

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(output_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    tracing::info!(
        path = %output_path.display(),
        rows = table.rows.len(),
        "Parquet summary written"
    );

    Ok(())
}
