use crate::error::Result;
use crate::models::{UnifiedRow, UnifiedTable};
use crate::utils::constants::{
    COMPRESSION_GZIP, COMPRESSION_LZ4, COMPRESSION_NONE, COMPRESSION_SNAPPY, COMPRESSION_ZSTD,
    DEFAULT_ROW_GROUP_SIZE,
};
use crate::utils::time::TimeFeatures;
use arrow::array::*;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use h3o::LatLng;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

pub struct ParquetWriter {
    compression: Compression,
    row_group_size: usize,
}

impl ParquetWriter {
    pub fn new() -> Self {
        Self {
            compression: Compression::SNAPPY,
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
        }
    }

    pub fn with_compression(mut self, compression: &str) -> Result<Self> {
        self.compression = match compression.to_lowercase().as_str() {
            COMPRESSION_SNAPPY => Compression::SNAPPY,
            COMPRESSION_GZIP => Compression::GZIP(GzipLevel::default()),
            COMPRESSION_LZ4 => Compression::LZ4,
            COMPRESSION_ZSTD => Compression::ZSTD(parquet::basic::ZstdLevel::default()),
            COMPRESSION_NONE => Compression::UNCOMPRESSED,
            _ => {
                return Err(crate::error::ProcessingError::Config(format!(
                    "Unsupported compression: {}",
                    compression
                )))
            }
        };
        Ok(self)
    }

    /// Write a unified table, one record batch per `batch_size` rows
    pub fn write_unified(&self, table: &UnifiedTable, path: &Path, batch_size: usize) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let schema = self.create_unified_schema(table);
        let file = File::create(path)?;
        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.row_group_size)
            .build();

        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;

        for chunk in table.rows.chunks(batch_size.max(1)) {
            let batch = self.rows_to_batch(table, chunk, schema.clone())?;
            writer.write(&batch)?;
        }

        writer.close()?;
        Ok(())
    }

    /// Key and calendar columns, then six nullable columns per group
    fn create_unified_schema(&self, table: &UnifiedTable) -> Arc<Schema> {
        let mut fields = vec![
            Field::new("h3_cell", DataType::Utf8, false),
            Field::new("h3_lat", DataType::Float64, false),
            Field::new("h3_lon", DataType::Float64, false),
            Field::new(
                "hour",
                DataType::Timestamp(TimeUnit::Second, Some("UTC".into())),
                false,
            ),
            Field::new("hour_of_day", DataType::UInt32, false),
            Field::new("day_of_week", DataType::UInt32, false),
            Field::new("month", DataType::UInt32, false),
            Field::new("is_weekend", DataType::Boolean, false),
            Field::new("is_daytime", DataType::Boolean, false),
        ];

        for group in &table.groups {
            let names = group.column_names();
            fields.push(Field::new(&names[0], DataType::Float64, true));
            fields.push(Field::new(&names[1], DataType::Float64, true));
            fields.push(Field::new(&names[2], DataType::Float64, true));
            fields.push(Field::new(&names[3], DataType::Float64, true));
            fields.push(Field::new(&names[4], DataType::UInt64, true));
            fields.push(Field::new(&names[5], DataType::Utf8, true));
        }

        Arc::new(Schema::new(fields))
    }

    fn rows_to_batch(
        &self,
        table: &UnifiedTable,
        rows: &[UnifiedRow],
        schema: Arc<Schema>,
    ) -> Result<RecordBatch> {
        let centers: Vec<LatLng> = rows.iter().map(|r| LatLng::from(r.cell)).collect();
        let features: Vec<TimeFeatures> = rows.iter().map(|r| TimeFeatures::from_hour(r.hour)).collect();

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.cell.to_string()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                centers.iter().map(|c| c.lat()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                centers.iter().map(|c| c.lng()).collect::<Vec<_>>(),
            )),
            Arc::new(
                TimestampSecondArray::from(
                    rows.iter().map(|r| r.hour.timestamp()).collect::<Vec<_>>(),
                )
                .with_timezone("UTC"),
            ),
            Arc::new(UInt32Array::from(
                features.iter().map(|f| f.hour_of_day).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                features.iter().map(|f| f.day_of_week).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                features.iter().map(|f| f.month).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                features.iter().map(|f| f.is_weekend).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                features.iter().map(|f| f.is_daytime).collect::<Vec<_>>(),
            )),
        ];

        for index in 0..table.groups.len() {
            let values: Vec<_> = rows.iter().map(|r| r.values.get(index).copied().flatten()).collect();

            columns.push(Arc::new(Float64Array::from(
                values.iter().map(|v| v.map(|v| v.stats.mean)).collect::<Vec<_>>(),
            )));
            columns.push(Arc::new(Float64Array::from(
                values.iter().map(|v| v.map(|v| v.stats.std)).collect::<Vec<_>>(),
            )));
            columns.push(Arc::new(Float64Array::from(
                values.iter().map(|v| v.map(|v| v.stats.min)).collect::<Vec<_>>(),
            )));
            columns.push(Arc::new(Float64Array::from(
                values.iter().map(|v| v.map(|v| v.stats.max)).collect::<Vec<_>>(),
            )));
            columns.push(Arc::new(UInt64Array::from(
                values.iter().map(|v| v.map(|v| v.stats.count)).collect::<Vec<_>>(),
            )));
            columns.push(Arc::new(StringArray::from(
                values
                    .iter()
                    .map(|v| v.map(|v| v.fill.as_str()))
                    .collect::<Vec<_>>(),
            )));
        }

        let batch = RecordBatch::try_new(schema, columns)?;
        Ok(batch)
    }

    /// Get file statistics
    pub fn get_file_info(&self, path: &Path) -> Result<ParquetFileInfo> {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let metadata = reader.metadata();

        let file_metadata = metadata.file_metadata();
        let row_groups = metadata.num_row_groups();
        let total_rows = file_metadata.num_rows();
        let file_size = std::fs::metadata(path)?.len();
        let columns = file_metadata.schema_descr().num_columns();

        let mut row_group_sizes = Vec::new();
        for i in 0..row_groups {
            let rg_metadata = metadata.row_group(i);
            row_group_sizes.push(rg_metadata.num_rows());
        }

        Ok(ParquetFileInfo {
            total_rows,
            row_groups: row_groups as i32,
            row_group_sizes,
            columns,
            file_size,
            compression: self.compression,
        })
    }
}

impl Default for ParquetWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ParquetFileInfo {
    pub total_rows: i64,
    pub row_groups: i32,
    pub row_group_sizes: Vec<i64>,
    pub columns: usize,
    pub file_size: u64,
    pub compression: Compression,
}

impl ParquetFileInfo {
    pub fn summary(&self) -> String {
        format!(
            "Parquet File Summary:\n\
            - Total rows: {}\n\
            - Columns: {}\n\
            - Row groups: {}\n\
            - File size: {:.2} MB\n\
            - Compression: {:?}\n\
            - Avg rows per group: {:.0}",
            self.total_rows,
            self.columns,
            self.row_groups,
            self.file_size as f64 / 1_048_576.0, // Convert to MB
            self.compression,
            self.total_rows as f64 / self.row_groups.max(1) as f64
        )
    }
}
