//! Lenient JSON-per-line scan over an explicit list of shards.
//!
//! [`JsonShardTable`] reads exactly the objects a glob resolved to and
//! nothing else. Lines that are not a JSON object, or whose values do not
//! fit the declared schema, are skipped and counted per shard instead of
//! failing the whole read.

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::error::ArrowError;
use datafusion::arrow::json::ReaderBuilder;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::Session;
use datafusion::datasource::TableProvider;
use datafusion::error::{DataFusionError, Result as DFResult};
use datafusion::execution::{SendableRecordBatchStream, TaskContext};
use datafusion::logical_expr::{Expr, TableType};
use datafusion::physical_expr::{EquivalenceProperties, Partitioning};
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{DisplayAs, DisplayFormatType, ExecutionPlan, PlanProperties};
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_json::Value;

/// Table over JSON-per-line shards decoded with a fixed schema.
pub struct JsonShardTable {
    store: Arc<dyn ObjectStore>,
    files: Vec<ObjectPath>,
    schema: SchemaRef,
}

impl JsonShardTable {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, files: Vec<ObjectPath>, schema: SchemaRef) -> Self {
        Self {
            store,
            files,
            schema,
        }
    }
}

impl Debug for JsonShardTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonShardTable")
            .field("files", &self.files.len())
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TableProvider for JsonShardTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        _limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let config = state.config();
        Ok(Arc::new(JsonShardExec::try_new(
            Arc::clone(&self.store),
            &self.files,
            Arc::clone(&self.schema),
            projection.cloned(),
            config.target_partitions(),
            config.batch_size(),
        )?))
    }
}

/// Leaf plan reading shard groups, one group per output partition.
pub struct JsonShardExec {
    store: Arc<dyn ObjectStore>,
    groups: Vec<Vec<ObjectPath>>,
    file_schema: SchemaRef,
    /// Output schema (after projection)
    schema: SchemaRef,
    projection: Option<Vec<usize>>,
    batch_size: usize,
    properties: PlanProperties,
}

impl JsonShardExec {
    /// Spread `files` round-robin over at most `target_partitions` groups.
    ///
    /// # Errors
    ///
    /// Fails if `projection` names a column outside `file_schema`.
    pub fn try_new(
        store: Arc<dyn ObjectStore>,
        files: &[ObjectPath],
        file_schema: SchemaRef,
        projection: Option<Vec<usize>>,
        target_partitions: usize,
        batch_size: usize,
    ) -> DFResult<Self> {
        let partitions = files.len().min(target_partitions).max(1);
        let mut groups = vec![Vec::new(); partitions];
        for (index, file) in files.iter().enumerate() {
            groups[index % partitions].push(file.clone());
        }

        let schema = match &projection {
            Some(indices) => Arc::new(file_schema.project(indices)?),
            None => Arc::clone(&file_schema),
        };

        let properties = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&schema)),
            Partitioning::UnknownPartitioning(partitions),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );

        Ok(Self {
            store,
            groups,
            file_schema,
            schema,
            projection,
            batch_size: batch_size.max(1),
            properties,
        })
    }

    #[must_use]
    pub fn groups(&self) -> &[Vec<ObjectPath>] {
        &self.groups
    }
}

impl Debug for JsonShardExec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonShardExec")
            .field("groups", &self.groups.len())
            .field("schema", &self.schema)
            .field("projection", &self.projection)
            .finish_non_exhaustive()
    }
}

impl DisplayAs for JsonShardExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut Formatter<'_>) -> std::fmt::Result {
        let files: usize = self.groups.iter().map(Vec::len).sum();
        write!(f, "JsonShardExec: files={files}, partitions={}", self.groups.len())?;
        if let Some(projection) = &self.projection {
            write!(f, ", projection={projection:?}")?;
        }
        Ok(())
    }
}

impl ExecutionPlan for JsonShardExec {
    fn name(&self) -> &'static str {
        "JsonShardExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        if children.is_empty() {
            Ok(self)
        } else {
            Err(DataFusionError::Plan(
                "JsonShardExec cannot have children".to_string(),
            ))
        }
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        let files = self.groups.get(partition).cloned().ok_or_else(|| {
            DataFusionError::Plan(format!(
                "JsonShardExec has {} partitions, got {partition}",
                self.groups.len()
            ))
        })?;
        let store = Arc::clone(&self.store);
        let file_schema = Arc::clone(&self.file_schema);
        let projection = self.projection.clone();
        let batch_size = self.batch_size;

        let batches = futures::stream::iter(files)
            .then(move |path| {
                let store = Arc::clone(&store);
                let file_schema = Arc::clone(&file_schema);
                async move { read_shard(store.as_ref(), &path, &file_schema, batch_size).await }
            })
            .map_ok(|batches| {
                futures::stream::iter(batches.into_iter().map(Ok::<_, DataFusionError>))
            })
            .try_flatten()
            .map(move |batch| match (&projection, batch) {
                (Some(indices), Ok(batch)) => Ok(batch.project(indices)?),
                (_, batch) => batch,
            });

        Ok(Box::pin(RecordBatchStreamAdapter::new(self.schema(), batches)))
    }
}

/// Decode one shard, skipping records that do not fit `schema`.
///
/// # Errors
///
/// Fails only if the object cannot be fetched.
pub async fn read_shard(
    store: &dyn ObjectStore,
    path: &ObjectPath,
    schema: &SchemaRef,
    batch_size: usize,
) -> DFResult<Vec<RecordBatch>> {
    let bytes = store.get(path).await?.bytes().await?;

    let mut skipped = 0usize;
    let mut rows = Vec::new();
    for line in bytes.split(|byte| *byte == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value @ Value::Object(_)) => rows.push(value),
            _ => skipped += 1,
        }
    }

    let mut batches = Vec::new();
    for chunk in rows.chunks(batch_size.max(1)) {
        match decode(schema, chunk) {
            Ok(batch) => batches.extend(batch),
            // Retry the chunk row by row so one bad value only costs its row.
            Err(_) => {
                for row in chunk {
                    match decode(schema, std::slice::from_ref(row)) {
                        Ok(batch) => batches.extend(batch),
                        Err(e) => {
                            skipped += 1;
                            tracing::debug!(file = %path, error = %e, "Record does not fit schema");
                        }
                    }
                }
            }
        }
    }

    if skipped > 0 {
        tracing::warn!(file = %path, skipped, "Skipped malformed records");
    }
    Ok(batches)
}

fn decode(schema: &SchemaRef, rows: &[Value]) -> Result<Option<RecordBatch>, ArrowError> {
    let mut decoder = ReaderBuilder::new(Arc::clone(schema))
        .with_batch_size(rows.len().max(1))
        .with_coerce_primitive(true)
        .build_decoder()?;
    decoder.serialize(rows)?;
    decoder.flush()
}
