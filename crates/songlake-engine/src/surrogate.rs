//! Surrogate keys for the songplays fact table.
//!
//! Ids follow a partition-offset scheme: the execution partition index
//! occupies the high bits and a per-partition counter the low 33 bits, so
//! every partition numbers its own rows without coordinating with the
//! others. Ids are unique and non-negative but neither dense nor
//! consecutive across partitions.

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::array::Int64Array;
use datafusion::arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::Session;
use datafusion::datasource::TableProvider;
use datafusion::error::{DataFusionError, Result as DFResult};
use datafusion::execution::{SendableRecordBatchStream, TaskContext};
use datafusion::logical_expr::{Expr, LogicalPlan, TableType};
use datafusion::physical_expr::expressions::Column;
use datafusion::physical_expr::{EquivalenceProperties, PhysicalExpr};
use datafusion::physical_plan::projection::ProjectionExec;
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, ExecutionPlanProperties, PlanProperties,
};
use datafusion::prelude::{DataFrame, SessionContext};
use futures::StreamExt;

/// Bits reserved for the row counter within a partition.
pub const ROW_BITS: u32 = 33;

/// Largest partition index that still yields a non-negative id.
pub const MAX_PARTITION: usize = (1 << (63 - ROW_BITS)) - 1;

/// Hands out ids for one execution partition.
#[derive(Debug, Clone)]
pub struct SongplayIdGenerator {
    base: i64,
    next_row: i64,
}

impl SongplayIdGenerator {
    /// # Errors
    ///
    /// Fails if `partition` exceeds [`MAX_PARTITION`].
    pub fn for_partition(partition: usize) -> DFResult<Self> {
        if partition > MAX_PARTITION {
            return Err(DataFusionError::Execution(format!(
                "partition index {partition} exceeds the id space ({MAX_PARTITION})"
            )));
        }
        let partition = i64::try_from(partition)
            .map_err(|e| DataFusionError::Execution(e.to_string()))?;
        Ok(Self {
            base: partition << ROW_BITS,
            next_row: 0,
        })
    }

    /// # Errors
    ///
    /// Fails once the partition has produced 2^33 ids.
    pub fn next_id(&mut self) -> DFResult<i64> {
        if self.next_row >> ROW_BITS != 0 {
            return Err(DataFusionError::Execution(
                "songplay id counter exhausted for partition".to_string(),
            ));
        }
        let id = self.base | self.next_row;
        self.next_row += 1;
        Ok(id)
    }

    /// Ids for the next `rows` rows.
    ///
    /// # Errors
    ///
    /// Fails if the partition counter would overflow.
    pub fn take(&mut self, rows: usize) -> DFResult<Int64Array> {
        let ids = (0..rows)
            .map(|_| self.next_id())
            .collect::<DFResult<Vec<i64>>>()?;
        Ok(Int64Array::from(ids))
    }
}

/// Append a non-null Int64 `column` of partition-offset ids to `frame`.
///
/// The result stays lazy: every execution plans `frame` again and numbers
/// the rows of each partition while they stream through.
///
/// # Errors
///
/// Fails if `frame` already has a field named `column`.
pub fn assign_ids(ctx: &SessionContext, frame: DataFrame, column: &str) -> DFResult<DataFrame> {
    let table = SurrogateIdTable::try_new(&frame, column)?;
    ctx.read_table(Arc::new(table))
}

/// Relation of a logical plan with an id column appended.
pub struct SurrogateIdTable {
    plan: LogicalPlan,
    column: String,
    schema: SchemaRef,
}

impl SurrogateIdTable {
    /// # Errors
    ///
    /// Fails if `frame` already has a field named `column`.
    pub fn try_new(frame: &DataFrame, column: &str) -> DFResult<Self> {
        let input = frame.schema().as_arrow();
        if input.field_with_name(column).is_ok() {
            return Err(DataFusionError::Plan(format!(
                "cannot assign ids to '{column}': the column already exists"
            )));
        }
        let mut fields: Vec<FieldRef> = input.fields().iter().cloned().collect();
        fields.push(Arc::new(Field::new(column, DataType::Int64, false)));
        Ok(Self {
            plan: frame.logical_plan().clone(),
            column: column.to_string(),
            schema: Arc::new(Schema::new(fields)),
        })
    }
}

impl Debug for SurrogateIdTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrogateIdTable")
            .field("column", &self.column)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TableProvider for SurrogateIdTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::View
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        _limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let input = state.create_physical_plan(&self.plan).await?;
        let plan: Arc<dyn ExecutionPlan> =
            Arc::new(SurrogateIdExec::new(input, Arc::clone(&self.schema)));
        let Some(indices) = projection else {
            return Ok(plan);
        };
        let exprs = indices
            .iter()
            .map(|&index| {
                let name = self.schema.field(index).name().clone();
                let expr: Arc<dyn PhysicalExpr> = Arc::new(Column::new(&name, index));
                (expr, name)
            })
            .collect();
        Ok(Arc::new(ProjectionExec::try_new(exprs, plan)?))
    }
}

/// Appends the id column to every batch of its input, per partition.
pub struct SurrogateIdExec {
    input: Arc<dyn ExecutionPlan>,
    /// Input fields plus the id field last
    schema: SchemaRef,
    properties: PlanProperties,
}

impl SurrogateIdExec {
    #[must_use]
    pub fn new(input: Arc<dyn ExecutionPlan>, schema: SchemaRef) -> Self {
        let properties = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&schema)),
            input.output_partitioning().clone(),
            input.pipeline_behavior(),
            input.boundedness(),
        );
        Self {
            input,
            schema,
            properties,
        }
    }
}

impl Debug for SurrogateIdExec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrogateIdExec")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl DisplayAs for SurrogateIdExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut Formatter<'_>) -> std::fmt::Result {
        let column = self.schema.fields().last().map_or("", |field| field.name().as_str());
        write!(f, "SurrogateIdExec: column={column}")
    }
}

impl ExecutionPlan for SurrogateIdExec {
    fn name(&self) -> &'static str {
        "SurrogateIdExec"
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
        vec![&self.input]
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        match <[_; 1]>::try_from(children) {
            Ok([input]) => Ok(Arc::new(Self::new(input, Arc::clone(&self.schema)))),
            Err(children) => Err(DataFusionError::Plan(format!(
                "SurrogateIdExec takes one child, got {}",
                children.len()
            ))),
        }
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        let mut ids = SongplayIdGenerator::for_partition(partition)?;
        let schema = Arc::clone(&self.schema);
        let batches = self.input.execute(partition, context)?.map(move |batch| {
            let batch = batch?;
            let mut columns = batch.columns().to_vec();
            columns.push(Arc::new(ids.take(batch.num_rows())?));
            Ok(RecordBatch::try_new(Arc::clone(&schema), columns)?)
        });
        Ok(Box::pin(RecordBatchStreamAdapter::new(self.schema(), batches)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use datafusion::arrow::array::{AsArray, StringArray};
    use datafusion::arrow::datatypes::Int64Type;
    use datafusion::datasource::MemTable;
    use datafusion::physical_plan::displayable;
    use datafusion::prelude::SessionConfig;

    use super::*;

    #[test]
    fn generator_offsets_by_partition() {
        let mut first = SongplayIdGenerator::for_partition(0).unwrap();
        assert_eq!(first.next_id().unwrap(), 0);
        assert_eq!(first.next_id().unwrap(), 1);

        let mut third = SongplayIdGenerator::for_partition(2).unwrap();
        assert_eq!(third.next_id().unwrap(), 2 << 33);
        assert_eq!(third.next_id().unwrap(), (2 << 33) + 1);
    }

    #[test]
    fn generator_rejects_partitions_outside_id_space() {
        assert!(SongplayIdGenerator::for_partition(MAX_PARTITION).is_ok());
        assert!(SongplayIdGenerator::for_partition(MAX_PARTITION + 1).is_err());
        let mut last = SongplayIdGenerator::for_partition(MAX_PARTITION).unwrap();
        assert!(last.next_id().unwrap() > 0);
    }

    #[test]
    fn take_produces_sequential_ids() {
        let mut ids = SongplayIdGenerator::for_partition(1).unwrap();
        let block = ids.take(3).unwrap();
        assert_eq!(block.values().to_vec(), vec![1 << 33, (1 << 33) + 1, (1 << 33) + 2]);
        assert_eq!(ids.next_id().unwrap(), (1 << 33) + 3);
    }

    async fn ids_for(ctx: &SessionContext, partitions: Vec<Vec<RecordBatch>>) -> Vec<i64> {
        let schema = partitions[0][0].schema();
        let table = MemTable::try_new(schema, partitions).unwrap();
        let frame = ctx.read_table(Arc::new(table)).unwrap();
        let with_ids = assign_ids(ctx, frame, "songplay_id").unwrap();
        with_ids
            .collect()
            .await
            .unwrap()
            .iter()
            .flat_map(|batch| {
                batch
                    .column_by_name("songplay_id")
                    .unwrap()
                    .as_primitive::<Int64Type>()
                    .values()
                    .to_vec()
            })
            .collect()
    }

    fn batch(values: &[&str]) -> RecordBatch {
        RecordBatch::try_from_iter(vec![(
            "song",
            Arc::new(StringArray::from(values.to_vec())) as _,
        )])
        .unwrap()
    }

    #[tokio::test]
    async fn ids_are_unique_across_partitions() {
        let ctx = SessionContext::new_with_config(SessionConfig::new().with_target_partitions(3));
        let ids = ids_for(
            &ctx,
            vec![
                vec![batch(&["a", "b"]), batch(&["c"])],
                vec![batch(&["d", "e", "f"])],
                vec![batch(&["g"])],
            ],
        )
        .await;

        assert_eq!(ids.len(), 7);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 7);
        assert!(ids.iter().all(|id| *id >= 0));
    }

    #[tokio::test]
    async fn ids_stream_through_the_plan() {
        let ctx = SessionContext::new_with_config(SessionConfig::new().with_target_partitions(1));
        let frame = ctx.read_batch(batch(&["a", "b", "c"])).unwrap();
        let with_ids = assign_ids(&ctx, frame, "songplay_id").unwrap();

        let plan = with_ids.clone().create_physical_plan().await.unwrap();
        let rendered = displayable(plan.as_ref()).indent(true).to_string();
        assert!(rendered.contains("SurrogateIdExec: column=songplay_id"));

        let batches = with_ids.select_columns(&["songplay_id"]).unwrap().collect().await.unwrap();
        let ids: Vec<i64> = batches
            .iter()
            .flat_map(|b| b.column(0).as_primitive::<Int64Type>().values().to_vec())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn existing_column_is_rejected() {
        let ctx = SessionContext::new();
        let frame = ctx.read_batch(batch(&["a"])).unwrap();
        assert!(assign_ids(&ctx, frame, "song").is_err());
    }

    #[tokio::test]
    async fn id_column_is_non_null_int64() {
        let ctx = SessionContext::new();
        let frame = ctx.read_batch(batch(&["a"])).unwrap();
        let with_ids = assign_ids(&ctx, frame, "songplay_id").unwrap();
        let field = with_ids.schema().field_with_unqualified_name("songplay_id").unwrap();
        assert_eq!(field.data_type(), &DataType::Int64);
        assert!(!field.is_nullable());
    }
}
