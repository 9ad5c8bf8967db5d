//! Engine session provisioning and the relation read/write surface.
//!
//! A run talks to storage only through the [`Engine`] trait: reading
//! JSON-per-line records matched by a glob, writing a star-schema table as
//! parquet and reading a written table back. [`EngineSession`] implements it
//! on a DataFusion `SessionContext`; [`SessionProvisioner`] hands out one
//! shared session per run and tears it down exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use datafusion::arrow::array::AsArray;
use datafusion::arrow::datatypes::{DataType, FieldRef, Schema, SchemaRef, UInt64Type};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::error::Result as DFResult;
use datafusion::prelude::*;
use futures::StreamExt;
use object_store::ObjectStore;
use songlake_types::{PipelineStage, StageError, StarTable};
use tokio::sync::OnceCell;
use url::Url;

use crate::config::types::{CommitProtocol, PipelineConfig};
use crate::errors::PipelineError;
use crate::result::TableWriteSummary;
use crate::source::JsonShardTable;
use crate::storage::{
    build_store, delete_prefix, list_partitions, promote_prefix, GlobPattern, StorageLocation,
};

/// Value written for a null partition key.
pub const NULL_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

const STAGING_DIR: &str = "_staging";

/// Records read from a glob, plus how many files matched.
pub struct SourceRelation {
    pub frame: DataFrame,
    pub files: usize,
}

/// A table that has been fully written, with what is needed to read it back.
#[derive(Debug, Clone)]
pub struct PersistedTable {
    pub summary: TableWriteSummary,
    /// Schema of the data files, partition columns excluded.
    pub file_schema: SchemaRef,
}

impl PersistedTable {
    #[must_use]
    pub fn table(&self) -> StarTable {
        self.summary.table
    }
}

/// Relational engine surface used by the pipeline stages.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Context used to build in-memory relations.
    fn context(&self) -> &SessionContext;

    /// Read every JSON-per-line file matching `pattern` with an explicit schema.
    async fn read_records(
        &self,
        stage: PipelineStage,
        pattern: &str,
        schema: &Schema,
    ) -> Result<SourceRelation, PipelineError>;

    /// Write `frame` as `table`, replacing whatever the table held before.
    async fn write_table(
        &self,
        stage: PipelineStage,
        table: StarTable,
        frame: DataFrame,
    ) -> Result<PersistedTable, PipelineError>;

    /// Read a previously written table, partition columns included.
    async fn read_table(
        &self,
        stage: PipelineStage,
        persisted: &PersistedTable,
    ) -> Result<DataFrame, PipelineError>;
}

/// Run identifier derived from the wall clock, e.g. `20181102T012535123Z`.
#[must_use]
pub fn new_run_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// A configured DataFusion session bound to the run's input and output roots.
pub struct EngineSession {
    ctx: SessionContext,
    run_id: String,
    input_root: StorageLocation,
    output_root: StorageLocation,
    commit: CommitProtocol,
    stores: HashMap<String, Arc<dyn ObjectStore>>,
    tables_written: AtomicUsize,
    closed: AtomicBool,
}

impl EngineSession {
    /// Build the session context and register the stores both roots live in.
    ///
    /// # Errors
    ///
    /// Returns a config error for unusable roots, or a storage error if a
    /// store client cannot be configured.
    pub fn open(config: &PipelineConfig, run_id: String) -> Result<Self, PipelineError> {
        let stage = PipelineStage::Session;
        let input_root = StorageLocation::parse(&config.input.root)
            .map_err(|e| PipelineError::storage(stage, "INVALID_INPUT_ROOT", e))?;
        let output_root = StorageLocation::parse(&config.output.root)
            .map_err(|e| PipelineError::storage(stage, "INVALID_OUTPUT_ROOT", e))?;

        let mut session_config = SessionConfig::new().with_batch_size(config.engine.batch_size);
        if let Some(partitions) = config.engine.target_partitions {
            session_config = session_config.with_target_partitions(partitions);
        }
        let ctx = SessionContext::new_with_config(session_config);

        let mut stores: HashMap<String, Arc<dyn ObjectStore>> = HashMap::new();
        for location in [&input_root, &output_root] {
            let key = location.store_url();
            if stores.contains_key(&key) {
                continue;
            }
            let store = build_store(location, config.storage.aws.as_ref())
                .map_err(|e| PipelineError::storage(stage, "STORE_INIT_FAILED", e))?;
            let url = Url::parse(&key).map_err(|e| {
                StageError::config(stage, "INVALID_STORE_URL", format!("{key}: {e}"))
            })?;
            ctx.register_object_store(&url, Arc::clone(&store));
            stores.insert(key, store);
        }

        tracing::info!(
            run_id = %run_id,
            input_root = %input_root,
            output_root = %output_root,
            commit = %config.output.commit,
            target_partitions = ctx.copied_config().target_partitions(),
            "Engine session opened"
        );

        Ok(Self {
            ctx,
            run_id,
            input_root,
            output_root,
            commit: config.output.commit,
            stores,
            tables_written: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn input_root(&self) -> &StorageLocation {
        &self.input_root
    }

    #[must_use]
    pub fn output_root(&self) -> &StorageLocation {
        &self.output_root
    }

    /// Final location of a table: `<output root>/<table name>/`.
    #[must_use]
    pub fn table_location(&self, table: StarTable) -> StorageLocation {
        self.output_root.child(table.name())
    }

    fn staging_root(&self) -> StorageLocation {
        self.output_root.child(STAGING_DIR).child(&self.run_id)
    }

    fn ensure_open(&self, stage: PipelineStage) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StageError::internal(
                stage,
                "SESSION_CLOSED",
                "engine session has already been released",
            )
            .into());
        }
        Ok(())
    }

    fn store_for(
        &self,
        stage: PipelineStage,
        location: &StorageLocation,
    ) -> Result<&Arc<dyn ObjectStore>, PipelineError> {
        self.stores.get(&location.store_url()).ok_or_else(|| {
            StageError::config(
                stage,
                "UNREGISTERED_STORE",
                format!("{location} is not in the store of the input or output root"),
            )
            .into()
        })
    }

    /// Count the files a glob matches without reading them.
    ///
    /// # Errors
    ///
    /// Fails on a malformed glob or if the store cannot be listed.
    pub async fn count_matches(
        &self,
        stage: PipelineStage,
        pattern: &str,
    ) -> Result<usize, PipelineError> {
        self.ensure_open(stage)?;
        let glob = GlobPattern::parse(pattern)
            .map_err(|e| PipelineError::storage(stage, "INVALID_GLOB", e))?;
        let store = self.store_for(stage, glob.base())?;
        let resolved = glob
            .resolve(store.as_ref())
            .await
            .map_err(|e| PipelineError::storage(stage, "LIST_FAILED", e))?;
        Ok(resolved.len())
    }

    /// Whether the output root can be listed with the configured credentials.
    pub async fn probe_output(&self) -> Result<(), PipelineError> {
        let stage = PipelineStage::Check;
        self.ensure_open(stage)?;
        let store = self.store_for(stage, &self.output_root)?;
        let mut listing = store.list(Some(self.output_root.prefix()));
        if let Some(Err(e)) = listing.next().await {
            return Err(PipelineError::storage(stage, "OUTPUT_UNREACHABLE", e.into()));
        }
        Ok(())
    }

    /// Close the session. Staged leftovers of this run are removed.
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.commit == CommitProtocol::Staged {
            let staging = self.staging_root();
            if let Some(store) = self.stores.get(&staging.store_url()) {
                match delete_prefix(store.as_ref(), staging.prefix()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::warn!(
                        staging = %staging,
                        removed,
                        "Removed leftover staged objects"
                    ),
                    Err(e) => tracing::warn!(
                        staging = %staging,
                        error = %e,
                        "Failed to clean staging prefix"
                    ),
                }
            }
        }
        tracing::info!(
            run_id = %self.run_id,
            tables_written = self.tables_written.load(Ordering::Acquire),
            "Engine session released"
        );
    }

    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Cast partition columns to text, mapping nulls to the Hive default
/// partition, so every key type lands in a `name=value` directory.
fn partition_columns_as_text(frame: DataFrame, partition_cols: &[&str]) -> DFResult<DataFrame> {
    if partition_cols.is_empty() {
        return Ok(frame);
    }
    let exprs: Vec<Expr> = frame
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let name = field.name();
            if partition_cols.contains(&name.as_str()) {
                coalesce(vec![
                    cast(ident(name), DataType::Utf8),
                    lit(NULL_PARTITION_VALUE),
                ])
                .alias(name)
            } else {
                ident(name)
            }
        })
        .collect();
    frame.select(exprs)
}

/// Undo [`partition_columns_as_text`]: the null marker reads back as null.
fn partition_columns_from_text(frame: DataFrame, partition_cols: &[&str]) -> DFResult<DataFrame> {
    if partition_cols.is_empty() {
        return Ok(frame);
    }
    let exprs: Vec<Expr> = frame
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let name = field.name();
            if partition_cols.contains(&name.as_str()) {
                nullif(ident(name), lit(NULL_PARTITION_VALUE)).alias(name)
            } else {
                ident(name)
            }
        })
        .collect();
    frame.select(exprs)
}

fn data_file_schema(frame: &DataFrame, partition_cols: &[&str]) -> SchemaRef {
    let fields: Vec<FieldRef> = frame
        .schema()
        .fields()
        .iter()
        .filter(|field| !partition_cols.contains(&field.name().as_str()))
        .cloned()
        .collect();
    Arc::new(Schema::new(fields))
}

/// Sum the `count` column DataFusion returns from a write.
fn rows_from_count_batches(batches: &[RecordBatch]) -> u64 {
    batches
        .iter()
        .filter_map(|batch| batch.column_by_name("count"))
        .filter_map(|column| column.as_primitive_opt::<UInt64Type>())
        .map(|counts| counts.iter().flatten().sum::<u64>())
        .sum()
}

async fn write_parquet(
    frame: DataFrame,
    location: &StorageLocation,
    partition_cols: &[&str],
) -> DFResult<u64> {
    let options = DataFrameWriteOptions::new().with_partition_by(
        partition_cols
            .iter()
            .map(|column| (*column).to_string())
            .collect(),
    );
    let batches = frame
        .write_parquet(&location.dir_url(), options, None)
        .await?;
    Ok(rows_from_count_batches(&batches))
}

#[async_trait]
impl Engine for EngineSession {
    fn context(&self) -> &SessionContext {
        &self.ctx
    }

    async fn read_records(
        &self,
        stage: PipelineStage,
        pattern: &str,
        schema: &Schema,
    ) -> Result<SourceRelation, PipelineError> {
        self.ensure_open(stage)?;
        let glob = GlobPattern::parse(pattern)
            .map_err(|e| PipelineError::storage(stage, "INVALID_GLOB", e))?;
        let store = self.store_for(stage, glob.base())?;
        let resolved = glob
            .resolve(store.as_ref())
            .await
            .map_err(|e| PipelineError::storage(stage, "LIST_FAILED", e))?;

        if resolved.is_empty() {
            return Err(StageError::data(
                stage,
                "NO_INPUT_FILES",
                format!("no files match '{pattern}'"),
            )
            .into());
        }

        let files = resolved.len();
        tracing::debug!(pattern, files, "Resolved input glob");

        let table = JsonShardTable::new(
            Arc::clone(store),
            resolved.files().to_vec(),
            Arc::new(schema.clone()),
        );
        let frame = self
            .ctx
            .read_table(Arc::new(table))
            .map_err(|e| PipelineError::engine(stage, "READ_FAILED", e))?;

        Ok(SourceRelation { frame, files })
    }

    async fn write_table(
        &self,
        stage: PipelineStage,
        table: StarTable,
        frame: DataFrame,
    ) -> Result<PersistedTable, PipelineError> {
        self.ensure_open(stage)?;
        let started = Instant::now();
        let target = self.table_location(table);
        let store = self.store_for(stage, &target)?;
        let partition_cols = table.partition_columns();

        let frame = partition_columns_as_text(frame, partition_cols)
            .map_err(|e| PipelineError::engine(stage, "PLAN_FAILED", e))?;
        let file_schema = data_file_schema(&frame, partition_cols);

        let rows_written = match self.commit {
            CommitProtocol::Direct => {
                let removed = delete_prefix(store.as_ref(), target.prefix())
                    .await
                    .map_err(|e| PipelineError::storage(stage, "CLEAR_FAILED", e))?;
                tracing::debug!(table = %table, removed, "Cleared table location");
                write_parquet(frame, &target, partition_cols)
                    .await
                    .map_err(|e| PipelineError::engine(stage, "WRITE_FAILED", e))?
            }
            CommitProtocol::Staged => {
                let staging = self.staging_root().child(table.name());
                delete_prefix(store.as_ref(), staging.prefix())
                    .await
                    .map_err(|e| PipelineError::storage(stage, "CLEAR_FAILED", e))?;
                let rows = write_parquet(frame, &staging, partition_cols)
                    .await
                    .map_err(|e| PipelineError::engine(stage, "WRITE_FAILED", e))?;
                let removed = delete_prefix(store.as_ref(), target.prefix())
                    .await
                    .map_err(|e| PipelineError::storage(stage, "CLEAR_FAILED", e))?;
                let moved = promote_prefix(store.as_ref(), staging.prefix(), target.prefix())
                    .await
                    .map_err(|e| PipelineError::storage(stage, "PROMOTE_FAILED", e))?;
                tracing::debug!(table = %table, removed, moved, "Promoted staged table");
                rows
            }
        };

        let partitions = list_partitions(store.as_ref(), target.prefix(), partition_cols.len())
            .await
            .map_err(|e| PipelineError::storage(stage, "LIST_FAILED", e))?
            .len();

        let summary = TableWriteSummary {
            table,
            location: target.dir_url(),
            rows_written,
            partition_columns: partition_cols.iter().map(|c| (*c).to_string()).collect(),
            partitions,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        self.tables_written.fetch_add(1, Ordering::AcqRel);

        tracing::info!(
            table = %table,
            rows = summary.rows_written,
            partitions = summary.partitions,
            location = %summary.location,
            duration_secs = summary.duration_secs,
            "Table written"
        );

        Ok(PersistedTable {
            summary,
            file_schema,
        })
    }

    async fn read_table(
        &self,
        stage: PipelineStage,
        persisted: &PersistedTable,
    ) -> Result<DataFrame, PipelineError> {
        self.ensure_open(stage)?;
        let partition_cols: Vec<(String, DataType)> = persisted
            .table()
            .partition_columns()
            .iter()
            .map(|column| ((*column).to_string(), DataType::Utf8))
            .collect();
        let options = ParquetReadOptions::default()
            .schema(&persisted.file_schema)
            .table_partition_cols(partition_cols);
        self.ctx
            .read_parquet(persisted.summary.location.clone(), options)
            .await
            .and_then(|frame| {
                partition_columns_from_text(frame, persisted.table().partition_columns())
            })
            .map_err(|e| PipelineError::engine(stage, "READ_BACK_FAILED", e))
    }
}

/// Hands out one shared [`EngineSession`] per run.
///
/// `acquire` is idempotent: every call after the first returns the same
/// session. `release` tears the session down exactly once; acquiring after
/// release fails.
pub struct SessionProvisioner {
    config: PipelineConfig,
    run_id: String,
    session: OnceCell<Arc<EngineSession>>,
    released: AtomicBool,
}

impl SessionProvisioner {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            run_id: new_run_id(),
            session: OnceCell::new(),
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Get the run's session, opening it on first use.
    ///
    /// # Errors
    ///
    /// Fails if the session was released or cannot be opened.
    pub async fn acquire(&self) -> Result<Arc<EngineSession>, PipelineError> {
        if self.released.load(Ordering::Acquire) {
            return Err(StageError::internal(
                PipelineStage::Session,
                "SESSION_RELEASED",
                "engine session has already been released",
            )
            .into());
        }
        let session = self
            .session
            .get_or_try_init(|| async {
                EngineSession::open(&self.config, self.run_id.clone()).map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(session))
    }

    /// Tear the session down. Returns `false` if it was already released.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(session) = self.session.get() {
            session.shutdown().await;
        }
        true
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for SessionProvisioner {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.session.get() {
            if session.mark_closed() {
                tracing::warn!(
                    run_id = %self.run_id,
                    "Engine session dropped without release; staging cleanup skipped"
                );
            }
        }
    }
}

/// Scoped access to a run's session.
///
/// Call [`SessionGuard::release`] on every path; a guard dropped without it
/// still closes the session, only without staging cleanup.
pub struct SessionGuard {
    provisioner: SessionProvisioner,
    session: Arc<EngineSession>,
}

impl SessionGuard {
    /// Provision and open a session for `config`.
    ///
    /// # Errors
    ///
    /// Fails if the session cannot be opened.
    pub async fn acquire(config: PipelineConfig) -> Result<Self, PipelineError> {
        let provisioner = SessionProvisioner::new(config);
        let session = provisioner.acquire().await?;
        Ok(Self {
            provisioner,
            session,
        })
    }

    #[must_use]
    pub fn session(&self) -> &EngineSession {
        &self.session
    }

    /// Tear the session down.
    pub async fn release(self) -> bool {
        self.provisioner.release().await
    }
}
