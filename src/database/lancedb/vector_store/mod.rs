
use super::{EmbeddingRecord, ScoredChunk, SearchFilters};
use crate::config::Config;
use crate::embeddings::normalize::cosine_similarity;
use crate::embeddings::provider::ProviderSpec;
use crate::{EngineError, Result};
use arrow::array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use itertools::Itertools;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType, Table};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TABLE_NAME: &str = "embeddings";

// Scores this close are treated as one tie group when widening a search.
const TIE_EPSILON: f32 = 1e-6;

/// Vector database store using LanceDB for similarity search
pub struct VectorStore {
    connection: Connection,
    table: Table,
    vector_dimension: usize,
    // Merge-inserts and deletes against one table are applied one at a time.
    write_lock: Mutex<()>,
}

impl VectorStore {
    /// Open (or create) the vector store under the configured base directory.
    #[inline]
    pub async fn new(config: &Config) -> Result<Self> {
        let db_path = config.vector_database_path();
        Self::open(&db_path, config.embedding.target_dimension).await
    }

    /// Open (or create) a vector store at `db_path` holding `vector_dimension`-wide vectors.
    ///
    /// An existing table with a different width is an error; its records are never dropped.
    #[inline]
    pub async fn open(db_path: &Path, vector_dimension: usize) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", db_path);

        std::fs::create_dir_all(db_path).map_err(|e| {
            EngineError::Database(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = db_path.to_string_lossy().to_string();
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to connect to LanceDB: {}", e)))?;

        let table_names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to list tables: {}", e)))?;

        let table = if table_names.iter().any(|name| name == TABLE_NAME) {
            let table = connection
                .open_table(TABLE_NAME)
                .execute()
                .await
                .map_err(|e| EngineError::Database(format!("Failed to open table: {}", e)))?;

            let existing = Self::detect_vector_dimension(&table).await?;
            if existing != vector_dimension {
                error!(
                    "Vector table holds {}-dimensional vectors, configured target is {}",
                    existing, vector_dimension
                );
                return Err(EngineError::Config(format!(
                    "vector store at {} holds {}-dimensional vectors but target_dimension is {}",
                    db_path.display(),
                    existing,
                    vector_dimension
                )));
            }
            table
        } else {
            info!(
                "Creating embeddings table with {} dimensions",
                vector_dimension
            );
            connection
                .create_empty_table(TABLE_NAME, Self::create_schema(vector_dimension))
                .execute()
                .await
                .map_err(|e| EngineError::Database(format!("Failed to create table: {}", e)))?
        };

        info!("Vector store initialized successfully");
        Ok(Self {
            connection,
            table,
            vector_dimension,
            write_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub fn vector_dimension(&self) -> usize {
        self.vector_dimension
    }

    /// Detect vector dimension from existing table schema
    async fn detect_vector_dimension(table: &Table) -> Result<usize> {
        let schema = table
            .schema()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to get table schema: {}", e)))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(EngineError::Database(
            "Could not find vector column or determine dimension".to_string(),
        ))
    }

    fn create_schema(vector_dim: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_dim as i32,
                ),
                false,
            ),
            Field::new("chunk_id", DataType::Int64, false),
            Field::new("knowledge_source_id", DataType::Int64, false),
            Field::new("provider", DataType::Utf8, false),
            Field::new("model", DataType::Utf8, false),
            Field::new("native_dimension", DataType::UInt32, false),
            Field::new("content_hash", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("created_at", DataType::Utf8, false),
        ]))
    }

    #[inline]
    pub async fn put(&self, record: EmbeddingRecord) -> Result<()> {
        self.put_batch(&[record]).await
    }

    /// Upsert records keyed by (chunk, provider, model). Re-writing a record replaces it.
    #[inline]
    pub async fn put_batch(&self, records: &[EmbeddingRecord]) -> Result<()> {
        self.upsert(records, None).await.map(|_| ())
    }

    /// Upsert `records` unless `cancel` has fired; returns whether anything was written.
    ///
    /// The token is checked while holding the write lock, so a writer cancelled before a
    /// [`delete_source`](Self::delete_source) can never land after it.
    #[inline]
    pub async fn put_batch_unless_cancelled(
        &self,
        records: &[EmbeddingRecord],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.upsert(records, Some(cancel)).await
    }

    async fn upsert(
        &self,
        records: &[EmbeddingRecord],
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        if records.is_empty() {
            debug!("No embeddings to store");
            return Ok(true);
        }

        if let Some(bad) = records
            .iter()
            .find(|record| record.vector.len() != self.vector_dimension)
        {
            return Err(EngineError::Validation(format!(
                "record for chunk {} has {} dimensions, store expects {}",
                bad.chunk_id,
                bad.vector.len(),
                self.vector_dimension
            )));
        }

        let record_batch = self.create_record_batch(records)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        let _guard = self.write_lock.lock().await;
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Ok(false);
        }
        let mut merge = self.table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| EngineError::Database(format!("Failed to upsert embeddings: {}", e)))?;

        debug!("Stored {} embeddings", records.len());
        Ok(true)
    }

    fn create_record_batch(&self, records: &[EmbeddingRecord]) -> Result<RecordBatch> {
        let len = records.len();
        let vector_dim = self.vector_dimension;

        let mut ids = Vec::with_capacity(len);
        let mut flat_values = Vec::with_capacity(len * vector_dim);
        let mut chunk_ids = Vec::with_capacity(len);
        let mut source_ids = Vec::with_capacity(len);
        let mut providers = Vec::with_capacity(len);
        let mut models = Vec::with_capacity(len);
        let mut native_dimensions = Vec::with_capacity(len);
        let mut content_hashes = Vec::with_capacity(len);
        let mut contents = Vec::with_capacity(len);
        let mut created_ats = Vec::with_capacity(len);

        for record in records {
            ids.push(record.record_id());
            flat_values.extend_from_slice(&record.vector);
            chunk_ids.push(record.chunk_id);
            source_ids.push(record.knowledge_source_id);
            providers.push(record.provider.as_str());
            models.push(record.model.as_str());
            native_dimensions.push(record.native_dimension as u32);
            content_hashes.push(record.content_hash.as_str());
            contents.push(record.content.as_str());
            created_ats.push(record.created_at.to_rfc3339());
        }

        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let vector_array = FixedSizeListArray::try_new(
            field,
            vector_dim as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| EngineError::Database(format!("Failed to create vector array: {}", e)))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(Int64Array::from(chunk_ids)),
            Arc::new(Int64Array::from(source_ids)),
            Arc::new(StringArray::from(providers)),
            Arc::new(StringArray::from(models)),
            Arc::new(UInt32Array::from(native_dimensions)),
            Arc::new(StringArray::from(content_hashes)),
            Arc::new(StringArray::from(contents)),
            Arc::new(StringArray::from(created_ats)),
        ];

        RecordBatch::try_new(Self::create_schema(vector_dim), arrays)
            .map_err(|e| EngineError::Database(format!("Failed to create record batch: {}", e)))
    }

    /// Nearest neighbours among records embedded by exactly `spec`.
    ///
    /// Records from any other provider or model are never candidates. Hits are ordered by
    /// descending cosine similarity, ties broken by ascending chunk id.
    #[inline]
    pub async fn search(
        &self,
        query_vector: &[f32],
        spec: &ProviderSpec,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>> {
        if query_vector.len() != self.vector_dimension {
            return Err(EngineError::Validation(format!(
                "query vector has {} dimensions, store expects {}",
                query_vector.len(),
                self.vector_dimension
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(predicate) = search_predicate(spec, filters) else {
            return Ok(Vec::new());
        };

        let candidates = self.count_where(&predicate).await?;
        if candidates == 0 {
            return Ok(Vec::new());
        }

        debug!(
            "Searching {} {} vectors with limit {} ({})",
            candidates, spec, limit, predicate
        );

        // LanceDB cuts at `limit` before ties are ordered, so widen the fetch until the
        // score group straddling the cut is complete.
        let mut fetch = limit.min(candidates);
        let mut hits = loop {
            let hits = self.nearest(query_vector, &predicate, fetch).await?;
            let straddles = fetch < candidates
                && hits.len() == fetch
                && hits.len() >= limit
                && hits
                    .last()
                    .is_some_and(|last| hits[limit - 1].score - last.score <= TIE_EPSILON);
            if !straddles {
                break hits;
            }
            fetch = fetch.saturating_mul(2).min(candidates);
        };
        hits.truncate(limit);

        debug!("Search returned {} hits", hits.len());
        Ok(hits)
    }

    /// Up to `fetch` nearest records matching `predicate`, sorted by descending score then
    /// ascending chunk id.
    async fn nearest(
        &self,
        query_vector: &[f32],
        predicate: &str,
        fetch: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let results = self
            .table
            .vector_search(query_vector)
            .map_err(|e| EngineError::Database(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .only_if(predicate)
            .limit(fetch)
            .execute()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to execute search: {}", e)))?;

        let records = collect_records(results).await?;
        let mut hits: Vec<ScoredChunk> = records
            .into_iter()
            .map(|record| ScoredChunk {
                score: cosine_similarity(query_vector, &record.vector),
                chunk_id: record.chunk_id,
                knowledge_source_id: record.knowledge_source_id,
                content: record.content,
                content_hash: record.content_hash,
                provider: record.provider,
                model: record.model,
                native_dimension: record.native_dimension,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(hits)
    }

    #[inline]
    pub async fn get(&self, chunk_id: i64, spec: &ProviderSpec) -> Result<Option<EmbeddingRecord>> {
        let predicate = format!("chunk_id = {} AND {}", chunk_id, spec_predicate(spec));
        let results = self
            .table
            .query()
            .only_if(predicate)
            .limit(1)
            .execute()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to query record: {}", e)))?;

        Ok(collect_records(results).await?.into_iter().next())
    }

    /// Ids of the chunks in a source that hold a record for `spec`.
    #[inline]
    pub async fn chunk_ids_with(
        &self,
        knowledge_source_id: i64,
        spec: &ProviderSpec,
    ) -> Result<HashSet<i64>> {
        let predicate = format!(
            "knowledge_source_id = {} AND {}",
            knowledge_source_id,
            spec_predicate(spec)
        );
        let count = self.count_where(&predicate).await?;
        if count == 0 {
            return Ok(HashSet::new());
        }

        let mut results = self
            .table
            .query()
            .only_if(predicate)
            .select(Select::Columns(vec!["chunk_id".to_string()]))
            .limit(count)
            .execute()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to query chunk ids: {}", e)))?;

        let mut ids = HashSet::with_capacity(count);
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to read result stream: {}", e)))?
        {
            let chunk_ids = typed_column::<Int64Array>(&batch, "chunk_id")?;
            ids.extend(chunk_ids.values().iter().copied());
        }

        Ok(ids)
    }

    /// Number of records per provider spec within one source.
    #[inline]
    pub async fn counts_by_spec(
        &self,
        knowledge_source_id: i64,
    ) -> Result<BTreeMap<ProviderSpec, usize>> {
        let predicate = format!("knowledge_source_id = {}", knowledge_source_id);
        let count = self.count_where(&predicate).await?;
        let mut counts = BTreeMap::new();
        if count == 0 {
            return Ok(counts);
        }

        let mut results = self
            .table
            .query()
            .only_if(predicate)
            .select(Select::Columns(vec![
                "provider".to_string(),
                "model".to_string(),
            ]))
            .limit(count)
            .execute()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to query record specs: {}", e)))?;

        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to read result stream: {}", e)))?
        {
            let providers = typed_column::<StringArray>(&batch, "provider")?;
            let models = typed_column::<StringArray>(&batch, "model")?;
            for row in 0..batch.num_rows() {
                let spec = ProviderSpec::new(providers.value(row).parse()?, models.value(row));
                *counts.entry(spec).or_insert(0) += 1;
            }
        }

        Ok(counts)
    }

    /// Delete the `spec` records of the given chunks.
    #[inline]
    pub async fn delete_records(
        &self,
        knowledge_source_id: i64,
        spec: &ProviderSpec,
        chunk_ids: &[i64],
    ) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        for window in chunk_ids.chunks(500) {
            let predicate = format!(
                "knowledge_source_id = {} AND {} AND chunk_id IN ({})",
                knowledge_source_id,
                spec_predicate(spec),
                window.iter().join(", ")
            );
            self.table.delete(&predicate).await.map_err(|e| {
                EngineError::Database(format!("Failed to delete embeddings: {}", e))
            })?;
        }

        info!(
            "Deleted {} {} embeddings from knowledge source {}",
            chunk_ids.len(),
            spec,
            knowledge_source_id
        );
        Ok(())
    }

    /// Delete every record of a knowledge source.
    #[inline]
    pub async fn delete_source(&self, knowledge_source_id: i64) -> Result<()> {
        let predicate = format!("knowledge_source_id = {}", knowledge_source_id);

        let _guard = self.write_lock.lock().await;
        self.table.delete(&predicate).await.map_err(|e| {
            EngineError::Database(format!("Failed to delete source embeddings: {}", e))
        })?;

        info!(
            "Deleted embeddings for knowledge source {}",
            knowledge_source_id
        );
        Ok(())
    }

    /// Count records, optionally narrowed to one source and/or one provider spec.
    #[inline]
    pub async fn count(
        &self,
        knowledge_source_id: Option<i64>,
        spec: Option<&ProviderSpec>,
    ) -> Result<usize> {
        let mut clauses = Vec::new();
        if let Some(id) = knowledge_source_id {
            clauses.push(format!("knowledge_source_id = {}", id));
        }
        if let Some(spec) = spec {
            clauses.push(spec_predicate(spec));
        }

        if clauses.is_empty() {
            self.table
                .count_rows(None)
                .await
                .map_err(|e| EngineError::Database(format!("Failed to count rows: {}", e)))
        } else {
            self.count_where(&clauses.join(" AND ")).await
        }
    }

    async fn count_where(&self, predicate: &str) -> Result<usize> {
        self.table
            .count_rows(Some(predicate.to_string()))
            .await
            .map_err(|e| EngineError::Database(format!("Failed to count rows: {}", e)))
    }

    /// Optimize the vector database by compacting and reorganizing data
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        debug!("Optimizing vector database");

        let _guard = self.write_lock.lock().await;
        self.table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(|e| EngineError::Database(format!("Failed to optimize table: {}", e)))?;

        info!("Vector database optimization completed");
        Ok(())
    }

    /// True when the embeddings table can be listed, opened and counted.
    #[inline]
    pub async fn validate_integrity(&self) -> Result<bool> {
        debug!("Validating database integrity");

        let table_names = match self.connection.table_names().execute().await {
            Ok(names) => names,
            Err(e) => {
                error!("Failed to list tables during integrity check: {}", e);
                return Ok(false);
            }
        };

        if !table_names.iter().any(|name| name == TABLE_NAME) {
            warn!("Embeddings table missing during integrity check");
            return Ok(false);
        }

        match self.table.count_rows(None).await {
            Ok(count) => {
                debug!("Database integrity check passed, {} rows found", count);
                Ok(true)
            }
            Err(e) => {
                error!("Failed to count rows during integrity check: {}", e);
                Ok(false)
            }
        }
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn spec_predicate(spec: &ProviderSpec) -> String {
    format!(
        "provider = {} AND model = {}",
        sql_literal(spec.provider.as_str()),
        sql_literal(&spec.model)
    )
}

/// `None` when the filters can match nothing.
fn search_predicate(spec: &ProviderSpec, filters: &SearchFilters) -> Option<String> {
    let mut predicate = spec_predicate(spec);
    if let Some(ids) = &filters.knowledge_source_ids {
        if ids.is_empty() {
            return None;
        }
        predicate.push_str(&format!(
            " AND knowledge_source_id IN ({})",
            ids.iter().join(", ")
        ));
    }
    Some(predicate)
}

fn typed_column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| EngineError::Database(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| EngineError::Database(format!("Invalid {} column type", name)))
}

async fn collect_records(
    mut results: lancedb::arrow::SendableRecordBatchStream,
) -> Result<Vec<EmbeddingRecord>> {
    let mut records = Vec::new();
    while let Some(batch) = results
        .try_next()
        .await
        .map_err(|e| EngineError::Database(format!("Failed to read result stream: {}", e)))?
    {
        records.extend(parse_batch(&batch)?);
    }
    Ok(records)
}

fn parse_batch(batch: &RecordBatch) -> Result<Vec<EmbeddingRecord>> {
    let vectors = typed_column::<FixedSizeListArray>(batch, "vector")?;
    let chunk_ids = typed_column::<Int64Array>(batch, "chunk_id")?;
    let source_ids = typed_column::<Int64Array>(batch, "knowledge_source_id")?;
    let providers = typed_column::<StringArray>(batch, "provider")?;
    let models = typed_column::<StringArray>(batch, "model")?;
    let native_dimensions = typed_column::<UInt32Array>(batch, "native_dimension")?;
    let content_hashes = typed_column::<StringArray>(batch, "content_hash")?;
    let contents = typed_column::<StringArray>(batch, "content")?;
    let created_ats = typed_column::<StringArray>(batch, "created_at")?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let vector_values = vectors.value(row);
        let vector = vector_values
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| EngineError::Database("Invalid vector item type".to_string()))?
            .values()
            .to_vec();

        let created_at = DateTime::parse_from_rfc3339(created_ats.value(row))
            .map_err(|e| EngineError::Database(format!("Invalid created_at value: {}", e)))?
            .with_timezone(&Utc);

        records.push(EmbeddingRecord {
            chunk_id: chunk_ids.value(row),
            knowledge_source_id: source_ids.value(row),
            provider: providers.value(row).parse()?,
            model: models.value(row).to_string(),
            native_dimension: native_dimensions.value(row) as usize,
            content_hash: content_hashes.value(row).to_string(),
            content: contents.value(row).to_string(),
            vector,
            created_at,
        });
    }

    Ok(records)
}
