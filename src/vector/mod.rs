//! Vector index (C3): LanceDB-backed nearest-neighbour store for solved and
//! open cases. Grounded on the upsert / filtered-k-NN / delete contract of
//! a Chroma-style collection: one table, `group_id` + `status` metadata
//! filters, cosine distance.

use crate::domain::{CaseStatus, VectorEntry, VectorHit};
use crate::error::{Result, VectorError};
use arrow_array::{
    builder::{FixedSizeListBuilder, Float32Builder, StringBuilder, TimestampMillisecondBuilder},
    Array, ArrayRef, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

const TABLE_NAME: &str = "cases";

/// One LanceDB table holding every case's embedding plus metadata needed to
/// filter by group and status at query time.
pub struct VectorIndex {
    connection: lancedb::Connection,
    dimension: usize,
}

impl VectorIndex {
    pub async fn connect(uri: &str, dimension: usize) -> Result<Self> {
        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| VectorError::Connect(e.to_string()))?;

        let index = Self { connection, dimension };
        index.ensure_table().await?;
        Ok(index)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("case_id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
            Field::new("document", DataType::Utf8, false),
            Field::new("group_id", DataType::Utf8, false),
            Field::new("status", DataType::Utf8, false),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
            Field::new("evidence_ids_json", DataType::Utf8, false),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let existing = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| VectorError::Table(e.to_string()))?;

        if existing.iter().any(|name| name == TABLE_NAME) {
            return Ok(());
        }

        let schema = self.schema();
        let empty_batch = RecordBatch::new_empty(schema.clone());
        let batches = RecordBatchIterator::new(vec![Ok(empty_batch)], schema);

        self.connection
            .create_table(TABLE_NAME, Box::new(batches))
            .execute()
            .await
            .map_err(|e| VectorError::Table(e.to_string()))?;

        Ok(())
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| VectorError::Table(e.to_string()))
    }

    fn entry_to_batch(&self, entry: &VectorEntry) -> Result<RecordBatch> {
        if entry.embedding.len() != self.dimension {
            return Err(VectorError::Upsert(format!(
                "embedding dimension {} does not match index dimension {}",
                entry.embedding.len(),
                self.dimension
            ))
            .into());
        }

        let schema = self.schema();

        let mut case_id = StringBuilder::new();
        case_id.append_value(&entry.case_id);

        let mut embedding =
            FixedSizeListBuilder::new(Float32Builder::new(), self.dimension as i32);
        for value in &entry.embedding {
            embedding.values().append_value(*value);
        }
        embedding.append(true);

        let mut document = StringBuilder::new();
        document.append_value(&entry.document);

        let mut group_id = StringBuilder::new();
        group_id.append_value(&entry.group_id);

        let mut status = StringBuilder::new();
        status.append_value(entry.status.as_str());

        let mut created_at = TimestampMillisecondBuilder::new();
        created_at.append_value(entry.created_at.timestamp_millis());

        let mut evidence_ids_json = StringBuilder::new();
        evidence_ids_json.append_value(
            serde_json::to_string(&entry.evidence_ids).unwrap_or_else(|_| "[]".to_string()),
        );

        let columns: Vec<ArrayRef> = vec![
            Arc::new(case_id.finish()),
            Arc::new(embedding.finish()),
            Arc::new(document.finish()),
            Arc::new(group_id.finish()),
            Arc::new(status.finish()),
            Arc::new(created_at.finish()),
            Arc::new(evidence_ids_json.finish()),
        ];

        RecordBatch::try_new(schema, columns)
            .map_err(|e| VectorError::Upsert(e.to_string()).into())
    }

    /// Insert or replace a case's vector entry (delete-then-add keyed by `case_id`).
    pub async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        let table = self.table().await?;
        let predicate = format!("case_id = '{}'", escape_literal(&entry.case_id));
        table
            .delete(&predicate)
            .await
            .map_err(|e| VectorError::Upsert(e.to_string()))?;

        let schema = self.schema();
        let batch = self.entry_to_batch(entry)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| VectorError::Upsert(e.to_string()))?;

        Ok(())
    }

    /// k-nearest neighbours within a group, filtered to one case status.
    pub async fn query(
        &self,
        group_id: &str,
        status: CaseStatus,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        let table = self.table().await?;
        let filter = format!(
            "group_id = '{}' AND status = '{}'",
            escape_literal(group_id),
            status.as_str()
        );

        let mut stream = table
            .query()
            .nearest_to(embedding)
            .map_err(|e| VectorError::Query(e.to_string()))?
            .only_if(filter)
            .limit(k)
            .execute()
            .await
            .map_err(|e| VectorError::Query(e.to_string()))?;

        let mut hits = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| VectorError::Query(e.to_string()))?
        {
            hits.extend(batch_to_hits(&batch)?);
        }
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Remove vector entries for the given case ids. Returns the number of
    /// ids actually present before deletion is not tracked by LanceDB, so
    /// this is best-effort (idempotent on already-absent ids).
    pub async fn delete(&self, case_ids: &[String]) -> Result<()> {
        if case_ids.is_empty() {
            return Ok(());
        }
        let table = self.table().await?;
        let quoted = case_ids
            .iter()
            .map(|id| format!("'{}'", escape_literal(id)))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = format!("case_id IN ({quoted})");
        table
            .delete(&predicate)
            .await
            .map_err(|e| VectorError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| VectorError::Query(e.to_string()).into())
    }

    /// All case ids currently stored, for reconciliation against the
    /// relational store.
    pub async fn all_case_ids(&self) -> Result<Vec<String>> {
        let table = self.table().await?;
        let mut stream = table
            .query()
            .select(lancedb::query::Select::Columns(vec!["case_id".to_string()]))
            .execute()
            .await
            .map_err(|e| VectorError::Query(e.to_string()))?;

        let mut ids = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| VectorError::Query(e.to_string()))?
        {
            let column = batch
                .column_by_name("case_id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| VectorError::Query("case_id column missing".to_string()))?;
            for i in 0..column.len() {
                ids.push(column.value(i).to_string());
            }
        }
        Ok(ids)
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn batch_to_hits(batch: &RecordBatch) -> Result<Vec<VectorHit>> {
    let case_id = column_as_str(batch, "case_id")?;
    let document = column_as_str(batch, "document")?;
    let group_id = column_as_str(batch, "group_id")?;
    let status = column_as_str(batch, "status")?;
    let evidence_ids_json = column_as_str(batch, "evidence_ids_json")?;

    let created_at = batch
        .column_by_name("created_at")
        .and_then(|c| c.as_any().downcast_ref::<arrow_array::TimestampMillisecondArray>())
        .ok_or_else(|| VectorError::Query("created_at column missing".to_string()))?;

    let distance = batch
        .column_by_name("_distance")
        .and_then(|c| c.as_any().downcast_ref::<arrow_array::Float32Array>());

    let embeddings = batch
        .column_by_name("embedding")
        .and_then(|c| c.as_any().downcast_ref::<arrow_array::FixedSizeListArray>());

    let mut hits = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let embedding = embeddings
            .map(|list| {
                let values = list.value(i);
                let floats = values
                    .as_any()
                    .downcast_ref::<arrow_array::Float32Array>()
                    .expect("embedding list values are Float32");
                floats.values().to_vec()
            })
            .unwrap_or_default();

        let evidence_ids: Vec<String> =
            serde_json::from_str(evidence_ids_json.value(i)).unwrap_or_default();

        hits.push(VectorHit {
            entry: VectorEntry {
                case_id: case_id.value(i).to_string(),
                embedding,
                document: document.value(i).to_string(),
                group_id: group_id.value(i).to_string(),
                status: CaseStatus::parse(status.value(i))
                    .unwrap_or(CaseStatus::Open),
                created_at: chrono::DateTime::from_timestamp_millis(created_at.value(i))
                    .unwrap_or_else(chrono::Utc::now),
                evidence_ids,
            },
            distance: distance.map(|d| d.value(i)).unwrap_or(0.0),
        });
    }
    Ok(hits)
}

fn column_as_str<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| VectorError::Query(format!("{name} column missing or wrong type")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(case_id: &str, group_id: &str, status: CaseStatus) -> VectorEntry {
        VectorEntry {
            case_id: case_id.to_string(),
            embedding: vec![0.1, 0.2, 0.3, 0.4],
            document: "VPN negotiation fails after client update".to_string(),
            group_id: group_id.to_string(),
            status,
            created_at: chrono::Utc::now(),
            evidence_ids: vec!["m1".to_string()],
        }
    }

    #[tokio::test]
    async fn upsert_then_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("lance").to_string_lossy().to_string();
        let index = VectorIndex::connect(&uri, 4).await.unwrap();

        let entry = sample_entry("c1", "G", CaseStatus::Solved);
        index.upsert(&entry).await.unwrap();

        let hits = index
            .query("G", CaseStatus::Solved, &[0.1, 0.2, 0.3, 0.4], 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.case_id, "c1");
    }

    #[tokio::test]
    async fn query_filters_by_group_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("lance").to_string_lossy().to_string();
        let index = VectorIndex::connect(&uri, 4).await.unwrap();

        index.upsert(&sample_entry("c1", "G", CaseStatus::Solved)).await.unwrap();
        index.upsert(&sample_entry("c2", "OTHER", CaseStatus::Solved)).await.unwrap();
        index.upsert(&sample_entry("c3", "G", CaseStatus::Open)).await.unwrap();

        let hits = index
            .query("G", CaseStatus::Solved, &[0.1, 0.2, 0.3, 0.4], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.case_id, "c1");
    }

    #[tokio::test]
    async fn delete_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("lance").to_string_lossy().to_string();
        let index = VectorIndex::connect(&uri, 4).await.unwrap();

        index.upsert(&sample_entry("c1", "G", CaseStatus::Solved)).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        index.delete(&["c1".to_string()]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
