//! MongoDB driver
//!
//! Adapts the `mongodb` client to the driver traits. Bulk writes run one
//! operation at a time on the session so they join its transaction. Server
//! failures keep their numeric code as a [`CommandError`]; index conflicts
//! also carry the name of the existing index.

use super::{
    BulkWriteOptions, BulkWriteResult, ClientSession, CommandError, DocumentCollection,
    DocumentCursor, DocumentDriver, DriverError, DriverResult, ErrorCode, FindQuery, IndexKeys,
    IndexKind, IndexModel, IndexOptions, IndexSpec, WriteOperation, DEFAULT_BATCH_SIZE,
};
use crate::config::{ContextOptions, SessionOptions, TransactionOptions};
use crate::document::Filter;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{self as mongo_options, Acknowledgment, ReadConcern, WriteConcern};
use mongodb::{Client, Collection, Cursor, Database, IndexModel as MongoIndexModel};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Name of the index MongoDB creates on `_id` for every collection.
const ID_INDEX: &str = "_id_";

/// Connection to one database of a MongoDB deployment.
#[derive(Debug, Clone)]
pub struct MongoDriver {
    client: Client,
    database: Database,
}

impl MongoDriver {
    /// Use `options.database` on an existing client.
    pub fn new(client: Client, options: &ContextOptions) -> Self {
        let database = client.database(&options.database);
        Self { client, database }
    }

    pub async fn connect(uri: &str, options: &ContextOptions) -> DriverResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(map_error)?;
        debug!(database = %options.database, "connected to mongodb");
        Ok(Self::new(client, options))
    }

    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl DocumentDriver for MongoDriver {
    type Session = MongoSession;
    type Collection = MongoCollection;

    async fn start_session(&self, options: &SessionOptions) -> DriverResult<MongoSession> {
        let session = self
            .client
            .start_session(Some(session_options(options)?))
            .await
            .map_err(map_error)?;
        let id = session.id().to_string();
        debug!(session = %id, "started mongodb session");
        Ok(MongoSession {
            id,
            session: Mutex::new(session),
            in_transaction: false,
        })
    }

    fn collection(&self, name: &str) -> MongoCollection {
        MongoCollection {
            name: name.to_string(),
            inner: self.database.collection(name),
        }
    }
}

pub struct MongoSession {
    id: String,
    session: Mutex<mongodb::ClientSession>,
    in_transaction: bool,
}

#[async_trait]
impl ClientSession for MongoSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn start_transaction(&mut self) -> DriverResult<()> {
        self.session
            .get_mut()
            .start_transaction(None::<mongo_options::TransactionOptions>)
            .await
            .map_err(map_error)?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> DriverResult<()> {
        let committed = self.session.get_mut().commit_transaction().await;
        self.in_transaction = false;
        committed.map_err(map_error)
    }

    async fn abort_transaction(&mut self) -> DriverResult<()> {
        let aborted = self.session.get_mut().abort_transaction().await;
        self.in_transaction = false;
        aborted.map_err(map_error)
    }
}

#[derive(Debug, Clone)]
pub struct MongoCollection {
    name: String,
    inner: Collection<Document>,
}

impl MongoCollection {
    async fn write_one(
        &self,
        session: &mut mongodb::ClientSession,
        operation: WriteOperation,
        result: &mut BulkWriteResult,
    ) -> DriverResult<()> {
        match operation {
            WriteOperation::InsertOne { document } => {
                self.inner
                    .insert_one_with_session(to_document(&document)?, None, session)
                    .await
                    .map_err(map_error)?;
                result.inserted += 1;
            }
            WriteOperation::UpdateOne { filter, update } => {
                let outcome = self
                    .inner
                    .update_one_with_session(
                        filter_document(&filter)?,
                        to_document(&update.to_document())?,
                        None,
                        session,
                    )
                    .await
                    .map_err(map_error)?;
                result.matched += outcome.matched_count;
                result.modified += outcome.modified_count;
            }
            WriteOperation::DeleteOne { filter } => {
                let outcome = self
                    .inner
                    .delete_one_with_session(filter_document(&filter)?, None, session)
                    .await
                    .map_err(map_error)?;
                result.deleted += outcome.deleted_count;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentCollection for MongoCollection {
    type Session = MongoSession;
    type Cursor = MongoCursor;

    fn name(&self) -> &str {
        &self.name
    }

    async fn bulk_write(
        &self,
        session: &MongoSession,
        operations: Vec<WriteOperation>,
        options: BulkWriteOptions,
    ) -> DriverResult<BulkWriteResult> {
        let mut client_session = session.session.lock().await;
        let mut result = BulkWriteResult::default();
        let mut first_error: Option<(usize, DriverError)> = None;

        for (index, operation) in operations.into_iter().enumerate() {
            if let Err(source) = self.write_one(&mut client_session, operation, &mut result).await {
                if options.ordered {
                    return Err(DriverError::BulkWrite {
                        index,
                        source: Box::new(source),
                        partial: result,
                    });
                }
                first_error.get_or_insert((index, source));
            }
        }

        match first_error {
            Some((index, source)) => Err(DriverError::BulkWrite {
                index,
                source: Box::new(source),
                partial: result,
            }),
            None => Ok(result),
        }
    }

    async fn find(&self, query: &FindQuery) -> DriverResult<MongoCursor> {
        let sort = (!query.sort.is_empty()).then(|| {
            query
                .sort
                .iter()
                .map(|(path, direction)| (path.clone(), Bson::Int32(direction.as_i32())))
                .collect::<Document>()
        });
        let options = mongo_options::FindOptions::builder()
            .sort(sort)
            .skip(query.skip)
            .limit(query.limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX)))
            .batch_size(query.batch_size)
            .build();
        let cursor = self
            .inner
            .find(filter_document(&query.filter)?, Some(options))
            .await
            .map_err(map_error)?;
        let batch_size = match query.batch_size {
            Some(size) if size > 0 => size,
            _ => DEFAULT_BATCH_SIZE,
        };
        Ok(MongoCursor {
            cursor,
            batch_size: batch_size as usize,
        })
    }

    async fn count(&self, filter: &Filter) -> DriverResult<u64> {
        self.inner
            .count_documents(filter_document(filter)?, None)
            .await
            .map_err(map_error)
    }

    async fn create_index(&self, model: &IndexModel) -> DriverResult<String> {
        let index = MongoIndexModel::builder()
            .keys(index_keys(&model.keys))
            .options(Some(index_options(&model.options)))
            .build();
        let created = self
            .inner
            .create_index(index, None)
            .await
            .map_err(map_error)?;
        debug!(collection = %self.name, index = %created.index_name, "created index");
        Ok(created.index_name)
    }

    /// The implicit `_id_` index is not reported.
    async fn list_indexes(&self) -> DriverResult<Vec<IndexSpec>> {
        let indexes: Vec<MongoIndexModel> = self
            .inner
            .list_indexes(None)
            .await
            .map_err(map_error)?
            .try_collect()
            .await
            .map_err(map_error)?;
        Ok(indexes
            .into_iter()
            .map(index_spec)
            .filter(|spec| spec.name != ID_INDEX)
            .collect())
    }

    async fn drop_index(&self, name: &str) -> DriverResult<()> {
        self.inner.drop_index(name, None).await.map_err(map_error)?;
        debug!(collection = %self.name, index = %name, "dropped index");
        Ok(())
    }
}

pub struct MongoCursor {
    cursor: Cursor<Document>,
    batch_size: usize,
}

#[async_trait]
impl DocumentCursor for MongoCursor {
    async fn next_batch(&mut self) -> DriverResult<Option<Vec<Value>>> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.cursor.try_next().await.map_err(map_error)? {
                Some(document) => batch.push(Bson::Document(document).into_relaxed_extjson()),
                None => break,
            }
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

fn session_options(options: &SessionOptions) -> DriverResult<mongo_options::SessionOptions> {
    Ok(mongo_options::SessionOptions::builder()
        .causal_consistency(Some(options.causal_consistency))
        .default_transaction_options(Some(transaction_options(&options.transaction)?))
        .build())
}

fn transaction_options(
    options: &TransactionOptions,
) -> DriverResult<mongo_options::TransactionOptions> {
    let read_concern = options
        .read_concern
        .as_deref()
        .map(read_concern)
        .transpose()?;
    Ok(mongo_options::TransactionOptions::builder()
        .read_concern(read_concern)
        .write_concern(options.write_concern.as_deref().map(write_concern))
        .max_commit_time(options.max_commit_time_ms.map(Duration::from_millis))
        .build())
}

fn read_concern(level: &str) -> DriverResult<ReadConcern> {
    match level {
        "local" => Ok(ReadConcern::local()),
        "majority" => Ok(ReadConcern::majority()),
        "snapshot" => Ok(ReadConcern::snapshot()),
        "available" => Ok(ReadConcern::available()),
        "linearizable" => Ok(ReadConcern::linearizable()),
        other => Err(DriverError::Client(format!(
            "unsupported read concern level '{}'",
            other
        ))),
    }
}

/// `"majority"`, a node count such as `"2"`, or a custom tag set name.
fn write_concern(w: &str) -> WriteConcern {
    let acknowledgment = match w {
        "majority" => Acknowledgment::Majority,
        _ => match w.parse::<u32>() {
            Ok(nodes) => Acknowledgment::Nodes(nodes),
            Err(_) => Acknowledgment::Custom(w.to_string()),
        },
    };
    WriteConcern::builder().w(Some(acknowledgment)).build()
}

fn to_document(value: &Value) -> DriverResult<Document> {
    bson::to_document(value).map_err(|e| DriverError::Client(e.to_string()))
}

fn filter_document(filter: &Filter) -> DriverResult<Document> {
    to_document(&filter.to_document())
}

fn index_keys(keys: &IndexKeys) -> Document {
    keys.fields
        .iter()
        .map(|(field, kind)| {
            let value = match kind {
                IndexKind::Ascending => Bson::Int32(1),
                IndexKind::Descending => Bson::Int32(-1),
                IndexKind::Text => Bson::String("text".to_string()),
            };
            (field.clone(), value)
        })
        .collect()
}

fn index_options(options: &IndexOptions) -> mongo_options::IndexOptions {
    let weights = options.weights.as_ref().map(|weights| {
        weights
            .iter()
            .map(|(field, weight)| (field.clone(), Bson::Int32(*weight)))
            .collect::<Document>()
    });
    mongo_options::IndexOptions::builder()
        .name(options.name.clone())
        .unique(options.unique.then_some(true))
        .sparse(options.sparse.then_some(true))
        .expire_after(options.expire_after_seconds.map(Duration::from_secs))
        .weights(weights)
        .default_language(options.default_language.clone())
        .build()
}

fn bson_i32(value: &Bson) -> Option<i32> {
    value
        .as_i32()
        .or_else(|| value.as_i64().and_then(|v| i32::try_from(v).ok()))
        .or_else(|| value.as_f64().map(|v| v as i32))
}

/// Convert a listed index. Text indexes are reported by the server as
/// `_fts`/`_ftsx` keys; their fields are recovered from the weights.
fn index_spec(model: MongoIndexModel) -> IndexSpec {
    let options = model.options.unwrap_or_default();
    let weights: Option<BTreeMap<String, i32>> = options.weights.as_ref().map(|weights| {
        weights
            .iter()
            .filter_map(|(field, weight)| Some((field.clone(), bson_i32(weight)?)))
            .collect()
    });

    let mut keys = IndexKeys::default();
    for (field, value) in model.keys.iter() {
        match field.as_str() {
            "_fts" => {
                for text_field in weights.iter().flat_map(|weights| weights.keys()) {
                    keys = keys.then(text_field.clone(), IndexKind::Text);
                }
            }
            "_ftsx" => {}
            _ => match value {
                Bson::String(kind) if kind == "text" => {
                    keys = keys.then(field.clone(), IndexKind::Text)
                }
                _ => match bson_i32(value) {
                    Some(direction) if direction < 0 => {
                        keys = keys.then(field.clone(), IndexKind::Descending)
                    }
                    Some(_) => keys = keys.then(field.clone(), IndexKind::Ascending),
                    None => debug!(field = %field, key = %value, "skipping unsupported index key"),
                },
            },
        }
    }

    let name = options.name.clone().unwrap_or_else(|| keys.default_name());
    IndexSpec {
        name: name.clone(),
        keys,
        options: IndexOptions {
            name: Some(name),
            unique: options.unique.unwrap_or(false),
            sparse: options.sparse.unwrap_or(false),
            expire_after_seconds: options.expire_after.map(|ttl| ttl.as_secs()),
            weights,
            default_language: options.default_language.clone(),
        },
    }
}

/// Name of the existing index in an index conflict message, e.g.
/// `... existing index: { v: 2, key: { created_at: 1 }, name: "created_at_1" }`.
fn existing_index_name(message: &str) -> Option<String> {
    let (_, existing) = message.split_once("existing index: ")?;
    let (_, rest) = existing.split_once("name: ")?;
    let name: String = rest
        .trim_start_matches('"')
        .chars()
        .take_while(|c| *c != '"' && *c != ',' && !c.is_whitespace())
        .collect();
    (!name.is_empty()).then_some(name)
}

fn command_error(code: i32, message: &str) -> DriverError {
    let code = ErrorCode::from_i32(code);
    let error = CommandError::new(code, message);
    match existing_index_name(message).filter(|_| code.is_index_conflict()) {
        Some(name) => error.with_details(json!({ "existingIndex": name })).into(),
        None => error.into(),
    }
}

fn map_error(err: MongoError) -> DriverError {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => command_error(command.code, &command.message),
        ErrorKind::Write(WriteFailure::WriteError(write)) => {
            command_error(write.code, &write.message)
        }
        ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => {
            command_error(concern.code, &concern.message)
        }
        _ => DriverError::Client(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_options_conflict_names_the_existing_index() {
        let message = "An existing index has the same name as the requested index. \
            Requested index: { v: 2, key: { created_at: 1 }, name: \"created_at_1\", expireAfterSeconds: 3600 }, \
            existing index: { v: 2, key: { created_at: 1 }, name: \"created_at_1\" }";
        let DriverError::Command(error) = command_error(85, message) else {
            panic!("expected command error");
        };
        assert_eq!(error.code, ErrorCode::IndexOptionsConflict);
        assert_eq!(error.conflicting_index_name().as_deref(), Some("created_at_1"));
    }

    #[test]
    fn test_renamed_index_conflict_falls_back_to_message() {
        let DriverError::Command(error) =
            command_error(85, "Index already exists with a different name: by_creation")
        else {
            panic!("expected command error");
        };
        assert_eq!(error.details, Value::Null);
        assert_eq!(error.conflicting_index_name().as_deref(), Some("by_creation"));
    }

    #[test]
    fn test_duplicate_key_keeps_its_code() {
        let err = command_error(11000, "E11000 duplicate key error");
        assert_eq!(err.code(), Some(ErrorCode::DuplicateKey));
    }

    #[test]
    fn test_transaction_options_follow_configuration() {
        let options = transaction_options(&TransactionOptions {
            read_concern: Some("snapshot".to_string()),
            write_concern: Some("majority".to_string()),
            max_commit_time_ms: Some(250),
        })
        .unwrap();
        assert_eq!(options.read_concern, Some(ReadConcern::snapshot()));
        assert_eq!(
            options.write_concern.and_then(|concern| concern.w),
            Some(Acknowledgment::Majority)
        );
        assert_eq!(options.max_commit_time, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_unknown_read_concern_is_rejected() {
        let err = read_concern("eventual").unwrap_err();
        assert!(matches!(err, DriverError::Client(_)));
    }

    #[test]
    fn test_write_concern_node_count() {
        assert_eq!(write_concern("2").w, Some(Acknowledgment::Nodes(2)));
        assert_eq!(
            write_concern("dc-east").w,
            Some(Acknowledgment::Custom("dc-east".to_string()))
        );
    }

    #[test]
    fn test_listed_text_index_recovers_fields() {
        let listed = MongoIndexModel::builder()
            .keys(bson::doc! { "_fts": "text", "_ftsx": 1 })
            .options(Some(
                mongo_options::IndexOptions::builder()
                    .name(Some("title_text_body_text".to_string()))
                    .weights(Some(bson::doc! { "body": 1, "title": 5 }))
                    .build(),
            ))
            .build();

        let spec = index_spec(listed);

        assert_eq!(spec.name, "title_text_body_text");
        assert_eq!(
            spec.keys,
            IndexKeys::text("body").then("title", IndexKind::Text)
        );
        assert_eq!(spec.options.weights.and_then(|w| w.get("title").copied()), Some(5));
    }

    #[test]
    fn test_declared_keys_render_directions() {
        let keys = IndexKeys::ascending("created_at")
            .then("score", IndexKind::Descending)
            .then("title", IndexKind::Text);
        assert_eq!(
            index_keys(&keys),
            bson::doc! { "created_at": 1, "score": -1, "title": "text" }
        );
    }
}
