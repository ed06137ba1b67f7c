//! Export requests
//!
//! An [`ExportRequest`] is built once per export from the client's JSON,
//! validated while it is staged, and then owned by the coordinator for the
//! lifetime of the export.

use mongodb::bson::{Bson, Document, oid::ObjectId};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default GridFS bucket name
pub const DEFAULT_GRIDFS_BUCKET: &str = "fs";

/// One export request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    /// Source collection
    pub collection: String,

    /// Filter+options or aggregation pipeline
    #[serde(flatten)]
    pub source: Source,

    /// Upload record JSON lines
    #[serde(default)]
    pub include_records: bool,

    /// Explicit key for the JSON Lines artifact
    #[serde(default)]
    pub record_destination_key: Option<String>,

    /// Folder used when the artifact key is derived from the collection name
    #[serde(default)]
    pub record_key_prefix: Option<String>,

    /// How to find and name binary objects referenced by records
    #[serde(default)]
    pub binary_linkage: Option<BinaryLinkage>,
}

/// Where records come from, discriminated by `mode`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Source {
    Query {
        #[serde(default)]
        filter: Document,
        #[serde(default)]
        options: QueryOptions,
    },
    Aggregation {
        pipeline: Vec<Document>,
    },
}

/// Find options honored in query mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub projection: Option<Document>,
    #[serde(default)]
    pub sort: Option<Document>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub skip: Option<u64>,
}

/// Derivation of binary lookup keys and destination names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BinaryLinkage {
    /// Record field holding the key material
    pub source_field: String,

    /// GridFS files-collection field matched against the derived key
    pub match_field: String,

    /// GridFS bucket name
    #[serde(default = "default_bucket")]
    pub bucket_name: String,

    #[serde(default)]
    pub key_prefix: String,

    #[serde(default)]
    pub key_suffix: String,

    /// Folder for relayed objects in the destination bucket
    #[serde(default)]
    pub destination_key_prefix: String,
}

fn default_bucket() -> String {
    DEFAULT_GRIDFS_BUCKET.to_string()
}

/// A derived lookup key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupKey {
    /// prefix + field value + suffix
    pub raw: String,
    pub target: LookupTarget,
}

/// How a lookup key is resolved in the chunked store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupTarget {
    /// By files-collection `_id`
    Id(ObjectId),
    /// By files-collection `filename`
    Filename(String),
    /// By any other files-collection field
    Field { field: String, value: String },
    /// `_id` matching was requested but the key is not an ObjectId
    Malformed,
}

/// A binary relay to perform for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryTask {
    pub lookup: LookupKey,
    pub destination_prefix: String,
}

impl ExportRequest {
    /// Parse a request from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validate a request before it is staged
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(ConfigError::InvalidRequest("collection is required".into()).into());
        }
        if !self.include_records && self.binary_linkage.is_none() {
            return Err(ConfigError::InvalidRequest(
                "No data selected to upload on S3".into(),
            )
            .into());
        }
        if let Some(linkage) = &self.binary_linkage {
            if linkage.source_field.is_empty() || linkage.match_field.is_empty() {
                return Err(ConfigError::InvalidRequest(
                    "binaryLinkage requires sourceField and matchField".into(),
                )
                .into());
            }
            if linkage.bucket_name.is_empty() {
                return Err(ConfigError::InvalidRequest(
                    "binaryLinkage bucketName cannot be empty".into(),
                )
                .into());
            }
        }
        self.check_projection()
    }

    /// Ensure the linkage source field survives the query projection
    pub fn check_projection(&self) -> Result<()> {
        let (Some(linkage), Source::Query { options, .. }) = (&self.binary_linkage, &self.source)
        else {
            return Ok(());
        };
        let Some(projection) = options.projection.as_ref().filter(|p| !p.is_empty()) else {
            return Ok(());
        };

        let field = linkage.source_field.as_str();
        let inclusive = projection
            .iter()
            .any(|(k, v)| k != "_id" && is_truthy(v));

        let kept = if field == "_id" {
            projection.get("_id").is_none_or(is_truthy)
        } else if inclusive {
            projection.get(field).is_some_and(is_truthy)
        } else {
            projection.get(field).is_none_or(is_truthy)
        };

        if kept {
            Ok(())
        } else {
            Err(ConfigError::FieldNotProjected(field.to_string()).into())
        }
    }

    /// Key of the JSON Lines artifact
    pub fn record_key(&self) -> String {
        if let Some(key) = self.record_destination_key.as_deref().filter(|k| !k.is_empty()) {
            return key.to_string();
        }
        let suffix = match self.source {
            Source::Query { .. } => "",
            Source::Aggregation { .. } => "_aggregated",
        };
        let name = format!("{}{}.jsonl", self.collection, suffix);
        join_key(self.record_key_prefix.as_deref().unwrap_or(""), &name)
    }

    pub fn mode(&self) -> &'static str {
        match self.source {
            Source::Query { .. } => "query",
            Source::Aggregation { .. } => "aggregation",
        }
    }
}

impl BinaryLinkage {
    /// Derive the lookup key for one record
    ///
    /// Returns `None` when the source field is absent or null.
    pub fn lookup_key(&self, record: &Document) -> Option<LookupKey> {
        let value = match record.get(&self.source_field)? {
            Bson::Null | Bson::Undefined => return None,
            Bson::String(s) => s.clone(),
            Bson::ObjectId(oid) => oid.to_hex(),
            Bson::Int32(n) => n.to_string(),
            Bson::Int64(n) => n.to_string(),
            Bson::Double(f) => f.to_string(),
            Bson::Boolean(b) => b.to_string(),
            Bson::Decimal128(d) => d.to_string(),
            other => other.to_string(),
        };
        let raw = format!("{}{}{}", self.key_prefix, value, self.key_suffix);

        let target = match self.match_field.as_str() {
            "_id" => ObjectId::parse_str(&raw)
                .map(LookupTarget::Id)
                .unwrap_or(LookupTarget::Malformed),
            "filename" => LookupTarget::Filename(raw.clone()),
            field => LookupTarget::Field {
                field: field.to_string(),
                value: raw.clone(),
            },
        };
        Some(LookupKey { raw, target })
    }

    /// Build the relay task for one record
    pub fn task_for(&self, record: &Document) -> Option<BinaryTask> {
        self.lookup_key(record).map(|lookup| BinaryTask {
            lookup,
            destination_prefix: self.destination_key_prefix.clone(),
        })
    }
}

impl BinaryTask {
    /// Destination key for this task given a sniffed extension
    pub fn destination_key(&self, extension: Option<&str>) -> String {
        let name = match extension {
            Some(ext) => format!("{}.{}", self.lookup.raw, ext),
            None => self.lookup.raw.clone(),
        };
        join_key(&self.destination_prefix, &name)
    }
}

/// Join a folder prefix and a name with exactly one `/`
pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if prefix.ends_with('/') {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}/{name}")
    }
}

fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(f) => *f != 0.0,
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        // Projection expressions ($slice, $elemMatch, computed fields) keep the field
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn linkage(match_field: &str) -> BinaryLinkage {
        BinaryLinkage {
            source_field: "photo".to_string(),
            match_field: match_field.to_string(),
            bucket_name: "images".to_string(),
            key_prefix: "img_".to_string(),
            key_suffix: "_v1".to_string(),
            destination_key_prefix: "photos".to_string(),
        }
    }

    fn query_request(projection: Option<Document>) -> ExportRequest {
        ExportRequest {
            collection: "users".to_string(),
            source: Source::Query {
                filter: doc! {},
                options: QueryOptions {
                    projection,
                    ..Default::default()
                },
            },
            include_records: true,
            record_destination_key: None,
            record_key_prefix: None,
            binary_linkage: Some(linkage("filename")),
        }
    }

    #[test]
    fn test_parse_query_request() {
        let request = ExportRequest::from_json(
            r#"{
                "collection": "users",
                "mode": "query",
                "filter": {"active": true},
                "options": {"projection": {"photo": 1}, "limit": 50},
                "includeRecords": true,
                "binaryLinkage": {
                    "sourceField": "photo",
                    "matchField": "filename",
                    "destinationKeyPrefix": "photos"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(request.mode(), "query");
        let Source::Query { filter, options } = &request.source else {
            panic!("expected query source");
        };
        assert_eq!(filter.get_bool("active").unwrap(), true);
        assert_eq!(options.limit, Some(50));
        let linkage = request.binary_linkage.unwrap();
        assert_eq!(linkage.bucket_name, DEFAULT_GRIDFS_BUCKET);
        assert_eq!(linkage.key_prefix, "");
    }

    #[test]
    fn test_parse_aggregation_request() {
        let request = ExportRequest::from_json(
            r#"{
                "collection": "orders",
                "mode": "aggregation",
                "pipeline": [{"$match": {"status": "paid"}}],
                "includeRecords": true
            }"#,
        )
        .unwrap();
        assert_eq!(request.mode(), "aggregation");
        assert_eq!(request.record_key(), "orders_aggregated.jsonl");
    }

    #[test]
    fn test_validate_requires_something_to_export() {
        let mut request = query_request(None);
        request.include_records = false;
        request.binary_linkage = None;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_projection_must_include_source_field() {
        assert!(query_request(Some(doc! { "name": 1 })).validate().is_err());
        assert!(query_request(Some(doc! { "name": 1, "photo": 1 })).validate().is_ok());
        assert!(query_request(Some(doc! { "photo": true })).validate().is_ok());
        // exclusion projection keeps everything else
        assert!(query_request(Some(doc! { "secret": 0 })).validate().is_ok());
        assert!(query_request(Some(doc! { "photo": 0 })).validate().is_err());
        assert!(query_request(Some(doc! {})).validate().is_ok());
    }

    #[test]
    fn test_projection_on_id_source_field() {
        let mut request = query_request(Some(doc! { "name": 1 }));
        request.binary_linkage.as_mut().unwrap().source_field = "_id".to_string();
        assert!(request.check_projection().is_ok());
        request.source = Source::Query {
            filter: doc! {},
            options: QueryOptions {
                projection: Some(doc! { "_id": 0, "name": 1 }),
                ..Default::default()
            },
        };
        assert!(request.check_projection().is_err());
    }

    #[test]
    fn test_record_key_defaults() {
        let mut request = query_request(None);
        assert_eq!(request.record_key(), "users.jsonl");
        request.record_key_prefix = Some("exports/2024".to_string());
        assert_eq!(request.record_key(), "exports/2024/users.jsonl");
        request.record_destination_key = Some("custom/out.jsonl".to_string());
        assert_eq!(request.record_key(), "custom/out.jsonl");
    }

    #[test]
    fn test_lookup_key_by_filename() {
        let key = linkage("filename")
            .lookup_key(&doc! { "photo": "abc" })
            .unwrap();
        assert_eq!(key.raw, "img_abc_v1");
        assert_eq!(key.target, LookupTarget::Filename("img_abc_v1".to_string()));
    }

    #[test]
    fn test_lookup_key_by_id() {
        let oid = ObjectId::new();
        let mut by_id = linkage("_id");
        by_id.key_prefix.clear();
        by_id.key_suffix.clear();

        let key = by_id.lookup_key(&doc! { "photo": oid }).unwrap();
        assert_eq!(key.target, LookupTarget::Id(oid));

        let key = by_id.lookup_key(&doc! { "photo": "not-an-oid" }).unwrap();
        assert_eq!(key.target, LookupTarget::Malformed);
    }

    #[test]
    fn test_lookup_key_other_field_and_numbers() {
        let key = linkage("metadata.ref")
            .lookup_key(&doc! { "photo": 42_i64 })
            .unwrap();
        assert_eq!(
            key.target,
            LookupTarget::Field {
                field: "metadata.ref".to_string(),
                value: "img_42_v1".to_string()
            }
        );
    }

    #[test]
    fn test_absent_or_null_field_is_skipped() {
        let linkage = linkage("filename");
        assert!(linkage.lookup_key(&doc! { "name": "x" }).is_none());
        assert!(linkage.lookup_key(&doc! { "photo": Bson::Null }).is_none());
    }

    #[test]
    fn test_destination_key() {
        let task = linkage("filename").task_for(&doc! { "photo": "abc" }).unwrap();
        assert_eq!(task.destination_key(Some("png")), "photos/img_abc_v1.png");
        assert_eq!(task.destination_key(None), "photos/img_abc_v1");
        assert_eq!(join_key("a/", "b"), "a/b");
        assert_eq!(join_key("", "b"), "b");
    }
}
