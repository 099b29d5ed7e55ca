//! The target's command channel: a single `/feature` endpoint multiplexed on a `command`
//! field. Both the HTTP target store (client side) and the command router (server side)
//! go through the types here, so the wire names and parameter encoding live in one place.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::record::codec::{self, CodecError};
use crate::record::{Collection, Record};
use crate::store::{
    clamp_limit, DeleteOutcome, IdRange, Scope, StoreError, TargetStore, MAX_PAGE_LIMIT,
};

pub const CODE_OK: i64 = 0;
pub const CODE_FAILURE: i64 = 100;
pub const CODE_UNSUPPORTED: i64 = 101;
pub const CODE_DEPENDENCY_EXISTS: i64 = 102;
pub const CODE_INVALID_PARAMETER: i64 = 103;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    GetSyncStatus,
    QueryIdRange(Collection),
    QueryRowRange(Collection),
    /// Id plus revision marker only; exists for collections that have a marker.
    QueryRevisionRange(Collection),
    Insert(Collection),
    DeleteById(Collection),
    Update(Collection),
}

impl CommandKind {
    pub fn all() -> Vec<CommandKind> {
        let mut kinds = vec![CommandKind::GetSyncStatus];
        for collection in Collection::ALL {
            kinds.extend([
                CommandKind::QueryIdRange(collection),
                CommandKind::QueryRowRange(collection),
                CommandKind::Insert(collection),
                CommandKind::DeleteById(collection),
                CommandKind::Update(collection),
            ]);
            if collection.revision_marker().is_some() {
                kinds.push(CommandKind::QueryRevisionRange(collection));
            }
        }
        kinds
    }

    pub fn name(&self) -> String {
        match self {
            CommandKind::GetSyncStatus => "get_sync_status".to_string(),
            CommandKind::QueryIdRange(c) => format!("query_{}_id_range", c.name()),
            CommandKind::QueryRowRange(c) => format!("query_{}_range", c.name()),
            CommandKind::QueryRevisionRange(c) => format!("query_{}_time_range", c.name()),
            CommandKind::Insert(c) => format!("add_{}", c.name()),
            CommandKind::DeleteById(c) => format!("del_{}_by_id", c.name()),
            CommandKind::Update(c) => format!("update_{}", c.name()),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, CommandError> {
        CommandKind::all()
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| CommandError::Unsupported(name.to_string()))
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            CommandKind::Insert(_) | CommandKind::DeleteById(_) | CommandKind::Update(_)
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetSyncStatus {
        scope: Scope,
    },
    QueryIdRange {
        collection: Collection,
        scope: Scope,
        range: IdRange,
        limit: usize,
    },
    QueryRowRange {
        collection: Collection,
        scope: Scope,
        range: IdRange,
        limit: usize,
    },
    QueryRevisionRange {
        collection: Collection,
        scope: Scope,
        range: IdRange,
        limit: usize,
    },
    Insert {
        collection: Collection,
        record: Record,
    },
    DeleteById {
        collection: Collection,
        id: i64,
    },
    Update {
        collection: Collection,
        record: Record,
    },
}

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("no support command <{0}>")]
    Unsupported(String),

    #[error("invalid parameter `{name}`: {message}")]
    InvalidParameter { name: String, message: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CommandError {
    pub fn code(&self) -> i64 {
        match self {
            CommandError::Unsupported(_) => CODE_UNSUPPORTED,
            CommandError::InvalidParameter { .. } | CommandError::Codec(_) => {
                CODE_INVALID_PARAMETER
            }
        }
    }

    fn invalid(name: &str, message: impl Into<String>) -> Self {
        CommandError::InvalidParameter {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Request parameters, from either a query string (all strings) or a JSON body.
struct Params(Map<String, Value>);

impl Params {
    fn str(&self, name: &str) -> Result<String, CommandError> {
        match self.0.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(_) => Err(CommandError::invalid(name, "expected a string")),
            None => Err(CommandError::invalid(name, "missing")),
        }
    }

    fn opt_str(&self, name: &str) -> Result<Option<String>, CommandError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.str(name).map(Some),
        }
    }

    fn int(&self, name: &str) -> Result<i64, CommandError> {
        match self.0.get(name) {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| CommandError::invalid(name, "expected an integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| CommandError::invalid(name, format!("`{s}` is not an integer"))),
            Some(_) => Err(CommandError::invalid(name, "expected an integer")),
            None => Err(CommandError::invalid(name, "missing")),
        }
    }

    fn scope(&self) -> Result<Scope, CommandError> {
        Ok(Scope::new(
            self.str("province_code")?,
            self.str("city_code")?,
            self.opt_str("town_code")?,
        ))
    }

    fn range(&self) -> Result<IdRange, CommandError> {
        Ok(IdRange::new(self.int("begin_id")?, self.int("end_id")?))
    }

    fn limit(&self) -> Result<usize, CommandError> {
        match self.0.get("limit") {
            None | Some(Value::Null) => Ok(MAX_PAGE_LIMIT),
            Some(_) => {
                let limit = self.int("limit")?;
                if limit <= 0 {
                    return Err(CommandError::invalid("limit", "must be positive"));
                }
                Ok(clamp_limit(usize::try_from(limit).unwrap_or(MAX_PAGE_LIMIT)))
            }
        }
    }

    fn record(&self, collection: Collection) -> Result<Record, CommandError> {
        let values = match self.0.get("values") {
            Some(Value::String(raw)) => serde_json::from_str(raw)
                .map_err(|err| CommandError::invalid("values", err.to_string()))?,
            Some(value @ Value::Object(_)) => value.clone(),
            Some(_) => return Err(CommandError::invalid("values", "expected an object")),
            None => return Err(CommandError::invalid("values", "missing")),
        };
        Ok(codec::decode_record(collection, values)?)
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::GetSyncStatus { .. } => CommandKind::GetSyncStatus,
            Command::QueryIdRange { collection, .. } => CommandKind::QueryIdRange(*collection),
            Command::QueryRowRange { collection, .. } => CommandKind::QueryRowRange(*collection),
            Command::QueryRevisionRange { collection, .. } => {
                CommandKind::QueryRevisionRange(*collection)
            }
            Command::Insert { collection, .. } => CommandKind::Insert(*collection),
            Command::DeleteById { collection, .. } => CommandKind::DeleteById(*collection),
            Command::Update { collection, .. } => CommandKind::Update(*collection),
        }
    }

    /// Parses a GET request's query parameters.
    pub fn from_query(params: HashMap<String, String>) -> Result<Self, CommandError> {
        let map = params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Self::parse(Params(map))
    }

    /// Parses a POST request's JSON body.
    pub fn from_body(body: Value) -> Result<Self, CommandError> {
        match body {
            Value::Object(map) => Self::parse(Params(map)),
            _ => Err(CommandError::invalid("body", "expected a JSON object")),
        }
    }

    fn parse(params: Params) -> Result<Self, CommandError> {
        let name = params.opt_str("command")?.unwrap_or_default();
        let command = match CommandKind::from_name(&name)? {
            CommandKind::GetSyncStatus => Command::GetSyncStatus {
                scope: params.scope()?,
            },
            CommandKind::QueryIdRange(collection) => Command::QueryIdRange {
                collection,
                scope: params.scope()?,
                range: params.range()?,
                limit: params.limit()?,
            },
            CommandKind::QueryRowRange(collection) => Command::QueryRowRange {
                collection,
                scope: params.scope()?,
                range: params.range()?,
                limit: params.limit()?,
            },
            CommandKind::QueryRevisionRange(collection) => Command::QueryRevisionRange {
                collection,
                scope: params.scope()?,
                range: params.range()?,
                limit: params.limit()?,
            },
            CommandKind::Insert(collection) => Command::Insert {
                collection,
                record: params.record(collection)?,
            },
            CommandKind::DeleteById(collection) => Command::DeleteById {
                collection,
                id: params.int("id")?,
            },
            CommandKind::Update(collection) => Command::Update {
                collection,
                record: params.record(collection)?,
            },
        };
        Ok(command)
    }

    /// Query-string form of a read command; `None` for writes, which travel as POST bodies.
    pub fn to_query(&self) -> Option<Vec<(&'static str, String)>> {
        let scope_params = |scope: &Scope| {
            vec![
                ("province_code", scope.province_code.clone()),
                ("city_code", scope.city_code.clone()),
                ("town_code", scope.town_code.clone()),
            ]
        };
        let mut query = vec![("command", self.kind().name())];
        match self {
            Command::GetSyncStatus { scope } => query.extend(scope_params(scope)),
            Command::QueryIdRange {
                scope, range, limit, ..
            }
            | Command::QueryRowRange {
                scope, range, limit, ..
            }
            | Command::QueryRevisionRange {
                scope, range, limit, ..
            } => {
                query.extend(scope_params(scope));
                query.push(("begin_id", range.begin_id.to_string()));
                query.push(("end_id", range.end_id.to_string()));
                query.push(("limit", limit.to_string()));
            }
            Command::Insert { .. } | Command::DeleteById { .. } | Command::Update { .. } => {
                return None
            }
        }
        Some(query)
    }

    /// JSON body of a command. Records are encoded through the codec.
    pub fn to_body(&self) -> Result<Value, CodecError> {
        let name = self.kind().name();
        Ok(match self {
            Command::Insert { record, .. } | Command::Update { record, .. } => {
                json!({ "command": name, "values": codec::encode_record(record)? })
            }
            Command::DeleteById { id, .. } => json!({ "command": name, "id": id }),
            _ => {
                let fields: Map<String, Value> = self
                    .to_query()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v)))
                    .collect();
                Value::Object(fields)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn ok(data: Value) -> Self {
        Self {
            code: CODE_OK,
            desc: String::new(),
            data,
        }
    }

    pub fn failure(code: i64, desc: impl Into<String>) -> Self {
        Self {
            code,
            desc: desc.into(),
            data: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

impl From<CommandError> for Envelope {
    fn from(err: CommandError) -> Self {
        Envelope::failure(err.code(), err.to_string())
    }
}

/// Runs one command against the backing store and wraps the outcome in an envelope.
pub async fn execute(store: &dyn TargetStore, command: Command) -> Envelope {
    match run(store, command).await {
        Ok(envelope) => envelope,
        Err(err) => Envelope::failure(CODE_FAILURE, err.to_string()),
    }
}

async fn run(store: &dyn TargetStore, command: Command) -> Result<Envelope, StoreError> {
    let data = match command {
        Command::GetSyncStatus { scope } => {
            let marks = store.get_sync_status(&scope).await?;
            serde_json::to_value(marks).map_err(|err| StoreError::Decode(err.to_string()))?
        }
        Command::QueryIdRange {
            collection,
            scope,
            range,
            limit,
        } => {
            let ids = store
                .query_id_range(collection, &scope, range, limit)
                .await?;
            Value::Array(ids.into_iter().map(|id| json!({ "id": id })).collect())
        }
        Command::QueryRowRange {
            collection,
            scope,
            range,
            limit,
        } => {
            let rows = store
                .query_row_range(collection, &scope, range, limit)
                .await?;
            codec::encode_records(&rows)?
        }
        Command::QueryRevisionRange {
            collection,
            scope,
            range,
            limit,
        } => {
            let rows = store
                .query_revision_range(collection, &scope, range, limit)
                .await?;
            codec::encode_records(&rows)?
        }
        Command::Insert { collection, record } => Value::from(store.insert(collection, &record).await?),
        Command::DeleteById { collection, id } => {
            match store.delete_by_id(collection, id).await? {
                DeleteOutcome::Deleted(rows) => Value::from(rows),
                DeleteOutcome::DependencyExists => {
                    return Ok(Envelope::failure(
                        CODE_DEPENDENCY_EXISTS,
                        format!("{collection} {id} is still referenced"),
                    ))
                }
            }
        }
        Command::Update { collection, record } => Value::from(store.update(collection, &record).await?),
    };
    Ok(Envelope::ok(data))
}
