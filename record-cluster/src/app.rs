//! HTTP handling that runs inside each worker (or the standalone server).
//!
//! Paths look like `/api/{resource}/{id?}`. Records live in whatever
//! [`RecordStore`] the router was built with; every error is answered with a
//! plain-text body.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Map, Number, Value, json};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::{error::ApiError, store::RecordStore};

/// Header naming the worker port that produced a response.
pub const WORKER_PORT_HEADER: &str = "x-worker-port";

const MISSING_FIELDS: &str = "There is no required fields";
const WRONG_FORMAT: &str = "Wrong format of fields";

#[derive(Clone)]
struct AppState {
    store: Arc<dyn RecordStore>,
    worker_port: Option<u16>,
}

/// Builds the API router. `worker_port` is echoed in [`WORKER_PORT_HEADER`]
/// when set.
pub fn router(store: Arc<dyn RecordStore>, worker_port: Option<u16>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(AppState { store, worker_port })
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Users,
    Items,
}

impl Resource {
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "users" => Some(Resource::Users),
            "items" => Some(Resource::Items),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Resource::Users => "users",
            Resource::Items => "items",
        }
    }

    fn singular(self) -> &'static str {
        match self {
            Resource::Users => "user",
            Resource::Items => "item",
        }
    }

    fn key(self, id: &str) -> String {
        format!("{}/{}", self.name(), id)
    }

    /// Checks a request body and returns the fields to store, without `id`.
    pub fn validate(self, body: &Value) -> Result<Map<String, Value>, ApiError> {
        match self {
            Resource::Users => validate_user(body),
            Resource::Items => validate_item(body),
        }
    }
}

/// What actually goes into the store: the record plus the resource it
/// belongs to, so listings can be filtered.
#[derive(Debug, Deserialize)]
struct StoredRecord {
    resource: String,
    record: Value,
}

async fn handle(State(state): State<AppState>, method: Method, uri: Uri, body: Bytes) -> Response {
    let mut response = match dispatch(&state, &method, uri.path(), &body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    if let Some(port) = state.worker_port {
        response
            .headers_mut()
            .insert(WORKER_PORT_HEADER, HeaderValue::from(port));
    }
    response
}

async fn dispatch(
    state: &AppState,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    let segments: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();

    if segments.first() != Some(&"api") {
        return Err(ApiError::not_found("Not Found. Add /api path to URL"));
    }

    let resource = segments
        .get(1)
        .and_then(|segment| Resource::from_path(segment))
        .ok_or_else(|| ApiError::not_found("Not Found. Pathname is wrong"))?;
    let id = segments.get(2).copied();
    let store = state.store.as_ref();

    match *method {
        Method::GET => match id {
            Some(id) => get_one(store, resource, id).await,
            None => list(store, resource).await,
        },
        Method::POST => create(store, resource, body).await,
        Method::PUT => update(store, resource, id, body).await,
        Method::DELETE => remove(store, resource, id).await,
        _ => Err(ApiError::not_found("Method Not Allowed")),
    }
}

async fn list(store: &dyn RecordStore, resource: Resource) -> Result<Response, ApiError> {
    let records: Vec<Value> = store
        .get_all()
        .await?
        .into_iter()
        .filter_map(|stored| serde_json::from_value::<StoredRecord>(stored).ok())
        .filter(|stored| stored.resource == resource.name())
        .map(|stored| stored.record)
        .collect();

    Ok(Json(records).into_response())
}

async fn get_one(store: &dyn RecordStore, resource: Resource, id: &str) -> Result<Response, ApiError> {
    let id = parse_id(id)?;
    let stored = store.get(&resource.key(&id)).await?;

    match stored.map(serde_json::from_value::<StoredRecord>) {
        Some(Ok(stored)) => Ok(Json(stored.record).into_response()),
        Some(Err(error)) => {
            warn!(%error, %id, "stored record is not readable");
            Err(not_found_record(resource, &id))
        }
        None => Err(not_found_record(resource, &id)),
    }
}

async fn create(store: &dyn RecordStore, resource: Resource, body: &[u8]) -> Result<Response, ApiError> {
    let id = Uuid::new_v4().to_string();
    let record = build_record(resource, &id, body)?;
    save(store, resource, &id, record.clone()).await?;

    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn update(
    store: &dyn RecordStore,
    resource: Resource,
    id: Option<&str>,
    body: &[u8],
) -> Result<Response, ApiError> {
    let id = require_existing(store, resource, id).await?;
    let record = build_record(resource, &id, body)?;
    save(store, resource, &id, record.clone()).await?;

    Ok(Json(record).into_response())
}

async fn remove(store: &dyn RecordStore, resource: Resource, id: Option<&str>) -> Result<Response, ApiError> {
    let id = require_existing(store, resource, id).await?;
    store.delete(&resource.key(&id)).await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn require_existing(
    store: &dyn RecordStore,
    resource: Resource,
    id: Option<&str>,
) -> Result<String, ApiError> {
    let id = id.ok_or_else(|| ApiError::not_found("Provide Id"))?;
    let id = parse_id(id)?;

    if !store.has(&resource.key(&id)).await? {
        return Err(not_found_record(resource, &id));
    }
    Ok(id)
}

async fn save(store: &dyn RecordStore, resource: Resource, id: &str, record: Value) -> Result<(), ApiError> {
    let stored = json!({ "resource": resource.name(), "record": record });
    store.set(&resource.key(id), stored).await?;
    Ok(())
}

fn build_record(resource: Resource, id: &str, body: &[u8]) -> Result<Value, ApiError> {
    let body: Value =
        serde_json::from_slice(body).map_err(|_| ApiError::bad_request("Invalid JSON body"))?;
    let mut fields = resource.validate(&body)?;
    fields.insert("id".to_string(), Value::String(id.to_string()));
    Ok(Value::Object(fields))
}

/// Accepts only the hyphenated form, in either case. The simple, braced and
/// URN spellings are rejected.
fn parse_id(id: &str) -> Result<String, ApiError> {
    match Uuid::try_parse(id) {
        Ok(uuid) if id.eq_ignore_ascii_case(&uuid.hyphenated().to_string()) => Ok(id.to_string()),
        _ => Err(ApiError::bad_request("Wrong format of ID")),
    }
}

fn not_found_record(resource: Resource, id: &str) -> ApiError {
    ApiError::not_found(format!("Not Found {} with id: {}", resource.singular(), id))
}

/// Required fields count as missing when null, false, zero or empty.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn validate_user(body: &Value) -> Result<Map<String, Value>, ApiError> {
    let required = |name: &str| {
        body.as_object()
            .and_then(|fields| fields.get(name))
            .filter(|value| is_truthy(value))
    };

    let (Some(username), Some(age), Some(hobbies)) =
        (required("username"), required("age"), required("hobbies"))
    else {
        return Err(ApiError::bad_request(MISSING_FIELDS));
    };

    let username = coerce_string(username);
    if username.is_empty() {
        return Err(ApiError::bad_request(WRONG_FORMAT));
    }
    let age = parse_age(age).ok_or_else(|| ApiError::bad_request(WRONG_FORMAT))?;
    let hobbies = match hobbies {
        Value::Array(items) if items.iter().all(Value::is_string) => hobbies.clone(),
        _ => return Err(ApiError::bad_request(WRONG_FORMAT)),
    };

    let mut fields = Map::new();
    fields.insert("username".to_string(), Value::String(username));
    fields.insert("age".to_string(), Value::Number(age));
    fields.insert("hobbies".to_string(), hobbies);
    Ok(fields)
}

/// Loose string conversion: arrays join their elements with commas and
/// objects collapse to a fixed placeholder.
fn coerce_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(coerce_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Loose numeric conversion. `None` stands for "not a number".
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                Some(0.0)
            } else {
                text.parse().ok()
            }
        }
        Value::Array(items) => match items.as_slice() {
            [] => Some(0.0),
            [only] => coerce_number(&Value::String(coerce_string(only))),
            _ => None,
        },
        Value::Object(_) => None,
    }
}

/// Ages must coerce to a positive, finite number.
fn parse_age(value: &Value) -> Option<Number> {
    if let Value::Number(number) = value {
        return number.as_f64().filter(|age| *age > 0.0).map(|_| number.clone());
    }

    let age = coerce_number(value).filter(|age| age.is_finite() && *age > 0.0)?;
    if age.fract() == 0.0 && age <= i64::MAX as f64 {
        return Some(Number::from(age as i64));
    }
    Number::from_f64(age)
}

fn validate_item(body: &Value) -> Result<Map<String, Value>, ApiError> {
    let Some(fields) = body.as_object() else {
        return Err(ApiError::bad_request(WRONG_FORMAT));
    };

    let fields: Map<String, Value> = fields
        .iter()
        .filter(|(name, _)| name.as_str() != "id")
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    if fields.is_empty() {
        return Err(ApiError::bad_request(MISSING_FIELDS));
    }

    let flat = fields.values().all(|value| match value {
        Value::Array(items) => items.iter().all(is_scalar),
        other => is_scalar(other),
    });
    if !flat {
        return Err(ApiError::bad_request(WRONG_FORMAT));
    }
    Ok(fields)
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}
