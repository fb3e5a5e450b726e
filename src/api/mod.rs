// HTTP endpoint.
//
// `GET /health` and `POST /query` over axum, CORS wide open. Each request
// runs one synchronous script against a fresh session on a blocking
// worker; keep-alive pipelining of multiple queries is not attempted.

use crate::execution::executor::{QueryResult, Session};
use crate::types::value::Value;
use crate::Engine;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub ok: bool,
    pub message: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/query", post(query))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Binds and serves until the process stops.
pub async fn serve(engine: Arc<Engine>, port: u16) -> crate::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::DbError::Network(format!("cannot bind {}: {}", addr, e)))?;
    tracing::info!("HTTP endpoint listening on {}", addr);
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| crate::DbError::Network(e.to_string()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn query(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    let result = tokio::task::spawn_blocking(move || {
        let mut session = Session::default();
        engine.execute_sql(&request.sql, &mut session)
    })
    .await;

    let response = match result {
        Ok(Ok(results)) => from_results(results),
        Ok(Err(e)) => QueryResponse {
            ok: false,
            message: format!("ERROR {}: {}", e.sqlstate(), e),
            headers: Vec::new(),
            rows: Vec::new(),
        },
        Err(join_err) => QueryResponse {
            ok: false,
            message: format!("ERROR XX000: executor task failed: {}", join_err),
            headers: Vec::new(),
            rows: Vec::new(),
        },
    };
    Json(response)
}

/// The last tabular result wins; messages concatenate.
fn from_results(results: Vec<QueryResult>) -> QueryResponse {
    let message = results
        .iter()
        .map(|r| r.message.as_str())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    let tabular = results
        .into_iter()
        .rev()
        .find(|r| !r.headers.is_empty())
        .unwrap_or_default();
    QueryResponse {
        ok: true,
        message,
        headers: tabular.headers,
        rows: tabular
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| value_to_json(&v)).collect())
            .collect(),
    }
}

/// JSON projection of engine values.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::json!(b),
        Value::TinyInt(v) => serde_json::json!(v),
        Value::SmallInt(v) => serde_json::json!(v),
        Value::Integer(v) => serde_json::json!(v),
        Value::BigInt(v) => serde_json::json!(v),
        Value::Double(v) => serde_json::json!(v),
        Value::Varchar(s) | Value::Text(s) | Value::Timestamp(s) | Value::Date(s)
        | Value::Time(s) => serde_json::json!(s),
        Value::Blob(b) => serde_json::json!(hex::encode(b)),
        Value::Vector(v) => serde_json::json!(v),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_json_shapes() {
        assert_eq!(value_to_json(&Value::Null), serde_json::Value::Null);
        assert_eq!(value_to_json(&Value::Integer(5)), serde_json::json!(5));
        assert_eq!(
            value_to_json(&Value::Vector(vec![0.1, 0.2])),
            serde_json::json!([0.1, 0.2])
        );
        assert_eq!(
            value_to_json(&Value::Blob(vec![0xAB])),
            serde_json::json!("ab")
        );
    }

    #[test]
    fn test_from_results_picks_last_table() {
        let results = vec![
            QueryResult::message("1 row(s) inserted"),
            QueryResult {
                headers: vec!["id".to_string()],
                rows: vec![vec![Value::Integer(1)]],
                message: "1 row(s)".to_string(),
            },
        ];
        let response = from_results(results);
        assert!(response.ok);
        assert_eq!(response.headers, vec!["id"]);
        assert_eq!(response.rows.len(), 1);
        assert!(response.message.contains("inserted"));
    }
}
