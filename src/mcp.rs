use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Response, StatusCode},
    response::{IntoResponse, Json},
};
use bytes::Bytes;
use reqwest::header::{HeaderMap as UpstreamHeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::proxy::ProxyRequest;
use crate::server::AppState;

const PROTOCOL_VERSION: &str = "2024-11-05";

struct ToolDef {
    name: &'static str,
    description: &'static str,
    method: Method,
    path: &'static str,
}

fn tool_table() -> [ToolDef; 5] {
    [
        ToolDef {
            name: "tavily-search",
            description: "Execute a search query through the key pool. Returns ranked results and optional answer/raw content/images.",
            method: Method::POST,
            path: "/search",
        },
        ToolDef {
            name: "tavily-extract",
            description: "Extract structured content from one or more URLs through the key pool.",
            method: Method::POST,
            path: "/extract",
        },
        ToolDef {
            name: "tavily-crawl",
            description: "Crawl a website starting from a root URL through the key pool.",
            method: Method::POST,
            path: "/crawl",
        },
        ToolDef {
            name: "tavily-map",
            description: "Map a website's URL structure through the key pool.",
            method: Method::POST,
            path: "/map",
        },
        ToolDef {
            name: "tavily-usage",
            description: "Fetch usage and quota information for the pooled account.",
            method: Method::GET,
            path: "/usage",
        },
    ]
}

fn input_schema(name: &str) -> Value {
    match name {
        "tavily-search" => json!({
            "type": "object",
            "additionalProperties": true,
            "required": ["query"],
            "properties": {
                "query": {"type": "string", "description": "The search query to execute."},
                "topic": {"type": "string", "enum": ["general", "news", "finance"], "default": "general"},
                "search_depth": {"type": "string", "enum": ["basic", "advanced"], "default": "basic"},
                "max_results": {"type": "integer", "minimum": 0, "maximum": 20, "default": 5},
                "include_answer": {"type": "boolean", "default": false},
                "include_raw_content": {"type": "boolean", "default": false},
                "include_images": {"type": "boolean", "default": false},
                "include_domains": {"type": "array", "items": {"type": "string"}},
                "exclude_domains": {"type": "array", "items": {"type": "string"}}
            }
        }),
        "tavily-extract" => json!({
            "type": "object",
            "additionalProperties": true,
            "required": ["urls"],
            "properties": {
                "urls": {
                    "description": "URL or list of URLs to extract content from.",
                    "anyOf": [
                        {"type": "string"},
                        {"type": "array", "items": {"type": "string"}}
                    ]
                },
                "extract_depth": {"type": "string", "enum": ["basic", "advanced"], "default": "basic"},
                "include_images": {"type": "boolean", "default": false}
            }
        }),
        "tavily-crawl" => json!({
            "type": "object",
            "additionalProperties": true,
            "required": ["url"],
            "properties": {
                "url": {"type": "string", "description": "The root URL to begin the crawl."},
                "max_depth": {"type": "integer", "minimum": 1, "default": 1},
                "max_breadth": {"type": "integer", "minimum": 1, "default": 20},
                "limit": {"type": "integer", "minimum": 1, "default": 50},
                "instructions": {"type": "string"}
            }
        }),
        "tavily-map" => json!({
            "type": "object",
            "additionalProperties": true,
            "required": ["url"],
            "properties": {
                "url": {"type": "string", "description": "The root URL to begin the mapping."},
                "max_depth": {"type": "integer", "minimum": 1, "default": 1},
                "limit": {"type": "integer", "minimum": 1, "default": 50}
            }
        }),
        _ => json!({"type": "object", "properties": {}, "additionalProperties": false}),
    }
}

/// Streamable JSON-RPC endpoint exposing each proxied path as a
/// schema-described tool. Authenticated with the bearer master key.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    if !state.master.authenticate(token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response();
    }

    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": {"code": -32700, "message": "parse error"},
            }))
            .into_response()
        }
    };

    let id = request.get("id").cloned();
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();

    // Notifications carry no id and expect no response body.
    let Some(id) = id else {
        return StatusCode::ACCEPTED.into_response();
    };

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {
                "name": "tavily-relay-mcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": tool_table()
                .iter()
                .map(|tool| json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": input_schema(tool.name),
                }))
                .collect::<Vec<_>>(),
        })),
        "tools/call" => call_tool(&state, request.get("params")).await,
        _ => Err((-32601, "method not found".to_owned())),
    };

    let response = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }),
    };
    Json(response).into_response()
}

async fn call_tool(state: &AppState, params: Option<&Value>) -> Result<Value, (i64, String)> {
    let params = params.ok_or((-32602, "missing params".to_owned()))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or((-32602, "missing tool name".to_owned()))?;

    let tool = tool_table()
        .into_iter()
        .find(|tool| tool.name == name)
        .ok_or((-32602, format!("unknown tool: {name}")))?;

    let body = if tool.method == Method::POST {
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        Bytes::from(serde_json::to_vec(&arguments).map_err(|err| (-32603, err.to_string()))?)
    } else {
        Bytes::new()
    };

    let mut headers = UpstreamHeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", state.master.get()))
            .map_err(|err| (-32603, err.to_string()))?,
    );
    if tool.method == Method::POST {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    let request = ProxyRequest {
        method: tool.method.clone(),
        path: tool.path.to_owned(),
        query: None,
        headers,
        body,
        client_ip: "mcp".to_owned(),
        content_type: Some("application/json".to_owned()),
    };

    let response = match state.dispatcher.dispatch(request).await {
        Ok(response) => response,
        Err(err) => {
            return Ok(json!({
                "isError": true,
                "content": [{"type": "text", "text": err.to_string()}],
                "structuredContent": {"error": err.to_string()},
            }))
        }
    };

    let text = String::from_utf8_lossy(&response.body).into_owned();
    let structured = match serde_json::from_slice::<Value>(&response.body) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => json!({"raw": text}),
    };

    if !response.status.is_success() {
        return Ok(json!({
            "isError": true,
            "content": [{
                "type": "text",
                "text": format!("Upstream status {}: {}", response.status.as_u16(), text),
            }],
            "structuredContent": structured,
        }));
    }

    Ok(json!({
        "isError": false,
        "content": [{"type": "text", "text": text}],
        "structuredContent": structured,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_key::MasterKey;
    use crate::proxy::Dispatcher;
    use crate::quota_sync::QuotaReconciler;
    use crate::server::build_router;
    use crate::stats::StatsAggregator;
    use crate::store::KeyStore;
    use crate::sync_job::SyncJobSupervisor;
    use axum::http::Request as HttpRequest;
    use axum::routing::{get, post};
    use axum::Router;
    use http_body_util::BodyExt;
    use nanoid::nanoid;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn spawn_upstream(status: u16) -> String {
        async fn ok() -> (StatusCode, Json<Value>) {
            (StatusCode::OK, Json(json!({"results": ["hit"]})))
        }
        async fn exhausted() -> (StatusCode, Json<Value>) {
            (
                StatusCode::from_u16(433).unwrap(),
                Json(json!({"error": "quota_exhausted"})),
            )
        }
        let app = if status == 200 {
            Router::new()
                .route("/search", post(ok))
                .route("/usage", get(ok))
        } else {
            Router::new()
                .route("/search", post(exhausted))
                .route("/usage", get(exhausted))
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn build_state(upstream: &str, prefix: &str) -> (Arc<AppState>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("{}-{}.db", prefix, nanoid!(8)));
        let store = KeyStore::open(&path.to_string_lossy())
            .await
            .expect("store opened");
        let master = Arc::new(
            MasterKey::load_or_create(store.clone())
                .await
                .expect("master key"),
        );
        let stats = StatsAggregator::new(store.clone());
        let dispatcher = Dispatcher::new(
            upstream,
            Duration::from_secs(5),
            store.clone(),
            master.clone(),
            stats.clone(),
        )
        .expect("dispatcher");
        let reconciler =
            QuotaReconciler::new(upstream, Duration::from_secs(5), store.clone())
                .expect("reconciler");
        let supervisor = Arc::new(SyncJobSupervisor::new(store.clone(), reconciler));
        (
            Arc::new(AppState {
                dispatcher,
                store,
                master,
                stats,
                supervisor,
            }),
            path,
        )
    }

    fn rpc_request(state: &AppState, payload: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/mcp")
            .header("Authorization", format!("Bearer {}", state.master.get()))
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&payload).unwrap()))
            .expect("request")
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn tools_list_describes_every_proxied_endpoint() {
        let upstream = spawn_upstream(200).await;
        let (state, path) = build_state(&upstream, "mcp-list").await;
        let router = build_router(state.clone());

        let response = router
            .oneshot(rpc_request(
                &state,
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let reply = body_json(response).await;
        let tools = reply["result"]["tools"].as_array().expect("tools");
        assert_eq!(tools.len(), 5);
        let names: Vec<&str> = tools
            .iter()
            .map(|tool| tool["name"].as_str().expect("name"))
            .collect();
        assert!(names.contains(&"tavily-search"));
        assert!(names.contains(&"tavily-usage"));
        for tool in tools {
            assert!(tool["inputSchema"]["type"] == "object");
        }

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn call_tool_round_trips_through_the_pool() {
        let upstream = spawn_upstream(200).await;
        let (state, path) = build_state(&upstream, "mcp-call").await;
        state
            .store
            .create("tvly-pool", "pool", 1000)
            .await
            .expect("create");
        let router = build_router(state.clone());

        let response = router
            .oneshot(rpc_request(
                &state,
                json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "tools/call",
                    "params": {"name": "tavily-search", "arguments": {"query": "hello"}},
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let reply = body_json(response).await;
        let result = &reply["result"];
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["results"][0], "hit");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn upstream_failure_surfaces_as_tool_error() {
        let upstream = spawn_upstream(433).await;
        let (state, path) = build_state(&upstream, "mcp-err").await;
        state
            .store
            .create("tvly-pool", "pool", 1000)
            .await
            .expect("create");
        let router = build_router(state.clone());

        let response = router
            .oneshot(rpc_request(
                &state,
                json!({
                    "jsonrpc": "2.0",
                    "id": 3,
                    "method": "tools/call",
                    "params": {"name": "tavily-search", "arguments": {"query": "hello"}},
                }),
            ))
            .await
            .expect("response");
        let reply = body_json(response).await;
        let result = &reply["result"];
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().expect("text");
        assert!(text.contains("433"), "error text must carry the status: {text}");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn facade_requires_master_bearer() {
        let upstream = spawn_upstream(200).await;
        let (state, path) = build_state(&upstream, "mcp-auth").await;
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn unknown_method_yields_rpc_error() {
        let upstream = spawn_upstream(200).await;
        let (state, path) = build_state(&upstream, "mcp-unknown").await;
        let router = build_router(state.clone());

        let response = router
            .oneshot(rpc_request(
                &state,
                json!({"jsonrpc": "2.0", "id": 9, "method": "resources/list"}),
            ))
            .await
            .expect("response");
        let reply = body_json(response).await;
        assert_eq!(reply["error"]["code"], -32601);

        let _ = std::fs::remove_file(path);
    }
}
