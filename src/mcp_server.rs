use anyhow::Result;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{
    ErrorData as McpError, ServerHandler, model::*, schemars, tool, tool_handler, tool_router,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::search_engine::{SearchEngine, SearchError, SearchHit};
use crate::vector_store::VectorStore;

/// Maximum allowed top_k to prevent DoS via memory exhaustion
const MAX_TOP_K: usize = 100;

#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct SearchRequest {
    #[schemars(description = "The search query")]
    pub query: String,
    #[schemars(description = "Number of results per collection (default: 10)")]
    pub top_k: Option<usize>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct GetPaperRequest {
    #[schemars(description = "Paper id (e.g. ArXiv id) to look up")]
    pub id: String,
}

#[derive(Clone)]
pub struct PaperSearchServer {
    tool_router: ToolRouter<Self>,
    engine: Arc<SearchEngine>,
    store: Arc<VectorStore>,
    default_top_k: usize,
}

#[tool_router]
impl PaperSearchServer {
    pub fn new(engine: Arc<SearchEngine>, store: Arc<VectorStore>, default_top_k: usize) -> Self {
        Self {
            tool_router: Self::tool_router(),
            engine,
            store,
            default_top_k,
        }
    }

    #[tool(
        description = "Search the research paper corpus with both the base and fine-tuned embedding models. Returns one ranked list; each hit is labeled with the collection that produced it."
    )]
    async fn search_papers(
        &self,
        Parameters(params): Parameters<SearchRequest>,
    ) -> Result<CallToolResult, McpError> {
        let top_k = params.top_k.unwrap_or(self.default_top_k).min(MAX_TOP_K);
        let query = params.query;

        match self.engine.search(&query, top_k).await {
            Ok(results) => {
                let formatted_results = if results.is_empty() {
                    "No results found.".to_string()
                } else {
                    results
                        .iter()
                        .enumerate()
                        .map(|(i, hit)| {
                            let authors = hit
                                .authors
                                .as_ref()
                                .map(|a| format!("Authors: {a}\n"))
                                .unwrap_or_default();
                            format!(
                                "**Result {}** (Score: {:.4}) [{}] {} ({})\n{}{}\n",
                                i + 1,
                                hit.score,
                                source_tag(hit),
                                hit.title,
                                hit.id,
                                authors,
                                hit.snippet
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n---\n\n")
                };

                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Found {} results for '{}':\n\n{}",
                    results.len(),
                    query,
                    formatted_results
                ))]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Search error ({}): {e}",
                e.kind()
            ))])),
        }
    }

    #[tool(description = "Look up a single paper's metadata by id")]
    async fn get_paper(
        &self,
        Parameters(params): Parameters<GetPaperRequest>,
    ) -> Result<CallToolResult, McpError> {
        let paper = self
            .engine
            .paper_store()
            .get(&params.id)
            .ok_or_else(|| {
                McpError::resource_not_found(format!("Paper {} not found", params.id), None)
            })?;

        let response_text = serde_json::to_string_pretty(paper)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        Ok(CallToolResult::success(vec![Content::text(response_text)]))
    }

    #[tool(description = "Get corpus and collection statistics")]
    async fn corpus_stats(&self) -> Result<CallToolResult, McpError> {
        let stats = corpus_stats_json(&self.engine, &self.store);

        let stats_text = serde_json::to_string_pretty(&stats)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Corpus stats:\n{stats_text}"
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for PaperSearchServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "scholar-stream".to_string(),
                version: "0.1.0".to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Semantic search over a research paper corpus, comparing a base embedding model against a fine-tuned variant.".to_string(),
            ),
        }
    }
}

fn source_tag(hit: &SearchHit) -> &'static str {
    match hit.source {
        crate::search_engine::SourceLabel::Custom => "custom",
        crate::search_engine::SourceLabel::Base => "base",
    }
}

fn corpus_stats_json(engine: &SearchEngine, store: &VectorStore) -> serde_json::Value {
    let papers = engine.paper_store();
    serde_json::json!({
        "papers": papers.len(),
        "corpus_path": papers.source_path(),
        "corpus_fingerprint": papers.fingerprint(),
        "index": store.stats(),
        "generated_at": chrono::Utc::now().to_rfc3339(),
    })
}

/// Liveness probe handler - always returns 200 OK if process is alive
async fn healthz() -> axum::http::StatusCode {
    axum::http::StatusCode::OK
}

/// Readiness probe handler - returns 200 once the corpus is loaded
async fn readyz(
    axum::extract::State(app_state): axum::extract::State<AppState>,
) -> axum::http::StatusCode {
    if app_state.engine.paper_store().is_empty() {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    }
}

#[derive(Debug, serde::Deserialize)]
struct HttpSearchRequest {
    query: String,
    top_k: Option<usize>,
}

/// Query-string form used by `GET /api/search?q=...&top_k=...`.
#[derive(Debug, serde::Deserialize)]
struct HttpSearchQuery {
    q: String,
    top_k: Option<usize>,
}

#[derive(Debug, serde::Serialize)]
struct HttpSearchResponse {
    query: String,
    results: Vec<SearchHit>,
}

/// Shared application state for HTTP handlers
#[derive(Clone)]
struct AppState {
    engine: Arc<SearchEngine>,
    store: Arc<VectorStore>,
    default_top_k: usize,
}

/// Maps a core search error to an HTTP status plus a kind-tagged JSON body.
fn error_response(err: SearchError) -> (axum::http::StatusCode, axum::Json<serde_json::Value>) {
    let status = match err {
        SearchError::InvalidQuery { .. } => axum::http::StatusCode::BAD_REQUEST,
        SearchError::Encoding { .. } => axum::http::StatusCode::BAD_GATEWAY,
        SearchError::IndexUnavailable { .. } => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = axum::Json(serde_json::json!({
        "error": err.to_string(),
        "kind": err.kind(),
    }));
    (status, body)
}

async fn run_search(
    app_state: &AppState,
    query: String,
    top_k: Option<usize>,
) -> Result<axum::Json<HttpSearchResponse>, (axum::http::StatusCode, axum::Json<serde_json::Value>)>
{
    let top_k = top_k.unwrap_or(app_state.default_top_k).min(MAX_TOP_K);
    match app_state.engine.search(&query, top_k).await {
        Ok(results) => Ok(axum::Json(HttpSearchResponse { query, results })),
        Err(e) => {
            tracing::error!("Search error: {}", e);
            Err(error_response(e))
        }
    }
}

async fn http_search(
    axum::extract::State(app_state): axum::extract::State<AppState>,
    axum::extract::Json(request): axum::extract::Json<HttpSearchRequest>,
) -> Result<axum::Json<HttpSearchResponse>, (axum::http::StatusCode, axum::Json<serde_json::Value>)>
{
    run_search(&app_state, request.query, request.top_k).await
}

async fn http_search_get(
    axum::extract::State(app_state): axum::extract::State<AppState>,
    axum::extract::Query(request): axum::extract::Query<HttpSearchQuery>,
) -> Result<axum::Json<HttpSearchResponse>, (axum::http::StatusCode, axum::Json<serde_json::Value>)>
{
    run_search(&app_state, request.q, request.top_k).await
}

async fn http_stats(
    axum::extract::State(app_state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(corpus_stats_json(&app_state.engine, &app_state.store))
}

pub async fn start_server(
    engine: Arc<SearchEngine>,
    store: Arc<VectorStore>,
    default_top_k: usize,
) -> Result<()> {
    use rmcp::transport::streamable_http_server::{
        StreamableHttpService, session::local::LocalSessionManager,
    };

    let bind: SocketAddr = std::env::var("MCP_HTTP_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let endpoint_path = std::env::var("MCP_HTTP_ENDPOINT").unwrap_or_else(|_| "/mcp".to_string());

    tracing::info!(
        "Starting MCP Streamable HTTP server on http://{}{}",
        bind,
        endpoint_path
    );
    tracing::info!("Health endpoints: /healthz (liveness), /readyz (readiness)");

    let service = StreamableHttpService::new(
        {
            let engine = engine.clone();
            let store = store.clone();
            move || Ok(PaperSearchServer::new(engine.clone(), store.clone(), default_top_k))
        },
        LocalSessionManager::default().into(),
        Default::default(), // StreamableHttpServerConfig
    );

    let app_state = AppState {
        engine,
        store,
        default_top_k,
    };

    let router = axum::Router::new()
        .route("/healthz", axum::routing::get(healthz))
        .route("/readyz", axum::routing::get(readyz))
        .route("/search", axum::routing::post(http_search))
        .route("/api/search", axum::routing::get(http_search_get))
        .route("/stats", axum::routing::get(http_stats))
        .route(&endpoint_path, axum::routing::any_service(service))
        .with_state(app_state);

    tracing::info!(
        "HTTP endpoints: POST /search, GET /api/search?q=..., GET /stats"
    );

    let tcp_listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
