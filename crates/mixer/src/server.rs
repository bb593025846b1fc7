use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::info;

use mixer_sdk::api::{
    ClaimRequest, ClaimResponse, CompletionProofResponse, ConfirmDepositRequest, CreateMixRequest,
    DisputeResponse, HealthResponse, InfoResponse, ListRequestsResponse, MixRequestView,
    StatsResponse,
};

use crate::config::MixerConfig;
use crate::error::MixerError;
use crate::model::RequestStatus;
use crate::service::MixerService;

pub const ACCOUNT_HEADER: &str = "x-account-id";
const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct MixerState {
    pub config: MixerConfig,
    pub service: Arc<MixerService>,
}

type ApiResult<T> = Result<T, MixerError>;

/// Routes without the rate limiter, which needs the peer address.
pub fn router(state: Arc<MixerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(get_info))
        .route("/stats", get(get_stats))
        .route("/request", post(create_request))
        .route("/requests", get(list_requests))
        .route("/request/:id", get(get_request))
        .route("/request/:id/deposit", post(confirm_deposit))
        .route("/request/:id/resume", post(resume_request))
        .route("/request/:id/dispute", post(dispute_request))
        .route("/request/:id/claim", post(claim_request))
        .route("/request/:id/proof", get(get_proof))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn run(state: Arc<MixerState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    // 10 requests per second per IP
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(10)
        .burst_size(20)
        .key_extractor(tower_governor::key_extractor::SmartIpKeyExtractor)
        .finish()
        .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?;

    let app = router(state.clone())
        .layer(GovernorLayer {
            config: Arc::new(governor_conf),
        })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Mixer listening on {} (rate limited: 10 req/s per IP)", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn account_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MixerError::AccountNotFound(format!("missing {} header", ACCOUNT_HEADER)))
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_info(State(state): State<Arc<MixerState>>) -> Json<InfoResponse> {
    Json(state.service.info())
}

async fn get_stats(State(state): State<Arc<MixerState>>) -> ApiResult<Json<StatsResponse>> {
    Ok(Json(state.service.stats().await?))
}

async fn create_request(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Json(body): Json<CreateMixRequest>,
) -> ApiResult<(StatusCode, Json<MixRequestView>)> {
    let account = account_id(&headers)?;
    let request = state.service.create_mix_request(&account, body).await?;
    Ok((StatusCode::CREATED, Json(request.to_view())))
}

async fn list_requests(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ListRequestsResponse>> {
    let account = account_id(&headers)?;
    let page = state
        .service
        .list_requests(&account, params.offset, params.limit)
        .await?;
    Ok(Json(page))
}

async fn get_request(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<MixRequestView>> {
    let account = account_id(&headers)?;
    Ok(Json(state.service.get_request(&account, &id).await?.to_view()))
}

async fn confirm_deposit(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ConfirmDepositRequest>,
) -> ApiResult<Json<MixRequestView>> {
    let account = account_id(&headers)?;
    let request = state.service.confirm_deposit(&account, &id, body.tx_refs).await?;
    Ok(Json(request.to_view()))
}

async fn resume_request(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<MixRequestView>> {
    let account = account_id(&headers)?;
    Ok(Json(state.service.resume_request(&account, &id).await?.to_view()))
}

async fn dispute_request(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DisputeResponse>> {
    let account = account_id(&headers)?;
    let dispute = state.service.dispute_request(&account, &id).await?;
    Ok(Json(DisputeResponse {
        request_id: dispute.request_id,
        status: RequestStatus::Disputed,
        submission_tx: dispute.submission_tx.unwrap_or_default(),
        resolution_deadline: dispute.resolution_deadline,
    }))
}

async fn claim_request(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> ApiResult<Json<ClaimResponse>> {
    let account = account_id(&headers)?;
    let claim = state
        .service
        .create_withdrawal_claim(&account, &id, &body.claim_address)
        .await?;
    Ok(Json(ClaimResponse {
        claim_id: claim.id,
        request_id: claim.request_id,
        amount: claim.amount,
        claim_address: claim.claim_address,
        claimable_at: claim.claimable_at,
        status: RequestStatus::Withdrawable,
    }))
}

async fn get_proof(
    State(state): State<Arc<MixerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<CompletionProofResponse>> {
    let account = account_id(&headers)?;
    Ok(Json(state.service.get_completion_proof(&account, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::testing::{Harness, ACCOUNT};

    fn app(h: &Harness) -> Router {
        router(Arc::new(MixerState {
            config: h.config.clone(),
            service: h.service.clone(),
        }))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, account: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(account) = account {
            builder = builder.header(ACCOUNT_HEADER, account);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str, account: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(account) = account {
            builder = builder.header(ACCOUNT_HEADER, account);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new().await;
        let response = app(&h).oneshot(get_req("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_and_fetch_request() {
        let h = Harness::new().await;
        let body = serde_json::json!({
            "amount": "1000",
            "targets": [{"address": "target-a", "amount": "995"}],
            "mix_duration": "30m"
        });
        let response = app(&h)
            .oneshot(post_json("/request", Some(ACCOUNT), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["status"], "pending");
        assert_eq!(created["total_amount"], "1000");
        assert_eq!(created["service_fee"], "5");

        let id = created["id"].as_str().unwrap();
        let response = app(&h)
            .oneshot(get_req(&format!("/request/{}", id), Some(ACCOUNT)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["id"], id);

        let response = app(&h)
            .oneshot(get_req(&format!("/request/{}", id), Some("intruder")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_account_header() {
        let h = Harness::new().await;
        let body = serde_json::json!({"amount": "1000", "targets": []});
        let response = app(&h).oneshot(post_json("/request", None, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_mismatch_is_bad_request() {
        let h = Harness::new().await;
        let body = serde_json::json!({
            "amount": "1000",
            "targets": [{"address": "a", "amount": "600"}, {"address": "b", "amount": "400"}]
        });
        let response = app(&h)
            .oneshot(post_json("/request", Some(ACCOUNT), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unconfirmed_deposit_is_unprocessable() {
        let h = Harness::new().await;
        let request = h
            .service
            .create_mix_request(ACCOUNT, crate::testing::create_body("1000", &[("a", "995")]))
            .await
            .unwrap();
        let response = app(&h)
            .oneshot(post_json(
                &format!("/request/{}/deposit", request.id),
                Some(ACCOUNT),
                serde_json::json!({"tx_refs": ["nowhere"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_early_claim_conflicts() {
        let h = Harness::new().await;
        let request = h.mixing_request("1000", &[("a", "995")]).await;
        let response = app(&h)
            .oneshot(post_json(
                &format!("/request/{}/claim", request.id),
                Some(ACCOUNT),
                serde_json::json!({"claim_address": "refund-addr"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let h = Harness::new().await;
        h.mixing_request("1000", &[("a", "995")]).await;

        let response = app(&h)
            .oneshot(get_req("/requests?limit=5000", Some(ACCOUNT)))
            .await
            .unwrap();
        let page = json_body(response).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["limit"], 1000);

        let response = app(&h).oneshot(get_req("/stats", None)).await.unwrap();
        let stats = json_body(response).await;
        assert_eq!(stats["total_requests"], 1);
        assert_eq!(stats["by_status"]["mixing"], 1);
        assert_eq!(stats["total_volume"], "1000");
    }
}
