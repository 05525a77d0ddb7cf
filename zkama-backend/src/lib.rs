//! zkama-backend
//!
//! HTTP API for the zkama anonymous AMA platform. Handlers are thin: they
//! write provisional rows to the relational cache, relay proof-carrying
//! transactions to the AMA contract, and flip visibility flags once the chain
//! confirms. Anything a handler needs rides in [`AppState`]; there is no
//! process-global request state.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use zkama_chain::{parse_u256, AmaChain, ChainError, SignalCall, U256};
use zkama_common::{access_code_hash, unix_time_secs, QuestionId, SessionId, StatusCommand};
use zkama_proof::Signal;
use zkama_store::{AmaStore, NewSession, StoreError};

pub const DB_PATH_ENV: &str = "ZKAMA_DB_PATH";
pub const DEFAULT_DB_PATH: &str = "data/zkama.db";
const REAPER_INTERVAL_ENV: &str = "ZKAMA_REAPER_INTERVAL_SECS";
const ORPHAN_TTL_ENV: &str = "ZKAMA_ORPHAN_TTL_SECS";
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_ORPHAN_TTL_SECS: u64 = 24 * 60 * 60;

const CODE_CHAIN_REVERT: &str = "CHAIN_REVERT";
const CODE_CHAIN_RPC: &str = "CHAIN_RPC_ERROR";
const CODE_STORE: &str = "STORE_ERROR";
const CODE_ACCESS_DENIED: &str = "ACCESS_DENIED";
const CODE_SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
const CODE_QUESTION_NOT_FOUND: &str = "QUESTION_NOT_FOUND";
const CODE_INVALID_REQUEST: &str = "INVALID_REQUEST";

const ACCESS_DENIED_MSG: &str =
    "Invalid access code. Please obtain the access code from the session host.";

/// Cadence of the orphan-reaper reconciliation task.
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    pub ttl_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            ttl_secs: DEFAULT_ORPHAN_TTL_SECS,
        }
    }
}

impl ReaperConfig {
    pub fn from_env() -> Self {
        Self {
            interval_secs: parse_env_u64(REAPER_INTERVAL_ENV)
                .unwrap_or(DEFAULT_REAPER_INTERVAL_SECS),
            ttl_secs: parse_env_u64(ORPHAN_TTL_ENV).unwrap_or(DEFAULT_ORPHAN_TTL_SECS),
        }
    }
}

fn parse_env_u64(var: &str) -> Option<u64> {
    env::var(var).ok().and_then(|value| value.parse().ok())
}

/// Request-scoped context handed to every handler.
#[derive(Clone)]
pub struct AppState {
    store: AmaStore,
    chain: Arc<dyn AmaChain>,
    reaper: ReaperConfig,
}

impl AppState {
    pub fn new(store: AmaStore, chain: Arc<dyn AmaChain>, reaper: ReaperConfig) -> Self {
        Self {
            store,
            chain,
            reaper,
        }
    }

    pub fn store(&self) -> &AmaStore {
        &self.store
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, CODE_INVALID_REQUEST, message)
    }

    fn session_not_found(session_id: SessionId) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            CODE_SESSION_NOT_FOUND,
            format!("session {} not found", session_id),
        )
    }

    fn question_not_found(question_id: QuestionId) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            CODE_QUESTION_NOT_FOUND,
            format!("question {} not found", question_id),
        )
    }

    fn access_denied() -> Self {
        Self::new(StatusCode::FORBIDDEN, CODE_ACCESS_DENIED, ACCESS_DENIED_MSG)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        // The underlying failure is logged; callers get a generic message.
        warn!(error = %err, "relational cache failure");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            CODE_STORE,
            "session cache unavailable",
        )
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        match err {
            // Contract revert reasons go to the caller verbatim.
            ChainError::Revert(reason) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_CHAIN_REVERT, reason)
            }
            ChainError::Rpc(message) => {
                warn!(error = %message, "chain rpc failure");
                Self::new(StatusCode::BAD_GATEWAY, CODE_CHAIN_RPC, message)
            }
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                CODE_CHAIN_RPC,
                other.to_string(),
            ),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            error_code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // sessions
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:owner", get(list_owner_sessions))
        .route("/api/session/create", post(create_session))
        .route("/api/session/fee", get(get_fee))
        .route("/api/session/:session_id", get(get_session))
        .route("/api/session/post/:session_id", post(confirm_session))
        .route("/api/session/status/:session_id", put(update_status))
        .route("/api/session/join/:session_id", post(join_session))
        .route(
            "/api/session/identity/:session_id",
            get(identity_commitments),
        )
        // questions
        .route("/api/questions/:session_id", get(list_questions))
        .route("/api/question/insert/:session_id", post(insert_question))
        .route("/api/question/post/:session_id", post(post_question))
        .route("/api/question/vote/:session_id", post(vote_question))
        .layer(cors)
        .with_state(state)
}

/// Periodic reconciliation: provisional rows whose on-chain confirmation
/// never arrived are deleted once they outlive the TTL, so orphans do not
/// accumulate forever.
pub fn spawn_orphan_reaper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.reaper.interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let cutoff = unix_time_secs() - state.reaper.ttl_secs as i64;
            match state.store.reap_orphans(cutoff) {
                Ok((0, 0)) => debug!("no orphaned provisional rows to reap"),
                Ok((sessions, questions)) => {
                    info!(sessions, questions, "reaped orphaned provisional rows")
                }
                Err(err) => warn!(error = %err, "orphan reap failed"),
            }
        }
    })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    name: String,
    host: String,
    desc: String,
    #[serde(default)]
    access_code: Option<String>,
    owner: String,
}

/// Provisional write: the returned id is what the owner's wallet passes to
/// `createAmaSession`, and the row stays invisible until the confirm call.
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionId>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("session name must not be empty"));
    }
    if req.owner.trim().is_empty() {
        return Err(ApiError::bad_request("owner address must not be empty"));
    }

    let session_id = state.store.create_session(&NewSession {
        name: req.name,
        hosts: req.host,
        description: req.desc,
        owner: req.owner,
        access_code_hash: req
            .access_code
            .as_deref()
            .and_then(access_code_hash),
    })?;

    debug!(session_id, "created provisional session");
    Ok(Json(session_id))
}

async fn get_fee(State(state): State<AppState>) -> Result<Json<String>, ApiError> {
    let fee = state.chain.fee().await?;
    Ok(Json(fee.to_string()))
}

async fn get_session(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
) -> Result<Json<zkama_store::OwnedSession>, ApiError> {
    state
        .store
        .session(session_id)?
        .map(Json)
        .ok_or_else(|| ApiError::session_not_found(session_id))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmSessionRequest {
    owner: String,
}

/// Confirm half of the reconciler: flips the posted flag after the owner's
/// `createAmaSession` transaction succeeded.
async fn confirm_session(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
    Json(req): Json<ConfirmSessionRequest>,
) -> Result<StatusCode, ApiError> {
    if state.store.confirm_session_posted(session_id, &req.owner)? {
        info!(session_id, "session confirmed posted");
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::session_not_found(session_id))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdateRequest {
    command: String,
    owner: String,
}

/// Cache mirror of an owner's on-chain status transition.
async fn update_status(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<StatusCode, ApiError> {
    let command = StatusCommand::parse(&req.command)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let status = command.target_status();

    if state
        .store
        .set_session_status(session_id, &req.owner, status)?
    {
        info!(session_id, status = status.name(), "session status updated");
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::session_not_found(session_id))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinSessionRequest {
    identity_commitment: String,
    #[serde(default)]
    access_code: Option<String>,
}

#[derive(Serialize)]
struct TxResponse {
    tx_hash: String,
}

/// Access gate plus on-chain group registration. The access check happens in
/// the relational layer; only then does the service relay `joinAmaSession`.
async fn join_session(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<Json<TxResponse>, ApiError> {
    let code_hash = req.access_code.as_deref().and_then(access_code_hash);
    if !state
        .store
        .check_join_access(session_id, code_hash.as_deref())?
    {
        return Err(ApiError::access_denied());
    }

    let commitment = parse_u256_field(&req.identity_commitment, "identityCommitment")?;
    let tx_hash = state.chain.join_session(session_id, commitment).await?;
    info!(session_id, "identity joined session group");
    Ok(Json(TxResponse { tx_hash }))
}

async fn identity_commitments(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
) -> Result<Json<Vec<String>>, ApiError> {
    let commitments = state.chain.identity_commitments(session_id).await?;
    Ok(Json(
        commitments.iter().map(|commitment| commitment.to_string()).collect(),
    ))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<zkama_store::PublicSession>>, ApiError> {
    Ok(Json(state.store.list_public_sessions()?))
}

async fn list_owner_sessions(
    State(state): State<AppState>,
    AxumPath(owner): AxumPath<String>,
) -> Result<Json<Vec<zkama_store::OwnedSession>>, ApiError> {
    Ok(Json(state.store.list_owner_sessions(&owner)?))
}

async fn list_questions(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
) -> Result<Json<Vec<zkama_store::QuestionRow>>, ApiError> {
    Ok(Json(state.store.list_questions(session_id)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertQuestionRequest {
    content: String,
}

/// Provisional write for a question. The id must exist before the proof can
/// be generated: it seeds the action nullifier.
async fn insert_question(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
    Json(req): Json<InsertQuestionRequest>,
) -> Result<Json<QuestionId>, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("question content must not be empty"));
    }
    let question_id = state.store.insert_question(session_id, &req.content)?;
    debug!(session_id, question_id, "created provisional question");
    Ok(Json(question_id))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProofSubmission {
    question_id: QuestionId,
    root: String,
    nullifier_hash: String,
    external_nullifier: String,
    solidity_proof: [String; 8],
}

impl ProofSubmission {
    fn into_call(self, session_id: SessionId, signal: Signal) -> Result<SignalCall, ApiError> {
        let mut proof = [U256::zero(); 8];
        for (slot, value) in proof.iter_mut().zip(&self.solidity_proof) {
            *slot = parse_u256_field(value, "solidityProof")?;
        }
        Ok(SignalCall {
            session_id,
            question_id: self.question_id,
            signal,
            root: parse_u256_field(&self.root, "root")?,
            nullifier_hash: parse_u256_field(&self.nullifier_hash, "nullifierHash")?,
            external_nullifier: parse_u256_field(&self.external_nullifier, "externalNullifier")?,
            proof,
        })
    }
}

/// Reconciler, question flavor: relay `postQuestion` and only then flip the
/// question's posted flag. A revert leaves the provisional row unposted for
/// the reaper.
async fn post_question(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
    Json(req): Json<ProofSubmission>,
) -> Result<Json<TxResponse>, ApiError> {
    let question_id = req.question_id;
    let call = req.into_call(session_id, Signal::Post)?;
    let tx_hash = state.chain.post_question(&call).await?;

    if !state.store.confirm_question_posted(question_id)? {
        return Err(ApiError::question_not_found(question_id));
    }
    info!(session_id, question_id, "question posted on-chain");
    Ok(Json(TxResponse { tx_hash }))
}

#[derive(Serialize)]
struct VoteResponse {
    tx_hash: String,
    question_id: QuestionId,
    votes: i64,
}

/// Vote relay: the cache adopts the count decoded from the `QuestionVoted`
/// event rather than incrementing locally.
async fn vote_question(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<SessionId>,
    Json(req): Json<ProofSubmission>,
) -> Result<Json<VoteResponse>, ApiError> {
    let call = req.into_call(session_id, Signal::Vote)?;
    let receipt = state.chain.vote_question(&call).await?;

    state
        .store
        .set_question_votes(receipt.question_id, receipt.votes)?;
    info!(
        session_id,
        question_id = receipt.question_id,
        votes = receipt.votes,
        "vote recorded"
    );
    Ok(Json(VoteResponse {
        tx_hash: receipt.tx_hash,
        question_id: receipt.question_id,
        votes: receipt.votes,
    }))
}

fn parse_u256_field(value: &str, field: &str) -> Result<U256, ApiError> {
    parse_u256(value)
        .map_err(|_| ApiError::bad_request(format!("{} is not a valid uint256", field)))
}
