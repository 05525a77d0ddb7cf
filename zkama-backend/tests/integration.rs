use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};

use zkama_backend::{app_router, AppState, ReaperConfig};
use zkama_chain::mock::{MockAmaChain, ERR_DUPLICATE_NULLIFIER};
use zkama_chain::AmaChain;
use zkama_store::AmaStore;

const OWNER: &str = "0x90f8bf6a479f320ead074411a4b0e7944ea8c9c1";

fn test_app() -> (TestServer, Arc<MockAmaChain>, AmaStore) {
    let store = AmaStore::in_memory().expect("in-memory store");
    let chain = Arc::new(MockAmaChain::default());
    let state = AppState::new(store.clone(), chain.clone(), ReaperConfig::default());
    let server = TestServer::new(app_router(state)).expect("test server");
    (server, chain, store)
}

async fn create_session(server: &TestServer, name: &str, access_code: &str) -> i64 {
    let response = server
        .post("/api/session/create")
        .json(&json!({
            "name": name,
            "host": "Counselor",
            "desc": "A safe space to ask anything",
            "accessCode": access_code,
            "owner": OWNER,
        }))
        .await;
    response.assert_status_ok();
    response.json::<i64>()
}

async fn confirm_session(server: &TestServer, session_id: i64) {
    let response = server
        .post(&format!("/api/session/post/{session_id}"))
        .json(&json!({ "owner": OWNER }))
        .await;
    response.assert_status_ok();
}

async fn set_status(server: &TestServer, session_id: i64, command: &str) {
    let response = server
        .put(&format!("/api/session/status/{session_id}"))
        .json(&json!({ "command": command, "owner": OWNER }))
        .await;
    response.assert_status_ok();
}

fn proof_body(question_id: i64, nullifier_hash: &str) -> Value {
    json!({
        "questionId": question_id,
        "root": "12345",
        "nullifierHash": nullifier_hash,
        "externalNullifier": "67890",
        "solidityProof": ["1", "2", "3", "4", "5", "6", "7", "8"],
    })
}

#[tokio::test]
async fn session_invisible_until_confirmed() {
    let (server, _, _) = test_app();

    let session_id = create_session(&server, "Therapy Talk", "").await;

    let listing = server.get("/api/sessions").await.json::<Vec<Value>>();
    assert!(listing.is_empty());

    confirm_session(&server, session_id).await;

    let listing = server.get("/api/sessions").await.json::<Vec<Value>>();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0]["name"], "Therapy Talk");
    assert_eq!(listing[0]["session_id"], session_id);
    assert_eq!(listing[0]["req_access_code"], false);
}

#[tokio::test]
async fn confirm_is_owner_scoped() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;

    let response = server
        .post(&format!("/api/session/post/{session_id}"))
        .json(&json!({ "owner": "0x0000000000000000000000000000000000000bad" }))
        .await;
    response.assert_status_not_found();

    let listing = server.get("/api/sessions").await.json::<Vec<Value>>();
    assert!(listing.is_empty());
}

#[tokio::test]
async fn ended_session_leaves_public_listing() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;
    confirm_session(&server, session_id).await;
    set_status(&server, session_id, "start").await;

    assert_eq!(
        server.get("/api/sessions").await.json::<Vec<Value>>().len(),
        1
    );

    set_status(&server, session_id, "end").await;
    assert!(server
        .get("/api/sessions")
        .await
        .json::<Vec<Value>>()
        .is_empty());

    // owner still sees it
    let owned = server
        .get(&format!("/api/sessions/{OWNER}"))
        .await
        .json::<Vec<Value>>();
    assert_eq!(owned.len(), 1);
}

#[tokio::test]
async fn join_rejects_wrong_access_code_in_any_status() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Gated", "abc123").await;
    confirm_session(&server, session_id).await;

    let join = |code: &str| {
        let body = json!({
            "identityCommitment": "123456789",
            "accessCode": code,
        });
        let path = format!("/api/session/join/{session_id}");
        let server = &server;
        async move { server.post(&path).json(&body).await }
    };

    // not started: even the right code is refused
    join("abc123").await.assert_status_forbidden();

    set_status(&server, session_id, "start").await;
    join("wrong-code").await.assert_status_forbidden();

    set_status(&server, session_id, "pause").await;
    join("wrong-code").await.assert_status_forbidden();

    // the right code works while paused
    join("abc123").await.assert_status_ok();

    set_status(&server, session_id, "end").await;
    join("abc123").await.assert_status_forbidden();
}

#[tokio::test]
async fn join_registers_commitment_and_surfaces_reverts() {
    let (server, chain, _) = test_app();
    let session_id = create_session(&server, "Open", "").await;
    confirm_session(&server, session_id).await;
    set_status(&server, session_id, "start").await;

    let body = json!({ "identityCommitment": "424242" });
    let path = format!("/api/session/join/{session_id}");

    server.post(&path).json(&body).await.assert_status_ok();
    assert_eq!(
        chain.identity_commitments(session_id).await.unwrap().len(),
        1
    );

    // identity listing mirrors the chain
    let identities = server
        .get(&format!("/api/session/identity/{session_id}"))
        .await
        .json::<Vec<String>>();
    assert_eq!(identities, vec!["424242".to_string()]);

    // second join with the same commitment: the contract's revert reason
    // comes back verbatim
    let response = server.post(&path).json(&body).await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.json::<Value>();
    assert_eq!(body["error_code"], "CHAIN_REVERT");
    assert_eq!(body["error"], "AMA: identity commitment already registered");
}

#[tokio::test]
async fn question_id_is_allocated_before_posting_and_reused() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;
    confirm_session(&server, session_id).await;
    set_status(&server, session_id, "start").await;

    let response = server
        .post(&format!("/api/question/insert/{session_id}"))
        .json(&json!({ "content": "How do I start over?" }))
        .await;
    response.assert_status_ok();
    let question_id = response.json::<i64>();

    // provisional: not listed yet
    assert!(server
        .get(&format!("/api/questions/{session_id}"))
        .await
        .json::<Vec<Value>>()
        .is_empty());

    let response = server
        .post(&format!("/api/question/post/{session_id}"))
        .json(&proof_body(question_id, "111"))
        .await;
    response.assert_status_ok();

    let listed = server
        .get(&format!("/api/questions/{session_id}"))
        .await
        .json::<Vec<Value>>();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["question_id"], question_id);
    assert_eq!(listed[0]["content"], "How do I start over?");
    assert_eq!(listed[0]["votes"], 0);
}

#[tokio::test]
async fn failed_post_leaves_question_invisible() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;
    confirm_session(&server, session_id).await;

    let question_id = server
        .post(&format!("/api/question/insert/{session_id}"))
        .json(&json!({ "content": "orphan" }))
        .await
        .json::<i64>();

    // burn the nullifier with a first post, then replay it for a fresh row:
    // the chain rejects the second post and the row stays unposted
    server
        .post(&format!("/api/question/post/{session_id}"))
        .json(&proof_body(question_id, "777"))
        .await
        .assert_status_ok();

    let orphan_id = server
        .post(&format!("/api/question/insert/{session_id}"))
        .json(&json!({ "content": "never lands" }))
        .await
        .json::<i64>();

    let response = server
        .post(&format!("/api/question/post/{session_id}"))
        .json(&proof_body(orphan_id, "777"))
        .await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.json::<Value>()["error"], ERR_DUPLICATE_NULLIFIER);

    let listed = server
        .get(&format!("/api/questions/{session_id}"))
        .await
        .json::<Vec<Value>>();
    assert_eq!(listed.len(), 1);
    assert!(listed.iter().all(|q| q["question_id"] != orphan_id));
}

#[tokio::test]
async fn double_vote_accepts_exactly_one() {
    let (server, chain, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;
    confirm_session(&server, session_id).await;

    let question_id = server
        .post(&format!("/api/question/insert/{session_id}"))
        .json(&json!({ "content": "Am I doing ok?" }))
        .await
        .json::<i64>();
    server
        .post(&format!("/api/question/post/{session_id}"))
        .json(&proof_body(question_id, "1"))
        .await
        .assert_status_ok();

    // same derived identity, same question: both votes carry the same
    // nullifier hash, and only one may land
    let vote_path = format!("/api/question/vote/{session_id}");
    let body = proof_body(question_id, "2");
    let (first, second) = tokio::join!(
        async { server.post(&vote_path).json(&body).await },
        async { server.post(&vote_path).json(&body).await },
    );

    let statuses = [first.status_code(), second.status_code()];
    assert!(statuses.contains(&StatusCode::OK));
    assert!(statuses.contains(&StatusCode::INTERNAL_SERVER_ERROR));

    let rejected = if first.status_code() == StatusCode::OK {
        second
    } else {
        first
    };
    assert_eq!(rejected.json::<Value>()["error"], ERR_DUPLICATE_NULLIFIER);

    assert_eq!(chain.votes(question_id), 1);
    let listed = server
        .get(&format!("/api/questions/{session_id}"))
        .await
        .json::<Vec<Value>>();
    assert_eq!(listed[0]["votes"], 1);
}

#[tokio::test]
async fn votes_adopt_the_event_count() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;
    confirm_session(&server, session_id).await;

    let question_id = server
        .post(&format!("/api/question/insert/{session_id}"))
        .json(&json!({ "content": "popular question" }))
        .await
        .json::<i64>();
    server
        .post(&format!("/api/question/post/{session_id}"))
        .json(&proof_body(question_id, "10"))
        .await
        .assert_status_ok();

    for nullifier in ["11", "12", "13"] {
        let response = server
            .post(&format!("/api/question/vote/{session_id}"))
            .json(&proof_body(question_id, nullifier))
            .await;
        response.assert_status_ok();
    }

    let listed = server
        .get(&format!("/api/questions/{session_id}"))
        .await
        .json::<Vec<Value>>();
    assert_eq!(listed[0]["votes"], 3);
}

#[tokio::test]
async fn fee_endpoint_reports_the_contract_fee() {
    let (server, _, _) = test_app();
    let fee = server.get("/api/session/fee").await.json::<String>();
    assert_eq!(fee, "1000000000000000000");
}

#[tokio::test]
async fn invalid_payloads_are_bad_requests() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;
    confirm_session(&server, session_id).await;
    set_status(&server, session_id, "start").await;

    // malformed uint256
    let response = server
        .post(&format!("/api/session/join/{session_id}"))
        .json(&json!({ "identityCommitment": "not-a-number" }))
        .await;
    response.assert_status_bad_request();

    // unknown status command
    let response = server
        .put(&format!("/api/session/status/{session_id}"))
        .json(&json!({ "command": "restart", "owner": OWNER }))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn session_detail_and_missing_session() {
    let (server, _, _) = test_app();
    let session_id = create_session(&server, "Therapy Talk", "").await;

    let detail = server
        .get(&format!("/api/session/{session_id}"))
        .await
        .json::<Value>();
    assert_eq!(detail["name"], "Therapy Talk");
    assert_eq!(detail["owner"], OWNER);

    server
        .get("/api/session/999999")
        .await
        .assert_status_not_found();
}
