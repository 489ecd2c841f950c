#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::{test, web, App};
use async_trait::async_trait;
use serde_json::{json, Value};

use cinechat::docstore::inmem::InMemDocStore;
use cinechat::docstore::{CollectionPath, DocumentStore, FieldOp, Precondition, WriteBatch};
use cinechat::guest::{GuestId, GuestSession};
use cinechat::models::{CommentsWithReplies, LikeStatus, LikeToggle, ReconcileReport};
use cinechat::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use cinechat::repo::RepoResult;
use cinechat::{config, AppState, CommentRepo, DocCommentRepo, RepoError};

const ALICE: &str = "guest_1718000000000_alice0000";
const BOB: &str = "guest_1718000000001_bob000000";

fn state(rate_limiter: Option<RateLimiterFacade>, max_text_len: usize) -> AppState {
    let store = InMemDocStore::new();
    AppState { repo: Arc::new(DocCommentRepo::new(Arc::new(store))), rate_limiter, max_text_len }
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(App::new().app_data(web::Data::new($state)).configure(config)).await
    };
}

#[actix_web::test]
async fn comment_reply_like_flow() {
    let app = app!(state(None, 2000));

    // guest session
    let req = test::TestRequest::post().uri("/api/v1/guest-sessions").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let session: Value = test::read_body_json(resp).await;
    assert!(session["userId"].as_str().unwrap().starts_with("guest_"));
    assert!(!session["displayName"].as_str().unwrap().is_empty());

    // empty listing
    let req = test::TestRequest::get().uri("/api/v1/movies/603/comments").to_request();
    let listing: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listing["comments"].as_array().unwrap().len(), 0);
    assert!(listing.get("likeStatus").is_none());

    // comment, text trimmed
    let req = test::TestRequest::post()
        .uri("/api/v1/movies/603/comments")
        .set_json(json!({"userId": ALICE, "userName": "neoherobeta7", "text": "  Loved it  "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let created: Value = test::read_body_json(resp).await;
    let comment_id = created["id"].as_str().unwrap().to_string();

    // reply
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/comments/{comment_id}/replies"))
        .set_json(json!({"userId": BOB, "userName": "metakingpro1", "movieId": "603", "text": "Same"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let reply_id = test::read_body_json::<Value, _>(resp).await["id"].as_str().unwrap().to_string();

    // likes
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/comments/{comment_id}/like"))
        .set_json(json!({"userId": BOB}))
        .to_request();
    let toggle: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(toggle, json!({"likes": 1, "liked": true}));

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/comments/{comment_id}/replies/{reply_id}/like"))
        .set_json(json!({"userId": ALICE}))
        .to_request();
    let toggle: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(toggle, json!({"likes": 1, "liked": true}));

    // listing with the viewer's like status folded in
    let req = test::TestRequest::get().uri(&format!("/api/v1/movies/603/comments?userId={BOB}")).to_request();
    let listing: Value = test::call_and_read_body_json(&app, req).await;
    let comment = &listing["comments"][0];
    assert_eq!(comment["userComment"], "Loved it");
    assert_eq!(comment["likes"], 1);
    assert_eq!(comment["replies"], 1);
    assert_eq!(listing["repliesByCommentId"][&comment_id][0]["id"], reply_id.as_str());
    assert_eq!(listing["likeStatus"]["commentLikes"][&comment_id], true);
    assert_eq!(listing["likeStatus"]["replyLikes"][&reply_id], false);

    // standalone like status
    let req = test::TestRequest::get().uri(&format!("/api/v1/movies/603/likes?userId={ALICE}")).to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["commentLikes"][&comment_id], false);
    assert_eq!(status["replyLikes"][&reply_id], true);
}

#[actix_web::test]
async fn invalid_input_is_rejected_with_400() {
    let app = app!(state(None, 10));

    let cases = [
        json!({"userId": ALICE, "userName": "n", "text": "   "}),
        json!({"userId": ALICE, "userName": "n", "text": "far more than ten characters"}),
        json!({"userId": "not a guest id", "userName": "n", "text": "hi"}),
        json!({"userId": ALICE, "userName": "  ", "text": "hi"}),
        json!({"userId": ALICE}),
    ];
    for body in cases {
        let req = test::TestRequest::post().uri("/api/v1/movies/603/comments").set_json(&body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "body {body}");
        let err: Value = test::read_body_json(resp).await;
        assert!(err["error"].is_string());
    }

    let req = test::TestRequest::get().uri("/api/v1/movies/603/likes").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
    let req = test::TestRequest::get().uri("/api/v1/movies/603/comments?userId=bad%20id").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_web::test]
async fn missing_targets_are_404() {
    let app = app!(state(None, 2000));

    let req = test::TestRequest::post()
        .uri("/api/v1/comments/nope/like")
        .set_json(json!({"userId": ALICE}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["error"], "not found");

    let req = test::TestRequest::post()
        .uri("/api/v1/comments/nope/replies/r1/like")
        .set_json(json!({"userId": ALICE}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/comments/nope/replies")
        .set_json(json!({"userId": ALICE, "userName": "n", "movieId": "603", "text": "hi"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    // nothing was written
    let req = test::TestRequest::get().uri("/api/v1/movies/603/comments").to_request();
    let listing: Value = test::call_and_read_body_json(&app, req).await;
    assert!(listing["comments"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn per_guest_rate_limit_answers_429() {
    let cfg = RateLimitConfig { comment_limit: 1, like_limit: 2, ..RateLimitConfig::default() };
    let limiter = RateLimiterFacade::new(InMemoryRateLimiter::new(true), cfg);
    let app = app!(state(Some(limiter), 2000));

    let post = |user: &str| {
        test::TestRequest::post()
            .uri("/api/v1/movies/603/comments")
            .set_json(json!({"userId": user, "userName": "n", "text": "hi"}))
            .to_request()
    };
    let resp = test::call_service(&app, post(ALICE)).await;
    assert_eq!(resp.status(), 201, "first comment allowed");
    let comment_id = test::read_body_json::<Value, _>(resp).await["id"].as_str().unwrap().to_string();

    let resp = test::call_service(&app, post(ALICE)).await;
    assert_eq!(resp.status(), 429, "second comment should be rate limited");
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["error"], "rate limited");

    // other guests have their own budget
    assert_eq!(test::call_service(&app, post(BOB)).await.status(), 201);

    let like = || {
        test::TestRequest::post()
            .uri(&format!("/api/v1/comments/{comment_id}/like"))
            .set_json(json!({"userId": BOB}))
            .to_request()
    };
    assert_eq!(test::call_service(&app, like()).await.status(), 200);
    assert_eq!(test::call_service(&app, like()).await.status(), 200);
    assert_eq!(test::call_service(&app, like()).await.status(), 429);
}

#[actix_web::test]
async fn reply_rate_limit_answers_429() {
    let cfg = RateLimitConfig { reply_limit: 1, ..RateLimitConfig::default() };
    let limiter = RateLimiterFacade::new(InMemoryRateLimiter::new(true), cfg);
    let app = app!(state(Some(limiter), 2000));

    let req = test::TestRequest::post()
        .uri("/api/v1/movies/603/comments")
        .set_json(json!({"userId": ALICE, "userName": "n", "text": "parent"}))
        .to_request();
    let comment_id = test::call_and_read_body_json::<_, _, Value>(&app, req).await["id"].as_str().unwrap().to_string();

    let reply = |user: &str| {
        test::TestRequest::post()
            .uri(&format!("/api/v1/comments/{comment_id}/replies"))
            .set_json(json!({"userId": user, "userName": "n", "movieId": "603", "text": "hi"}))
            .to_request()
    };
    assert_eq!(test::call_service(&app, reply(BOB)).await.status(), 201);
    let resp = test::call_service(&app, reply(BOB)).await;
    assert_eq!(resp.status(), 429);
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["error"], "rate limited");
    assert_eq!(test::call_service(&app, reply(ALICE)).await.status(), 201);
}

/// Every toggle loses its race.
struct ContendedRepo;

#[async_trait]
impl CommentRepo for ContendedRepo {
    async fn add_comment(&self, _: &GuestSession, _: &str, _: &str) -> RepoResult<String> {
        Ok("c1".into())
    }
    async fn add_reply(&self, _: &str, _: &GuestSession, _: &str, _: &str) -> RepoResult<String> {
        Ok("r1".into())
    }
    async fn toggle_comment_like(&self, comment_id: &str, _: &GuestId) -> RepoResult<LikeToggle> {
        Err(RepoError::Contention(format!("comments/{comment_id}")))
    }
    async fn toggle_reply_like(&self, comment_id: &str, reply_id: &str, _: &GuestId) -> RepoResult<LikeToggle> {
        Err(RepoError::Contention(format!("comments/{comment_id}/replies/{reply_id}")))
    }
    async fn get_comments_with_replies(&self, _: &str) -> RepoResult<CommentsWithReplies> {
        Ok(CommentsWithReplies::default())
    }
    async fn get_user_like_status(&self, _: &str, _: &GuestId) -> RepoResult<LikeStatus> {
        Ok(LikeStatus::default())
    }
    async fn reconcile_counts(&self, movie_id: &str) -> RepoResult<ReconcileReport> {
        Err(RepoError::Contention(movie_id.to_string()))
    }
}

#[actix_web::test]
async fn exhausted_toggle_retries_answer_409() {
    let app = app!(AppState { repo: Arc::new(ContendedRepo), rate_limiter: None, max_text_len: 2000 });

    for uri in [
        "/api/v1/comments/c1/like",
        "/api/v1/comments/c1/replies/r1/like",
    ] {
        let req = test::TestRequest::post().uri(uri).set_json(json!({"userId": ALICE})).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 409, "{uri}");
        let err: Value = test::read_body_json(resp).await;
        assert_eq!(err["error"], "conflict, try again");
    }

    let req = test::TestRequest::post().uri("/api/v1/movies/603/reconcile").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);
}

#[actix_web::test]
async fn reconcile_route_repairs_negative_likes() {
    let store = InMemDocStore::new();
    let repo = DocCommentRepo::new(Arc::new(store.clone()));
    let author = GuestSession::new(GuestId::try_from(ALICE).unwrap(), "n");
    let cid = repo.add_comment(&author, "603", "raced").await.unwrap();
    let path = CollectionPath::root("comments").doc(&cid);
    store
        .commit(WriteBatch::new().update(path.clone(), Precondition::Exists, vec![FieldOp::set("likes", -1)]))
        .await
        .unwrap();
    let app = app!(AppState { repo: Arc::new(repo), rate_limiter: None, max_text_len: 2000 });

    // still listed while drifted
    let req = test::TestRequest::get().uri("/api/v1/movies/603/comments").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let listing: Value = test::read_body_json(resp).await;
    assert_eq!(listing["comments"][0]["likes"], 0);

    let req = test::TestRequest::post().uri("/api/v1/movies/603/reconcile").to_request();
    let report: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(report["commentsChecked"], 1);
    assert_eq!(report["commentsFixed"], 1);
    assert_eq!(store.get(&path).await.unwrap().unwrap().int_field("likes"), 0);

    let req = test::TestRequest::post().uri("/api/v1/movies/603/reconcile").to_request();
    let again: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(again["commentsFixed"], 0);
}

#[actix_web::test]
async fn healthz_is_ok() {
    let app = app!(state(None, 2000));
    let req = test::TestRequest::get().uri("/healthz").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
}
