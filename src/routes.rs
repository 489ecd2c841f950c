use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::error::ApiError;
use crate::guest::{GuestId, GuestSession};
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::CommentRepo;

pub const MAX_DISPLAY_NAME_LEN: usize = 64;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            // malformed bodies and query strings answer with the JSON error body
            .app_data(web::JsonConfig::default().error_handler(|err, _| ApiError::BadRequest(err.to_string()).into()))
            .app_data(web::QueryConfig::default().error_handler(|err, _| ApiError::BadRequest(err.to_string()).into()))
            .service(web::resource("/guest-sessions").route(web::post().to(mint_guest_session)))
            .service(
                web::resource("/movies/{movie_id}/comments")
                    .route(web::get().to(list_comments))
                    .route(web::post().to(create_comment)),
            )
            .service(web::resource("/movies/{movie_id}/likes").route(web::get().to(get_like_status)))
            .service(web::resource("/movies/{movie_id}/reconcile").route(web::post().to(reconcile_counts)))
            .service(web::resource("/comments/{comment_id}/replies").route(web::post().to(create_reply)))
            .service(web::resource("/comments/{comment_id}/like").route(web::post().to(toggle_comment_like)))
            .service(
                web::resource("/comments/{comment_id}/replies/{reply_id}/like")
                    .route(web::post().to(toggle_reply_like)),
            ),
    );
    cfg.route("/healthz", web::get().to(healthz));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn CommentRepo>,
    pub rate_limiter: Option<RateLimiterFacade>,
    pub max_text_len: usize,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ViewerQuery {
    /// Guest whose like status is folded into the listing.
    #[param(value_type = Option<String>)]
    pub user_id: Option<GuestId>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct LikeStatusQuery {
    #[param(value_type = String)]
    pub user_id: GuestId,
}

fn validated_text(raw: &str, max_len: usize) -> Result<String, ApiError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ApiError::BadRequest("text must not be blank".into()));
    }
    if text.chars().count() > max_len {
        return Err(ApiError::BadRequest(format!("text exceeds {max_len} characters")));
    }
    Ok(text.to_string())
}

fn validated_author(user_id: GuestId, user_name: &str) -> Result<GuestSession, ApiError> {
    let name = user_name.trim();
    if name.is_empty() || name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "userName must be 1-{MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    Ok(GuestSession::new(user_id, name))
}

fn rate_guard(data: &AppState, allow: impl FnOnce(&RateLimiterFacade) -> bool) -> Result<(), ApiError> {
    match &data.rate_limiter {
        Some(limiter) if !allow(limiter) => Err(ApiError::RateLimited),
        _ => Ok(()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/guest-sessions",
    tag = "guests",
    responses(
        (status = 201, description = "Fresh guest identity", body = GuestSession)
    )
)]
pub async fn mint_guest_session() -> HttpResponse {
    let session = GuestSession::mint(&mut rand::thread_rng());
    HttpResponse::Created().json(session)
}

#[utoipa::path(
    get,
    path = "/api/v1/movies/{movie_id}/comments",
    tag = "comments",
    params(("movie_id" = String, Path, description = "Movie id"), ViewerQuery),
    responses(
        (status = 200, description = "Comments oldest first with their replies", body = CommentListing),
        (status = 400, description = "Invalid userId", body = crate::error::ApiErrorBody)
    )
)]
pub async fn list_comments(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ViewerQuery>,
) -> Result<HttpResponse, ApiError> {
    let movie_id = path.into_inner();
    let thread = data.repo.get_comments_with_replies(&movie_id).await?;
    let like_status = query.user_id.as_ref().map(|user| LikeStatus::derive(&thread, user));
    Ok(HttpResponse::Ok().json(CommentListing { thread, like_status }))
}

#[utoipa::path(
    post,
    path = "/api/v1/movies/{movie_id}/comments",
    tag = "comments",
    params(("movie_id" = String, Path, description = "Movie id")),
    request_body = NewComment,
    responses(
        (status = 201, description = "Comment created", body = Created),
        (status = 400, description = "Blank or oversized text, bad guest id", body = crate::error::ApiErrorBody),
        (status = 429, description = "Rate limited", body = crate::error::ApiErrorBody)
    )
)]
pub async fn create_comment(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<NewComment>,
) -> Result<HttpResponse, ApiError> {
    let movie_id = path.into_inner();
    let NewComment { user_id, user_name, text } = payload.into_inner();
    let text = validated_text(&text, data.max_text_len)?;
    let author = validated_author(user_id, &user_name)?;
    rate_guard(&data, |rl| rl.allow_comment(author.user_id.as_str()))?;
    let id = data.repo.add_comment(&author, &movie_id, &text).await?;
    Ok(HttpResponse::Created().json(Created { id }))
}

#[utoipa::path(
    get,
    path = "/api/v1/movies/{movie_id}/likes",
    tag = "likes",
    params(("movie_id" = String, Path, description = "Movie id"), LikeStatusQuery),
    responses(
        (status = 200, description = "Per-item like status of the guest", body = LikeStatus),
        (status = 400, description = "Missing or invalid userId", body = crate::error::ApiErrorBody)
    )
)]
pub async fn get_like_status(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<LikeStatusQuery>,
) -> Result<HttpResponse, ApiError> {
    let status = data.repo.get_user_like_status(&path.into_inner(), &query.user_id).await?;
    Ok(HttpResponse::Ok().json(status))
}

#[utoipa::path(
    post,
    path = "/api/v1/comments/{comment_id}/replies",
    tag = "comments",
    params(("comment_id" = String, Path, description = "Parent comment id")),
    request_body = NewReply,
    responses(
        (status = 201, description = "Reply created", body = Created),
        (status = 400, description = "Blank or oversized text, bad guest id", body = crate::error::ApiErrorBody),
        (status = 404, description = "Parent comment not found", body = crate::error::ApiErrorBody),
        (status = 429, description = "Rate limited", body = crate::error::ApiErrorBody)
    )
)]
pub async fn create_reply(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<NewReply>,
) -> Result<HttpResponse, ApiError> {
    let comment_id = path.into_inner();
    let NewReply { user_id, user_name, movie_id, text } = payload.into_inner();
    let text = validated_text(&text, data.max_text_len)?;
    let author = validated_author(user_id, &user_name)?;
    rate_guard(&data, |rl| rl.allow_reply(author.user_id.as_str()))?;
    let id = data.repo.add_reply(&comment_id, &author, &movie_id, &text).await?;
    Ok(HttpResponse::Created().json(Created { id }))
}

#[utoipa::path(
    post,
    path = "/api/v1/comments/{comment_id}/like",
    tag = "likes",
    params(("comment_id" = String, Path, description = "Comment id")),
    request_body = LikeRequest,
    responses(
        (status = 200, description = "Like toggled", body = LikeToggle),
        (status = 404, description = "Comment not found", body = crate::error::ApiErrorBody),
        (status = 409, description = "Too many concurrent toggles", body = crate::error::ApiErrorBody),
        (status = 429, description = "Rate limited", body = crate::error::ApiErrorBody)
    )
)]
pub async fn toggle_comment_like(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<LikeRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = payload.into_inner().user_id;
    rate_guard(&data, |rl| rl.allow_like(user.as_str()))?;
    let toggle = data.repo.toggle_comment_like(&path.into_inner(), &user).await?;
    Ok(HttpResponse::Ok().json(toggle))
}

#[utoipa::path(
    post,
    path = "/api/v1/comments/{comment_id}/replies/{reply_id}/like",
    tag = "likes",
    params(
        ("comment_id" = String, Path, description = "Parent comment id"),
        ("reply_id" = String, Path, description = "Reply id")
    ),
    request_body = LikeRequest,
    responses(
        (status = 200, description = "Like toggled", body = LikeToggle),
        (status = 404, description = "Reply not found", body = crate::error::ApiErrorBody),
        (status = 409, description = "Too many concurrent toggles", body = crate::error::ApiErrorBody),
        (status = 429, description = "Rate limited", body = crate::error::ApiErrorBody)
    )
)]
pub async fn toggle_reply_like(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    payload: web::Json<LikeRequest>,
) -> Result<HttpResponse, ApiError> {
    let (comment_id, reply_id) = path.into_inner();
    let user = payload.into_inner().user_id;
    rate_guard(&data, |rl| rl.allow_like(user.as_str()))?;
    let toggle = data.repo.toggle_reply_like(&comment_id, &reply_id, &user).await?;
    Ok(HttpResponse::Ok().json(toggle))
}

#[utoipa::path(
    post,
    path = "/api/v1/movies/{movie_id}/reconcile",
    tag = "maintenance",
    params(("movie_id" = String, Path, description = "Movie id")),
    responses(
        (status = 200, description = "Drifted like and reply counters rewritten", body = ReconcileReport),
        (status = 409, description = "A counter changed while being repaired", body = crate::error::ApiErrorBody)
    )
)]
pub async fn reconcile_counts(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let report = data.repo.reconcile_counts(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(report))
}

pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}
