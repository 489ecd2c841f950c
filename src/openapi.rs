use crate::error::ApiErrorBody;
use crate::guest::GuestSession;
use crate::models::{Comment, CommentListing, CommentsWithReplies, Created, LikeRequest, LikeStatus, LikeToggle, NewComment, NewReply, ReconcileReport, Reply};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::mint_guest_session,
        crate::routes::list_comments,
        crate::routes::create_comment,
        crate::routes::get_like_status,
        crate::routes::create_reply,
        crate::routes::toggle_comment_like,
        crate::routes::toggle_reply_like,
        crate::routes::reconcile_counts,
    ),
    components(schemas(
        Comment, Reply, NewComment, NewReply, LikeRequest, LikeToggle, LikeStatus,
        CommentsWithReplies, CommentListing, Created, GuestSession, ReconcileReport, ApiErrorBody
    )),
    tags(
        (name = "guests", description = "Anonymous guest identities"),
        (name = "comments", description = "Movie comments and replies"),
        (name = "likes", description = "Like toggles and per-guest like status"),
        (name = "maintenance", description = "Counter repair"),
    )
)]
pub struct ApiDoc;
