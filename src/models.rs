use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::guest::GuestId;

/// Field names as stored in the `comments` collection and its `replies`
/// sub-collections.
pub mod fields {
    pub const USER_ID: &str = "userId";
    pub const USER_NAME: &str = "userName";
    pub const TEXT: &str = "userComment";
    pub const MOVIE_ID: &str = "movieId";
    pub const COMMENT_ID: &str = "commentId";
    pub const TIMING: &str = "timing";
    pub const LIKES: &str = "likes";
    pub const REPLIES: &str = "replies";
    pub const LIKED_BY: &str = "likedBy";
    pub const LAST_UPDATED: &str = "lastUpdated";
    pub const YEAR: &str = "year";
    pub const MONTH: &str = "month";
    pub const DATE: &str = "date";
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    /// Document id; not stored in the document body.
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(rename = "userComment")]
    pub text: String,
    pub movie_id: String,
    pub timing: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub likes: u32,
    #[serde(default, deserialize_with = "lenient_count")]
    pub replies: u32,
    #[serde(default)]
    pub liked_by: Vec<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    // calendar day of creation, kept for day-bucketed display
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub date: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(default)]
    pub id: String,
    pub comment_id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(rename = "userComment")]
    pub text: String,
    pub movie_id: String,
    pub timing: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub likes: u32,
    #[serde(default)]
    pub liked_by: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub date: Option<u32>,
}

/// Counters written by older clients can be null, fractional or negative
/// (racing un-likes); they read as the nearest value in range, 0 otherwise.
fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let n = Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    Ok(n.clamp(0.0, f64::from(u32::MAX)) as u32)
}

/// Result of a like toggle: the stored count after the write and whether the
/// user now likes the target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct LikeToggle {
    pub likes: u32,
    pub liked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommentsWithReplies {
    /// Oldest first.
    pub comments: Vec<Comment>,
    /// One entry per comment, possibly empty; replies oldest first.
    pub replies_by_comment_id: BTreeMap<String, Vec<Reply>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LikeStatus {
    pub comment_likes: BTreeMap<String, bool>,
    pub reply_likes: BTreeMap<String, bool>,
}

impl LikeStatus {
    /// Like status of `user` over an already-fetched listing.
    pub fn derive(listing: &CommentsWithReplies, user: &GuestId) -> Self {
        let user = user.as_str();
        let comment_likes = listing
            .comments
            .iter()
            .map(|c| (c.id.clone(), c.liked_by.iter().any(|u| u == user)))
            .collect();
        let reply_likes = listing
            .replies_by_comment_id
            .values()
            .flatten()
            .map(|r| (r.id.clone(), r.liked_by.iter().any(|u| u == user)))
            .collect();
        Self { comment_likes, reply_likes }
    }
}

/// Counts corrected by a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub comments_checked: usize,
    pub comments_fixed: usize,
    pub replies_checked: usize,
    pub replies_fixed: usize,
}

// ---------------- HTTP payloads -----------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    #[schema(value_type = String)]
    pub user_id: GuestId,
    pub user_name: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewReply {
    #[schema(value_type = String)]
    pub user_id: GuestId,
    pub user_name: String,
    pub movie_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LikeRequest {
    #[schema(value_type = String)]
    pub user_id: GuestId,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Created {
    pub id: String,
}

/// Comment listing with the viewer's like status folded in when a viewer is
/// named.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommentListing {
    #[serde(flatten)]
    pub thread: CommentsWithReplies,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_status: Option<LikeStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored_comment(likes: Value, replies: Value) -> Value {
        json!({
            "userId": "guest_1_a",
            "userName": "a",
            "userComment": "hi",
            "movieId": "603",
            "timing": "2024-06-10T12:00:00Z",
            "likes": likes,
            "replies": replies,
        })
    }

    #[test]
    fn drifted_counters_decode_in_range() {
        let c: Comment = serde_json::from_value(stored_comment(json!(-1), json!(null))).unwrap();
        assert_eq!((c.likes, c.replies), (0, 0));

        let c: Comment = serde_json::from_value(stored_comment(json!(2.0), json!(u64::MAX))).unwrap();
        assert_eq!((c.likes, c.replies), (2, u32::MAX));

        let mut bare = stored_comment(json!(0), json!(0));
        bare.as_object_mut().unwrap().retain(|k, _| k != "likes" && k != "replies");
        let c: Comment = serde_json::from_value(bare).unwrap();
        assert_eq!((c.likes, c.replies), (0, 0));
    }
}
