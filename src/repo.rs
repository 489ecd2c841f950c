use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::docstore::{
    is_valid_doc_id, CollectionPath, DocPath, Document, DocumentStore, FieldOp, Precondition, Query, StoreError,
    WriteBatch,
};
use crate::guest::{GuestId, GuestSession};
use crate::models::{fields, Comment, CommentsWithReplies, LikeStatus, LikeToggle, ReconcileReport, Reply};

pub const COMMENTS: &str = "comments";
pub const REPLIES: &str = "replies";
pub const DEFAULT_LIKE_MAX_ATTEMPTS: u32 = 5;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("too many concurrent updates to {0}")]
    Contention(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RepoError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path) => RepoError::NotFound(path.to_string()),
            other => RepoError::Store(other),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn add_comment(&self, author: &GuestSession, movie_id: &str, text: &str) -> RepoResult<String>;
    async fn add_reply(
        &self,
        comment_id: &str,
        author: &GuestSession,
        movie_id: &str,
        text: &str,
    ) -> RepoResult<String>;
    async fn toggle_comment_like(&self, comment_id: &str, user: &GuestId) -> RepoResult<LikeToggle>;
    async fn toggle_reply_like(&self, comment_id: &str, reply_id: &str, user: &GuestId) -> RepoResult<LikeToggle>;
    async fn get_comments_with_replies(&self, movie_id: &str) -> RepoResult<CommentsWithReplies>;
    async fn get_user_like_status(&self, movie_id: &str, user: &GuestId) -> RepoResult<LikeStatus>;
    /// Rewrites drifted `likes` and `replies` counters of one movie's thread.
    async fn reconcile_counts(&self, movie_id: &str) -> RepoResult<ReconcileReport>;
}

/// Comment repository over any [`DocumentStore`].
#[derive(Clone)]
pub struct DocCommentRepo {
    store: Arc<dyn DocumentStore>,
    like_max_attempts: u32,
}

fn comments_collection() -> CollectionPath {
    CollectionPath::root(COMMENTS)
}

fn comment_path(comment_id: &str) -> RepoResult<DocPath> {
    if !is_valid_doc_id(comment_id) {
        return Err(RepoError::NotFound(format!("{COMMENTS}/{comment_id}")));
    }
    Ok(comments_collection().doc(comment_id))
}

fn reply_path(comment_id: &str, reply_id: &str) -> RepoResult<DocPath> {
    let parent = comment_path(comment_id)?;
    if !is_valid_doc_id(reply_id) {
        return Err(RepoError::NotFound(format!("{parent}/{REPLIES}/{reply_id}")));
    }
    Ok(parent.collection(REPLIES).doc(reply_id))
}

/// Fields shared by comments and replies at creation.
fn authored_fields(author: &GuestSession, movie_id: &str, text: &str) -> Vec<FieldOp> {
    let today = Utc::now();
    vec![
        FieldOp::set(fields::USER_ID, author.user_id.as_str()),
        FieldOp::set(fields::USER_NAME, author.display_name.as_str()),
        FieldOp::set(fields::TEXT, text),
        FieldOp::set(fields::MOVIE_ID, movie_id),
        FieldOp::server_timestamp(fields::TIMING),
        FieldOp::set(fields::LIKES, 0),
        FieldOp::set(fields::LIKED_BY, Value::Array(Vec::new())),
        FieldOp::set(fields::YEAR, today.year()),
        FieldOp::set(fields::MONTH, today.month()),
        FieldOp::set(fields::DATE, today.day()),
    ]
}

fn decode_comment(doc: &Document) -> RepoResult<Comment> {
    let mut comment: Comment = doc.decode()?;
    comment.id = doc.id().to_string();
    Ok(comment)
}

fn decode_reply(doc: &Document) -> RepoResult<Reply> {
    let mut reply: Reply = doc.decode()?;
    reply.id = doc.id().to_string();
    Ok(reply)
}

fn count_as_u32(n: i64) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

/// Distinct members of the like-set, first occurrence wins.
fn distinct_likers(doc: &Document) -> Vec<&str> {
    let mut seen = Vec::new();
    for user in doc.string_set(fields::LIKED_BY) {
        if !seen.contains(&user) {
            seen.push(user);
        }
    }
    seen
}

impl DocCommentRepo {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store, like_max_attempts: DEFAULT_LIKE_MAX_ATTEMPTS }
    }

    /// Read-decide-write cycles a like toggle may run before giving up.
    pub fn with_like_max_attempts(mut self, attempts: u32) -> Self {
        self.like_max_attempts = attempts.max(1);
        self
    }

    async fn toggle_like(&self, path: DocPath, user: &GuestId) -> RepoResult<LikeToggle> {
        let member = Value::from(user.as_str());
        for attempt in 1..=self.like_max_attempts {
            let doc = self
                .store
                .get(&path)
                .await?
                .ok_or_else(|| RepoError::NotFound(path.to_string()))?;
            let liked = !doc.string_set(fields::LIKED_BY).contains(&user.as_str());
            let ops = if liked {
                vec![
                    FieldOp::increment(fields::LIKES, 1),
                    FieldOp::array_union(fields::LIKED_BY, vec![member.clone()]),
                ]
            } else {
                vec![
                    FieldOp::increment(fields::LIKES, -1),
                    FieldOp::array_remove(fields::LIKED_BY, vec![member.clone()]),
                ]
            };
            let batch = WriteBatch::new().update(path.clone(), Precondition::Version(doc.version), ops);
            match self.store.commit(batch).await {
                Ok(written) => {
                    let likes = written.first().map(|d| d.int_field(fields::LIKES)).unwrap_or_default();
                    metrics::increment_counter!("cinechat_like_toggles_total");
                    debug!(path = %path, user = %user, liked, likes, attempt, "like toggled");
                    return Ok(LikeToggle { likes: count_as_u32(likes), liked });
                }
                Err(StoreError::Aborted(_)) => {
                    metrics::increment_counter!("cinechat_like_conflicts_total");
                    debug!(path = %path, attempt, "like toggle raced another write, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(path = %path, attempts = self.like_max_attempts, "like toggle gave up under contention");
        Err(RepoError::Contention(path.to_string()))
    }

    /// Writes `ops` to `doc` only if nobody updated it since it was read.
    async fn rewrite_counts(&self, doc: &Document, ops: Vec<FieldOp>) -> RepoResult<()> {
        let batch = WriteBatch::new().update(doc.path.clone(), Precondition::Version(doc.version), ops);
        match self.store.commit(batch).await {
            Ok(_) => Ok(()),
            Err(StoreError::Aborted(path)) => Err(RepoError::Contention(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CommentRepo for DocCommentRepo {
    async fn add_comment(&self, author: &GuestSession, movie_id: &str, text: &str) -> RepoResult<String> {
        let path = comments_collection().new_doc();
        let mut ops = authored_fields(author, movie_id, text);
        ops.push(FieldOp::set(fields::REPLIES, 0));
        self.store.commit(WriteBatch::new().create(path.clone(), ops)).await?;
        metrics::increment_counter!("cinechat_comments_created_total");
        info!(movie_id, comment_id = path.id(), user = %author.user_id, "comment added");
        Ok(path.id().to_string())
    }

    async fn add_reply(
        &self,
        comment_id: &str,
        author: &GuestSession,
        movie_id: &str,
        text: &str,
    ) -> RepoResult<String> {
        let parent = comment_path(comment_id)?;
        // Replies are listed per movie, so a parent filed under another movie
        // does not exist from the caller's point of view.
        let parent_doc = self
            .store
            .get(&parent)
            .await?
            .ok_or_else(|| RepoError::NotFound(parent.to_string()))?;
        if parent_doc.fields.get(fields::MOVIE_ID).and_then(Value::as_str) != Some(movie_id) {
            return Err(RepoError::NotFound(format!("{parent} under movie {movie_id}")));
        }

        let path = parent.collection(REPLIES).new_doc();
        let mut ops = authored_fields(author, movie_id, text);
        ops.push(FieldOp::set(fields::COMMENT_ID, comment_id));
        let batch = WriteBatch::new().create(path.clone(), ops).update(
            parent,
            Precondition::Exists,
            vec![FieldOp::increment(fields::REPLIES, 1), FieldOp::server_timestamp(fields::LAST_UPDATED)],
        );
        self.store.commit(batch).await?;
        metrics::increment_counter!("cinechat_replies_created_total");
        info!(movie_id, comment_id, reply_id = path.id(), user = %author.user_id, "reply added");
        Ok(path.id().to_string())
    }

    async fn toggle_comment_like(&self, comment_id: &str, user: &GuestId) -> RepoResult<LikeToggle> {
        self.toggle_like(comment_path(comment_id)?, user).await
    }

    async fn toggle_reply_like(&self, comment_id: &str, reply_id: &str, user: &GuestId) -> RepoResult<LikeToggle> {
        self.toggle_like(reply_path(comment_id, reply_id)?, user).await
    }

    async fn get_comments_with_replies(&self, movie_id: &str) -> RepoResult<CommentsWithReplies> {
        let comment_docs = self
            .store
            .query(&Query::collection(comments_collection()).where_eq(fields::MOVIE_ID, movie_id))
            .await?;
        let reply_docs = self
            .store
            .query(&Query::collection_group(REPLIES).where_eq(fields::MOVIE_ID, movie_id))
            .await?;

        let mut comments = comment_docs.iter().map(decode_comment).collect::<RepoResult<Vec<_>>>()?;
        comments.sort_by(|a, b| a.timing.cmp(&b.timing).then_with(|| a.id.cmp(&b.id)));

        let mut replies_by_comment_id: BTreeMap<String, Vec<Reply>> =
            comments.iter().map(|c| (c.id.clone(), Vec::new())).collect();
        for doc in &reply_docs {
            let reply = decode_reply(doc)?;
            match replies_by_comment_id.get_mut(&reply.comment_id) {
                Some(bucket) => bucket.push(reply),
                None => debug!(path = %doc.path, "reply without a listed parent skipped"),
            }
        }
        for replies in replies_by_comment_id.values_mut() {
            replies.sort_by(|a, b| a.timing.cmp(&b.timing).then_with(|| a.id.cmp(&b.id)));
        }

        debug!(movie_id, comments = comments.len(), replies = reply_docs.len(), "listed comments");
        Ok(CommentsWithReplies { comments, replies_by_comment_id })
    }

    async fn get_user_like_status(&self, movie_id: &str, user: &GuestId) -> RepoResult<LikeStatus> {
        let listing = self.get_comments_with_replies(movie_id).await?;
        Ok(LikeStatus::derive(&listing, user))
    }

    async fn reconcile_counts(&self, movie_id: &str) -> RepoResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let comment_docs = self
            .store
            .query(&Query::collection(comments_collection()).where_eq(fields::MOVIE_ID, movie_id))
            .await?;

        for comment in &comment_docs {
            report.comments_checked += 1;
            let reply_docs = self.store.query(&Query::collection(comment.path.collection(REPLIES))).await?;

            for reply in &reply_docs {
                report.replies_checked += 1;
                let likers = distinct_likers(reply);
                let stored = reply.string_set(fields::LIKED_BY).len();
                if reply.int_field(fields::LIKES) != likers.len() as i64 || stored != likers.len() {
                    self.rewrite_counts(
                        reply,
                        vec![
                            FieldOp::set(fields::LIKES, likers.len()),
                            FieldOp::set(fields::LIKED_BY, likers),
                        ],
                    )
                    .await?;
                    report.replies_fixed += 1;
                }
            }

            let likers = distinct_likers(comment);
            let stored = comment.string_set(fields::LIKED_BY).len();
            let drifted = comment.int_field(fields::LIKES) != likers.len() as i64
                || stored != likers.len()
                || comment.int_field(fields::REPLIES) != reply_docs.len() as i64;
            if drifted {
                self.rewrite_counts(
                    comment,
                    vec![
                        FieldOp::set(fields::LIKES, likers.len()),
                        FieldOp::set(fields::LIKED_BY, likers),
                        FieldOp::set(fields::REPLIES, reply_docs.len()),
                    ],
                )
                .await?;
                report.comments_fixed += 1;
            }
        }

        if report.comments_fixed + report.replies_fixed > 0 {
            warn!(movie_id, ?report, "repaired drifted counters");
        } else {
            debug!(movie_id, ?report, "counters consistent");
        }
        Ok(report)
    }
}
