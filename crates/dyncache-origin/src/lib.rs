//! Mock origin server.
//!
//! Serves a small in-memory post list so the proxy can be exercised locally:
//!
//! - `GET /` → `root`
//! - `GET /posts`, `GET /posts/` → `{"posts": [...], "time": "HH:MM:SS"}`
//! - `GET /posts/delay?delay=<ms>` → same body after sleeping (capped at 10 s)
//! - `POST /posts` (form `title`, `body`) → append a post, redirect to `/`

use std::{sync::Arc, time::Duration};

use axum::{
    Form, Json, Router,
    extract::{Query, State},
    response::Redirect,
    routing::get,
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset, macros::format_description, macros::offset};
use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_DELAY_MS: u64 = 1000;
pub const MAX_DELAY: Duration = Duration::from_secs(10);

/// Responses report wall-clock time in Japan Standard Time.
const RESPONSE_OFFSET: UtcOffset = offset!(+9);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct PostStore {
    posts: Arc<RwLock<Vec<Post>>>,
}

impl PostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_posts(posts: Vec<Post>) -> Self {
        Self {
            posts: Arc::new(RwLock::new(posts)),
        }
    }

    pub async fn push(&self, post: Post) {
        self.posts.write().await.push(post);
    }

    pub async fn snapshot(&self) -> Vec<Post> {
        self.posts.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.posts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Serialize)]
pub struct PostsBody {
    pub posts: Vec<Post>,
    pub time: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DelayQuery {
    delay: Option<String>,
}

pub fn build_router(store: PostStore) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/posts", get(list_posts).post(create_post))
        .route("/posts/", get(list_posts))
        .route("/posts/delay", get(list_posts_delayed))
        .with_state(store)
}

/// Clock time in the response offset, formatted `HH:MM:SS`.
pub fn format_time(now: OffsetDateTime) -> String {
    let format = format_description!("[hour]:[minute]:[second]");
    now.to_offset(RESPONSE_OFFSET)
        .format(&format)
        .unwrap_or_default()
}

/// Requested delay in milliseconds, capped at [`MAX_DELAY`].
///
/// A missing value means the default; anything that is not a whole number
/// means no delay at all.
fn requested_delay(raw: Option<&str>) -> Duration {
    let millis = match raw {
        None => DEFAULT_DELAY_MS,
        Some(value) => value.trim().parse::<u64>().unwrap_or(0),
    };
    Duration::from_millis(millis).min(MAX_DELAY)
}

async fn root() -> &'static str {
    "root"
}

async fn list_posts(State(store): State<PostStore>) -> Json<PostsBody> {
    Json(PostsBody {
        posts: store.snapshot().await,
        time: format_time(OffsetDateTime::now_utc()),
    })
}

async fn list_posts_delayed(
    State(store): State<PostStore>,
    Query(query): Query<DelayQuery>,
) -> Json<PostsBody> {
    tokio::time::sleep(requested_delay(query.delay.as_deref())).await;
    list_posts(State(store)).await
}

async fn create_post(State(store): State<PostStore>, Form(post): Form<Post>) -> Redirect {
    info!(title = %post.title, "post created");
    store.push(post).await;
    Redirect::to("/")
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use time::macros::datetime;
    use tower::ServiceExt;

    use super::*;

    async fn get_json(router: Router, uri: &str) -> Value {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn root_returns_text() {
        let response = build_router(PostStore::new())
            .oneshot(Request::get("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&bytes[..], b"root");
    }

    #[tokio::test]
    async fn posts_list_is_empty_initially() {
        let body = get_json(build_router(PostStore::new()), "/posts").await;
        assert_eq!(body["posts"], serde_json::json!([]));
        assert!(body["time"].is_string());
    }

    #[tokio::test]
    async fn trailing_slash_serves_the_same_list() {
        let store = PostStore::with_posts(vec![Post {
            title: "a".to_string(),
            body: "b".to_string(),
        }]);
        let body = get_json(build_router(store), "/posts/").await;
        assert_eq!(body["posts"][0]["title"], "a");
    }

    #[tokio::test]
    async fn form_post_appends_and_redirects() {
        let store = PostStore::new();
        let response = build_router(store.clone())
            .oneshot(
                Request::post("/posts")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("title=hello&body=world"))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert!(response.status().is_redirection());
        assert_eq!(response.headers()[header::LOCATION], "/");
        assert_eq!(
            store.snapshot().await,
            vec![Post {
                title: "hello".to_string(),
                body: "world".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delay_endpoint_sleeps_before_answering() {
        let started = tokio::time::Instant::now();
        let body = get_json(build_router(PostStore::new()), "/posts/delay?delay=250").await;
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(body["posts"], serde_json::json!([]));
    }

    #[test]
    fn delay_defaults_and_caps() {
        assert_eq!(requested_delay(None), Duration::from_millis(1000));
        assert_eq!(requested_delay(Some("20")), Duration::from_millis(20));
        assert_eq!(requested_delay(Some("999999")), MAX_DELAY);
        assert_eq!(requested_delay(Some("soon")), Duration::ZERO);
    }

    #[test]
    fn time_is_rendered_in_japan_time() {
        assert_eq!(format_time(datetime!(2024-01-01 15:04:05 UTC)), "00:04:05");
    }
}
