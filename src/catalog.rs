use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://e621.net/posts.json";
pub const DEFAULT_PAGE_LIMIT: u32 = 75;
const BODY_SNIPPET_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("failed to build request: {0}")]
    Request(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("API request failed with status {status}: {body}")]
    Status { status: String, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn status_code(&self) -> Option<&str> {
        match self {
            FetchError::Status { status, .. } => Some(status.as_str()),
            _ => None,
        }
    }
}

pub trait SearchService: Send + Sync {
    fn search(&self, query: &str, page: u32) -> Result<Vec<Post>, FetchError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostResponse {
    #[serde(default)]
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    #[serde(default)]
    pub pools: Vec<i64>,
    #[serde(default)]
    pub score: Score,
    #[serde(default)]
    pub rating: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub file: FileRef,
    #[serde(default)]
    pub sample: SampleRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub general: Vec<String>,
    #[serde(default)]
    pub species: Vec<String>,
    #[serde(default)]
    pub character: Vec<String>,
    #[serde(default)]
    pub copyright: Vec<String>,
    #[serde(default)]
    pub artist: Vec<String>,
    #[serde(default)]
    pub invalid: Vec<String>,
    #[serde(default)]
    pub lore: Vec<String>,
    #[serde(default)]
    pub meta: Vec<String>,
}

impl Tags {
    /// Tags shown in the popup: general, species, character, copyright and
    /// artist, in that order.
    pub fn display_text(&self) -> String {
        self.general
            .iter()
            .chain(&self.species)
            .chain(&self.character)
            .chain(&self.copyright)
            .chain(&self.artist)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn artists(&self) -> String {
        if self.artist.is_empty() {
            "unknown".to_string()
        } else {
            self.artist.join(", ")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRef {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub has: bool,
}

impl Post {
    pub fn file_url(&self) -> &str {
        self.file.url.as_deref().unwrap_or_default()
    }

    pub fn sample_url(&self) -> Option<&str> {
        match self.sample.url.as_deref() {
            Some(url) if self.sample.has && !url.is_empty() => Some(url),
            _ => None,
        }
    }

    pub fn first_pool(&self) -> Option<i64> {
        self.pools.first().copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub page_limit: u32,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    endpoint: String,
    user_agent: String,
    page_limit: u32,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        if config.user_agent.trim().is_empty() {
            anyhow::bail!("catalog client user agent required");
        }
        let endpoint = if config.endpoint.trim().is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            config.endpoint
        };
        url::Url::parse(&endpoint)
            .map_err(|err| anyhow::anyhow!("invalid catalog endpoint {endpoint}: {err}"))?;

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(30)))
                .build()?,
        };

        Ok(Client {
            http,
            endpoint,
            user_agent: config.user_agent,
            page_limit: if config.page_limit == 0 {
                DEFAULT_PAGE_LIMIT
            } else {
                config.page_limit
            },
        })
    }

    pub fn search(&self, query: &str, page: u32) -> Result<Vec<Post>, FetchError> {
        info!(query, page, "fetching posts");

        let request = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("tags", query.to_string()),
                ("page", page.to_string()),
                ("limit", self.page_limit.to_string()),
            ])
            .header(USER_AGENT, &self.user_agent)
            .build()
            .map_err(|err| FetchError::Request(err.to_string()))?;

        let response = self.http.execute(request).map_err(|err| {
            warn!(error = %err, "catalog request failed");
            FetchError::Network(err.to_string())
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().unwrap_or_default();
            let err = FetchError::Status {
                status: status.to_string(),
                body: snippet(&body),
            };
            warn!(%status, "catalog returned an error status");
            return Err(err);
        }

        let body = response
            .text()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let decoded: PostResponse = serde_json::from_str(&body).map_err(|err| {
            warn!(error = %err, "catalog response did not decode");
            FetchError::Decode(err.to_string())
        })?;

        info!(count = decoded.posts.len(), "fetched posts");
        Ok(decoded.posts)
    }
}

impl SearchService for Client {
    fn search(&self, query: &str, page: u32) -> Result<Vec<Post>, FetchError> {
        Client::search(self, query, page)
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_SNIPPET_LIMIT) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use tiny_http::{Response, Server};

    struct Captured {
        url: String,
        user_agent: Option<String>,
    }

    fn serve(
        status: u16,
        body: &'static str,
    ) -> (String, Arc<AtomicUsize>, Arc<Mutex<Vec<Captured>>>) {
        let server = Server::http("127.0.0.1:0").expect("bind test server");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let hits = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let hits_thread = hits.clone();
        let captured_thread = captured.clone();
        thread::spawn(move || {
            for request in server.incoming_requests() {
                hits_thread.fetch_add(1, Ordering::SeqCst);
                let user_agent = request
                    .headers()
                    .iter()
                    .find(|header| header.field.equiv("User-Agent"))
                    .map(|header| header.value.as_str().to_string());
                captured_thread.lock().unwrap().push(Captured {
                    url: request.url().to_string(),
                    user_agent,
                });
                let _ = request.respond(Response::from_string(body).with_status_code(status));
            }
        });
        (format!("http://{addr}/posts.json"), hits, captured)
    }

    fn client(endpoint: String) -> Client {
        Client::new(ClientConfig {
            endpoint,
            user_agent: "e6tui-test/1.0".into(),
            page_limit: 0,
            timeout: Some(Duration::from_secs(5)),
            http_client: None,
        })
        .unwrap()
    }

    const TWO_POSTS: &str = r#"{"posts":[
        {"id":101,"pools":[],"score":{"total":12},"rating":"s",
         "tags":{"general":["wolf"],"artist":["someone"]},
         "file":{"url":"https://static.test/101.png","width":800,"height":600},
         "sample":{"url":"https://static.test/sample/101.jpg","has":true}},
        {"id":102,"pools":[55],"score":{"total":-3},"rating":"q",
         "file":{"url":null,"width":0,"height":0},
         "sample":{"has":false}}
    ]}"#;

    #[test]
    fn search_sends_query_contract_and_decodes_posts() {
        let (endpoint, hits, captured) = serve(200, TWO_POSTS);
        let posts = client(endpoint).search("wolf order:rank", 3).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let captured = captured.lock().unwrap();
        let url = &captured[0].url;
        assert!(url.starts_with("/posts.json?"), "url was {url}");
        assert!(url.contains("tags=wolf+order%3Arank"), "url was {url}");
        assert!(url.contains("page=3"), "url was {url}");
        assert!(url.contains("limit=75"), "url was {url}");
        assert_eq!(captured[0].user_agent.as_deref(), Some("e6tui-test/1.0"));

        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id, 101);
        assert_eq!(posts[0].score.total, 12);
        assert_eq!(posts[0].sample_url(), Some("https://static.test/sample/101.jpg"));
        assert_eq!(posts[1].pools, vec![55]);
        assert_eq!(posts[1].file_url(), "");
        assert_eq!(posts[1].sample_url(), None);
        assert!(posts[1].tags.general.is_empty());
    }

    #[test]
    fn server_error_surfaces_status_without_retry() {
        let (endpoint, hits, _) = serve(500, "upstream exploded");
        let err = client(endpoint).search("wolf", 1).unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("500"), "error was {err}");
        assert!(err.to_string().contains("upstream exploded"));
        assert!(err.status_code().is_some_and(|status| status.starts_with("500")));
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let (endpoint, _, _) = serve(200, "{\"posts\": [ {\"id\": \"nope\"} ]}");
        let err = client(endpoint).search("", 1).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)), "error was {err:?}");
    }

    #[test]
    fn unreachable_host_is_a_network_error() {
        let err = client("http://127.0.0.1:1/posts.json".into())
            .search("", 1)
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)), "error was {err:?}");
    }

    #[test]
    fn tag_text_follows_category_order() {
        let tags = Tags {
            general: vec!["a".into(), "b".into()],
            species: vec!["c".into()],
            character: vec!["d".into()],
            copyright: vec!["e".into()],
            artist: vec!["f".into()],
            meta: vec!["ignored".into()],
            ..Tags::default()
        };
        assert_eq!(tags.display_text(), "a, b, c, d, e, f");
        assert_eq!(Tags::default().artists(), "unknown");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(BODY_SNIPPET_LIMIT + 10);
        let cut = snippet(&body);
        assert_eq!(cut.chars().count(), BODY_SNIPPET_LIMIT + 1);
    }
}
