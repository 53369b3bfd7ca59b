#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use treeput::tree::{Entry, FileHandle, PagedCursor, ResolvedFile};
use treeput::{EnumerationError, RootSource};

/// 服务器收到的一个请求
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct ServerState {
    requests: Mutex<Vec<Recorded>>,
    rejections: Mutex<HashMap<String, (StatusCode, String)>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// 记录所有请求的测试服务器，默认对任何请求回 201
#[derive(Clone)]
pub struct TestServer {
    origin: String,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new().fallback(record).with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test server");
        });
        Self {
            origin: format!("http://{}", addr),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.origin, path.trim_start_matches('/'))
    }

    /// `path` 是服务器看到的已编码路径
    pub fn reject(&self, path: &str, status: StatusCode, body: &str) {
        self.state
            .rejections
            .lock()
            .insert(path.to_string(), (status, body.to_string()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = Some(delay);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.requests().into_iter().map(|r| r.path).collect();
        paths.sort();
        paths
    }

    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }
}

async fn record(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    let delay = *state.delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let path = uri.path().to_string();
    state.requests.lock().push(Recorded {
        method: method.to_string(),
        path: path.clone(),
        headers,
        body,
    });

    let rejection = state.rejections.lock().get(&path).cloned();
    rejection.unwrap_or((StatusCode::CREATED, String::new()))
}

pub fn mem_file(name: &str, data: &'static [u8]) -> Entry {
    Entry::file(name, ResolvedFile::from_bytes(data))
}

/// 每页两个子项，方便覆盖多页目录
pub fn mem_dir(name: &str, children: Vec<Entry>) -> Entry {
    Entry::dir(name, PagedCursor::new(name, children, 2))
}

pub fn unreadable(name: &str) -> Entry {
    let reason = format!("{} vanished", name);
    let owned = name.to_string();
    Entry::File(FileHandle::deferred(name, async move {
        Err(EnumerationError::Unreadable { name: owned, reason })
    }))
}

/// 每次打开都重新构建同一棵树
pub fn roots_from(build: fn() -> Vec<Entry>) -> impl RootSource {
    move || -> BoxFuture<'static, Result<Vec<Entry>, EnumerationError>> { Box::pin(async move { Ok(build()) }) }
}
