//! Scripted HTTP server for step tests.
//!
//! Every route (`"GET /path"`) answers from its own queue of replies; the
//! last reply repeats once the queue is drained. Unknown routes get `404`.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::domain::PipelineJob;

use super::StepContext;

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

#[derive(Default)]
struct Routes {
    replies: HashMap<String, VecDeque<Reply>>,
    hits: HashMap<String, usize>,
}

impl Routes {
    fn answer(&mut self, route: &str) -> Reply {
        *self.hits.entry(route.to_string()).or_default() += 1;
        match self.replies.get_mut(route) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Reply::new(404, "no such route"),
        }
    }
}

pub struct TestServer {
    base: String,
    routes: Arc<Mutex<Routes>>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Bind to a free local port and serve `routes`
    pub async fn start(routes: Vec<(&str, Vec<Reply>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let mut table = Routes::default();
        for (route, replies) in routes {
            assert!(!replies.is_empty(), "route {} needs at least one reply", route);
            table.replies.insert(route.to_string(), replies.into());
        }
        let routes = Arc::new(Mutex::new(table));

        let shared = routes.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle(stream, shared.clone()));
            }
        });

        Self { base, routes, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Requests served on `route` so far
    pub fn hits(&self, route: &str) -> usize {
        let routes = self.routes.lock().unwrap();
        routes.hits.get(route).copied().unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(mut stream: TcpStream, routes: Arc<Mutex<Routes>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default();
    let route = format!("{} {}", method, path);

    let reply = routes.lock().unwrap().answer(&route);

    let mut response = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        reply.body.len()
    );
    for (name, value) in &reply.headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response.push_str(&reply.body);

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Step context rooted at `dir`, writing into `dir/out`
pub fn context<'a>(job: &'a PipelineJob, config: &'a PipelineConfig, dir: &Path) -> StepContext<'a> {
    StepContext {
        cancel: CancellationToken::new(),
        job,
        config,
        job_dir: dir.to_path_buf(),
        output: dir.join("out"),
        checkpoint: dir.join("step.checkpoint.json"),
    }
}
