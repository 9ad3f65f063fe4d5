#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

pub const SERIES_PATH: &str = "/fiction/1/test-serial";
pub const SLUG: &str = "test-serial";

/// Local serial site: an overview page plus chapters `1..=published`, each
/// linking to the next with a "Next Chapter" button.
pub struct SerialServer {
    pub base_url: String,
    published: Arc<AtomicUsize>,
    overview_first: Arc<AtomicUsize>,
    flaky: Arc<Mutex<HashSet<usize>>>,
    broken: Arc<Mutex<HashSet<usize>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SerialServer {
    pub fn start(chapters: usize) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());

        let published = Arc::new(AtomicUsize::new(chapters));
        let overview_first = Arc::new(AtomicUsize::new(1));
        let flaky = Arc::new(Mutex::new(HashSet::new()));
        let broken = Arc::new(Mutex::new(HashSet::new()));
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();

        let state = ServerState {
            published: published.clone(),
            overview_first: overview_first.clone(),
            flaky: flaky.clone(),
            broken: broken.clone(),
            hits: hits.clone(),
        };
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(20)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let path = request
                    .url()
                    .split('?')
                    .next()
                    .unwrap_or_default()
                    .to_owned();
                *state.hits.lock().expect("hits lock").entry(path.clone()).or_insert(0) += 1;
                let _ = request.respond(state.respond(&path));
            }
        });

        Self {
            base_url,
            published,
            overview_first,
            flaky,
            broken,
            hits,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn overview_url(&self) -> String {
        format!("{}{SERIES_PATH}", self.base_url)
    }

    pub fn chapter_url(&self, n: usize) -> String {
        format!("{}{}", self.base_url, chapter_path(n))
    }

    pub fn hits(&self, n: usize) -> usize {
        self.hits
            .lock()
            .expect("hits lock")
            .get(&chapter_path(n))
            .copied()
            .unwrap_or(0)
    }

    pub fn chapter_hits(&self) -> usize {
        self.hits
            .lock()
            .expect("hits lock")
            .iter()
            .filter(|(path, _)| path.contains("/chapter/"))
            .map(|(_, count)| *count)
            .sum()
    }

    /// Makes chapters up to `n` reachable; earlier last chapters gain a
    /// next link.
    pub fn publish(&self, n: usize) {
        self.published.store(n, Ordering::SeqCst);
    }

    pub fn set_overview_first(&self, n: usize) {
        self.overview_first.store(n, Ordering::SeqCst);
    }

    /// Chapter `n` answers 503 until healed.
    pub fn make_flaky(&self, n: usize) {
        self.flaky.lock().expect("flaky lock").insert(n);
    }

    pub fn heal(&self, n: usize) {
        self.flaky.lock().expect("flaky lock").remove(&n);
    }

    /// Chapter `n` answers 200 with a page lacking the content container.
    pub fn make_broken(&self, n: usize) {
        self.broken.lock().expect("broken lock").insert(n);
    }
}

impl Drop for SerialServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct ServerState {
    published: Arc<AtomicUsize>,
    overview_first: Arc<AtomicUsize>,
    flaky: Arc<Mutex<HashSet<usize>>>,
    broken: Arc<Mutex<HashSet<usize>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl ServerState {
    fn respond(&self, path: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
        let published = self.published.load(Ordering::SeqCst);
        if path == SERIES_PATH {
            let first = self.overview_first.load(Ordering::SeqCst);
            return html_response(200, overview_html(first));
        }
        let Some(n) = chapter_number(path).filter(|n| (1..=published).contains(n)) else {
            return html_response(404, "<html><body>not found</body></html>".to_owned());
        };
        if self.flaky.lock().expect("flaky lock").contains(&n) {
            return html_response(503, "<html><body>busy</body></html>".to_owned()).with_header(
                tiny_http::Header::from_bytes(&b"Retry-After"[..], &b"0"[..])
                    .expect("retry-after header"),
            );
        }
        let has_next = n < published;
        if self.broken.lock().expect("broken lock").contains(&n) {
            return html_response(200, broken_chapter_html(n, has_next));
        }
        html_response(200, chapter_html(n, has_next))
    }
}

fn html_response(status: u16, body: String) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    tiny_http::Response::from_string(body)
        .with_status_code(status)
        .with_header(
            tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
                .expect("content-type header"),
        )
}

pub fn chapter_path(n: usize) -> String {
    format!("{SERIES_PATH}/chapter/{n}/part-{n}")
}

fn chapter_number(path: &str) -> Option<usize> {
    let rest = path.strip_prefix(&format!("{SERIES_PATH}/chapter/"))?;
    rest.split('/').next()?.parse().ok()
}

pub fn overview_html(first: usize) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
  <title>Test Serial | Example</title>
  <meta property="og:description" content="A serial for tests.">
  <meta name="keywords" content="Fantasy, Testing">
  <script type="application/ld+json">{{"@type": "Book", "author": {{"name": "Test Author"}}}}</script>
</head>
<body>
  <div class="fic-title"><h1>Test Serial</h1></div>
  <a class="btn btn-primary" href="{}">Start Reading</a>
</body>
</html>
"#,
        chapter_path(first)
    )
}

pub fn chapter_html(n: usize, has_next: bool) -> String {
    let next = if has_next {
        format!(
            r#"<a class="btn btn-primary" href="{}">Next Chapter</a>"#,
            chapter_path(n + 1)
        )
    } else {
        r#"<a class="btn btn-primary" disabled>Next Chapter</a>"#.to_owned()
    };
    let previous = if n > 1 {
        format!(
            r#"<a class="btn btn-primary" href="{}">Previous Chapter</a>"#,
            chapter_path(n - 1)
        )
    } else {
        String::new()
    };
    format!(
        r#"<!doctype html>
<html>
<head><title>Part {n} - Test Serial | Example</title></head>
<body>
  <div class="fic-header"><h1>Part {n}</h1></div>
  {previous}
  <div class="chapter-inner chapter-content">
    <p>Body of part {n}.</p>
    <script>track();</script>
  </div>
  {next}
</body>
</html>
"#
    )
}

fn broken_chapter_html(n: usize, has_next: bool) -> String {
    let next = if has_next {
        format!(
            r#"<a class="btn btn-primary" href="{}">Next Chapter</a>"#,
            chapter_path(n + 1)
        )
    } else {
        String::new()
    };
    format!(
        r#"<!doctype html>
<html><body><h1>Part {n}</h1><p>This chapter was removed.</p>{next}</body></html>
"#
    )
}
