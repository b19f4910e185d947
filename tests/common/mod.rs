#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    Router,
};
use tokio::net::TcpListener;
use tokio::time::Instant;

/// Serve `app` on an ephemeral localhost port.
pub async fn spawn_router(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
    pub at: Instant,
}

/// Stand-in for the management service. Answers with the queued statuses in
/// order, then 200 once the queue is empty.
#[derive(Clone, Default)]
pub struct MockManagement {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockManagement {
    pub async fn spawn(statuses: &[u16]) -> (String, Self) {
        let mock = Self {
            statuses: Arc::new(Mutex::new(statuses.iter().copied().collect())),
            requests: Arc::default(),
        };
        let app = Router::new().fallback(record).with_state(mock.clone());
        let addr = spawn_router(app).await;
        (format!("http://{addr}"), mock)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

async fn record(
    State(mock): State<MockManagement>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    mock.requests.lock().unwrap().push(Recorded {
        path: uri.path().to_string(),
        authorization: header("authorization"),
        content_type: header("content-type"),
        body,
        at: Instant::now(),
    });
    let code = mock.statuses.lock().unwrap().pop_front().unwrap_or(200);
    let status = StatusCode::from_u16(code).unwrap();
    (status, format!("mock {code}"))
}

/// Plain-text endpoint returning `body` and counting hits.
pub async fn spawn_text_endpoint(body: &'static str) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().fallback(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            body
        }
    });
    let addr = spawn_router(app).await;
    (format!("http://{addr}/ip"), hits)
}

/// A localhost URL nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -oX out.xml 10.0.0.1" start="1700000000">
<host starttime="1700000001" endtime="1700000009">
<status state="up" reason="syn-ack"/>
<address addr="10.0.0.1" addrtype="ipv4"/>
<hostnames><hostname name="gw.lan" type="PTR"/></hostnames>
<ports>
<extraports state="closed" count="998"/>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh" product="OpenSSH" version="9.6" extrainfo="protocol 2.0"/></port>
<port protocol="tcp" portid="443"><state state="open" reason="syn-ack"/></port>
</ports>
</host>
<runstats><finished time="1700000010"/></runstats>
</nmaprun>
"#;

/// Write an executable stand-in for nmap into `dir`.
///
/// It is invoked as `<script> -oX <path> <tokens...>`; it echoes its tokens,
/// writes `xml` (if any) to `<path>`, sleeps `sleep_secs` and exits with `exit_code`.
#[cfg(unix)]
pub fn fake_scanner(dir: &Path, xml: Option<&str>, exit_code: i32, sleep_secs: u32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let mut script = String::from("#!/bin/sh\nout=\"$2\"\nshift 2\necho \"scanning $*\"\necho \"note on stderr\" >&2\n");
    if let Some(xml) = xml {
        script.push_str("cat > \"$out\" <<'__XML__'\n");
        script.push_str(xml);
        script.push_str("\n__XML__\n");
    }
    if sleep_secs > 0 {
        script.push_str(&format!("sleep {sleep_secs}\n"));
    }
    script.push_str(&format!("exit {exit_code}\n"));

    let path = dir.join(format!("fake-nmap-{exit_code}-{sleep_secs}.sh"));
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
