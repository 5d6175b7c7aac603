//! Minimal scripted HTTP/1.1 fixture for exercising the blocking
//! client without a real serving endpoint.
//!
//! Serves one canned reply per accepted connection, in order, and
//! hands the captured requests back on `finish`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};

/// One scripted response.
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn error(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// A captured request.
#[derive(Debug)]
pub struct Request {
    pub path: String,
    pub body: String,
}

pub struct Fixture {
    pub base_url: String,
    handle: JoinHandle<Vec<Request>>,
}

impl Fixture {
    /// Wait for every scripted reply to be served and return the
    /// captured requests.
    pub fn finish(self) -> Vec<Request> {
        self.handle.join().expect("fixture server panicked")
    }
}

/// Spawn the fixture; it serves exactly `replies.len()` connections.
pub fn spawn_http(replies: Vec<Reply>) -> Fixture {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture listener");
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let mut captured = Vec::new();
        for reply in replies {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("request line");
            let path = request_line
                .split_whitespace()
                .nth(1)
                .unwrap_or("")
                .to_string();

            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("header line");
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some(value) = line
                    .to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(str::trim)
                    .and_then(|v| v.parse().ok())
                {
                    content_length = value;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).expect("request body");
            captured.push(Request {
                path,
                body: String::from_utf8_lossy(&body).into_owned(),
            });

            let reason = match reply.status {
                200 => "OK",
                404 => "Not Found",
                500 => "Internal Server Error",
                _ => "Unknown",
            };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                reply.status,
                reason,
                reply.body.len(),
                reply.body
            );
            let mut stream = reader.into_inner();
            stream.write_all(response.as_bytes()).expect("write reply");
            stream.flush().expect("flush reply");
        }
        captured
    });
    Fixture { base_url, handle }
}

/// A well-formed three-frame generation stream with engine counters.
pub fn generate_stream_body(fragments: &[&str], eval_count: u64, eval_duration_ns: u64) -> String {
    let mut body = String::new();
    for fragment in fragments {
        body.push_str(&format!(
            "{}\n",
            serde_json::json!({"response": fragment, "done": false})
        ));
    }
    body.push_str(&format!(
        "{}\n",
        serde_json::json!({
            "done": true,
            "eval_count": eval_count,
            "eval_duration": eval_duration_ns,
            "total_duration": eval_duration_ns + 500_000_000u64,
            "load_duration": 100_000_000u64,
            "prompt_eval_duration": 50_000_000u64,
            "context": [11, 22, 33]
        })
    ));
    body
}

/// A one-model `/api/tags` payload.
pub fn tags_body(model: &str) -> String {
    serde_json::json!({
        "models": [{
            "name": model,
            "digest": "sha256:deadbeef",
            "details": {
                "family": "llama",
                "families": ["llama"],
                "parameter_size": "3.2B",
                "quantization_level": "Q4_K_M"
            }
        }]
    })
    .to_string()
}
