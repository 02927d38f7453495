//! Test doubles shared by the unit tests

use crate::alerts::{Ack, AlarmMirror, MessagingBackend};
use crate::config::{Channel, RemediationSpec, Target};
use crate::error::{AlertError, ExecError};
use crate::model::{AlarmStatus, Observation, ProbeOutcome};
use crate::probe::ObservationSource;
use crate::remediation::{Credential, ExecOutput, RemoteExecutor};
use crate::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Target with a full remediation spec and default timings
pub(crate) fn remediable_target(name: &str) -> Target {
    let mut target = Target::probe_only(name, format!("https://{}.example.com/", name.to_lowercase()));
    target.remediation = Some(RemediationSpec {
        host: format!("{}.internal", name.to_lowercase()),
        user: "ubuntu".to_string(),
        command: "sudo systemctl restart apache2".to_string(),
        credential: format!("{}-key.pem", name.to_lowercase()),
    });
    target
}

/// Executor returning one programmable response, optionally after a delay
pub(crate) struct MockExecutor {
    response: Result<ExecOutput, ExecError>,
    delay: Option<Duration>,
    call_count: Arc<Mutex<usize>>,
}

impl MockExecutor {
    pub(crate) fn with_response(response: Result<ExecOutput, ExecError>) -> Self {
        Self {
            response,
            delay: None,
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    pub(crate) fn succeeding(stdout: &str) -> Self {
        Self::with_response(Ok(ExecOutput {
            exit_status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

impl RemoteExecutor for MockExecutor {
    fn exec<'a>(
        &'a self,
        _credential: &'a Credential,
        _user: &'a str,
        _host: &'a str,
        _command: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<ExecOutput, ExecError>> {
        Box::pin(async move {
            *self.call_count.lock().unwrap() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.response.clone()
        })
    }
}

/// Observation source replaying scripted cycles per target
///
/// Each `push` queues the observations for one call; once a target's queue
/// is empty the `always` fallback (or no observations) is returned.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    queued: Mutex<HashMap<String, VecDeque<Vec<ProbeOutcome>>>>,
    fallback: Mutex<HashMap<String, Vec<ProbeOutcome>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, target: &str, outcomes: Vec<ProbeOutcome>) {
        self.queued
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push_back(outcomes);
    }

    pub(crate) fn always(&self, target: &str, outcomes: Vec<ProbeOutcome>) {
        self.fallback
            .lock()
            .unwrap()
            .insert(target.to_string(), outcomes);
    }

    pub(crate) fn calls(&self, target: &str) -> usize {
        self.calls.lock().unwrap().get(target).copied().unwrap_or(0)
    }
}

impl ObservationSource for ScriptedSource {
    fn observe<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Vec<Observation>> {
        Box::pin(async move {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(target.name.clone())
                .or_default() += 1;

            let scripted = self
                .queued
                .lock()
                .unwrap()
                .get_mut(&target.name)
                .and_then(|queue| queue.pop_front());
            let outcomes = scripted.unwrap_or_else(|| {
                self.fallback
                    .lock()
                    .unwrap()
                    .get(&target.name)
                    .cloned()
                    .unwrap_or_default()
            });

            outcomes
                .into_iter()
                .enumerate()
                .map(|(i, outcome)| Observation::new(&target.name, outcome, format!("region-{}", i)))
                .collect()
        })
    }
}

/// One message seen by [`RecordingBackend`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PostedMessage {
    pub channel: String,
    pub text: String,
    pub thread_id: Option<String>,
}

/// Messaging backend recording every successful post
#[derive(Default)]
pub(crate) struct RecordingBackend {
    posts: Mutex<Vec<PostedMessage>>,
    failures_remaining: Mutex<usize>,
    delay: Option<Duration>,
    sequence: Mutex<u64>,
}

impl RecordingBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `count` posts with a delivery error
    pub(crate) fn fail_next(&self, count: usize) {
        *self.failures_remaining.lock().unwrap() = count;
    }

    pub(crate) fn posts(&self) -> Vec<PostedMessage> {
        self.posts.lock().unwrap().clone()
    }

    pub(crate) fn posts_to(&self, channel: &str) -> Vec<PostedMessage> {
        self.posts()
            .into_iter()
            .filter(|p| p.channel == channel)
            .collect()
    }

    /// Number of daily thread root messages posted
    pub(crate) fn root_posts(&self) -> usize {
        self.posts()
            .iter()
            .filter(|p| p.text.starts_with("Server monitoring report for"))
            .count()
    }
}

impl MessagingBackend for RecordingBackend {
    fn post_message<'a>(
        &'a self,
        channel: &'a Channel,
        text: &'a str,
        thread_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Ack, AlertError>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            {
                let mut failures = self.failures_remaining.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AlertError::Delivery("HTTP 503".to_string()));
                }
            }

            let id = {
                let mut sequence = self.sequence.lock().unwrap();
                *sequence += 1;
                *sequence
            };
            self.posts.lock().unwrap().push(PostedMessage {
                channel: channel.name.clone(),
                text: text.to_string(),
                thread_id: thread_id.map(str::to_string),
            });
            Ok(Ack {
                message_id: Some(format!("1760400000.{:06}", id)),
            })
        })
    }
}

/// Local HTTP endpoint answering every request with one canned response
pub(crate) struct HttpStub {
    pub url: String,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl HttpStub {
    pub(crate) async fn start(status_line: &'static str, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&bodies);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                if let Some(request_body) = read_request(&mut socket).await {
                    recorded.lock().unwrap().push(request_body);
                }
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        Self {
            url: format!("http://{}", addr),
            bodies,
        }
    }

    /// Request bodies received so far
    pub(crate) fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

pub(crate) async fn serve_json(status_line: &'static str, body: &'static str) -> String {
    HttpStub::start(status_line, body).await.url
}

/// Consume one request (headers plus Content-Length body) and return its body
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };
        request.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&request).into_owned();
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if request.len() >= end + 4 + length {
                return Some(text[end + 4..].to_string());
            }
        }
    }
}

/// Alarm mirror recording every trigger, optionally failing each one
#[derive(Default)]
pub(crate) struct RecordingMirror {
    triggered: Mutex<Vec<(String, AlarmStatus)>>,
    failing: bool,
}

impl RecordingMirror {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub(crate) fn triggered(&self) -> Vec<(String, AlarmStatus)> {
        self.triggered.lock().unwrap().clone()
    }
}

impl AlarmMirror for RecordingMirror {
    fn trigger<'a>(
        &'a self,
        target: &'a str,
        state: AlarmStatus,
        _reason: &'a str,
    ) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(async move {
            self.triggered
                .lock()
                .unwrap()
                .push((target.to_string(), state));
            if self.failing {
                Err(AlertError::Delivery("HTTP 502".to_string()))
            } else {
                Ok(())
            }
        })
    }
}
