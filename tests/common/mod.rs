#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;

use xref_fetch::cancel::Sleeper;
use xref_fetch::domain::{RetrievalTask, SpeciesContext};
use xref_fetch::error::XrefError;
use xref_fetch::transport::{HttpRequest, HttpResponse, Transport, TransportError};

/// Replays queued replies in order, then answers 200 with `fallback`.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    fallback: Vec<u8>,
    pub sent: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: b"ok\n".to_vec(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, body: &str) -> Self {
        self.fallback = body.as_bytes().to_vec();
        self
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.sent.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: &HttpRequest,
        connect_timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((request.url.clone(), connect_timeout));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(200, self.fallback.clone())))
    }
}

/// Records every requested wait and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    pub waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), XrefError> {
        self.waits.lock().unwrap().push(duration);
        Ok(())
    }
}

pub fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

pub fn task(name: &str, url: &str, destination: Utf8PathBuf) -> RetrievalTask {
    RetrievalTask {
        retriever: name.to_string(),
        source_locator: url.to_string(),
        destination,
        max_age: Duration::from_secs(3600),
        identifiers: Vec::new(),
        context: SpeciesContext::default(),
        retry_budget: 3,
    }
}
