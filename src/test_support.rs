//! Scripted transport and store doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{StorageError, TransportError};
use crate::storage::KeyValueStore;
use crate::transport::HttpTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
}

/// How the mock answers one request
#[derive(Clone)]
pub enum Reply {
    Ok(String),
    Status(u16),
    Fail,
    /// Never completes; only a caller-side timeout ends it
    Hang,
    /// Completes with `Ok` once the notify fires
    Gate(Arc<Notify>, String),
}

#[derive(Clone, Debug)]
pub struct Call {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Call {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(self.body.as_deref().unwrap_or("null")).unwrap()
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

struct Script {
    queued: VecDeque<Reply>,
    fallback: Reply,
}

pub struct MockTransport {
    scripts: Mutex<HashMap<Method, Script>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    /// Every endpoint succeeds; geocoding answers with a display name
    pub fn new() -> Arc<Self> {
        let mut scripts = HashMap::new();
        scripts.insert(
            Method::Get,
            Script {
                queued: VecDeque::new(),
                fallback: Reply::Ok(r#"{"display_name": "Main Street, Springfield"}"#.to_string()),
            },
        );
        for method in [Method::Put, Method::Post] {
            scripts.insert(
                method,
                Script {
                    queued: VecDeque::new(),
                    fallback: Reply::Ok(String::new()),
                },
            );
        }
        Arc::new(Self {
            scripts: Mutex::new(scripts),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Reply used once the queued replies for `method` run out
    pub fn set_default(&self, method: Method, reply: Reply) {
        self.scripts.lock().unwrap().get_mut(&method).unwrap().fallback = reply;
    }

    pub fn push(&self, method: Method, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&method)
            .unwrap()
            .queued
            .push_back(reply);
    }

    pub fn calls(&self, method: Method) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: Method) -> usize {
        self.calls(method).len()
    }

    fn record(&self, method: Method, url: &str, query: &[(&str, String)], body: Option<String>) -> Reply {
        self.calls.lock().unwrap().push(Call {
            method,
            url: url.to_string(),
            query: query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            body,
        });
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(&method).unwrap();
        script.queued.pop_front().unwrap_or_else(|| script.fallback.clone())
    }

    async fn answer(reply: Reply) -> Result<String, TransportError> {
        match reply {
            Reply::Ok(body) => Ok(body),
            Reply::Status(code) => Err(TransportError::Status(code)),
            Reply::Fail => Err(TransportError::Network("connection refused".to_string())),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Reply::Gate(notify, body) => {
                notify.notified().await;
                Ok(body)
            }
        }
    }
}

impl HttpTransport for MockTransport {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, TransportError> {
        let reply = self.record(Method::Get, url, query, None);
        Self::answer(reply).await.map(String::into_bytes)
    }

    async fn put_json(&self, url: &str, json_body: String) -> Result<(), TransportError> {
        let reply = self.record(Method::Put, url, &[], Some(json_body));
        Self::answer(reply).await.map(|_| ())
    }

    async fn post_json(&self, url: &str, json_body: String) -> Result<(), TransportError> {
        let reply = self.record(Method::Post, url, &[], Some(json_body));
        Self::answer(reply).await.map(|_| ())
    }
}

/// In-memory store whose writes can be switched to fail
#[derive(Default)]
pub struct FlakyStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().unwrap().get(key).cloned()
    }
}

impl KeyValueStore for FlakyStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk full".to_string()));
        }
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Poll `cond` until it holds, failing the test after a generous bound
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
