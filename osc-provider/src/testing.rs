//! Scripted in-memory cloud for handler tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use crate::api::{ApiClient, ApiError, CloudApi, Service};

type Reply = Result<JsonValue, ApiError>;

/// Replies to each action from a queue; the last reply of a queue repeats forever
/// and unscripted actions answer `{}`
#[derive(Default)]
pub struct FakeCloud {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(Service, String, JsonValue)>>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>) -> ApiClient {
        ApiClient::new(self.clone())
    }

    fn push(&self, action: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(action.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn reply(&self, action: &str, response: JsonValue) -> &Self {
        self.push(action, Ok(response));
        self
    }

    pub fn fail(&self, action: &str, code: &str, message: &str) -> &Self {
        self.push(action, Err(ApiError::new(code, message)));
        self
    }

    /// Action names in call order
    pub fn actions(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, action, _)| action.clone())
            .collect()
    }

    /// Mutating actions in call order (describes and reads filtered out)
    pub fn mutations(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter(|a| !a.starts_with("Describe") && !a.starts_with("Read"))
            .collect()
    }

    pub fn requests(&self, action: &str) -> Vec<JsonValue> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, a, _)| a == action)
            .map(|(_, _, request)| request.clone())
            .collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.requests(action).len()
    }

    pub fn services(&self) -> Vec<Service> {
        self.calls.lock().unwrap().iter().map(|(s, _, _)| *s).collect()
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn call(&self, service: Service, action: &str, request: JsonValue) -> Reply {
        self.calls
            .lock()
            .unwrap()
            .push((service, action.to_string(), request));

        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(action) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Ok(json!({}))),
            Some(queue) => queue.front().cloned().unwrap_or(Ok(json!({}))),
            None => Ok(json!({})),
        }
    }
}
