//! Shared fakes for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::Result;
use serde_json::Value;

use crate::api::{ApiReply, ApiTransport};
use crate::shell::{CommandRunner, ShellLine};

/// Build a reply with the given HTTP status and JSON body.
pub fn reply(http_status: u16, body: Value) -> ApiReply {
    ApiReply { http_status, body }
}

/// A request seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: &'static str,
    pub url: String,
    pub params: Vec<(String, String)>,
}

impl Request {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<ApiReply>,
    requests: Vec<Request>,
}

/// Transport answering from a queue of canned replies and recording requests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Rc<RefCell<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: ApiReply) {
        self.script.borrow_mut().replies.push_back(reply);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.script.borrow().requests.clone()
    }

    fn answer(&self, method: &'static str, url: &str, params: &[(&str, &str)]) -> Result<ApiReply> {
        let mut script = self.script.borrow_mut();
        script.requests.push(Request {
            method,
            url: url.to_string(),
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
        script
            .replies
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted reply for {method} {url}"))
    }
}

impl ApiTransport for ScriptedTransport {
    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<ApiReply> {
        self.answer("POST", url, form)
    }

    fn get_query(&self, url: &str, query: &[(&str, &str)]) -> Result<ApiReply> {
        self.answer("GET", url, query)
    }
}

/// Runner that records shell lines instead of executing them.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    lines: Rc<RefCell<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&mut self, line: &ShellLine) -> Result<()> {
        self.lines.borrow_mut().push(line.as_str().to_string());
        Ok(())
    }
}
