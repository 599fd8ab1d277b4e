//! Test mock for the `shell::run_host*` family.
//!
//! Installs a thread-local handler that intercepts host commands, answers
//! them from prefix rules, and records every command line it saw.

use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

/// Mock response for a host command.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub(crate) fn to_output(&self) -> Output {
        Output {
            // Unix exit code encoding: status = code << 8
            status: ExitStatus::from_raw(self.exit_code << 8),
            stdout: self.stdout.as_bytes().to_vec(),
            stderr: self.stderr.as_bytes().to_vec(),
        }
    }
}

type MockHandler = Box<dyn Fn(&str) -> MockResponse>;

thread_local! {
    static HANDLER: RefCell<Option<MockHandler>> = const { RefCell::new(None) };
}

/// Guard that clears the mock handler on drop.
pub struct MockGuard;

impl Drop for MockGuard {
    fn drop(&mut self) {
        HANDLER.with(|h| *h.borrow_mut() = None);
    }
}

/// Try to intercept a host command via the installed mock handler.
pub(crate) fn intercept(command_line: &str) -> Option<Output> {
    HANDLER.with(|h| h.borrow().as_ref().map(|f| f(command_line).to_output()))
}

/// Command lines observed by the mock, in order.
pub type SharedCalls = Arc<Mutex<Vec<String>>>;

type DynamicRule = Box<dyn Fn(&str) -> Option<MockResponse>>;

/// Build a mock answering by command-line prefix.
pub fn mock_commands() -> MockCommandsBuilder {
    MockCommandsBuilder {
        rules: Vec::new(),
        dynamic: Vec::new(),
    }
}

pub struct MockCommandsBuilder {
    rules: Vec<(String, MockResponse)>,
    dynamic: Vec<DynamicRule>,
}

impl MockCommandsBuilder {
    /// Answer commands starting with `prefix`. First matching rule wins.
    pub fn on(mut self, prefix: &str, response: MockResponse) -> Self {
        self.rules.push((prefix.to_string(), response));
        self
    }

    /// Answer with a closure; consulted before the static rules.
    pub fn on_fn(mut self, f: impl Fn(&str) -> Option<MockResponse> + 'static) -> Self {
        self.dynamic.push(Box::new(f));
        self
    }

    /// Install the mock. Unmatched commands succeed with empty output.
    pub fn install(self) -> (MockGuard, SharedCalls) {
        let calls: SharedCalls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let rules = self.rules;
        let dynamic = self.dynamic;

        HANDLER.with(|h| {
            *h.borrow_mut() = Some(Box::new(move |line: &str| {
                recorded.lock().unwrap().push(line.to_string());
                for rule in &dynamic {
                    if let Some(resp) = rule(line) {
                        return resp;
                    }
                }
                rules
                    .iter()
                    .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                    .map(|(_, resp)| resp.clone())
                    .unwrap_or_else(MockResponse::empty)
            }));
        });

        (MockGuard, calls)
    }
}
