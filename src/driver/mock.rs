//! A scripted driver for exercising server and client behavior in tests.

use crate::driver::{ConnectionParams, Driver, ParamValue};
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared journal of operations a [`MockDriver`] has observed, in order.
pub type CallJournal = Arc<Mutex<Vec<String>>>;

/// Driver whose behavior is scripted by the test that builds it.
///
/// Records every operation into a shared journal so tests can assert on
/// arrival order, and can be told to fail `open` or `close`, or to stall
/// inside `call` to expose serialization behavior.
pub struct MockDriver {
    name: String,
    journal: CallJournal,
    fail_open: bool,
    fail_close: bool,
    call_delay: Duration,
    attributes: HashMap<String, ParamValue>,
    opened: bool,
}

impl MockDriver {
    /// A well-behaved mock named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            journal: Arc::new(Mutex::new(Vec::new())),
            fail_open: false,
            fail_close: false,
            call_delay: Duration::ZERO,
            attributes: HashMap::new(),
            opened: false,
        }
    }

    /// Makes `open` fail.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Makes `close` fail (close attempts are still journaled).
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Stalls every `call` by `delay`, to surface interleaving.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Handle to the shared operation journal.
    pub fn journal(&self) -> CallJournal {
        self.journal.clone()
    }

    fn record(&self, entry: String) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(entry);
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, _params: &ConnectionParams) -> LabResult<()> {
        self.record("open".to_string());
        if self.fail_open {
            return Err(LabError::DriverInit {
                driver: self.name.clone(),
                message: "scripted open failure".to_string(),
            });
        }
        self.opened = true;
        Ok(())
    }

    async fn call(&mut self, method: &str, args: &[ParamValue]) -> LabResult<ParamValue> {
        self.record(format!("call:{method}"));
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        match method {
            "echo" => Ok(args.first().cloned().unwrap_or(ParamValue::Null)),
            "fail" => Err(LabError::Invocation {
                method: method.to_string(),
                message: "scripted call failure".to_string(),
            }),
            _ => Ok(ParamValue::Null),
        }
    }

    async fn get(&mut self, attribute: &str) -> LabResult<ParamValue> {
        self.record(format!("get:{attribute}"));
        self.attributes
            .get(attribute)
            .cloned()
            .ok_or_else(|| LabError::Invocation {
                method: format!("get {attribute}"),
                message: format!("unknown attribute '{attribute}'"),
            })
    }

    async fn set(&mut self, attribute: &str, value: ParamValue) -> LabResult<()> {
        self.record(format!("set:{attribute}"));
        if attribute == "readonly" {
            return Err(LabError::Validation {
                attribute: attribute.to_string(),
                message: "attribute is read-only".to_string(),
            });
        }
        self.attributes.insert(attribute.to_string(), value);
        Ok(())
    }

    async fn close(&mut self) -> LabResult<()> {
        self.record("close".to_string());
        self.opened = false;
        if self.fail_close {
            return Err(LabError::Invocation {
                method: "close".to_string(),
                message: "scripted close failure".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_journal_records_order() {
        let mut driver = MockDriver::new("mock");
        let journal = driver.journal();

        driver.open(&ConnectionParams::new()).await.unwrap();
        driver.call("echo", &[ParamValue::Int(1)]).await.unwrap();
        driver.set("gain", ParamValue::Float(2.0)).await.unwrap();
        driver.get("gain").await.unwrap();
        driver.close().await.unwrap();

        let entries = journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["open", "call:echo", "set:gain", "get:gain", "close"]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let mut driver = MockDriver::new("bad").failing_open();
        assert!(driver.open(&ConnectionParams::new()).await.is_err());
        // close after a failed open is journaled and safe
        assert!(driver.close().await.is_ok());
    }
}
