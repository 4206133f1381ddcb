use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use speed_trap_engine::limit::{LimitError, SpeedLimitRegister};
use tracing::{debug, info, warn};

/// Read `max_speed` from a `{"max_speed": n}` document. Integers, integral
/// floats and numeric strings are accepted; anything else is `None`.
pub fn max_speed(doc: &Value) -> Option<i64> {
    match doc.get("max_speed")? {
        Value::Number(n) => n.as_i64().or_else(|| {
            let f = n.as_f64()?;
            (f.fract() == 0.0 && f.abs() < 1e15).then_some(f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Periodically fetches the speed limit from a remote endpoint.
pub struct LimitPoller {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    register: Arc<SpeedLimitRegister>,
}

impl LimitPoller {
    pub fn new(
        url: String,
        interval: Duration,
        timeout: Duration,
        register: Arc<SpeedLimitRegister>,
    ) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PollError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url,
            interval,
            register,
        })
    }

    /// Fetch once and apply. Returns the limit now in force.
    pub async fn poll_once(&self) -> Result<u32, PollError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PollError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PollError::Status(response.status().as_u16()));
        }

        let doc: Value = response
            .json()
            .await
            .map_err(|e| PollError::Parse(e.to_string()))?;
        debug!(url = self.url, %doc, "fetched speed limit");

        apply(&doc, &self.register)
    }

    /// Poll forever. Failures are logged and the previous limit stays.
    pub async fn run(self) {
        info!(url = self.url, interval_secs = self.interval.as_secs(), "speed limit poller started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!(url = self.url, error = %e, "speed limit poll failed, keeping current limit");
            }
        }
    }
}

fn apply(doc: &Value, register: &SpeedLimitRegister) -> Result<u32, PollError> {
    let value = max_speed(doc).ok_or_else(|| PollError::Parse(format!("no usable max_speed in {doc}")))?;
    Ok(register.set(value)?.current)
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Parse(String),
    #[error(transparent)]
    Limit(#[from] LimitError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn max_speed_accepts_numbers_and_numeric_strings() {
        assert_eq!(max_speed(&json!({"max_speed": 50})), Some(50));
        assert_eq!(max_speed(&json!({"max_speed": 50.0})), Some(50));
        assert_eq!(max_speed(&json!({"max_speed": " 70 "})), Some(70));
        assert_eq!(max_speed(&json!({"max_speed": 50.5})), None);
        assert_eq!(max_speed(&json!({"max_speed": "fast"})), None);
        assert_eq!(max_speed(&json!({"max_speed": null})), None);
        assert_eq!(max_speed(&json!({"speed": 50})), None);
        assert_eq!(max_speed(&json!([50])), None);
    }

    #[test]
    fn apply_updates_register() {
        let register = SpeedLimitRegister::new(30).unwrap();
        assert_eq!(apply(&json!({"max_speed": 80}), &register).unwrap(), 80);
        assert_eq!(register.get(), 80);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let register = SpeedLimitRegister::new(30).unwrap();
        let err = apply(&json!({"max_speed": 500}), &register).unwrap_err();
        assert!(matches!(err, PollError::Limit(LimitError::OutOfRange { value: 500 })));
        assert_eq!(register.get(), 30);
    }

    #[test]
    fn malformed_document_is_ignored() {
        let register = SpeedLimitRegister::new(30).unwrap();
        let err = apply(&json!({"limit": 80}), &register).unwrap_err();
        assert!(matches!(err, PollError::Parse(_)));
        assert_eq!(register.get(), 30);
    }

    #[tokio::test]
    async fn unreachable_source_is_a_request_error() {
        let register = Arc::new(SpeedLimitRegister::new(30).unwrap());
        // Port 9 (discard) on loopback is closed in test environments.
        let poller = LimitPoller::new(
            "http://127.0.0.1:9/setspeedlimit".into(),
            Duration::from_secs(60),
            Duration::from_millis(500),
            Arc::clone(&register),
        )
        .unwrap();
        assert!(matches!(poller.poll_once().await, Err(PollError::Request(_))));
        assert_eq!(register.get(), 30);
    }
}
