// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rate-limited threshold alerts.
//!
//! A condition such as "upload endpoint failing" can persist for hours; the
//! alerter forwards the first occurrence per key and then holds further
//! repeats until the minimum repeat interval has elapsed.

use crate::sink::NotificationSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_MIN_REPEAT: Duration = Duration::from_secs(30 * 60);

pub struct Alerter {
    sink: Arc<dyn NotificationSink>,
    min_repeat: Duration,
    last_fired: Mutex<HashMap<String, Instant>>,
}

#[allow(clippy::expect_used)]
impl Alerter {
    pub fn new(sink: Arc<dyn NotificationSink>, min_repeat: Duration) -> Self {
        Alerter {
            sink,
            min_repeat,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Raises an alert for `key`, unless the same key fired within the
    /// minimum repeat interval. Suppressed repeats are still logged.
    pub async fn raise(&self, key: &str, message: &str) {
        if !self.should_fire(key) {
            warn!("Alert '{key}' suppressed (repeat within interval): {message}");
            return;
        }
        self.sink.notify(&format!("ALERT: {key}"), message).await;
    }

    fn should_fire(&self, key: &str) -> bool {
        let mut last_fired = self.last_fired.lock().expect("lock poisoned");
        let now = Instant::now();
        match last_fired.get(key) {
            Some(last) if now.duration_since(*last) < self.min_repeat => false,
            _ => {
                last_fired.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn notify(&self, _subject: &str, _body: &str) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn repeats_within_interval_are_suppressed() {
        let sink = Arc::new(CountingSink::default());
        let alerter = Alerter::new(sink.clone(), Duration::from_secs(3600));

        alerter.raise("upload-failures", "endpoint down").await;
        alerter.raise("upload-failures", "endpoint still down").await;
        alerter.raise("upload-failures", "endpoint down again").await;

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_fire_independently() {
        let sink = Arc::new(CountingSink::default());
        let alerter = Alerter::new(sink.clone(), Duration::from_secs(3600));

        alerter.raise("upload-failures", "endpoint down").await;
        alerter.raise("disk-space", "low disk").await;

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeat_fires_after_interval_elapses() {
        let sink = Arc::new(CountingSink::default());
        let alerter = Alerter::new(sink.clone(), Duration::from_millis(20));

        alerter.raise("disk-space", "low disk").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        alerter.raise("disk-space", "low disk").await;

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);
    }
}
