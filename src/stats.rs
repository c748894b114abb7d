//! Service counters shared by the webhook handlers and background tasks.

use crate::config::Config;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct StatsCollector {
    started: Instant,
    started_at: chrono::DateTime<chrono::Local>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    tasks_processed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub tasks_processed: u64,
}

impl StatsSnapshot {
    /// Percentage of successful requests, rounded to two decimals.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        let rate = self.successful_requests as f64 / self.total_requests as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: chrono::Local::now(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            tasks_processed: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, ok: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_tasks(&self) {
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn ai_json(config: &Config) -> Value {
        json!({
            "provider": config.ai.provider,
            "model": config.ai.model_name,
            "api_key_configured": config.ai.has_api_key(),
        })
    }

    /// Body of `GET /health`. `gateway_available` is `None` when the bridge
    /// is disabled.
    pub fn health_json(&self, config: &Config, gateway_available: Option<bool>) -> Value {
        let snapshot = self.snapshot();
        json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            "service": config.app.name,
            "version": config.app.version,
            "uptime": self.uptime_secs(),
            "stats": {
                "total_requests": snapshot.total_requests,
                "successful_requests": snapshot.successful_requests,
                "failed_requests": snapshot.failed_requests,
                "tasks_processed": snapshot.tasks_processed,
            },
            "ai_config": Self::ai_json(config),
            "agent_gateway": {
                "enabled": gateway_available.is_some(),
                "available": gateway_available.unwrap_or(false),
            },
        })
    }

    /// Body of `GET /stats`.
    pub fn detailed_json(&self, config: &Config) -> Value {
        let snapshot = self.snapshot();
        json!({
            "uptime": self.uptime_secs(),
            "start_time": self.started_at.to_rfc3339(),
            "requests": {
                "total": snapshot.total_requests,
                "successful": snapshot.successful_requests,
                "failed": snapshot.failed_requests,
                "success_rate": snapshot.success_rate(),
            },
            "tasks": { "processed": snapshot.tasks_processed },
            "ai": Self::ai_json(config),
            "config": {
                "server_port": config.server.port,
                "rate_limit_per_minute": config.security.rate_limit_per_minute,
                "event_verification_enabled": config.security.enable_event_verification,
                "ip_whitelist_enabled": config.security.enable_ip_whitelist,
            },
        })
    }
}
