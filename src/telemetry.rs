use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// 一条结构化事件
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub category: String,
    pub message: String,
    pub data: Value,
}

/// 结构化事件接收端
///
/// 由调用方构造后注入到 `HostDiscoverer`、`PlaybookRenderer`、`TaskExecutor`，
/// 不存在任何全局单例。
pub trait EventSink: Send + Sync {
    fn record(&self, level: EventLevel, category: &str, message: &str, data: Value);

    fn debug(&self, category: &str, message: &str, data: Value) {
        self.record(EventLevel::Debug, category, message, data);
    }

    fn info(&self, category: &str, message: &str, data: Value) {
        self.record(EventLevel::Info, category, message, data);
    }

    fn warning(&self, category: &str, message: &str, data: Value) {
        self.record(EventLevel::Warning, category, message, data);
    }

    fn error(&self, category: &str, message: &str, data: Value) {
        self.record(EventLevel::Error, category, message, data);
    }
}

/// 把事件转发给 tracing
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, level: EventLevel, category: &str, message: &str, data: Value) {
        match level {
            EventLevel::Debug => debug!(category, data = %data, "{}", message),
            EventLevel::Info => info!(category, data = %data, "{}", message),
            EventLevel::Warning => warn!(category, data = %data, "{}", message),
            EventLevel::Error => error!(category, data = %data, "{}", message),
        }
    }
}

/// 内存中的事件记录，主要用于测试和前端展示
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_in(&self, category: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, level: EventLevel, category: &str, message: &str, data: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(Event {
                timestamp: Utc::now(),
                level,
                category: category.to_string(),
                message: message.to_string(),
                data,
            });
        }
    }
}

pub fn tracing_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}
