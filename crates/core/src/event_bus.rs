//! Unified event bus: trait for emitting lifecycle events from any module.
//!
//! Components accept an `Arc<dyn EventSink>` and report enrollment and
//! campaign transitions through it. The sink decides where events go
//! (activity feed, chat notifications, analytics warehouse).

use crate::types::{AnalyticsEvent, EventType};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// Sink that forwards every event to `tracing` at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: AnalyticsEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            campaign_id = %event.campaign_id,
            enrollment_id = ?event.enrollment_id,
            account_id = ?event.account_id,
            step_order = ?event.step_order,
            detail = ?event.detail,
            "Lifecycle event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `AnalyticsEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    campaign_id: Uuid,
    enrollment_id: Option<Uuid>,
    account_id: Option<String>,
) -> AnalyticsEvent {
    AnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        campaign_id,
        enrollment_id,
        account_id,
        step_order: None,
        detail: None,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
