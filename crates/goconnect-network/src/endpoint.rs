//! Public endpoint observation
//!
//! Holds the reflexive `ip:port` learned from STUN and notifies a single
//! registered callback on change. Setting an already-equal value is a
//! no-op, except the empty string which always fires to signal loss of
//! the mapping.

use std::sync::{Arc, Mutex};

/// Callback invoked with the new endpoint value.
pub type EndpointCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Inner {
    endpoint: String,
    callback: Option<EndpointCallback>,
}

/// Shared observation slot; mutated only by the STUN probe loop.
#[derive(Default)]
pub struct EndpointObservation {
    inner: Mutex<Inner>,
}

impl EndpointObservation {
    /// Create an empty observation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current endpoint, empty when unknown.
    pub fn get(&self) -> String {
        self.inner.lock().unwrap().endpoint.clone()
    }

    /// Publish a new observation.
    pub fn set(&self, endpoint: &str) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if inner.endpoint == endpoint && !endpoint.is_empty() {
                return;
            }
            inner.endpoint = endpoint.to_string();
            inner.callback.clone()
        };
        // invoke outside the lock
        if let Some(cb) = callback {
            cb(endpoint);
        }
    }

    /// Register the change callback; fires immediately when an endpoint
    /// is already known.
    pub fn set_callback(&self, callback: EndpointCallback) {
        let current = {
            let mut inner = self.inner.lock().unwrap();
            inner.callback = Some(callback.clone());
            inner.endpoint.clone()
        };
        if !current.is_empty() {
            callback(&current);
        }
    }
}
