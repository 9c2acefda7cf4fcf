// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! In-app notifications, newest first, capped so the list never grows
//! unbounded. The dashboard rendering is out of scope; the agent only keeps
//! the ring and an ack flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap to prevent unbounded growth.
pub const MAX_NOTIFICATIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub level: Level,
    pub title: String,
    pub message: String,
    pub ts: DateTime<Utc>,
    pub ack: bool,
}

impl Notification {
    pub fn new(level: Level, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            level,
            title: title.into(),
            message: message.into(),
            ts: Utc::now(),
            ack: false,
        }
    }
}

/// Insert at the front, dropping anything past the cap.
pub fn push(ring: &mut std::collections::VecDeque<Notification>, n: Notification) {
    ring.push_front(n);
    ring.truncate(MAX_NOTIFICATIONS);
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn newest_notification_is_first() {
        let mut ring = VecDeque::new();
        push(&mut ring, Notification::new(Level::Info, "first", ""));
        push(&mut ring, Notification::new(Level::Warn, "second", ""));
        assert_eq!(ring[0].title, "second");
        assert_eq!(ring[1].title, "first");
    }

    #[test]
    fn ring_is_capped() {
        let mut ring = VecDeque::new();
        for i in 0..(MAX_NOTIFICATIONS + 10) {
            push(&mut ring, Notification::new(Level::Info, format!("n{i}"), ""));
        }
        assert_eq!(ring.len(), MAX_NOTIFICATIONS);
        assert_eq!(ring[0].title, format!("n{}", MAX_NOTIFICATIONS + 9));
    }
}
