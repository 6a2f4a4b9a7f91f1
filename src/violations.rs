//! Moderation signals: severity mapping, send lockout and transient
//! notifications.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::{BanState, Notification, ViolationLevel, ViolationRecord};
use crate::protocol::inbound::ViolationNotice;

/// Longest lockout honoured from a server frame (one year). Larger values
/// are clamped.
pub const MAX_BAN_SECONDS: u64 = 365 * 24 * 60 * 60;

/// How long a processed violation's dedup key is remembered.
const DEDUP_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Phrases the chat service puts in plain-text moderation replies.
pub const MODERATION_MARKERS: [&str; 4] = [
    "Cảnh báo",
    "cấm chat",
    "Tài khoản của bạn đã bị khóa",
    "Email thông báo",
];

pub fn has_moderation_marker(text: &str) -> bool {
    MODERATION_MARKERS.iter().any(|m| text.contains(m))
}

/// Severity implied by the duration phrase in a moderation message.
pub fn level_from_text(text: &str) -> ViolationLevel {
    if text.contains("5 phút") {
        ViolationLevel::FiveMinutes
    } else if text.contains("1 giờ") {
        ViolationLevel::OneHour
    } else if text.contains("1 ngày") {
        ViolationLevel::OneDay
    } else {
        ViolationLevel::Warning
    }
}

/// Where violation alerts are displayed.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
    fn dismiss(&self, id: &str);
}

/// Sink that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, notification: &Notification) {
        warn!(
            severity = notification.severity.as_u8(),
            "Moderation notice: {}", notification.message
        );
    }

    fn dismiss(&self, _id: &str) {}
}

#[derive(Debug)]
struct ActiveBan {
    until: Instant,
    until_utc: DateTime<Utc>,
}

/// Outcome of recording a violation the tracker had not seen before.
#[derive(Debug, Clone)]
pub struct AcceptedViolation {
    pub record: ViolationRecord,
    pub notification: Notification,
    /// Deadline after which the notification is dismissed.
    pub expires_at: Instant,
    /// End of the send lockout, when this violation imposed one.
    pub ban_until: Option<Instant>,
}

pub struct ViolationTracker {
    notification_ttl: Duration,
    ban: Option<ActiveBan>,
    seen: HashMap<String, Instant>,
    live: Vec<String>,
    next_id: u64,
}

impl ViolationTracker {
    pub fn new(notification_ttl: Duration) -> Self {
        Self { notification_ttl, ban: None, seen: HashMap::new(), live: Vec::new(), next_id: 0 }
    }

    /// Records a violation. Returns `None` when the same violation (by
    /// origin id, origin timestamp, or message plus receive time) was
    /// already processed.
    pub fn record(
        &mut self,
        notice: &ViolationNotice,
        now: Instant,
        received_at: DateTime<Utc>,
    ) -> Option<AcceptedViolation> {
        self.seen.retain(|_, at| now.saturating_duration_since(*at) < DEDUP_RETENTION);
        let key = dedup_key(notice, received_at);
        if self.seen.contains_key(&key) {
            info!("Duplicate violation ignored: {}", notice.message);
            return None;
        }
        self.seen.insert(key, now);

        let ban_seconds = notice.ban_seconds.min(MAX_BAN_SECONDS);
        if ban_seconds < notice.ban_seconds {
            warn!(requested = notice.ban_seconds, "Clamping oversized ban to {ban_seconds}s");
        }
        let ban_until = if ban_seconds > 0 {
            let span = Duration::from_secs(ban_seconds);
            let until = now.checked_add(span).unwrap_or(now);
            let until_utc = chrono::Duration::from_std(span)
                .ok()
                .and_then(|span| received_at.checked_add_signed(span))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            // A shorter ban never cuts an active longer one.
            let extend = self.ban.as_ref().map_or(true, |b| b.until < until);
            if extend {
                self.ban = Some(ActiveBan { until, until_utc });
            }
            warn!(
                level = notice.level.as_u8(),
                ban_seconds,
                "Sending locked out after moderation violation"
            );
            Some(until)
        } else {
            None
        };

        self.next_id += 1;
        let notification = Notification {
            id: format!("violation-{}-{}", received_at.timestamp_millis(), self.next_id),
            message: notice.message.clone(),
            severity: notice.level,
        };
        self.live.push(notification.id.clone());

        Some(AcceptedViolation {
            record: ViolationRecord {
                message: notice.message.clone(),
                level: notice.level,
                ban_seconds,
                timestamp: notice.timestamp.unwrap_or(received_at),
            },
            notification,
            expires_at: now + self.notification_ttl,
            ban_until,
        })
    }

    /// Whether sending is locked out at `now`. A lapsed ban is dropped here.
    pub fn is_banned(&mut self, now: Instant) -> bool {
        match &self.ban {
            Some(ban) if ban.until > now => true,
            Some(_) => {
                info!("Send lockout lapsed");
                self.ban = None;
                false
            }
            None => false,
        }
    }

    pub fn ban_state(&self) -> BanState {
        match &self.ban {
            Some(ban) => BanState { is_banned: true, banned_until: Some(ban.until_utc) },
            None => BanState::default(),
        }
    }

    pub fn ban_deadline(&self) -> Option<Instant> {
        self.ban.as_ref().map(|b| b.until)
    }

    pub fn clear_ban(&mut self) {
        self.ban = None;
    }

    /// Marks a notification as expired. Returns false for ids that are no
    /// longer live.
    pub fn expire(&mut self, id: &str) -> bool {
        let before = self.live.len();
        self.live.retain(|live| live != id);
        self.live.len() != before
    }

    /// Drops ban, live notifications and dedup history. Returns the ids
    /// that were still displayed.
    pub fn reset(&mut self) -> Vec<String> {
        self.ban = None;
        self.seen.clear();
        std::mem::take(&mut self.live)
    }
}

fn dedup_key(notice: &ViolationNotice, received_at: DateTime<Utc>) -> String {
    if let Some(id) = &notice.id {
        return format!("id:{id}");
    }
    match &notice.timestamp {
        Some(ts) => format!("ts:{}", ts.timestamp_millis()),
        None => format!("rx:{}:{}", received_at.timestamp_millis(), notice.message),
    }
}
