//! Outgoing message model — queue records, priorities, templates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sending priority. Stored as an integer so the queue can sort on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    /// Dispatched immediately, never queued.
    Now = 3,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::Now,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Now => write!(f, "now"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "now" => Ok(Self::Now),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Delivery status. A record with no status was created on the immediate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Sent,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// A reusable subject/html template rendered against a message's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub subject: String,
    /// Plain-text body.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub html_content: String,
    pub created_at: DateTime<Utc>,
}

impl EmailTemplate {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            subject: subject.into(),
            content: String::new(),
            html_content: html.into(),
            created_at: super::now(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Every renderable source, labelled by field.
    pub fn sources(&self) -> [(&'static str, &str); 3] {
        [
            ("subject", self.subject.as_str()),
            ("content", self.content.as_str()),
            ("html_content", self.html_content.as_str()),
        ]
    }
}

/// A file attached to one or more outgoing messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    pub id: Uuid,
    /// The original filename.
    pub name: String,
    /// Reference into the attachment store.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
}

/// A queued (or immediately dispatched) outgoing email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub id: Uuid,
    pub from_email: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Ignored when a template is set.
    #[serde(default)]
    pub subject: String,
    /// Plain-text body.
    #[serde(default)]
    pub message: String,
    /// Ignored when a template is set.
    #[serde(default)]
    pub html_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<EmailTemplate>,
    /// Template variables.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    pub status: Option<Status>,
    /// Which sender configuration to use; empty selects the default.
    #[serde(default)]
    pub backend_alias: String,
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutgoingMessage {
    /// Create a queued message with medium priority.
    pub fn new(from_email: impl Into<String>, to: Vec<String>) -> Self {
        let now = super::now();
        Self {
            id: Uuid::new_v4(),
            from_email: from_email.into(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            message: String::new(),
            html_message: String::new(),
            template: None,
            context: BTreeMap::new(),
            scheduled_time: None,
            headers: BTreeMap::new(),
            priority: Priority::Medium,
            status: Some(Status::Queued),
            backend_alias: String::new(),
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html_message = html.into();
        self
    }

    pub fn with_template(mut self, template: EmailTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    /// Builder: set priority. `Now` clears the queued status.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self.status = if priority == Priority::Now {
            None
        } else {
            Some(Status::Queued)
        };
        self
    }

    pub fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_backend(mut self, alias: impl Into<String>) -> Self {
        self.backend_alias = alias.into();
        self
    }

    /// Queued and due at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == Some(Status::Queued) && self.scheduled_time.is_none_or(|t| t <= now)
    }

    /// All envelope recipients (to, cc, bcc).
    pub fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }
}

impl std::fmt::Display for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {:?} ({})", self.from_email, self.to, self.subject)
    }
}
