//! Configuration types.

use std::str::FromStr;

use crate::error::ConfigError;
use crate::models::{LogLevel, Priority};

/// Column an outgoing batch can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Priority,
    Created,
    LastUpdated,
    ScheduledTime,
}

/// One entry of the sending order, e.g. `-priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl SortKey {
    pub const fn desc(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }

    pub const fn asc(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    /// SQL fragment for an `ORDER BY` clause. Columns are whitelisted by `SortField`.
    pub fn to_sql(&self) -> String {
        let column = match self.field {
            SortField::Priority => "priority",
            SortField::Created => "created_at",
            SortField::LastUpdated => "updated_at",
            SortField::ScheduledTime => "scheduled_time",
        };
        let dir = if self.descending { "DESC" } else { "ASC" };
        format!("{column} {dir}")
    }
}

impl FromStr for SortKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (descending, name) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let field = match name {
            "priority" => SortField::Priority,
            "created" | "created_at" => SortField::Created,
            "last_updated" | "updated_at" => SortField::LastUpdated,
            "scheduled_time" => SortField::ScheduledTime,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "sending_order".into(),
                    message: format!("unknown field {other}"),
                });
            }
        };
        Ok(Self { field, descending })
    }
}

/// Gateway configuration: batching, logging and MIME storage policy.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum number of queued messages selected per batch.
    pub batch_size: usize,
    /// Worker lanes per partition.
    pub threads_per_process: usize,
    /// Ordering applied when selecting a batch.
    pub sending_order: Vec<SortKey>,
    /// Delivery log verbosity.
    pub log_level: LogLevel,
    /// Priority used when a caller does not name one.
    pub default_priority: Priority,
    /// Replace parts outside `allowed_mimetypes` with an empty marker part.
    pub strip_unallowed_mimetypes: bool,
    pub allowed_mimetypes: Vec<String>,
    /// Leaf types kept inline as text; everything else is offloaded.
    pub text_stored_mimetypes: Vec<String>,
    pub altered_message_header: String,
    pub attachment_interpolation_header: String,
    /// Upload directory for attachments, `strftime` escapes allowed.
    pub attachment_upload_to: String,
    /// Keep the full original message in the blob store.
    pub store_original_message: bool,
    pub compress_original_message: bool,
    /// gzip level, 0-9.
    pub original_message_compression: u32,
    /// Charset for 8-bit header bytes with no declared charset.
    pub default_charset: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            threads_per_process: 5,
            sending_order: vec![SortKey::desc(SortField::Priority)],
            log_level: LogLevel::All,
            default_priority: Priority::Medium,
            strip_unallowed_mimetypes: false,
            allowed_mimetypes: vec!["text/plain".into(), "text/html".into()],
            text_stored_mimetypes: vec!["text/plain".into(), "text/html".into()],
            altered_message_header: "X-Mail-Gateway-Altered-Message".into(),
            attachment_interpolation_header: "X-Mail-Gateway-Interpolate-Attachment".into(),
            attachment_upload_to: "mail_attachments/%Y/%m/%d/".into(),
            store_original_message: true,
            compress_original_message: false,
            original_message_compression: 6,
            default_charset: "iso-8859-1".into(),
        }
    }
}

impl GatewayConfig {
    /// Build config from `MAIL_GATEWAY_*` environment variables, falling back
    /// to defaults for anything unset. Malformed values are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("MAIL_GATEWAY_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = env_parse::<usize>("MAIL_GATEWAY_THREADS_PER_PROCESS")? {
            config.threads_per_process = v.max(1);
        }
        if let Ok(order) = std::env::var("MAIL_GATEWAY_SENDING_ORDER") {
            config.sending_order = split_list(&order)
                .iter()
                .map(|s| s.parse())
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = env_parse::<u8>("MAIL_GATEWAY_LOG_LEVEL")? {
            config.log_level = LogLevel::try_from(v)?;
        }
        if let Ok(p) = std::env::var("MAIL_GATEWAY_DEFAULT_PRIORITY") {
            config.default_priority = p.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MAIL_GATEWAY_DEFAULT_PRIORITY".into(),
                message: p.clone(),
            })?;
        }
        if let Some(v) = env_parse::<bool>("MAIL_GATEWAY_STRIP_UNALLOWED_MIMETYPES")? {
            config.strip_unallowed_mimetypes = v;
        }
        if let Ok(v) = std::env::var("MAIL_GATEWAY_ALLOWED_MIMETYPES") {
            config.allowed_mimetypes = split_list(&v);
        }
        if let Ok(v) = std::env::var("MAIL_GATEWAY_TEXT_STORED_MIMETYPES") {
            config.text_stored_mimetypes = split_list(&v);
        }
        if let Ok(v) = std::env::var("MAIL_GATEWAY_ALTERED_MESSAGE_HEADER") {
            config.altered_message_header = v;
        }
        if let Ok(v) = std::env::var("MAIL_GATEWAY_ATTACHMENT_INTERPOLATION_HEADER") {
            config.attachment_interpolation_header = v;
        }
        if let Ok(v) = std::env::var("MAIL_GATEWAY_ATTACHMENT_UPLOAD_TO") {
            config.attachment_upload_to = v;
        }
        if let Some(v) = env_parse::<bool>("MAIL_GATEWAY_STORE_ORIGINAL_MESSAGE")? {
            config.store_original_message = v;
        }
        if let Some(v) = env_parse::<bool>("MAIL_GATEWAY_COMPRESS_ORIGINAL_MESSAGE")? {
            config.compress_original_message = v;
        }
        if let Some(v) = env_parse::<u32>("MAIL_GATEWAY_ORIGINAL_MESSAGE_COMPRESSION")? {
            config.original_message_compression = v.min(9);
        }
        if let Ok(v) = std::env::var("MAIL_GATEWAY_DEFAULT_CHARSET") {
            config.default_charset = v;
        }

        Ok(config)
    }

    /// Whether a leaf of this content type may be kept at all.
    pub fn is_allowed(&self, content_type: &str) -> bool {
        contains_ignore_case(&self.allowed_mimetypes, content_type)
    }

    /// Whether a leaf of this content type is stored inline as text.
    pub fn is_text_stored(&self, content_type: &str) -> bool {
        contains_ignore_case(&self.text_stored_mimetypes, content_type)
    }
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|m| m.eq_ignore_ascii_case(value))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: raw,
            }),
        Err(_) => Ok(None),
    }
}
