use crate::error::AppError;
use crate::models::Participant;
use crate::services::attachment_pipeline::{
    default_allowed_types, AttachmentPolicy, DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES,
};
use crate::services::outbox::AttachmentFailurePolicy;
use crate::services::typing_presence::DEFAULT_TYPING_TTL;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    /// Prefix for returned object URLs; defaults to the virtual-hosted bucket URL
    pub public_base_url: Option<String>,
}

impl S3Config {
    pub fn object_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }
}

/// Knobs the messaging core itself reads
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub attachment_policy: AttachmentPolicy,
    pub attachment_failure: AttachmentFailurePolicy,
    pub typing_ttl: Duration,
    pub send_timeout: Duration,
    pub history_page_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attachment_policy: AttachmentPolicy::default(),
            attachment_failure: AttachmentFailurePolicy::default(),
            typing_ttl: DEFAULT_TYPING_TTL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub redis_url: String,
    pub feed_reconnect: Duration,
    pub s3: Option<S3Config>,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub business_id: Option<Uuid>,
    pub active_conversation: Option<Uuid>,
    session: SessionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let allowed_types = env::var("ATTACHMENT_ALLOWED_MIME")
            .ok()
            .map(|value| parse_list(&value))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(default_allowed_types);

        let session = SessionConfig {
            attachment_policy: AttachmentPolicy {
                max_bytes: parsed("ATTACHMENT_MAX_BYTES")?.unwrap_or(DEFAULT_MAX_BYTES),
                max_files: parsed("ATTACHMENT_MAX_FILES")?.unwrap_or(DEFAULT_MAX_FILES),
                allowed_types,
            },
            attachment_failure: match env::var("ATTACHMENT_FAILURE_POLICY").ok().as_deref() {
                Some("keep_successful") => AttachmentFailurePolicy::KeepSuccessful,
                Some("abort_message") | None => AttachmentFailurePolicy::AbortMessage,
                Some(other) => {
                    return Err(AppError::Config(format!(
                        "ATTACHMENT_FAILURE_POLICY: unknown value {other}"
                    )))
                }
            },
            typing_ttl: parsed("TYPING_TTL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TYPING_TTL),
            send_timeout: parsed("SEND_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SEND_TIMEOUT),
            history_page_size: parsed("HISTORY_PAGE_SIZE")?.unwrap_or(DEFAULT_HISTORY_PAGE_SIZE),
        };

        let s3 = env::var("S3_BUCKET").ok().map(|bucket| S3Config {
            bucket,
            region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: env::var("S3_ENDPOINT").ok(),
            public_base_url: env::var("S3_PUBLIC_BASE_URL").ok(),
        });

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            db_max_connections: parsed("DB_MAX_CONNECTIONS")?.unwrap_or(16),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            feed_reconnect: Duration::from_millis(parsed("FEED_RECONNECT_MS")?.unwrap_or(1000)),
            s3,
            user_id: parsed("SESSION_USER_ID")?,
            display_name: env::var("SESSION_DISPLAY_NAME").unwrap_or_else(|_| "me".into()),
            business_id: parsed("SESSION_BUSINESS_ID")?,
            active_conversation: parsed("SESSION_ACTIVE_CONVERSATION")?,
            session,
        })
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone()
    }

    /// Identity the binary signs in as; `SESSION_USER_ID` is mandatory
    pub fn participant(&self) -> Result<Participant, AppError> {
        let user_id = self
            .user_id
            .ok_or_else(|| AppError::Config("SESSION_USER_ID is required".into()))?;
        Ok(Participant {
            user_id,
            display_name: self.display_name.clone(),
        })
    }
}

/// Unset is `None`; set but malformed is a config error
fn parsed<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AppError::Config(format!("{key}: {e}"))),
        _ => Ok(None),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_blanks() {
        assert_eq!(parse_list("image/*, ,application/pdf,"), vec!["image/*", "application/pdf"]);
    }

    #[test]
    fn test_object_url_prefers_public_base() {
        let mut cfg = S3Config {
            bucket: "chat".into(),
            region: "eu-west-1".into(),
            endpoint: None,
            public_base_url: Some("https://cdn.example.com/".into()),
        };
        assert_eq!(cfg.object_url("a/b.png"), "https://cdn.example.com/a/b.png");
        cfg.public_base_url = None;
        assert_eq!(cfg.object_url("a/b.png"), "https://chat.s3.eu-west-1.amazonaws.com/a/b.png");
    }

    fn bare_config() -> Config {
        Config {
            database_url: None,
            db_max_connections: 16,
            redis_url: "redis://127.0.0.1:6379".into(),
            feed_reconnect: Duration::from_secs(1),
            s3: None,
            user_id: None,
            display_name: "me".into(),
            business_id: None,
            active_conversation: None,
            session: SessionConfig::default(),
        }
    }

    #[test]
    fn test_participant_requires_user_id() {
        let mut cfg = bare_config();
        assert!(matches!(cfg.participant(), Err(AppError::Config(_))));

        let id = Uuid::new_v4();
        cfg.user_id = Some(id);
        let me = cfg.participant().unwrap();
        assert_eq!(me.user_id, id);
        assert_eq!(me.display_name, "me");
    }

    #[test]
    fn test_session_defaults() {
        let session = SessionConfig::default();
        assert_eq!(session.typing_ttl, Duration::from_secs(3));
        assert_eq!(session.attachment_policy.max_bytes, 10 * 1024 * 1024);
        assert_eq!(session.history_page_size, 200);
    }
}
