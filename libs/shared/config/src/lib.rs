use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_jwt_secret: String,
    pub room_provider_base_url: String,
    pub room_provider_api_token: String,
    pub server_port: u16,
    pub coordination: CoordinationConfig,
}

/// Timing and sizing knobs for queue admission and call-session coordination.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// How long a dropped connection keeps its queue entry / session alive.
    pub grace_window: Duration,
    /// How long a session may sit in INVITED before it is abandoned.
    pub invite_timeout: Duration,
    /// Consultation length assumed before any consultation has completed.
    pub default_consultation: Duration,
    /// Smoothing factor of the per-doctor consultation-length moving average.
    pub wait_smoothing: f64,
    pub provider_timeout: Duration,
    pub complete_room_attempts: u32,
    pub archive_capacity: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(10),
            invite_timeout: Duration::from_secs(60),
            default_consultation: Duration::from_secs(15 * 60),
            wait_smoothing: 0.3,
            provider_timeout: Duration::from_secs(10),
            complete_room_attempts: 3,
            archive_capacity: 1000,
        }
    }
}

impl CoordinationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let smoothing = env_parse("WAIT_ESTIMATE_SMOOTHING", defaults.wait_smoothing);
        let wait_smoothing = if smoothing > 0.0 && smoothing <= 1.0 {
            smoothing
        } else {
            warn!("WAIT_ESTIMATE_SMOOTHING must be in (0, 1], using {}", defaults.wait_smoothing);
            defaults.wait_smoothing
        };

        Self {
            grace_window: Duration::from_secs(env_parse(
                "CHANNEL_GRACE_SECONDS",
                defaults.grace_window.as_secs(),
            )),
            invite_timeout: Duration::from_secs(env_parse(
                "INVITE_TIMEOUT_SECONDS",
                defaults.invite_timeout.as_secs(),
            )),
            default_consultation: Duration::from_secs(
                env_parse(
                    "DEFAULT_CONSULTATION_MINUTES",
                    defaults.default_consultation.as_secs() / 60,
                ) * 60,
            ),
            wait_smoothing,
            provider_timeout: Duration::from_secs(env_parse(
                "ROOM_PROVIDER_TIMEOUT_SECONDS",
                defaults.provider_timeout.as_secs(),
            )),
            complete_room_attempts: env_parse(
                "COMPLETE_ROOM_ATTEMPTS",
                defaults.complete_room_attempts,
            )
            .max(1),
            archive_capacity: env_parse("SESSION_ARCHIVE_CAPACITY", defaults.archive_capacity),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            room_provider_base_url: env::var("ROOM_PROVIDER_BASE_URL")
                .unwrap_or_else(|_| {
                    warn!("ROOM_PROVIDER_BASE_URL not set, using default");
                    "http://localhost:8787/v1".to_string()
                }),
            room_provider_api_token: env::var("ROOM_PROVIDER_API_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("ROOM_PROVIDER_API_TOKEN not set, using empty value");
                    String::new()
                }),
            server_port: env_parse("SERVER_PORT", 3000),
            coordination: CoordinationConfig::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_room_provider_configured(&self) -> bool {
        !self.room_provider_base_url.is_empty()
            && !self.room_provider_api_token.is_empty()
    }
}

fn env_parse<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
