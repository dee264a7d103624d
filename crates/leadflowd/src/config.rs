//! Process configuration, loaded once from the environment at startup
//! and injected into the components as immutable sections.

use chrono_tz::Tz;
use mx_router::RoutingConfig;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env_opt(key)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

impl DatabaseSettings {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "db".to_string(),
            port: 5432,
            user: "leadflow".to_string(),
            password: "leadflow_password".to_string(),
            name: "leadflow".to_string(),
        }
    }
}

/// One SMTP channel (gmail or yandex). A channel counts as configured
/// once it has a host; authentication is attempted only when both
/// username and password are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmtpChannelSettings {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub use_starttls: bool,
    pub username: String,
    pub password: String,
    pub from_header: String,
    pub from_email: String,
    pub from_name: Option<String>,
}

impl SmtpChannelSettings {
    fn from_env(prefix: &str, default_host: &str, default_port: u16) -> Self {
        let use_ssl = env_bool(&format!("{prefix}_SMTP_SSL"), false);
        Self {
            host: env_str(&format!("{prefix}_SMTP_HOST"), default_host),
            port: env_parse(&format!("{prefix}_SMTP_PORT"), default_port),
            use_ssl,
            use_starttls: env_bool(&format!("{prefix}_SMTP_TLS"), !use_ssl),
            username: env_str(&format!("{prefix}_USER"), ""),
            password: env_str(&format!("{prefix}_PASS"), ""),
            from_header: env_str(&format!("{prefix}_FROM"), ""),
            from_email: env_str(&format!("{prefix}_FROM_EMAIL"), ""),
            from_name: env_opt(&format!("{prefix}_FROM_NAME")),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.sender_header().is_empty()
    }

    /// The `From` header for this channel: the explicit `*_FROM` value
    /// wins, otherwise it is assembled from address and display name.
    pub fn sender_header(&self) -> String {
        if !self.from_header.is_empty() {
            return self.from_header.clone();
        }
        if self.from_email.is_empty() {
            return String::new();
        }
        match &self.from_name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.from_email),
            _ => self.from_email.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct YandexSettings {
    pub folder_id: String,
    pub iam_token: Option<String>,
    pub sa_key_path: Option<String>,
    pub sa_key_json: Option<String>,
    pub enforce_night_window: bool,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4.1-mini".to_string(),
            temperature: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SheetSettings {
    pub sheet_id: String,
    pub tab_name: String,
    pub sa_key_path: Option<String>,
    pub sa_key_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SheetSyncSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_tag: Option<String>,
}

impl Default for SheetSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(3600),
            batch_tag: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub timezone: Tz,
    pub database: DatabaseSettings,
    pub yandex: YandexSettings,
    pub openai: OpenAiSettings,
    pub email_sending_enabled: bool,
    pub gmail: SmtpChannelSettings,
    pub yandex_smtp: SmtpChannelSettings,
    pub routing: RoutingConfig,
    pub sheets: SheetSettings,
    pub sheet_sync: SheetSyncSettings,
}

impl Settings {
    /// Read every `LEADFLOW`-relevant environment variable once.
    /// Nothing in the process consults the environment after this.
    pub fn from_env() -> anyhow::Result<Self> {
        let timezone_name = env_str("APP_TIMEZONE", "Europe/Moscow");
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|err| anyhow::anyhow!("APP_TIMEZONE {timezone_name:?} is invalid: {err}"))?;

        let database = DatabaseSettings {
            host: env_str("POSTGRES_HOST", "db"),
            port: env_parse("POSTGRES_PORT", 5432),
            user: env_str("POSTGRES_USER", "leadflow"),
            password: env_str("POSTGRES_PASSWORD", "leadflow_password"),
            name: env_str("POSTGRES_DB", "leadflow"),
        };

        let yandex = YandexSettings {
            folder_id: env_str("YANDEX_CLOUD_FOLDER_ID", ""),
            iam_token: env_opt("YANDEX_CLOUD_IAM_TOKEN"),
            sa_key_path: env_opt("YANDEX_CLOUD_SA_KEY_FILE"),
            sa_key_json: env_opt("YANDEX_CLOUD_SA_KEY_JSON"),
            enforce_night_window: env_bool("YANDEX_ENFORCE_NIGHT_WINDOW", true),
        };

        let openai = OpenAiSettings {
            api_key: env_str("OPENAI_API_KEY", ""),
            model: env_str("OPENAI_MODEL", "gpt-4.1-mini"),
            temperature: env_parse("OPENAI_TEMPERATURE", 0.4),
        };

        let routing = RoutingConfig {
            enabled: env_bool("ROUTING_ENABLED", true),
            mx_cache_ttl_hours: env_parse("ROUTING_MX_CACHE_TTL_HOURS", 168u64),
            dns_timeout: Duration::from_millis(env_parse("ROUTING_DNS_TIMEOUT_MS", 1500u64)),
            dns_resolvers: env_list("ROUTING_DNS_RESOLVERS")
                .iter()
                .filter_map(|item| item.parse::<IpAddr>().ok())
                .collect(),
            ru_mx_patterns: {
                let configured = env_list("ROUTING_RU_MX_PATTERNS");
                if configured.is_empty() {
                    RoutingConfig::default().ru_mx_patterns
                } else {
                    configured
                }
            },
            ru_mx_tlds: {
                let configured = env_list("ROUTING_RU_MX_TLDS");
                if configured.is_empty() {
                    RoutingConfig::default().ru_mx_tlds
                } else {
                    configured
                }
            },
            force_ru_domains: env_list("ROUTING_FORCE_RU_DOMAINS"),
            cache_capacity: 1024,
        };

        let sheets = SheetSettings {
            sheet_id: env_str("GOOGLE_SHEET_ID", ""),
            tab_name: env_str("GOOGLE_SHEET_TAB", "NICHES_INPUT"),
            sa_key_path: env_opt("GOOGLE_SA_KEY_FILE"),
            sa_key_json: env_opt("GOOGLE_SA_KEY_JSON"),
        };

        let sheet_sync = SheetSyncSettings {
            enabled: env_bool("SHEET_SYNC_ENABLED", false),
            interval: Duration::from_secs(
                env_parse("SHEET_SYNC_INTERVAL_MINUTES", 60u64).max(1) * 60,
            ),
            batch_tag: env_opt("SHEET_SYNC_BATCH_TAG"),
        };

        Ok(Self {
            timezone,
            database,
            yandex,
            openai,
            email_sending_enabled: env_bool("EMAIL_SENDING_ENABLED", true),
            gmail: SmtpChannelSettings::from_env("GMAIL", "smtp.gmail.com", 587),
            yandex_smtp: SmtpChannelSettings::from_env("YANDEX", "smtp.yandex.ru", 465),
            routing,
            sheets,
            sheet_sync,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Moscow,
            database: DatabaseSettings::default(),
            yandex: YandexSettings::default(),
            openai: OpenAiSettings::default(),
            email_sending_enabled: true,
            gmail: SmtpChannelSettings::default(),
            yandex_smtp: SmtpChannelSettings::default(),
            routing: RoutingConfig::default(),
            sheets: SheetSettings::default(),
            sheet_sync: SheetSyncSettings::default(),
        }
    }
}
