/// Which scan outcomes are delivered to Telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    Off,
    All,
    AdminOnly,
}

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message,
/// matching the fail-fast boot policy: a misconfigured process should never
/// limp along silently.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_version: String,
    pub git_sha: String,

    pub telegram_token: String,
    pub telegram_allowed_user_ids: Vec<i64>,

    pub dashboard_token: String,
    pub dashboard_port: u16,

    pub database_url: String,

    pub auto_scan_interval_min: u64,
    pub scheduler_misfire_grace_sec: u64,

    pub market_data_provider: String,
    pub market_cache_path: String,
    pub state_dir: String,
    pub user_strategies_dir: String,
    pub detector_aliases_path: Option<String>,

    pub strict_strategy_detectors: bool,
    pub strict_startup: bool,
    pub strategy_failover_on_block: bool,
    pub daily_limit_per_symbol: i64,
    pub signal_cooldown_minutes: i64,

    pub notify_mode: NotifyMode,

    pub detector_warn_ms: f64,
    pub feature_warn_ms: f64,
    pub pair_warn_ms: f64,
    pub scan_cycle_warn_ms: f64,

    pub patch_suggestions_path: String,
    pub unknown_detector_autofix_threshold: f64,
    pub shadow_all_detectors: bool,
}

impl Config {
    /// Load all configuration from environment variables. Loads `.env` if
    /// present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let telegram_allowed_user_ids = optional_env("TELEGRAM_ALLOWED_USER_IDS")
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| {
                        s.trim().parse::<i64>().unwrap_or_else(|_| {
                            panic!(
                                "TELEGRAM_ALLOWED_USER_IDS contains non-numeric id: '{}'",
                                s.trim()
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let notify_mode = match optional_env("NOTIFY_MODE")
            .unwrap_or_else(|| "all".to_string())
            .to_lowercase()
            .as_str()
        {
            "off" => NotifyMode::Off,
            "admin_only" => NotifyMode::AdminOnly,
            "all" => NotifyMode::All,
            other => panic!("NOTIFY_MODE must be one of off|all|admin_only, got: '{other}'"),
        };

        Config {
            app_version: optional_env("APP_VERSION").unwrap_or_else(|| "0.1.0".to_string()),
            git_sha: optional_env("GIT_SHA").unwrap_or_else(|| "unknown".to_string()),

            telegram_token: required_env("TELEGRAM_TOKEN"),
            telegram_allowed_user_ids,

            dashboard_token: required_env("DASHBOARD_TOKEN"),
            dashboard_port: optional_env("DASHBOARD_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            database_url: required_env("DATABASE_URL"),

            auto_scan_interval_min: optional_env("AUTO_SCAN_INTERVAL_MIN")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            scheduler_misfire_grace_sec: optional_env("SCHEDULER_MISFIRE_GRACE_SEC")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),

            market_data_provider: optional_env("MARKET_DATA_PROVIDER")
                .or_else(|| optional_env("DATA_PROVIDER"))
                .unwrap_or_else(|| "mock".to_string()),
            market_cache_path: optional_env("MARKET_CACHE_PATH")
                .unwrap_or_else(|| "state/market_cache.json".to_string()),
            state_dir: optional_env("STATE_DIR").unwrap_or_else(|| "state".to_string()),
            user_strategies_dir: optional_env("USER_STRATEGIES_DIR")
                .unwrap_or_else(|| "config/strategies".to_string()),
            detector_aliases_path: optional_env("DETECTOR_ALIASES_PATH"),

            strict_strategy_detectors: bool_env("STRICT_STRATEGY_DETECTORS", false),
            strict_startup: bool_env("STRICT_STARTUP", false),
            strategy_failover_on_block: bool_env("STRATEGY_FAILOVER_ON_BLOCK", true),
            daily_limit_per_symbol: optional_env("DAILY_LIMIT_PER_SYMBOL")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            signal_cooldown_minutes: optional_env("SIGNAL_COOLDOWN_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),

            notify_mode,

            detector_warn_ms: optional_env("DETECTOR_WARN_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(50.0),
            feature_warn_ms: optional_env("FEATURE_WARN_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100.0),
            pair_warn_ms: optional_env("PAIR_WARN_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(500.0),
            scan_cycle_warn_ms: optional_env("SCAN_CYCLE_WARN_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000.0),

            patch_suggestions_path: optional_env("PATCH_SUGGESTIONS_PATH")
                .unwrap_or_else(|| "state/patch_suggestions.json".to_string()),
            unknown_detector_autofix_threshold: optional_env("UNKNOWN_DETECTOR_AUTOFIX_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.85),
            shadow_all_detectors: bool_env("SHADOW_ALL_DETECTORS", false),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn bool_env(key: &str, default: bool) -> bool {
    match optional_env(key) {
        None => default,
        Some(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
    }
}
