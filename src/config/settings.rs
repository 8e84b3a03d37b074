use dotenv::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Settings {
    pub polygon_api_key: String,
    pub polygon_base_url: String,
    pub polygon_ws_url: String,
    pub database_url: String,
    pub redis_url: String,

    // Session boundaries (HH:MM, ET)
    pub pre_market_start: String,
    pub market_open: String,
    pub market_close: String,
    pub post_market_end: String,
    pub timezone: String,

    // Analytics
    pub slot_size_minutes: u32,
    pub rvol_lookback_days: u32,
    pub atr_period: u32,
    pub trades_zscore_threshold: f64,

    // Scanner
    pub scan_interval_secs: u64,
    pub filter_reload_secs: u64,
    pub max_filtered_tickers: usize,
    pub default_category_limit: usize,
    pub max_category_limit: usize,

    // Maintenance
    pub maintenance_hour: u32,
    pub maintenance_minute: u32,
    pub holiday_mode: bool,
    pub parquet_dir: String,
    pub screener_export_dir: String,
}

impl Settings {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok(); // loads `.env` file automatically

        let polygon_api_key =
            env::var("POLYGON_API_KEY").map_err(|_| "POLYGON_API_KEY missing from env")?;
        let polygon_base_url = env::var("POLYGON_BASE_URL")
            .unwrap_or_else(|_| "https://api.polygon.io".into());
        let polygon_ws_url = env::var("POLYGON_WS_URL")
            .unwrap_or_else(|_| "wss://socket.polygon.io/stocks".into());
        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL missing")?;
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let pre_market_start = env::var("PRE_MARKET_START").unwrap_or_else(|_| "04:00".into());
        let market_open = env::var("MARKET_OPEN").unwrap_or_else(|_| "09:30".into());
        let market_close = env::var("MARKET_CLOSE").unwrap_or_else(|_| "16:00".into());
        let post_market_end = env::var("POST_MARKET_END").unwrap_or_else(|_| "20:00".into());
        let timezone = env::var("MARKET_TIMEZONE").unwrap_or_else(|_| "America/New_York".into());

        let slot_size_minutes = parse_or("SLOT_SIZE_MINUTES", 5)?;
        let rvol_lookback_days = parse_or("RVOL_LOOKBACK_DAYS", 5)?;
        let atr_period = parse_or("ATR_PERIOD", 14)?;
        let trades_zscore_threshold = parse_or("TRADES_ZSCORE_THRESHOLD", 3.0)?;

        let scan_interval_secs = parse_or("SCAN_INTERVAL_SECS", 2)?;
        let filter_reload_secs = parse_or("FILTER_RELOAD_SECS", 60)?;
        let max_filtered_tickers = parse_or("MAX_FILTERED_TICKERS", 500)?;
        let default_category_limit = parse_or("DEFAULT_CATEGORY_LIMIT", 20)?;
        let max_category_limit = parse_or("MAX_CATEGORY_LIMIT", 1000)?;

        let maintenance_hour = parse_or("MAINTENANCE_HOUR", 17)?;
        let maintenance_minute = parse_or("MAINTENANCE_MINUTE", 0)?;
        let holiday_mode = env::var("HOLIDAY_MODE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let parquet_dir =
            env::var("PARQUET_DIR").unwrap_or_else(|_| "/data/polygon/day_aggs".into());
        let screener_export_dir =
            env::var("SCREENER_EXPORT_DIR").unwrap_or_else(|_| "/data/screener".into());

        Ok(Self {
            polygon_api_key,
            polygon_base_url,
            polygon_ws_url,
            database_url,
            redis_url,
            pre_market_start,
            market_open,
            market_close,
            post_market_end,
            timezone,
            slot_size_minutes,
            rvol_lookback_days,
            atr_period,
            trades_zscore_threshold,
            scan_interval_secs,
            filter_reload_secs,
            max_filtered_tickers,
            default_category_limit,
            max_category_limit,
            maintenance_hour,
            maintenance_minute,
            holiday_mode,
            parquet_dir,
            screener_export_dir,
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("{key} must be a valid value")),
        Err(_) => Ok(default),
    }
}
