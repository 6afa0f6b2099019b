use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

pub struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Start logging to the console, filtered by `RUST_LOG` (default: `info`).
///
/// Panics if a global subscriber was already installed.
pub fn init() -> impl Drop {
    initiate_logging(DEFAULT_FILTER).unwrap()
}

/// Start logging to the console.
///
/// `default_filter` is used when `RUST_LOG` is not set or cannot be parsed.
pub fn initiate_logging(
    default_filter: &str,
) -> Result<Guard, Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let console_layer = fmt::layer()
        .with_timer(timer)
        .with_ansi(!cfg!(windows))
        .with_target(false);

    let collector = tracing_subscriber::registry()
        .with(console_layer)
        .with(env_filter(default_filter));
    tracing::subscriber::set_global_default(collector)?;

    let log_var = match std::env::var("RUST_LOG") {
        Ok(var) => format!(" with RUST_LOG=\"{var}\"."),
        Err(_) => format!(" with default filter \"{default_filter}\"."),
    };
    tracing::debug!("Logging initiated to console{log_var}");

    Ok(Guard {})
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}
