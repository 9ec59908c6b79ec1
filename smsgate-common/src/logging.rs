use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Events about the gateway's own machinery (cycles, locks, stores).
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Events about traffic towards a modem driver.
#[macro_export]
macro_rules! device {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "device", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::device!(level = TRACE, $($msg)*)
    };
}

fn level_from_env() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

fn is_gateway_target(target: &str) -> bool {
    target.starts_with("smsgate")
}

/// Install the global subscriber.
///
/// `LOG_LEVEL` picks the verbosity and `LOG_FORMAT=json` switches to
/// line-delimited JSON, which is what log shippers on the gateway host expect.
/// Calling this twice is harmless; the second call is ignored.
pub fn init() {
    let level = level_from_env();
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(FilterFn::new(|metadata| is_gateway_target(metadata.target())))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_ansi(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(FilterFn::new(|metadata| is_gateway_target(metadata.target())))
            .boxed()
    };

    let _ = tracing_subscriber::Registry::default().with(layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gateway_targets_pass_the_filter() {
        assert!(is_gateway_target("smsgate_queue::engine"));
        assert!(is_gateway_target("smsgate"));
        assert!(!is_gateway_target("tokio::runtime"));
        assert!(!is_gateway_target("rusqlite"));
    }

    #[test]
    fn init_twice_does_not_panic() {
        init();
        init();
        internal!(level = INFO, "logging initialised in test");
    }
}
