use clap::ValueEnum;
use clap_verbosity_flag::{LogLevel, Verbosity};
use tracing::{Level, level_filters::LevelFilter};
use tracing_log::AsTrace as _;
use tracing_subscriber::{
    EnvFilter,
    fmt::{
        SubscriberBuilder,
        format::{DefaultFields, Format, Full},
        time::ChronoLocal,
    },
    util::SubscriberInitExt,
};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line human readable output, for local development.
    #[default]
    Pretty,
    /// One JSON object per line, for log collectors.
    Json,
    /// Single-line output without ANSI colors.
    Full,
}

pub fn init_tracing<L: LogLevel>(v: &Verbosity<L>, format: LogFormat) {
    match format {
        LogFormat::Pretty => init_subscriber(v, |b| b.pretty()),
        LogFormat::Json => init_subscriber(v, |b| b.json()),
        LogFormat::Full => init_subscriber(v, |b| b.with_ansi(false)),
    }
}

type DefaultSubscriberBuilder =
    SubscriberBuilder<DefaultFields, Format<Full, ChronoLocal>, EnvFilter>;

fn init_subscriber<L, F, B>(v: &Verbosity<L>, f: F)
where
    L: LogLevel,
    F: FnOnce(DefaultSubscriberBuilder) -> B,
    B: SubscriberInitExt,
{
    // `-qq` silences everything, so no subscriber at all.
    let filter = v.log_level_filter().as_trace();
    if filter == LevelFilter::OFF {
        return;
    }
    let builder = SubscriberBuilder::default()
        .with_timer(ChronoLocal::rfc_3339())
        .with_env_filter(into_env_filter(filter));
    // A second init (e.g. in tests) keeps the first subscriber.
    if let Err(e) = f(builder).try_init() {
        eprintln!("tracing subscriber already initialized: {e}");
    }
}

fn into_env_filter(filter: LevelFilter) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(filter).into())
}

// Debug and trace levels are only applied to our own target, reqwest and hyper are too noisy.
fn default_directive(filter: LevelFilter) -> String {
    if filter >= Level::DEBUG {
        format!("info,status_checker={filter}")
    } else {
        filter.to_string()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn verbose_levels_are_scoped_to_crate() {
        assert_eq!(
            default_directive(LevelFilter::DEBUG),
            "info,status_checker=debug"
        );
        assert_eq!(
            default_directive(LevelFilter::TRACE),
            "info,status_checker=trace"
        );
    }

    #[test]
    fn quiet_levels_apply_globally() {
        assert_eq!(default_directive(LevelFilter::INFO), "info");
        assert_eq!(default_directive(LevelFilter::ERROR), "error");
    }
}
