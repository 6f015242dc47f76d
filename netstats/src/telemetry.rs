use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

type FilterReloadHandle = reload::Handle<EnvFilter, Registry>;
static FILTER_RELOAD_HANDLE: OnceLock<FilterReloadHandle> = OnceLock::new();

/// Installs the global subscriber.
///
/// With `log_dir` set, logs go to a daily rolling file through a non-blocking
/// writer; the returned guard must live until shutdown. Otherwise they go to stdout.
pub fn init_tracing(
    log_dir: Option<&str>,
    log_file: &str,
    log_level: &str,
    console_port: Option<u16>,
) -> Option<WorkerGuard> {
    #[cfg(feature = "console")]
    let console_layer = console_port.map(|port| {
        console_subscriber::ConsoleLayer::builder()
            .server_addr((std::net::Ipv4Addr::LOCALHOST, port))
            .spawn()
    });

    #[cfg(not(feature = "console"))]
    if console_port.is_some() {
        eprintln!(
            "console_port is configured but netstatsd is not built with --features console; tokio-console is disabled"
        );
    }

    let (filter_layer, filter_handle) = reload_filter_layer(log_level);
    let _ = FILTER_RELOAD_HANDLE.set(filter_handle);

    if let Some(log_dir) = log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, log_file);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_ansi(false);

        #[cfg(feature = "console")]
        if let Some(console_layer) = console_layer {
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(console_layer)
                .with(file_layer)
                .init();
            return Some(guard);
        }

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        let stdout_layer = fmt::layer().with_target(true).with_line_number(true);

        #[cfg(feature = "console")]
        if let Some(console_layer) = console_layer {
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(console_layer)
                .with(stdout_layer)
                .init();
            return None;
        }

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(stdout_layer)
            .init();
        None
    }
}

fn reload_filter_layer(log_level: &str) -> (reload::Layer<EnvFilter, Registry>, FilterReloadHandle) {
    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    reload::Layer::new(initial_filter)
}

/// Swaps the active log filter, e.g. `debug` or `netstats=trace,info`.
pub fn reload_log_level(log_level: &str) -> std::result::Result<(), String> {
    let Some(handle) = FILTER_RELOAD_HANDLE.get() else {
        return Err("log filter reload handle is not initialized".to_string());
    };
    let filter = EnvFilter::try_new(log_level)
        .map_err(|err| format!("invalid log_level '{}': {err}", log_level))?;
    handle
        .reload(filter)
        .map_err(|err| format!("failed to reload log filter: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_before_init_is_an_error() {
        if FILTER_RELOAD_HANDLE.get().is_none() {
            assert!(reload_log_level("debug").is_err());
        }
    }
}
