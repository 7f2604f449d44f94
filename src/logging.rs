use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "TUTOR_RELAY_LOG";

fn default_filter(component: &str) -> String {
    format!("info,tutor_relay=debug,{component}=debug")
}

/// Installs the global fmt subscriber. `TUTOR_RELAY_LOG` wins over `RUST_LOG`.
/// Calling it twice is harmless; the second install is ignored.
pub fn init_tracing(component: &str) {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter(component)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_names_component() {
        let filter = default_filter("tutor_relayd");
        assert!(filter.contains("tutor_relayd=debug"));
        assert!(EnvFilter::try_new(filter).is_ok());
    }

    #[test]
    fn repeated_init_does_not_panic() {
        init_tracing("tests");
        init_tracing("tests");
    }
}
