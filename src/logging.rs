use std::env;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(format!("notification_pipeline={}", log_level));
        for directive in ["tower_http=warn", "a2=warn", "sqlx=warn", "hyper=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    tracing::info!(level = %log_level, "Logging initialized");
}
