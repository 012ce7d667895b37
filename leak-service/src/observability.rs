use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = match "leak_service=info".parse::<tracing_subscriber::filter::Directive>() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
