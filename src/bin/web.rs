use tombola::app;
use tombola::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    println!("Starting tombola ticket office on http://{}", config.bind_addr);
    app::run(config).await
}
