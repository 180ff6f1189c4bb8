use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // optional path to a config file, platform config dir otherwise
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    global_upc::run(config_path).await
}
