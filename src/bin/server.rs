use std::path::PathBuf;
use std::sync::Arc;

use sheaf::{start_server, Database, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:9610".to_string());
    let data_dir = args.next().map(PathBuf::from);

    let config = StoreConfig::default();
    let db = match data_dir {
        Some(dir) => Database::open(Some(dir), config)?,
        None => Database::open_in_memory(config)?,
    };

    let result = start_server(&addr, Arc::clone(&db)).await;
    db.close()?;
    result.map_err(Into::into)
}
