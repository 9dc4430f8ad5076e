use anyhow::Result;
use latchkey::{Lock, RedisBackend};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let backend = Arc::new(RedisBackend::new(&url)?);

    // A handful of workers fighting over one name; at most one is ever
    // inside the critical section.
    let mut workers = Vec::new();
    for n in 0..4 {
        let lock = Lock::builder()
            .name("latchkey-demo".to_string())
            .backend(backend.clone())
            .poll_interval(Duration::from_millis(250))
            .build();
        workers.push(tokio::spawn(async move {
            for round in 0..3 {
                let held = lock
                    .with(async || {
                        info!("worker {n} entered (round {round})");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        info!("worker {n} leaving");
                    })
                    .await;
                if let Err(e) = held {
                    error!("worker {n}: {e}");
                }
            }
        }));
    }

    for w in workers {
        w.await?;
    }

    Ok(())
}
