use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rookwatch_client::{ClientConfig, PlayerApi, RetryPolicy};

/// Counts requests seen by a fake handler.
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicU32>);

impl Hits {
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn spawn_backend(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Client config with short timeouts and near-instant retries.
pub fn test_config(base_url: String) -> ClientConfig {
    ClientConfig {
        base_url,
        read_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_attempts: 3,
            max_delay: Duration::from_millis(20),
        },
    }
}

pub async fn api_for(app: Router) -> PlayerApi {
    PlayerApi::new(test_config(spawn_backend(app).await))
}
