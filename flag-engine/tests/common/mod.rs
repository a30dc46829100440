use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use flag_engine::config::{Config, DEFAULT_TEST_CONFIG};
use flag_engine::database::InMemoryFlagStore;
use flag_engine::redis::MockRedisClient;
use flag_engine::router::router;
use flag_engine::server::{serve, serve_router};
use flag_engine::test_utils::setup_memory_service;

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub store: Option<Arc<InMemoryFlagStore>>,
    pub redis: Option<MockRedisClient>,
    client: reqwest::Client,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    /// Full server wiring against live Redis and the configured storage backend.
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            store: None,
            redis: None,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    /// Router over an in-memory store and a mock redis, so no external services are needed.
    pub async fn for_memory() -> ServerHandle {
        let (service, store, redis) = setup_memory_service();
        let app = router(service, &DEFAULT_TEST_CONFIG);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve_router(app, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            store: Some(store),
            redis: Some(redis),
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{:?}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.send_body(self.client.post(self.url(path)), body.to_string())
            .await
    }

    pub async fn put_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.send_body(self.client.put(self.url(path)), body.to_string())
            .await
    }

    pub async fn post_raw<T: Into<reqwest::Body>>(&self, path: &str, body: T) -> reqwest::Response {
        self.send_body(self.client.post(self.url(path)), body).await
    }

    pub async fn patch(&self, path: &str) -> reqwest::Response {
        self.client
            .patch(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }

    async fn send_body<T: Into<reqwest::Body>>(
        &self,
        request: reqwest::RequestBuilder,
        body: T,
    ) -> reqwest::Response {
        request
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
