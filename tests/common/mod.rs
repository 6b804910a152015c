#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use round_relay::api::{FeedSource, FetchError};
use round_relay::relay::{RelayActor, RelayHandle, RelayOptions};
use round_relay::server::{self, ServerState};
use round_relay::store::MemoryStore;
use round_relay::types::{PageParams, RawRound};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

/// Upstream stand-in: every fetch returns the current page, newest-first.
#[derive(Default)]
pub struct LiveFeed {
    page: Mutex<Vec<RawRound>>,
    credentials: Mutex<Vec<String>>,
}

impl LiveFeed {
    /// Settle a new round at the top of the page.
    pub fn settle(&self, id: i64, multiplier: f64) {
        let mut page = self.page.lock().unwrap();
        page.insert(
            0,
            RawRound {
                id: json!(id),
                multiplier: json!(multiplier),
                hash: Value::Null,
            },
        );
        page.truncate(20);
    }

    /// Empty the upstream page.
    pub fn clear(&self) {
        self.page.lock().unwrap().clear();
    }

    pub fn last_credential(&self) -> Option<String> {
        self.credentials.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl FeedSource for LiveFeed {
    async fn fetch(
        &self,
        credential: &str,
        _page: PageParams,
    ) -> Result<Vec<RawRound>, FetchError> {
        self.credentials.lock().unwrap().push(credential.to_string());
        Ok(self.page.lock().unwrap().clone())
    }
}

pub struct TestRelay {
    pub feed: Arc<LiveFeed>,
    pub store: MemoryStore,
    pub handle: RelayHandle,
    pub task: JoinHandle<()>,
}

pub fn spawn_relay() -> TestRelay {
    let feed = Arc::new(LiveFeed::default());
    let store = MemoryStore::new();
    let options = RelayOptions {
        poll_interval: Duration::from_millis(50),
        ..RelayOptions::default()
    };
    let actor = RelayActor::restore(options, feed.clone(), Box::new(store.clone())).unwrap();
    let (handle, task) = actor.spawn();
    TestRelay {
        feed,
        store,
        handle,
        task,
    }
}

pub fn server_state(relay: &TestRelay, internal_token: Option<&str>) -> ServerState {
    ServerState {
        relay: relay.handle.clone(),
        internal_token: internal_token.map(str::to_string),
        enable_reset: true,
    }
}

pub fn app(relay: &TestRelay) -> axum::Router {
    server::router(server_state(relay, None))
}

/// Poll `check` every 20ms until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s");
}
