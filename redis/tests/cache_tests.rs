//! Cache behaviour against Redis Stack. Requires Docker; run with `--ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use chrono::Utc;
use stockroom_core::cache::FastCache;
use stockroom_core::model::{Product, ProductId};
use stockroom_core::reader::{ListQuery, ProductReader};
use stockroom_redis::RedisProductCache;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

async fn cache() -> (ContainerAsync<GenericImage>, RedisProductCache) {
    let container = GenericImage::new("redis/redis-stack-server", "latest")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("redis-stack container");
    let port = container.get_host_port_ipv4(6379).await.expect("port");
    let cache = RedisProductCache::new(&format!("redis://127.0.0.1:{port}"), "productsIndex")
        .await
        .expect("cache");
    (container, cache)
}

fn product(name: &str) -> Product {
    Product {
        id: ProductId::new(),
        name: name.to_string(),
        slug: name.to_lowercase().replace(' ', "-"),
        description: String::new(),
        price: 3.0,
        quantity: 2,
        image: String::new(),
        created_at: Utc::now(),
        updated_at: None,
        version: 0,
        deleted: false,
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    // Indexing is asynchronous on the server side.
    for _ in 0..50 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn set_then_lookup_by_id_slug_and_name() {
    let (_container, cache) = cache().await;
    let lamp = product("Desk Lamp");
    cache.set(&lamp).await.unwrap();

    assert_eq!(cache.get_by_id(lamp.id).await.unwrap().unwrap().name, "Desk Lamp");
    eventually(|| async { cache.get_by_slug("desk-lamp").await.unwrap().is_some() }).await;
    eventually(|| async { cache.list(&ListQuery::new("lamp", 1, 10)).await.unwrap().len() == 1 }).await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn refresh_replaces_previous_contents() {
    let (_container, cache) = cache().await;
    let stale = product("Stale");
    cache.set(&stale).await.unwrap();

    let fresh = vec![product("Alpha"), product("Beta")];
    cache.refresh(&fresh).await.unwrap();

    assert!(cache.get_by_id(stale.id).await.unwrap().is_none());
    eventually(|| async {
        let names: Vec<String> = cache
            .list(&ListQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names == ["Alpha", "Beta"]
    })
    .await;
}
