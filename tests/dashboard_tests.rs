mod test_harness;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use test_harness::{cluster, TestEnv};
use ursa_lite::config::CoordinatorConfig;
use ursa_lite::dashboard::{router, DashboardState};
use ursa_lite::region::MultiRegionCoordinator;
use ursa_lite::store::{NewWorkset, Priority, StateStore};

fn app(env: &TestEnv) -> Router {
    router(DashboardState {
        store: env.store.clone(),
        scheduler: env.scheduler.clone(),
        coordinator: None,
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_queue_stats_endpoint() {
    let env = TestEnv::new(vec![cluster("c1", 1, 0.05)]);
    env.register("ws-1", Priority::Normal).await;
    env.register("ws-2", Priority::Low).await;
    env.poll().await;

    let (status, json) = get_json(app(&env), "/api/stats/queue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 2);
    assert_eq!(json["in_queue"], 1);
    assert_eq!(json["by_state"]["COMPLETED"], 1);
    assert_eq!(json["by_state"]["READY"], 1);
}

#[tokio::test]
async fn test_cluster_stats_endpoint() {
    let env = TestEnv::new(vec![cluster("b-cluster", 2, 0.07), cluster("a-cluster", 4, 0.05)]);

    let (status, json) = get_json(app(&env), "/api/stats/clusters").await;
    assert_eq!(status, StatusCode::OK);
    let clusters = json.as_array().unwrap();
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0]["cluster_name"], "a-cluster");
    assert_eq!(clusters[0]["max_concurrent_worksets"], 4);
    assert_eq!(clusters[1]["vcpu_utilization"], 0.0);
}

#[tokio::test]
async fn test_ready_queue_endpoint_in_dispatch_order() {
    let env = TestEnv::new(vec![]);
    env.register("normal", Priority::Normal).await;
    env.clock.advance(Duration::from_millis(1));
    env.register("urgent", Priority::Urgent).await;
    env.clock.advance(Duration::from_millis(1));
    env.register("low", Priority::Low).await;

    let (status, json) = get_json(app(&env), "/api/queue?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    let queue = json.as_array().unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0]["workset_id"], "urgent");
    assert_eq!(queue[0]["position"], 0);
    assert_eq!(queue[0]["priority"], "URGENT");
    assert_eq!(queue[1]["workset_id"], "normal");
}

#[tokio::test]
async fn test_list_worksets_pages_with_cursor() {
    let env = TestEnv::new(vec![]);
    for i in 0..3 {
        env.register(&format!("ws-{i}"), Priority::Normal).await;
        env.clock.advance(Duration::from_millis(1));
    }

    let (status, first) = get_json(app(&env), "/api/worksets?state=ready&limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["items"].as_array().unwrap().len(), 2);
    assert_eq!(first["items"][0]["workset_id"], "ws-0");
    let cursor = first["next_cursor"].as_str().unwrap().to_string();

    let uri = format!(
        "/api/worksets?state=READY&limit=2&cursor={}",
        cursor.replace('+', "%2B").replace(':', "%3A").replace('|', "%7C")
    );
    let (status, second) = get_json(app(&env), &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["items"].as_array().unwrap().len(), 1);
    assert_eq!(second["items"][0]["workset_id"], "ws-2");
    assert!(second["next_cursor"].is_null());
}

#[tokio::test]
async fn test_list_worksets_rejects_bad_filters() {
    let env = TestEnv::new(vec![]);

    let (status, json) = get_json(app(&env), "/api/worksets?state=RUNNING").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("RUNNING"));

    let (status, _) = get_json(app(&env), "/api/worksets?priority=critical").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(app(&env), "/api/worksets?cursor=garbage").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_workset_endpoint() {
    let env = TestEnv::new(vec![]);
    env.register_new(
        NewWorkset::new("ws-1", "s3://ursa-test/ws-1", Priority::Urgent).with_customer("acme"),
    )
    .await;

    let (status, json) = get_json(app(&env), "/api/worksets/ws-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["workset_id"], "ws-1");
    assert_eq!(json["state"], "READY");
    assert_eq!(json["customer_id"], "acme");
    assert_eq!(json["state_history"].as_array().unwrap().len(), 1);

    let (status, json) = get_json(app(&env), "/api/worksets/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_regions_endpoint_disabled_without_coordinator() {
    let env = TestEnv::new(vec![]);
    let (status, json) = get_json(app(&env), "/api/regions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], false);
    assert!(json["regions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_regions_endpoint_reports_health() {
    let env = TestEnv::new(vec![]);
    let store: Arc<dyn StateStore> = env.store.clone();
    let config = CoordinatorConfig::default()
        .with_region("us-east-1", true)
        .with_region("us-west-2", false);
    let stores = BTreeMap::from([
        ("us-east-1".to_string(), store.clone()),
        ("us-west-2".to_string(), store),
    ]);
    let coordinator = Arc::new(
        MultiRegionCoordinator::new(config, stores)
            .unwrap()
            .with_clock(env.clock.clone()),
    );
    coordinator.check_health_once().await;

    let app = router(DashboardState {
        store: coordinator.clone(),
        scheduler: env.scheduler.clone(),
        coordinator: Some(coordinator),
    });
    let (status, json) = get_json(app, "/api/regions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], true);
    assert_eq!(json["primary"], "us-east-1");
    let regions = json["regions"].as_array().unwrap();
    assert_eq!(regions.len(), 2);
    assert!(regions.iter().all(|r| r["healthy"] == true));
    assert!(regions.iter().all(|r| !r["last_health_check_at"].is_null()));
}
