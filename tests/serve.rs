mod common;
use common::{KillOnDrop, get_free_port, http_client, http_get, spawn_gateway, wait_for_listening};

#[tokio::test]
async fn anonymous_gateway_serves_fixed_identity() {
    let port = get_free_port();
    let config = r#"
        [auth]
        mode = "anonymous"
        username = "viewer"
        groups = ["readonly"]
    "#;
    let _guard = KillOnDrop(spawn_gateway(config, port));
    wait_for_listening(port, 20).await;
    let client = http_client();

    let resp = http_get(&client, port, "/healthz").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = http_get(&client, port, "/api/v1/whoami").await;
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers().get(reqwest::header::SET_COOKIE).is_none(),
        "anonymous mode must not set cookies"
    );
    assert_eq!(
        resp.text().await.unwrap(),
        r#"{"username":"viewer","groups":["readonly"]}"#
    );
}

#[tokio::test]
async fn unreachable_cluster_is_reported_as_bad_gateway() {
    let port = get_free_port();
    let _guard = KillOnDrop(spawn_gateway("", port));
    wait_for_listening(port, 20).await;

    let resp = http_get(
        &http_client(),
        port,
        "/api/v1/namespaces?group=apps&resource=deployments",
    )
    .await;
    assert_eq!(resp.status(), 502);
}
