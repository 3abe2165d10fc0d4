//! Control socket client, map store and backend against a fake HAProxy.

mod common;

use common::FakeHaproxy;
use haproxy_dynconf::error::DynconfError;
use haproxy_dynconf::haproxy::ServerState;

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let fake = FakeHaproxy::new();
    fake.add_backend("be_http:shop:web", 1);
    let client = fake.client();

    fake.refuse_next(2);
    let backends = client.backends().await.unwrap();
    assert_eq!(backends, vec!["be_http:shop:web"]);
    assert_eq!(fake.count_commands("show backend"), 3);
}

#[tokio::test(start_paused = true)]
async fn retries_give_up_after_three_attempts() {
    let fake = FakeHaproxy::new();
    let client = fake.client();

    fake.refuse_next(3);
    let err = client.execute("show backend").await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(fake.count_commands("show backend"), 3);
}

#[tokio::test(start_paused = true)]
async fn missing_socket_is_not_retried() {
    let fake = FakeHaproxy::new();
    let client = fake.client();

    fake.remove_socket();
    let err = client.execute("show backend").await.unwrap_err();
    assert!(err.is_transport());
    assert!(err.to_string().contains("no such file"));
    assert_eq!(fake.count_commands("show backend"), 1);
}

#[tokio::test]
async fn discovery_is_cached_until_reset() {
    let fake = FakeHaproxy::new();
    let client = fake.client();

    client.maps().await.unwrap();
    client.maps().await.unwrap();
    assert_eq!(fake.count_commands("show map"), 1);

    client.reset().await;
    client.maps().await.unwrap();
    assert_eq!(fake.count_commands("show map"), 2);
}

#[tokio::test]
async fn maps_are_found_by_file_name_or_path() {
    let fake = FakeHaproxy::new();
    let client = fake.client();

    let by_name = client.find_map("os_http_be.map").await.unwrap();
    let by_path = client
        .find_map("/var/lib/haproxy/conf/os_http_be.map")
        .await
        .unwrap();
    assert_eq!(by_name.name(), by_path.name());

    let err = client.find_map("os_missing.map").await.unwrap_err();
    assert!(matches!(err, DynconfError::MapNotFound(_)));
}

#[tokio::test]
async fn sync_replaces_the_map_in_one_transaction() {
    let fake = FakeHaproxy::new();
    fake.set_map("os_http_be.map", &[("route.test", "be_http:ns:b")]);
    let client = fake.client();
    let mut map = client.find_map("os_http_be.map").await.unwrap();

    map.sync_entries(&[("sub.route.test".into(), "be_http:ns:a".into())], true)
        .await
        .unwrap();

    assert_eq!(
        fake.map("os_http_be.map"),
        vec![
            ("sub.route.test".to_string(), "be_http:ns:a".to_string()),
            ("route.test".to_string(), "be_http:ns:b".to_string()),
        ]
    );
    assert_eq!(fake.count_commands("prepare map"), 1);
    assert_eq!(fake.count_commands("add map @1"), 1);
    assert_eq!(fake.count_commands("commit map @1"), 1);
}

#[tokio::test]
async fn sync_removal_keeps_other_keys() {
    let fake = FakeHaproxy::new();
    fake.set_map(
        "os_tcp_be.map",
        &[("a.test", "be_tcp:ns:a"), ("b.test", "be_tcp:ns:b")],
    );
    let client = fake.client();
    let mut map = client.find_map("os_tcp_be.map").await.unwrap();

    map.sync_entries(&[("a.test".into(), String::new())], false)
        .await
        .unwrap();

    assert_eq!(
        fake.map("os_tcp_be.map"),
        vec![("b.test".to_string(), "be_tcp:ns:b".to_string())]
    );
}

#[tokio::test]
async fn emptied_map_skips_the_upload() {
    let fake = FakeHaproxy::new();
    fake.set_map("os_sni_passthrough.map", &[("a.test", "1")]);
    let client = fake.client();
    let mut map = client.find_map("os_sni_passthrough.map").await.unwrap();

    map.sync_entries(&[("a.test".into(), "1".into())], false)
        .await
        .unwrap();

    assert!(fake.map("os_sni_passthrough.map").is_empty());
    assert_eq!(fake.count_commands("add map @"), 0);
    assert_eq!(fake.count_commands("commit map"), 1);
}

#[tokio::test]
async fn rejected_commit_is_an_error() {
    let fake = FakeHaproxy::new();
    fake.fail_on("commit map", "Unknown map version.\n");
    let client = fake.client();
    let mut map = client.find_map("os_http_be.map").await.unwrap();

    let err = map
        .sync_entries(&[("a.test".into(), "be_http:ns:a".into())], true)
        .await
        .unwrap_err();
    assert!(matches!(err, DynconfError::CommandFailed { .. }));
    assert!(fake.map("os_http_be.map").is_empty());
}

#[tokio::test]
async fn single_entries_can_be_added_and_deleted() {
    let fake = FakeHaproxy::new();
    let client = fake.client();
    let mut map = client.find_map("os_wildcard_domain.map").await.unwrap();

    map.add("a.test", "1", false).await.unwrap();
    map.add("a.test", "1", false).await.unwrap();
    assert_eq!(map.find("a.test").await.unwrap().len(), 2);

    map.add("a.test", "1", true).await.unwrap();
    assert_eq!(map.find("a.test").await.unwrap().len(), 1);

    map.delete("a.test").await.unwrap();
    assert!(map.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn staged_server_changes_are_committed_together() {
    let fake = FakeHaproxy::new();
    fake.add_backend("be_http:shop:web", 2);
    let client = fake.client();
    let mut backend = client.find_backend("be_http:shop:web").await.unwrap();

    backend
        .update_server_info("_dynamic-pod-1", "10.0.0.5", 8080, None, 100, false)
        .await
        .unwrap();
    backend.enable_server("_dynamic-pod-1").await.unwrap();
    assert_eq!(fake.count_commands("set server"), 0);

    backend.commit().await.unwrap();
    let server = fake.server("be_http:shop:web", "_dynamic-pod-1").unwrap();
    assert_eq!((server.ip.as_str(), server.port), ("10.0.0.5", 8080));
    assert_eq!(server.weight, 100);
    assert!(server.is_ready());

    let servers = backend.servers().await.unwrap();
    assert_eq!(servers[0].state, ServerState::Ready);
    assert_eq!(servers[1].state, ServerState::Maintenance);
}

#[tokio::test]
async fn relative_weight_is_sent_as_percentage() {
    let fake = FakeHaproxy::new();
    fake.add_backend("be_tcp:ns:db", 0);
    fake.add_static_server("be_tcp:ns:db", "db-1", "10.0.0.1", 5432);
    let client = fake.client();
    let mut backend = client.find_backend("be_tcp:ns:db").await.unwrap();

    backend
        .update_server_info("db-1", "10.0.0.2", 5432, None, 50, true)
        .await
        .unwrap();
    backend.commit().await.unwrap();

    assert_eq!(fake.count_commands("set server be_tcp:ns:db/db-1 weight 50%"), 1);
    assert_eq!(fake.server("be_tcp:ns:db", "db-1").unwrap().weight, 128);
}

#[tokio::test]
async fn unknown_servers_and_backends_are_reported() {
    let fake = FakeHaproxy::new();
    fake.add_backend("be_http:shop:web", 1);
    let client = fake.client();

    let err = client.find_backend("be_http:shop:none").await.unwrap_err();
    assert!(matches!(err, DynconfError::BackendNotFound(_)));

    let mut backend = client.find_backend("be_http:shop:web").await.unwrap();
    let err = backend.enable_server("pod-x").await.unwrap_err();
    assert!(matches!(err, DynconfError::ServerNotFound { .. }));
}

#[tokio::test]
async fn disabling_a_backend_puts_every_server_in_maintenance() {
    let fake = FakeHaproxy::new();
    fake.add_backend("be_http:shop:web", 1);
    fake.add_static_server("be_http:shop:web", "web-1", "10.0.0.1", 80);
    let client = fake.client();
    let mut backend = client.find_backend("be_http:shop:web").await.unwrap();

    backend.disable().await.unwrap();
    backend.commit().await.unwrap();

    assert!(fake
        .servers("be_http:shop:web")
        .iter()
        .all(common::FakeServer::is_maintenance));
}

#[tokio::test]
async fn routing_key_enables_dynamic_cookies() {
    let fake = FakeHaproxy::new();
    fake.add_backend("be_edge_http:shop:web", 1);
    let client = fake.client();
    let backend = client.find_backend("be_edge_http:shop:web").await.unwrap();

    backend.set_routing_key("abc123").await.unwrap();
    assert_eq!(
        fake.cookie_key("be_edge_http:shop:web").as_deref(),
        Some("abc123")
    );
}
