//! Crash-safety around `ConfigurationManager::save`: a write failure must
//! never leave the on-disk document in a half-written or missing state.

use mcp_composer::config::{ConfigurationDocument, ConfigurationManager, StoredServer};

#[tokio::test]
async fn round_trips_servers_and_kit_assignments() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ConfigurationManager::new(dir.path().join("config.json"));

    let spec = composer_registry::DownstreamServerSpec::stdio(
        "A",
        "echo",
        vec!["hi".to_string()],
        Default::default(),
    );
    manager.add_mcp_server(&spec).await.unwrap();

    let loaded = manager.load().await.unwrap();
    assert_eq!(loaded.mcp_servers["A"].command.as_deref(), Some("echo"));
}

#[cfg(unix)]
#[tokio::test]
async fn save_failure_after_an_existing_file_restores_it_from_backup() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let manager = ConfigurationManager::new(&path);

    let mut original = ConfigurationDocument::default();
    original.mcp_servers.insert(
        "A".to_string(),
        StoredServer {
            command: Some("echo".to_string()),
            args: vec!["first".to_string()],
            ..Default::default()
        },
    );
    manager.save(&original).await.unwrap();
    let original_bytes = tokio::fs::read(&path).await.unwrap();

    // Read-only directory: the second `save` must fail and leave "A" intact.
    let original_perms = tokio::fs::metadata(dir.path()).await.unwrap().permissions();
    let mut readonly = original_perms.clone();
    readonly.set_mode(0o555);
    tokio::fs::set_permissions(dir.path(), readonly).await.unwrap();

    let mut second = ConfigurationDocument::default();
    second.mcp_servers.insert(
        "B".to_string(),
        StoredServer {
            command: Some("echo".to_string()),
            args: vec!["second".to_string()],
            ..Default::default()
        },
    );
    let result = manager.save(&second).await;

    tokio::fs::set_permissions(dir.path(), original_perms)
        .await
        .unwrap();

    assert!(result.is_err());
    let restored_bytes = tokio::fs::read(&path).await.unwrap();
    assert_eq!(restored_bytes, original_bytes);

    let restored = manager.load().await.unwrap();
    assert_eq!(restored.mcp_servers["A"].args, vec!["first".to_string()]);
    assert!(!restored.mcp_servers.contains_key("B"));
}
