use std::sync::Arc;

use flowforge_core::ProcessInstanceId;
use flowforge_engine::config::keys;
use flowforge_engine::{ContentEngineConfigurator, EngineError, EngineProperties, ProcessEngine};
use flowforge_infra::content::{ContentError, NewContent};

#[tokio::test]
async fn content_items_round_trip_through_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("content");

    let props = EngineProperties::new()
        .with(keys::ASYNC_EXECUTOR_ACTIVATE, "false")
        .with(keys::CONTENT_ROOT_FOLDER, root.to_string_lossy())
        .with(keys::CONTENT_CREATE_ROOT, "true");
    let engine = ProcessEngine::builder(props)
        .configurator(Arc::new(ContentEngineConfigurator::new()))
        .build()
        .await
        .unwrap();
    assert!(root.is_dir());

    let content = engine.content_service().unwrap();
    let instance = ProcessInstanceId::new();

    let invoice = content
        .create_content_item(
            NewContent::new("invoice.pdf", b"%PDF-1.7".to_vec())
                .with_mime_type("application/pdf")
                .with_process_instance(instance),
        )
        .await
        .unwrap();
    let note = content
        .create_content_item(NewContent::new("note.txt", "loose note"))
        .await
        .unwrap();

    assert_eq!(invoice.size, 8);
    assert_eq!(content.get_content(invoice.id).await.unwrap(), b"%PDF-1.7");
    let fetched = content.get_content_item(invoice.id).await.unwrap();
    assert_eq!(fetched.mime_type.as_deref(), Some("application/pdf"));
    assert_eq!(fetched.process_instance_id, Some(instance));

    let for_instance = content.list_content_items(Some(instance)).await.unwrap();
    assert_eq!(for_instance.len(), 1);
    assert_eq!(for_instance[0].id, invoice.id);
    assert_eq!(content.list_content_items(None).await.unwrap().len(), 2);

    content.delete_content_item(note.id).await.unwrap();
    let err = content.get_content_item(note.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Content(ContentError::NotFound(id)) if id == note.id));
}

#[tokio::test]
async fn missing_content_root_without_create_fails_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let props = EngineProperties::new()
        .with(keys::ASYNC_EXECUTOR_ACTIVATE, "false")
        .with(keys::CONTENT_CREATE_ROOT, "false");

    let err = ProcessEngine::builder(props)
        .configurator(Arc::new(
            ContentEngineConfigurator::new().with_root_folder(dir.path().join("absent")),
        ))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configurator { ref name, .. } if name == "content-engine"));
}
