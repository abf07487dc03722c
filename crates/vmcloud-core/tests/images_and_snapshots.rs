use vmcloud_core::common::{CloudError, Filter, SnapshotState, VolumeFormat};
use vmcloud_core::testing::{TestCloud, BASE_IMAGE_GB};
use vmcloud_core::RegisterImageRequest;

fn image_request(name: &str, volume: &str) -> RegisterImageRequest {
    RegisterImageRequest {
        name: name.to_string(),
        volume_name: volume.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_register_image_from_pool_volume() {
    let cloud = TestCloud::new().await;
    cloud.hypervisor.add_volume("default", "debian.raw", 6);

    let image = cloud
        .context
        .images
        .register_image(image_request("debian", "debian.raw"))
        .await
        .unwrap();
    assert!(image.id.starts_with("img-"));
    assert_eq!(image.size_gb, 6);
    assert_eq!(image.format, VolumeFormat::Raw);
    assert_eq!(image.node, "local");

    let listed = cloud
        .context
        .images
        .describe_images(&[Filter::new("name", "debian")])
        .await
        .unwrap();
    assert_eq!(listed, vec![image]);

    assert!(cloud
        .context
        .images
        .register_image(image_request("ghost", "ghost.qcow2"))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_image_from_volume_is_a_full_copy() {
    let cloud = TestCloud::new().await;
    let volume = cloud.context.provisioning.create_volume(5, None).await.unwrap();

    let image = cloud
        .context
        .images
        .create_image_from_volume(&volume.id, "golden", Some("baked".into()))
        .await
        .unwrap();
    assert_eq!(cloud.disk_tool.ops(), vec!["convert"]);
    assert_eq!(image.size_gb, 5);
    assert!(cloud.hypervisor.has_volume("default", &image.volume_name()));

    // New volumes can be built from it right away.
    let clone = cloud
        .context
        .provisioning
        .create_volume_from_image(&image.id, 5)
        .await
        .unwrap();
    assert_eq!(clone.backing_file.as_ref(), Some(&image.path));
}

#[tokio::test]
async fn test_image_from_volume_rolls_back() {
    let cloud = TestCloud::new().await;
    let volume = cloud.context.provisioning.create_volume(5, None).await.unwrap();
    cloud.disk_tool.fail_on("convert");

    let err = cloud
        .context
        .images
        .create_image_from_volume(&volume.id, "golden", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::ToolFailure(_)));
    let mut names = cloud.hypervisor.volume_names("default");
    names.sort();
    let mut expected = vec!["base.qcow2".to_string(), volume.file_name()];
    expected.sort();
    assert_eq!(names, expected);
    assert_eq!(
        cloud.context.images.describe_images(&[]).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_deregister_keeps_files_that_back_volumes() {
    let cloud = TestCloud::new().await;
    let base = cloud.base_image.clone();
    cloud
        .context
        .provisioning
        .create_volume_from_image(&base.id, BASE_IMAGE_GB)
        .await
        .unwrap();

    assert!(matches!(
        cloud.context.images.deregister_image(&base.id, true).await,
        Err(CloudError::InvalidState(_))
    ));
    cloud
        .context
        .images
        .deregister_image(&base.id, false)
        .await
        .unwrap();
    assert!(cloud.context.images.get_image(&base.id).await.unwrap_err().is_not_found());
    assert!(cloud.hypervisor.has_volume("default", "base.qcow2"));
}

#[tokio::test]
async fn test_deregister_can_delete_unused_file() {
    let cloud = TestCloud::new().await;
    cloud.hypervisor.add_volume("default", "scratch.qcow2", 3);
    let image = cloud
        .context
        .images
        .register_image(image_request("scratch", "scratch.qcow2"))
        .await
        .unwrap();

    cloud.context.images.deregister_image(&image.id, true).await.unwrap();
    assert!(!cloud.hypervisor.has_volume("default", "scratch.qcow2"));
}

#[tokio::test]
async fn test_snapshot_export_sequence() {
    let cloud = TestCloud::new().await;
    let volume = cloud.context.provisioning.create_volume(5, None).await.unwrap();

    let snapshot = cloud
        .context
        .snapshots
        .create_snapshot(&volume.id, Some("before upgrade".into()))
        .await
        .unwrap();

    assert!(snapshot.id.starts_with("snap-"));
    assert_eq!(snapshot.state, SnapshotState::Completed);
    assert_eq!(snapshot.volume_id, volume.id);
    assert_eq!(snapshot.size_gb, 5);
    assert_eq!(
        cloud.disk_tool.ops(),
        vec!["snapshot_create", "convert_snapshot", "snapshot_delete"]
    );
    assert!(cloud
        .hypervisor
        .has_volume("default", &snapshot.format.file_name(&snapshot.id)));
    assert_eq!(
        cloud.context.snapshots.get_snapshot(&snapshot.id).await.unwrap(),
        snapshot
    );
}

#[tokio::test]
async fn test_failed_export_is_recorded_and_cleaned_up() {
    let cloud = TestCloud::new().await;
    let volume = cloud.context.provisioning.create_volume(5, None).await.unwrap();
    cloud.disk_tool.fail_on("convert_snapshot");

    let err = cloud
        .context
        .snapshots
        .create_snapshot(&volume.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::ToolFailure(_)));
    // The internal snapshot is dropped even though the export failed.
    assert_eq!(
        cloud.disk_tool.ops(),
        vec!["snapshot_create", "convert_snapshot", "snapshot_delete"]
    );

    let recorded = cloud.context.snapshots.describe_snapshots(&[]).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].state, SnapshotState::Failed);
    assert!(recorded[0].error.is_some());
    assert!(!cloud
        .hypervisor
        .has_volume("default", &recorded[0].format.file_name(&recorded[0].id)));

    assert!(matches!(
        cloud
            .context
            .provisioning
            .create_volume_from_snapshot(&recorded[0].id, None)
            .await,
        Err(CloudError::InvalidState(_))
    ));
    assert!(matches!(
        cloud.context.snapshots.copy_snapshot(&recorded[0].id, None).await,
        Err(CloudError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_volume_from_snapshot_and_copy() {
    let cloud = TestCloud::new().await;
    let volume = cloud.context.provisioning.create_volume(5, None).await.unwrap();
    let snapshot = cloud
        .context
        .snapshots
        .create_snapshot(&volume.id, Some("v1".into()))
        .await
        .unwrap();

    let restored = cloud
        .context
        .provisioning
        .create_volume_from_snapshot(&snapshot.id, Some(8))
        .await
        .unwrap();
    assert_eq!(restored.size_gb, 8);
    assert_eq!(restored.source_snapshot_id.as_deref(), Some(snapshot.id.as_str()));
    assert!(restored.source_image_id.is_none());

    let copy = cloud
        .context
        .snapshots
        .copy_snapshot(&snapshot.id, None)
        .await
        .unwrap();
    assert_ne!(copy.id, snapshot.id);
    assert_eq!(copy.copied_from.as_deref(), Some(snapshot.id.as_str()));
    assert_eq!(copy.description.as_deref(), Some("v1"));
    assert_eq!(copy.state, SnapshotState::Completed);

    cloud.context.snapshots.delete_snapshot(&snapshot.id).await.unwrap();
    assert!(!cloud
        .hypervisor
        .has_volume("default", &snapshot.format.file_name(&snapshot.id)));
    let remaining = cloud.context.snapshots.describe_snapshots(&[]).await.unwrap();
    assert_eq!(remaining, vec![copy]);
}

#[tokio::test]
async fn test_snapshot_of_unknown_volume() {
    let cloud = TestCloud::new().await;
    assert!(cloud
        .context
        .snapshots
        .create_snapshot("vol-00000000000000000", None)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(cloud
        .context
        .provisioning
        .create_volume_from_snapshot("snap-00000000000000000", None)
        .await
        .unwrap_err()
        .is_not_found());
}
