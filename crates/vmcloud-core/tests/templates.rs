use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vmcloud_core::common::{
    CloudError, DestinationKey, DownloadStatus, DownloadTask, HypervisorClient, TemplateStatus, GIB,
};
use vmcloud_core::download::CompletionCallback;
use vmcloud_core::testing::TestCloud;
use vmcloud_core::{RegisterTemplateRequest, TemplateUpdate};

const URL: &str = "https://images.example.com/jammy.qcow2";

fn template(name: &str, volume: &str, url: Option<&str>) -> RegisterTemplateRequest {
    RegisterTemplateRequest {
        name: name.to_string(),
        volume_name: volume.to_string(),
        source_url: url.map(str::to_string),
        os_type: "linux".to_string(),
        os_version: Some("22.04".to_string()),
        features: BTreeMap::from([("cloud_init".to_string(), true)]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_existing_volume_is_available_immediately() {
    let cloud = TestCloud::new().await;
    cloud.hypervisor.add_volume("default", "jammy.qcow2", 12);

    let registered = cloud
        .context
        .templates
        .register_template(template("jammy", "jammy.qcow2", Some(URL)))
        .await
        .unwrap();

    assert_eq!(registered.status, TemplateStatus::Available);
    assert_eq!(registered.size_gb, 12);
    assert_eq!(registered.arch, "x86_64");
    assert!(registered.download_task_id.is_none());
    assert!(cloud.fetcher.fetched().is_empty());
    assert_eq!(cloud.runner.pending(), 0);
}

#[tokio::test]
async fn test_missing_volume_without_url() {
    let cloud = TestCloud::new().await;
    let err = cloud
        .context
        .templates
        .register_template(template("jammy", "jammy.qcow2", None))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(cloud.context.templates.describe_templates(&[]).await.unwrap().is_empty());

    assert!(matches!(
        cloud
            .context
            .templates
            .register_template(template("", "jammy.qcow2", None))
            .await,
        Err(CloudError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_download_completes_template() {
    let cloud = TestCloud::new().await;
    let pending = cloud
        .context
        .templates
        .register_template(template("jammy", "jammy.qcow2", Some(URL)))
        .await
        .unwrap();

    assert_eq!(pending.status, TemplateStatus::Pending);
    let task_id = pending.download_task_id.clone().unwrap();
    assert_eq!(cloud.context.downloads.list_active().await.len(), 1);
    assert!(cloud.fetcher.fetched().is_empty());

    cloud.runner.run_pending().await;

    let done = cloud.context.templates.get_template(&pending.id).await.unwrap();
    assert_eq!(done.status, TemplateStatus::Available);
    assert_eq!(done.size_gb, 8);
    assert!(done.error.is_none());
    assert!(cloud.hypervisor.has_volume("default", "jammy.qcow2"));

    let task = cloud.context.downloads.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, DownloadStatus::Completed);
    assert_eq!(task.bytes, Some(8 * GIB));
    assert!(cloud.context.downloads.list_active().await.is_empty());
    assert_eq!(cloud.fetcher.fetched(), vec![URL.to_string()]);
}

#[tokio::test]
async fn test_failed_download_marks_template_failed() {
    let cloud = TestCloud::new().await;
    cloud.fetcher.fail_url(URL);
    let pending = cloud
        .context
        .templates
        .register_template(template("jammy", "jammy.qcow2", Some(URL)))
        .await
        .unwrap();
    cloud.runner.run_pending().await;

    let failed = cloud.context.templates.get_template(&pending.id).await.unwrap();
    assert_eq!(failed.status, TemplateStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("HTTP 404"));

    let task = cloud
        .context
        .downloads
        .get_task(failed.download_task_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(task.status, DownloadStatus::Failed);
    assert!(task.error.is_some());
    assert!(!cloud.hypervisor.has_volume("default", "jammy.qcow2"));
}

#[tokio::test]
async fn test_same_destination_shares_one_download() {
    let cloud = TestCloud::new().await;
    let first = cloud
        .context
        .templates
        .register_template(template("jammy", "jammy.qcow2", Some(URL)))
        .await
        .unwrap();
    let second = cloud
        .context
        .templates
        .register_template(template("jammy-copy", "jammy.qcow2", Some(URL)))
        .await
        .unwrap();

    assert_eq!(first.download_task_id, second.download_task_id);
    assert_eq!(cloud.runner.pending(), 1);

    cloud.runner.run_pending().await;
    assert_eq!(cloud.fetcher.fetched().len(), 1);
    for id in [&first.id, &second.id] {
        let template = cloud.context.templates.get_template(id).await.unwrap();
        assert_eq!(template.status, TemplateStatus::Available);
        assert_eq!(template.size_gb, 8);
    }
}

#[tokio::test]
async fn test_template_deleted_before_download_finishes() {
    let cloud = TestCloud::new().await;
    let pending = cloud
        .context
        .templates
        .register_template(template("jammy", "jammy.qcow2", Some(URL)))
        .await
        .unwrap();
    cloud
        .context
        .templates
        .delete_template(&pending.id, false)
        .await
        .unwrap();

    cloud.runner.run_pending().await;
    assert!(cloud
        .context
        .templates
        .get_template(&pending.id)
        .await
        .unwrap_err()
        .is_not_found());
    let task = cloud
        .context
        .downloads
        .get_task(pending.download_task_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(task.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn test_update_and_delete_template() {
    let cloud = TestCloud::new().await;
    cloud.hypervisor.add_volume("default", "jammy.qcow2", 12);
    let registered = cloud
        .context
        .templates
        .register_template(template("jammy", "jammy.qcow2", None))
        .await
        .unwrap();

    let updated = cloud
        .context
        .templates
        .update_template(
            &registered.id,
            TemplateUpdate {
                name: Some("jammy-lts".into()),
                features: Some(BTreeMap::from([("uefi".to_string(), true)])),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "jammy-lts");
    assert_eq!(updated.os_version.as_deref(), Some("22.04"));
    assert_eq!(updated.features.get("uefi"), Some(&true));
    assert!(updated.updated_at >= registered.updated_at);

    assert!(matches!(
        cloud
            .context
            .templates
            .update_template(
                &registered.id,
                TemplateUpdate {
                    name: Some(" ".into()),
                    ..Default::default()
                }
            )
            .await,
        Err(CloudError::InvalidArgument(_))
    ));

    cloud
        .context
        .templates
        .delete_template(&registered.id, true)
        .await
        .unwrap();
    assert!(!cloud.hypervisor.has_volume("default", "jammy.qcow2"));
    assert!(cloud.context.templates.describe_templates(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_download_manager_validates_destination() {
    let cloud = TestCloud::new().await;
    let hypervisor: Arc<dyn HypervisorClient> = cloud.hypervisor.clone();

    let err = cloud
        .context
        .downloads
        .start_download(
            hypervisor.clone(),
            DestinationKey::new("elsewhere", "default", "a.qcow2"),
            URL,
            None,
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CloudError::InvalidArgument(_)));

    let err = cloud
        .context
        .downloads
        .start_download(
            hypervisor,
            DestinationKey::new("local", "missing", "a.qcow2"),
            URL,
            None,
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CloudError::PoolUnavailable(_)));
    assert!(cloud.context.downloads.list_tasks().await.is_empty());
}

#[tokio::test]
async fn test_completion_callbacks_and_cleanup() {
    let cloud = TestCloud::new().await;
    let hypervisor: Arc<dyn HypervisorClient> = cloud.hypervisor.clone();
    let seen: Arc<Mutex<Vec<(DownloadStatus, Option<String>)>>> = Arc::default();

    let callback = |seen: Arc<Mutex<Vec<(DownloadStatus, Option<String>)>>>| -> CompletionCallback {
        Box::new(move |task: DownloadTask, failure: Option<Arc<CloudError>>| {
            async move {
                seen.lock()
                    .unwrap()
                    .push((task.status, failure.map(|e| e.to_string())));
            }
            .boxed()
        })
    };

    let destination = DestinationKey::new("local", "default", "raw.img");
    let (task, is_new) = cloud
        .context
        .downloads
        .start_download(
            hypervisor.clone(),
            destination.clone(),
            URL,
            Some(callback(seen.clone())),
        )
        .await
        .unwrap();
    assert!(is_new);
    let (joined, is_new) = cloud
        .context
        .downloads
        .start_download(hypervisor, destination.clone(), URL, Some(callback(seen.clone())))
        .await
        .unwrap();
    assert!(!is_new);
    assert_eq!(joined.id, task.id);

    cloud.runner.run_pending().await;
    let seen_now = seen.lock().unwrap().clone();
    assert_eq!(seen_now, vec![(DownloadStatus::Completed, None); 2]);

    assert_eq!(cloud.context.downloads.cleanup_older_than(Duration::from_secs(3600)).await, 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(cloud.context.downloads.cleanup_older_than(Duration::from_millis(1)).await, 1);
    assert!(cloud
        .context
        .downloads
        .get_task_by_destination(&destination)
        .await
        .is_none());
}
