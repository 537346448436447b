//! Image pulls with progress events.

use bollard::auth::DockerCredentials;
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use roost_events::topic;

use super::DockerEnvironment;
use crate::Result;

/// Pulls the image, publishing pull lifecycle events on the bus. When the
/// pull fails but the image already exists locally, the failure is degraded
/// to a warning so servers can still boot while a registry is down.
pub(crate) async fn ensure_pulled(env: &DockerEnvironment, image: &str) -> Result<()> {
    // Images pinned with the ~ prefix are never pulled.
    if let Some(local) = image.strip_prefix('~') {
        tracing::debug!(server = %env.uuid, image = local, "skipping pull for locally pinned image");
        return Ok(());
    }

    env.bus.publish(
        topic::DOCKER_IMAGE_PULL_STARTED,
        serde_json::json!({ "image": image }),
    );

    let credentials = registry_credentials(env, image);
    let options = CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    };

    let mut stream = env.client.create_image(Some(options), None, credentials);
    let mut pull_error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(info) => {
                env.bus.publish(
                    topic::DOCKER_IMAGE_PULL_STATUS,
                    serde_json::json!({
                        "status": info.status.unwrap_or_default(),
                        "progress": info.progress.unwrap_or_default(),
                    }),
                );
            }
            Err(err) => {
                pull_error = Some(err);
                break;
            }
        }
    }

    if let Some(err) = pull_error {
        // A failed pull is tolerable when the image is already present.
        if env.client.inspect_image(image).await.is_ok() {
            tracing::warn!(
                server = %env.uuid,
                image,
                error = %err,
                "image pull failed, using local copy"
            );
        } else {
            return Err(err.into());
        }
    }

    env.bus.publish(
        topic::DOCKER_IMAGE_PULL_COMPLETED,
        serde_json::json!({ "image": image }),
    );
    Ok(())
}

/// Matches the image's registry host against configured credentials.
fn registry_credentials(env: &DockerEnvironment, image: &str) -> Option<DockerCredentials> {
    let registry = image.split('/').next().unwrap_or_default();
    env.settings.registries.get(registry).map(|auth| DockerCredentials {
        username: Some(auth.username.clone()),
        password: Some(auth.password.clone()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    })
}
