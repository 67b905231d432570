//! Host-mount auto-detection for the media-scraper service. Iterates
//! every known Docker endpoint looking for a third-party container by
//! image/name substring, the way `DockerGateway::endpoints` enumerates
//! sockets for `InstallationEngine`.

use bollard::container::ListContainersOptions;
use bollard::Docker;

use crate::docker::DockerGateway;

#[derive(Debug, Clone)]
pub struct MountDetection {
    pub mount_path: String,
    pub socket_path: String,
    pub container_id: String,
    pub container_name: String,
}

pub struct MountDetector;

impl MountDetector {
    /// Searches every endpoint for a container whose image or name
    /// contains `needle` (case-insensitive) and returns its `/data` bind
    /// mount source. Per-socket errors are logged and swallowed.
    pub async fn detect(gateway: &DockerGateway, needle: &str) -> Option<MountDetection> {
        let needle = needle.to_ascii_lowercase();

        for (client, socket_path) in gateway.endpoints().await {
            match find_container(&client, &needle).await {
                Ok(Some((id, name))) => match inspect_data_mount(&client, &id).await {
                    Ok(Some(mount_path)) => {
                        return Some(MountDetection {
                            mount_path,
                            socket_path,
                            container_id: id,
                            container_name: name,
                        });
                    }
                    Ok(None) => {
                        tracing::debug!(
                            "container {name} matched {needle} but has no /data mount"
                        );
                    }
                    Err(e) => tracing::warn!("failed to inspect {name} on {socket_path}: {e}"),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!("failed to list containers on {socket_path}: {e}"),
            }
        }

        None
    }
}

async fn find_container(
    client: &Docker,
    needle: &str,
) -> Result<Option<(String, String)>, bollard::errors::Error> {
    let opts = ListContainersOptions::<String> {
        all: true,
        ..Default::default()
    };

    let containers = client.list_containers(Some(opts)).await?;

    for container in containers {
        let image_matches = container
            .image
            .as_deref()
            .map(|i| i.to_ascii_lowercase().contains(needle))
            .unwrap_or(false);

        let name_matches = container
            .names
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .any(|n| n.to_ascii_lowercase().contains(needle));

        if image_matches || name_matches {
            let id = container.id.unwrap_or_default();
            let name = container
                .names
                .and_then(|names| names.into_iter().next())
                .unwrap_or_default();
            return Ok(Some((id, name)));
        }
    }

    Ok(None)
}

async fn inspect_data_mount(
    client: &Docker,
    container_id: &str,
) -> Result<Option<String>, bollard::errors::Error> {
    let response = client.inspect_container(container_id, None).await?;

    let mount = response
        .mounts
        .unwrap_or_default()
        .into_iter()
        .find(|m| m.destination.as_deref() == Some("/data"));

    Ok(mount.and_then(|m| m.source))
}
