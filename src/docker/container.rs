//! Per-instance container lifecycle.

use tracing::{debug, warn};

use crate::docker::client::DockerClient;
use crate::error::DockerError;
use crate::specs::{InstallSpec, TestSpec};

/// Creates and starts the evaluation container for an instance.
///
/// The container runs `tail -f /dev/null` so it stays alive between execs.
/// Returns the container name, which doubles as its handle for later calls.
pub async fn start_instance_container(
    client: &DockerClient,
    spec: &TestSpec,
    install: &InstallSpec,
    run_id: &str,
) -> Result<String, DockerError> {
    let name = spec.container_name(run_id);
    let user = install.container_user();
    debug!(container = %name, image = %spec.instance_image_key, user, "creating container");

    client
        .create_container(
            &name,
            &spec.instance_image_key,
            &spec.platform,
            user,
            install.nano_cpus,
        )
        .await?;
    client.start_container(&name).await?;
    Ok(name)
}

/// Tears down a container: graceful stop, SIGKILL if the stop fails, then
/// forced removal.
///
/// Every failure is logged and swallowed. Teardown runs on both the success
/// and the error path of an instance, and a leaked container must never turn
/// a graded result into a failure.
pub async fn cleanup_container(client: &DockerClient, name: &str) {
    if let Err(e) = client.stop_container(name, 15).await {
        let pid = client.container_pid(name).await.ok().flatten();
        warn!(container = name, ?pid, "graceful stop failed, killing: {e}");
        if let Err(kill_err) = client.kill_container(name).await {
            warn!(container = name, "failed to kill container: {kill_err}");
        }
    }

    match client.remove_container(name).await {
        Ok(()) => debug!(container = name, "container removed"),
        Err(DockerError::Api(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        })) => {}
        Err(e) => warn!(container = name, "failed to remove container: {e}"),
    }
}

/// Removes leftover containers from a previous run, e.g. after an interrupt.
pub async fn clean_containers(
    client: &DockerClient,
    run_id: Option<&str>,
) -> Result<usize, DockerError> {
    let names = client.list_harness_containers(run_id).await?;
    let count = names.len();
    for name in names {
        cleanup_container(client, &name).await;
    }
    Ok(count)
}
