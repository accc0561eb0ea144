//! Image retention policy.
//!
//! After a run, images are kept or removed according to a cache level. The
//! policy distinguishes images that existed before the run from images the
//! run created, so a conservative level never deletes a user's warm cache.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

use crate::docker::client::DockerClient;
use crate::error::DockerError;
use crate::specs::test_spec::ImageTier;

/// How much of the image hierarchy survives the end of a run.
///
/// Each level keeps its own tier and everything below it: `Env` keeps base
/// and environment images but drops instance images, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    /// Remove every image the harness built.
    None,
    /// Keep base images only.
    Base,
    /// Keep base and environment images.
    Env,
    /// Keep everything, including per-instance images.
    Instance,
}

impl FromStr for CacheLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CacheLevel::None),
            "base" => Ok(CacheLevel::Base),
            "env" => Ok(CacheLevel::Env),
            "instance" => Ok(CacheLevel::Instance),
            other => Err(format!(
                "invalid cache level '{other}' (expected none, base, env, or instance)"
            )),
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheLevel::None => "none",
            CacheLevel::Base => "base",
            CacheLevel::Env => "env",
            CacheLevel::Instance => "instance",
        };
        f.write_str(s)
    }
}

/// Decides whether an image should be removed at the end of a run.
///
/// `prior_images` is the snapshot of harness image tags taken before the run
/// started. An image that predates the run is only removed when `clean` is
/// set; an image the run created falls under the cache level alone.
pub fn should_remove(
    image_name: &str,
    cache_level: CacheLevel,
    clean: bool,
    prior_images: &HashSet<String>,
) -> bool {
    let existed_before = prior_images.contains(image_name);
    let removable = clean || !existed_before;
    if !removable {
        return false;
    }

    if image_name.starts_with(ImageTier::Base.key_prefix()) {
        matches!(cache_level, CacheLevel::None)
    } else if image_name.starts_with(ImageTier::Env.key_prefix()) {
        matches!(cache_level, CacheLevel::None | CacheLevel::Base)
    } else if image_name.starts_with(ImageTier::Instance.key_prefix()) {
        matches!(
            cache_level,
            CacheLevel::None | CacheLevel::Base | CacheLevel::Env
        )
    } else {
        false
    }
}

/// Applies the retention policy to the local image store.
///
/// Returns the number of images removed. Removal failures are logged and do
/// not abort the sweep.
pub async fn clean_images(
    client: &DockerClient,
    prior_images: &HashSet<String>,
    cache_level: CacheLevel,
    clean: bool,
) -> Result<usize, DockerError> {
    let mut removed = 0;
    for image in client.list_harness_images().await? {
        for tag in image.tags {
            if !should_remove(&tag, cache_level, clean, prior_images) {
                continue;
            }
            match client.remove_image(&tag).await {
                Ok(()) => {
                    info!(image = %tag, "removed image");
                    removed += 1;
                }
                Err(e) => warn!(image = %tag, "failed to remove image: {e}"),
            }
        }
    }
    Ok(removed)
}
