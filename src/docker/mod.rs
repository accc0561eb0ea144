//! Docker engine integration: client wrapper, container lifecycle, and
//! image retention.

pub mod client;
pub mod container;
pub mod retention;

pub use client::{DockerClient, ExecOutput, ImageInfo, IMAGE_PREFIX};
pub use container::{clean_containers, cleanup_container, start_instance_container};
pub use retention::{clean_images, should_remove, CacheLevel};
