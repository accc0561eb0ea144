//! Pure build planning.
//!
//! Decides which images need building from a snapshot of what exists
//! locally, without touching the Docker engine. An image is rebuilt when it
//! is missing, when a rebuild is forced, or when its parent is newer than it
//! is; staleness cascades down the hierarchy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// One image the caller wants present, with its parent in the hierarchy.
/// Base images have no parent.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub name: String,
    pub parent: Option<String>,
}

impl ImageRequest {
    pub fn base(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    pub fn child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent.into()),
        }
    }
}

/// Outcome of planning: which requested images to build, in request order,
/// and which are already current.
#[derive(Debug, Default)]
pub struct BuildPlan {
    pub to_build: Vec<String>,
    pub up_to_date: Vec<String>,
}

/// Plans builds for `requests` against a snapshot of local image creation
/// times. Requests must list parents before children.
pub fn plan_images(
    snapshot: &HashMap<String, DateTime<Utc>>,
    requests: &[ImageRequest],
    force: bool,
) -> BuildPlan {
    let mut plan = BuildPlan::default();
    // Names already scheduled this round, so children of a rebuilt parent
    // rebuild too even when their own timestamps look fine.
    let mut scheduled: HashMap<&str, bool> = HashMap::new();

    for request in requests {
        let needs_build = force || needs_build(snapshot, request, &scheduled);
        scheduled.insert(request.name.as_str(), needs_build);
        if needs_build {
            plan.to_build.push(request.name.clone());
        } else {
            plan.up_to_date.push(request.name.clone());
        }
    }
    plan
}

fn needs_build(
    snapshot: &HashMap<String, DateTime<Utc>>,
    request: &ImageRequest,
    scheduled: &HashMap<&str, bool>,
) -> bool {
    let Some(created) = snapshot.get(&request.name) else {
        return true;
    };

    let Some(parent) = &request.parent else {
        return false;
    };
    if scheduled.get(parent.as_str()).copied().unwrap_or(false) {
        return true;
    }
    match snapshot.get(parent) {
        // Parent rebuilt after this image was created.
        Some(parent_created) => parent_created > created,
        // Parent missing entirely; this image's layers are orphaned.
        None => true,
    }
}
