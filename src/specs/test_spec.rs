//! Fully resolved build/run recipe for one task instance.
//!
//! Image keys are deterministic: two instances of the same (repo, version)
//! share base and env keys (so they share cached images), while instance
//! keys are unique per instance id. The env key embeds a digest of the
//! rendered setup script, so editing the install table mints a new env image
//! instead of reusing a stale one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;
use crate::specs::install::InstallSpecTable;
use crate::specs::{dockerfiles, scripts, TaskInstance};

/// Image tier within the build hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageTier {
    Base,
    Env,
    Instance,
}

impl ImageTier {
    /// Image-key prefix for this tier.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            ImageTier::Base => "sweval.base",
            ImageTier::Env => "sweval.env",
            ImageTier::Instance => "sweval.inst",
        }
    }
}

/// The resolved recipe for one instance: image keys, Dockerfiles, scripts,
/// and the reference test sets. Built once per run and immutable thereafter.
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub instance_id: String,
    pub repo: String,
    pub version: String,
    pub arch: String,
    pub platform: String,

    pub base_image_key: String,
    pub env_image_key: String,
    pub instance_image_key: String,

    pub base_dockerfile: String,
    pub env_dockerfile: String,
    pub instance_dockerfile: String,

    pub setup_env_script: String,
    pub install_repo_script: String,
    pub eval_script: String,

    pub fail_to_pass: Vec<String>,
    pub pass_to_pass: Vec<String>,
}

impl TestSpec {
    /// Deterministic container name for this instance within one run.
    pub fn container_name(&self, run_id: &str) -> String {
        format!("sweval.{}.{}", sanitize(&self.instance_id), run_id)
    }
}

/// Flattens an id into the character set Docker accepts for names and tags.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Short hex digest used to version env images by their setup script.
fn script_digest(script: &str) -> String {
    let digest = Sha256::digest(script.as_bytes());
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

/// Host architecture, normalized to Docker's naming.
pub fn host_arch() -> String {
    match std::env::consts::ARCH {
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Builds the [`TestSpec`] for one raw instance record.
///
/// Fails with [`ConfigurationError::UnknownRepoVersion`] when the install
/// table has no entry for the instance's (repo, version); spec construction
/// must abort for that instance rather than defaulting.
pub fn make_test_spec(
    instance: &TaskInstance,
    table: &InstallSpecTable,
) -> Result<TestSpec, ConfigurationError> {
    let install = table.get(&instance.repo, &instance.version)?;

    let arch = host_arch();
    let platform = format!("linux/{arch}");

    let setup_env_script = scripts::make_setup_env_script(install);
    let install_repo_script = scripts::make_install_repo_script(instance, install);
    let eval_script = scripts::make_eval_script(instance, install);

    let base_image_key = format!("{}.{arch}:latest", ImageTier::Base.key_prefix());
    let env_image_key = format!(
        "{}.{}.{}.{arch}.{}:latest",
        ImageTier::Env.key_prefix(),
        sanitize(&instance.repo.replace('/', "_")),
        sanitize(&instance.version),
        script_digest(&setup_env_script),
    );
    let instance_image_key = format!(
        "{}.{}:latest",
        ImageTier::Instance.key_prefix(),
        sanitize(&instance.instance_id),
    );

    let base_dockerfile = dockerfiles::base_dockerfile(&platform, &arch);
    let env_dockerfile = dockerfiles::env_dockerfile(&platform, &base_image_key);
    let instance_dockerfile = dockerfiles::instance_dockerfile(&platform, &env_image_key);

    Ok(TestSpec {
        instance_id: instance.instance_id.clone(),
        repo: instance.repo.clone(),
        version: instance.version.clone(),
        arch,
        platform,
        base_image_key,
        env_image_key,
        instance_image_key,
        base_dockerfile,
        env_dockerfile,
        instance_dockerfile,
        setup_env_script,
        install_repo_script,
        eval_script,
        fail_to_pass: instance.fail_to_pass.clone(),
        pass_to_pass: instance.pass_to_pass.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, repo: &str, version: &str) -> TaskInstance {
        TaskInstance {
            instance_id: id.to_string(),
            repo: repo.to_string(),
            version: version.to_string(),
            base_commit: "deadbeef".to_string(),
            patch: String::new(),
            test_patch: String::new(),
            fail_to_pass: vec!["tests/test_a.py::test_x".to_string()],
            pass_to_pass: vec!["tests/test_a.py::test_y".to_string()],
        }
    }

    #[test]
    fn test_shared_repo_version_shares_base_and_env_keys() {
        let table = InstallSpecTable::builtin();
        let a = make_test_spec(&instance("flask-1", "pallets/flask", "2.2"), &table).unwrap();
        let b = make_test_spec(&instance("flask-2", "pallets/flask", "2.2"), &table).unwrap();

        assert_eq!(a.base_image_key, b.base_image_key);
        assert_eq!(a.env_image_key, b.env_image_key);
        assert_ne!(a.instance_image_key, b.instance_image_key);
    }

    #[test]
    fn test_different_versions_differ_in_env_key() {
        let table = InstallSpecTable::builtin();
        let a = make_test_spec(&instance("flask-1", "pallets/flask", "2.2"), &table).unwrap();
        let b = make_test_spec(&instance("flask-2", "pallets/flask", "2.3"), &table).unwrap();
        assert_ne!(a.env_image_key, b.env_image_key);
        assert_eq!(a.base_image_key, b.base_image_key);
    }

    #[test]
    fn test_keys_carry_tier_prefixes() {
        let table = InstallSpecTable::builtin();
        let spec = make_test_spec(&instance("flask-1", "pallets/flask", "2.2"), &table).unwrap();
        assert!(spec.base_image_key.starts_with("sweval.base."));
        assert!(spec.env_image_key.starts_with("sweval.env."));
        assert!(spec.instance_image_key.starts_with("sweval.inst."));
    }

    #[test]
    fn test_unknown_repo_version_aborts_spec() {
        let table = InstallSpecTable::builtin();
        let err = make_test_spec(&instance("x-1", "nobody/nothing", "0.1"), &table).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownRepoVersion { .. }));
    }

    #[test]
    fn test_container_name_is_deterministic() {
        let table = InstallSpecTable::builtin();
        let spec = make_test_spec(&instance("Flask/One", "pallets/flask", "2.2"), &table).unwrap();
        assert_eq!(spec.container_name("run42"), "sweval.flask_one.run42");
        assert_eq!(spec.container_name("run42"), spec.container_name("run42"));
    }

    #[test]
    fn test_dockerfiles_chain_through_keys() {
        let table = InstallSpecTable::builtin();
        let spec = make_test_spec(&instance("flask-1", "pallets/flask", "2.2"), &table).unwrap();
        assert!(spec.env_dockerfile.contains(&spec.base_image_key));
        assert!(spec.instance_dockerfile.contains(&spec.env_image_key));
    }

    #[test]
    fn test_script_digest_stable_and_short() {
        let d1 = script_digest("abc");
        let d2 = script_digest("abc");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 8);
        assert_ne!(script_digest("abcd"), d1);
    }
}
