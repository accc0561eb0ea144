//! Dockerfile rendering for the three image tiers.
//!
//! base = OS + conda bootstrap, shared across repos; env = FROM base + run
//! setup_env.sh; instance = FROM env + run setup_repo.sh. If the base layer
//! changes, everything above it must be rebuilt (force-rebuild handles that).

/// Renders the base-tier Dockerfile: Ubuntu plus a miniconda bootstrap.
pub fn base_dockerfile(platform: &str, arch: &str) -> String {
    let conda_arch = if arch == "arm64" { "aarch64" } else { arch };
    format!(
        r#"FROM --platform={platform} ubuntu:22.04

ARG DEBIAN_FRONTEND=noninteractive
ENV TZ=Etc/UTC

RUN apt update && apt install -y \
wget \
git \
build-essential \
libffi-dev \
libtiff-dev \
python3 \
python3-pip \
python-is-python3 \
jq \
curl \
locales \
locales-all \
tzdata \
&& rm -rf /var/lib/apt/lists/*

RUN wget 'https://repo.anaconda.com/miniconda/Miniconda3-py311_23.11.0-2-Linux-{conda_arch}.sh' -O miniconda.sh \
    && bash miniconda.sh -b -p /opt/miniconda3
ENV PATH=/opt/miniconda3/bin:$PATH
RUN conda init --all
RUN conda config --append channels conda-forge

RUN adduser --disabled-password --gecos 'harness' nonroot
"#
    )
}

/// Renders the env-tier Dockerfile on top of the given base image.
pub fn env_dockerfile(platform: &str, base_image_key: &str) -> String {
    format!(
        r#"FROM --platform={platform} {base_image_key}

COPY ./setup_env.sh /root/
RUN chmod +x /root/setup_env.sh
RUN /bin/bash -c "source ~/.bashrc && /root/setup_env.sh"

WORKDIR /testbed/

RUN echo "source /opt/miniconda3/etc/profile.d/conda.sh && conda activate testbed" > /root/.bashrc
"#
    )
}

/// Renders the instance-tier Dockerfile on top of the given env image.
pub fn instance_dockerfile(platform: &str, env_image_key: &str) -> String {
    format!(
        r#"FROM --platform={platform} {env_image_key}

COPY ./setup_repo.sh /root/
RUN /bin/bash /root/setup_repo.sh

WORKDIR /testbed/
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_dockerfile_maps_arm64_conda_arch() {
        let df = base_dockerfile("linux/arm64", "arm64");
        assert!(df.contains("Linux-aarch64.sh"));
        assert!(df.contains("FROM --platform=linux/arm64 ubuntu:22.04"));
    }

    #[test]
    fn test_base_dockerfile_x86() {
        let df = base_dockerfile("linux/x86_64", "x86_64");
        assert!(df.contains("Linux-x86_64.sh"));
        assert!(df.contains("adduser"));
    }

    #[test]
    fn test_env_dockerfile_builds_from_base_key() {
        let df = env_dockerfile("linux/x86_64", "sweval.base.x86_64:latest");
        assert!(df.starts_with("FROM --platform=linux/x86_64 sweval.base.x86_64:latest"));
        assert!(df.contains("setup_env.sh"));
        assert!(df.contains("conda activate testbed"));
    }

    #[test]
    fn test_instance_dockerfile_builds_from_env_key() {
        let df = instance_dockerfile("linux/x86_64", "sweval.env.x86_64.abcd1234:latest");
        assert!(df.contains("sweval.env.x86_64.abcd1234:latest"));
        assert!(df.contains("setup_repo.sh"));
        assert!(df.contains("WORKDIR /testbed/"));
    }
}
