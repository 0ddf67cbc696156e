use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

const DOCKER_HUB: &str = "https://index.docker.io/v1/";

pub type ContainerId = String;

/// The name of an image as used in docker in the form `repo:tag`. E.g. "emrius11/example:latest"
#[derive(Deserialize, Serialize, Debug, Clone, Default, Hash, Eq, PartialEq)]
pub struct ImageName(pub String);

impl ImageName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into repository and tag. Digest references keep the digest in the
    /// repository part and carry no tag.
    pub fn split(&self) -> (&str, Option<&str>) {
        if self.0.contains('@') {
            return (&self.0, None);
        }
        match self.0.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
            _ => (&self.0, Some("latest")),
        }
    }

    /// Host part of the registry this image is pulled from. Images without an
    /// explicit registry resolve to Docker Hub.
    pub fn registry_host(&self) -> &str {
        let mut reference = self.0.as_str();
        if let Some((before, _)) = reference.split_once('@') {
            reference = before;
        }
        if let Some((before, tag)) = reference.rsplit_once(':')
            && !tag.contains('/')
        {
            reference = before;
        }
        match reference.split_once('/') {
            Some((first, _))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                first
            }
            _ => DOCKER_HUB,
        }
    }
}

impl Display for ImageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ServiceName(pub String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an upstream in the gateway admin api
#[derive(Deserialize, Serialize, Debug, Clone, Hash, Eq, PartialEq)]
pub struct UpstreamId(pub String);

impl UpstreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UpstreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
