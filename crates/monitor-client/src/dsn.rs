// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::error::DsnError;
use crate::protocol::ClientSdkInfo;

/// Version announced in the auth header.
pub const PROTOCOL_VERSION: u8 = 7;

/// Parsed endpoint descriptor: `{scheme}://{public_key}@{host}[:port][/path]/{project_id}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    host: String,
    port: Option<u16>,
    path: String,
    project_id: String,
}

impl Dsn {
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn envelope_url(&self) -> String {
        format!("{}/api/{}/envelope/", self.base_url(), self.project_id)
    }

    #[must_use]
    pub fn auth_header(&self, sdk: &ClientSdkInfo) -> String {
        format!(
            "Monitor monitor_version={PROTOCOL_VERSION}, monitor_client={}/{}, monitor_key={}",
            sdk.name, sdk.version, self.public_key
        )
    }

    fn base_url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{port}{}", self.scheme, self.host, self.path),
            None => format!("{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}

impl FromStr for Dsn {
    type Err = DsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s.trim()).map_err(|e| DsnError::InvalidUrl(e.to_string()))?;
        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(DsnError::UnsupportedScheme(scheme));
        }
        let public_key = url.username().to_string();
        if public_key.is_empty() {
            return Err(DsnError::MissingPublicKey);
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(DsnError::MissingHost)?
            .to_string();

        let trimmed = url.path().trim_end_matches('/');
        let (path, project_id) = match trimmed.rsplit_once('/') {
            Some((path, project_id)) => (path.to_string(), project_id.to_string()),
            None => (String::new(), trimmed.to_string()),
        };
        if project_id.is_empty() {
            return Err(DsnError::MissingProjectId);
        }

        Ok(Dsn {
            scheme,
            public_key,
            host,
            port: url.port(),
            path,
            project_id,
        })
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}", self.scheme, self.public_key, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}/{}", self.path, self.project_id)
    }
}
