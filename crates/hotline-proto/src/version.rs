use semver::Version;

/// Result of comparing a client's protocol version against the server's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCompatibility {
    Compatible,
    Incompatible { reason: String },
}

impl VersionCompatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, VersionCompatibility::Compatible)
    }
}

/// Semantic compatibility rule: a differing major version is incompatible,
/// any other difference is fine. Versions that do not parse are rejected.
pub fn check_version(client: &str, server: &str) -> VersionCompatibility {
    let client_version = match Version::parse(client.trim()) {
        Ok(version) => version,
        Err(err) => {
            return VersionCompatibility::Incompatible {
                reason: format!("unparseable client version {client:?}: {err}"),
            }
        }
    };
    let server_version = match Version::parse(server.trim()) {
        Ok(version) => version,
        Err(err) => {
            return VersionCompatibility::Incompatible {
                reason: format!("unparseable server version {server:?}: {err}"),
            }
        }
    };

    if client_version.major != server_version.major {
        VersionCompatibility::Incompatible {
            reason: format!(
                "client protocol {} is not compatible with server protocol {}",
                client_version, server_version
            ),
        }
    } else {
        VersionCompatibility::Compatible
    }
}
