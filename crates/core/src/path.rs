use crate::{Error, Result};

const SCHEME: &str = "latch://";

/// A normalized remote path in the LData content store.
///
/// Duplicate separators are collapsed and a trailing slash is stripped but
/// remembered, since `cp dir dest/` and `cp dir dest` disambiguate the same
/// way they do for POSIX `cp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath {
    path: String,
    trailing_slash: bool,
}

impl RemotePath {
    pub fn is_remote(input: &str) -> bool {
        input.starts_with(SCHEME)
    }

    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidArgument {
                message: format!("not a remote path (expected {SCHEME}...): {input}"),
            })?;

        let trailing_slash = rest.ends_with('/') && !rest.is_empty();
        let mut segments = Vec::new();
        for seg in rest.split('/') {
            if seg.is_empty() {
                continue;
            }
            if seg == "." || seg == ".." {
                return Err(Error::InvalidArgument {
                    message: format!("remote path must not contain '{seg}': {input}"),
                });
            }
            segments.push(seg);
        }
        if segments.is_empty() {
            return Err(Error::InvalidArgument {
                message: format!("remote path has no segments: {input}"),
            });
        }

        Ok(Self {
            path: format!("{SCHEME}{}", segments.join("/")),
            trailing_slash,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn had_trailing_slash(&self) -> bool {
        self.trailing_slash
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    pub fn join(&self, segment: &str) -> RemotePath {
        let mut path = self.path.clone();
        for seg in segment.split('/') {
            if seg.is_empty() {
                continue;
            }
            path.push('/');
            path.push_str(seg);
        }
        RemotePath {
            path,
            trailing_slash: false,
        }
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}
