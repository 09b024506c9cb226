use std::collections::HashMap;

use crate::api::{NodeInfo, TransferApi};
use crate::path::RemotePath;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub account_id: String,
    nodes: HashMap<String, NodeInfo>,
}

impl ResolvedPaths {
    pub fn node(&self, path: &RemotePath) -> Result<&NodeInfo> {
        self.nodes.get(path.as_str()).ok_or_else(|| Error::Protocol {
            message: format!("resolve response missing entry for {path}"),
        })
    }
}

/// Resolve every path in one batched round trip and classify the results.
///
/// A path passes when it exists, or (with `allow_parent`) when it is one
/// creatable level below an existing directory. A missing suffix spanning
/// more than one segment is ambiguous rather than creatable.
pub async fn resolve_remote<A: TransferApi>(
    api: &A,
    paths: &[RemotePath],
    allow_parent: bool,
) -> Result<ResolvedPaths> {
    let raw: Vec<String> = paths.iter().map(|p| p.as_str().to_string()).collect();
    let response = api.resolve(&raw, allow_parent).await?;

    for path in paths {
        let node = response
            .nodes
            .get(path.as_str())
            .ok_or_else(|| Error::Protocol {
                message: format!("resolve response missing entry for {path}"),
            })?;
        if node.exists {
            continue;
        }
        if allow_parent && node.is_direct_parent {
            continue;
        }

        let remainder = node.remainder.clone().unwrap_or_default();
        if remainder.contains('/') {
            return Err(Error::AmbiguousPath {
                path: path.as_str().to_string(),
                remainder,
            });
        }
        return Err(Error::PathNotFound {
            path: path.as_str().to_string(),
            account_id: response.account_id.clone(),
        });
    }

    Ok(ResolvedPaths {
        account_id: response.account_id,
        nodes: response.nodes,
    })
}
