//! Mapping of source-tool ACLs to canonical ACL strings: exact lookups
//! first, then start-anchored pattern mappings with `$1..$n` capture
//! substitution, then a `{source_tool}:{acl}` namespaced fallback.

use std::collections::{BTreeMap, HashMap, HashSet};

use common::config::AclToolMappings;
use regex::Regex;
use tracing::warn;

struct CompiledMappings {
    exact: BTreeMap<String, String>,
    patterns: Vec<(Regex, String)>,
}

pub struct AclMapper {
    mappings: HashMap<String, CompiledMappings>,
}

impl AclMapper {
    pub fn new(config: &HashMap<String, AclToolMappings>) -> Self {
        let mut mappings = HashMap::with_capacity(config.len());
        for (tool, tool_mappings) in config {
            let mut patterns = Vec::with_capacity(tool_mappings.patterns.len());
            for (pattern, replacement) in &tool_mappings.patterns {
                // Anchored at the start, matching the lookup semantics the
                // mapping tables were written for.
                match Regex::new(&format!("^(?:{pattern})")) {
                    Ok(regex) => patterns.push((regex, replacement.clone())),
                    Err(err) => {
                        warn!(%tool, %pattern, error = %err, "invalid ACL pattern; skipping");
                    }
                }
            }
            mappings.insert(
                tool.clone(),
                CompiledMappings {
                    exact: tool_mappings.exact.clone(),
                    patterns,
                },
            );
        }
        Self { mappings }
    }

    /// Already-canonical ACLs pass through unchanged, which keeps
    /// normalization idempotent.
    fn is_canonical(acl: &str, source_tool: &str) -> bool {
        acl.split_once(':').is_some_and(|(prefix, _)| {
            matches!(prefix, "tenant" | "group" | "user") || prefix == source_tool
        })
    }

    /// Maps source ACLs to canonical form, always prepending the tenant
    /// ACL. The result is deduplicated preserving first-seen order.
    pub fn map(&self, source_acls: &[String], source_tool: &str, tenant_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut canonical = Vec::with_capacity(source_acls.len() + 1);

        let tenant_acl = format!("tenant:{tenant_id}");
        seen.insert(tenant_acl.clone());
        canonical.push(tenant_acl);

        let tool_mappings = self.mappings.get(source_tool);
        for acl in source_acls {
            let mapped = if Self::is_canonical(acl, source_tool) {
                acl.clone()
            } else {
                self.map_one(tool_mappings, acl, source_tool)
            };
            if seen.insert(mapped.clone()) {
                canonical.push(mapped);
            }
        }
        canonical
    }

    fn map_one(
        &self,
        tool_mappings: Option<&CompiledMappings>,
        acl: &str,
        source_tool: &str,
    ) -> String {
        if let Some(mappings) = tool_mappings {
            if let Some(target) = mappings.exact.get(acl) {
                return target.clone();
            }
            for (pattern, replacement) in &mappings.patterns {
                if let Some(captures) = pattern.captures(acl) {
                    let mut mapped = replacement.clone();
                    for i in 1..captures.len() {
                        let group = captures.get(i).map_or("", |m| m.as_str());
                        mapped = mapped.replace(&format!("${i}"), group);
                    }
                    return mapped;
                }
            }
        }
        format!("{source_tool}:{acl}")
    }
}
