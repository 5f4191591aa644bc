use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a node or edge came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub document_id: String,
    pub source_tool: String,
    pub ts_extracted: DateTime<Utc>,
}

/// Entity node, deduplicated by `tenant:type:surface`; upserts replace
/// properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub summary: String,
    pub tenant_id: String,
    pub provenance: Provenance,
}

impl GraphNode {
    pub fn compose_id(tenant_id: &str, node_type: &str, surface: &str) -> String {
        format!("{tenant_id}:{node_type}:{surface}")
    }

    /// The surface form the node was extracted from (the id's last segment).
    pub fn surface(&self) -> &str {
        self.id.splitn(3, ':').nth(2).unwrap_or(&self.id)
    }
}

/// Temporal edge with a `[t_valid_start, t_valid_end)` validity window.
/// For any `(source, type, target)` and instant `t`, at most one edge is
/// valid; the graph sink's conflict resolution maintains that invariant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub t_valid_start: DateTime<Utc>,
    pub t_valid_end: DateTime<Utc>,
    pub confidence: f32,
    pub tenant_id: String,
    pub provenance: Provenance,
}

impl GraphEdge {
    /// Edge ids carry a per-validity-window suffix so clipped re-inserts
    /// get distinct identities.
    pub fn compose_id(
        source_id: &str,
        edge_type: &str,
        target_id: &str,
        t_valid_start: DateTime<Utc>,
    ) -> String {
        format!(
            "{source_id}:{edge_type}:{target_id}:{}",
            t_valid_start.timestamp()
        )
    }

    /// Identity of the relation this edge is one validity window of.
    pub fn relation_key(&self) -> String {
        format!("{}:{}:{}", self.source_id, self.edge_type, self.target_id)
    }

    pub fn valid_at(&self, t: DateTime<Utc>) -> bool {
        self.t_valid_start <= t && t < self.t_valid_end
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.t_valid_start < end && start < self.t_valid_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn edge(start: DateTime<Utc>, end: DateTime<Utc>) -> GraphEdge {
        GraphEdge {
            id: GraphEdge::compose_id("a", "works_for", "b", start),
            source_id: "a".into(),
            target_id: "b".into(),
            edge_type: "works_for".into(),
            t_valid_start: start,
            t_valid_end: end,
            confidence: 0.9,
            tenant_id: "acme".into(),
            provenance: Provenance {
                document_id: "d".into(),
                source_tool: "crm".into(),
                ts_extracted: Utc::now(),
            },
        }
    }

    #[test]
    fn validity_window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let e = edge(start, end);
        assert!(e.valid_at(start));
        assert!(e.valid_at(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        assert!(!e.valid_at(end));
    }

    #[test]
    fn overlap_excludes_touching_windows() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let e = edge(start, end);
        assert!(e.overlaps(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        ));
        // A window starting exactly at this edge's end does not overlap.
        assert!(!e.overlaps(end, Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn node_surface_parses_id_tail() {
        let node = GraphNode {
            id: GraphNode::compose_id("acme", "person", "Ada Lovelace"),
            node_type: "person".into(),
            summary: "Ada Lovelace".into(),
            tenant_id: "acme".into(),
            provenance: Provenance {
                document_id: "d".into(),
                source_tool: "crm".into(),
                ts_extracted: Utc::now(),
            },
        };
        assert_eq!(node.surface(), "Ada Lovelace");
    }
}
