//! Road-network loading.
//!
//! Roads and nodes come in one fetch; segments are pulled in fixed-size
//! keyset batches to bound peak memory on large graphs. Batches run
//! sequentially — parallel fetching would only complicate the memory
//! bound, and the exporter imposes its own ordering anyway.

use std::collections::HashMap;

use courier_common::{GraphError, Result};
use tracing::{debug, info};

use crate::model::{Road, RoadNode, RoadSegment};
use crate::store::Store;

pub const DEFAULT_SEGMENT_BATCH: usize = 20_000;

/// The loaded network, ready for weight derivation and export.
#[derive(Debug)]
pub struct RoadNetwork {
    pub roads: HashMap<i64, Road>,
    pub nodes: Vec<RoadNode>,
    pub segments: Vec<RoadSegment>,
}

/// Load the full network. An empty segment set is a validation failure:
/// proceeding would produce an empty but otherwise well-formed graph,
/// and compiling that would silently deploy a routing engine that can
/// answer no queries.
pub fn load_network(store: &Store, batch_size: usize) -> Result<RoadNetwork> {
    let batch_size = batch_size.max(1);

    let roads = store.load_roads()?;
    let nodes = store.load_nodes()?;
    info!(roads = roads.len(), nodes = nodes.len(), "loaded road and node tables");

    let mut segments: Vec<RoadSegment> = Vec::new();
    let mut after_id = 0i64;
    loop {
        let batch = store.load_segment_batch(after_id, batch_size)?;
        if batch.is_empty() {
            break;
        }
        after_id = batch.last().map(|s| s.id).unwrap_or(after_id);
        debug!(batch = batch.len(), total = segments.len() + batch.len(), "segment batch loaded");
        segments.extend(batch);
    }

    if segments.is_empty() {
        return Err(GraphError::Validation(
            "road network contains no segments; refusing to export an empty graph".to_string(),
        ));
    }

    info!(segments = segments.len(), "road network loaded");
    Ok(RoadNetwork { roads, nodes, segments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_fixtures::*;

    #[test]
    fn empty_segment_set_is_a_validation_failure_not_an_empty_graph() {
        let store = seeded_store();
        let err = load_network(&store, 100).unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn loads_across_multiple_batches() {
        let store = seeded_store();
        for id in 1..=7 {
            insert_segment(
                &store,
                id,
                10,
                r#"[[52.5,13.4],[52.6,13.5]]"#,
                false,
                None,
            );
        }
        let network = load_network(&store, 3).unwrap();
        assert_eq!(network.segments.len(), 7);
        assert_eq!(network.roads.len(), 1);
        // Keyset paging preserves id order.
        let ids: Vec<i64> = network.segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, (1..=7).collect::<Vec<_>>());
    }
}
