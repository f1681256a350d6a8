pub mod tests {
    use std::collections::HashMap;

    use crate::{
        DataType,
        Node,
        NodeBuilder,
        NodeId,
        Parent,
        Query,
        QueryId,
        Segment,
        SegmentId,
        Series,
        SeriesId,
        Timeline,
    };

    pub const TEST_QUERY_ID: i64 = 1;

    pub fn mock_segment(id: i64, frames: usize) -> Segment {
        Segment {
            id: SegmentId(id),
            timeline: Timeline {
                id: 1,
                name: "test_timeline".to_string(),
            },
            name: format!("segment_{}", id),
            frames,
            fps: 25.0,
        }
    }

    pub fn mock_series(id: i64, data_type: DataType) -> Series {
        Series {
            id: SeriesId(id),
            timeline: Timeline {
                id: 1,
                name: "test_timeline".to_string(),
            },
            name: format!("series_{}", id),
            data_type,
        }
    }

    pub fn mock_node(id: i64, kind: &str, data_type: DataType, parents: Vec<Parent>) -> Node {
        NodeBuilder::default()
            .id(NodeId(id))
            .name(format!("{}_{}", kind, id))
            .kind(kind.to_string())
            .data_type(data_type)
            .parents(parents)
            .query_id(QueryId(TEST_QUERY_ID))
            .build()
            .unwrap()
    }

    pub fn mock_query(nodes: Vec<Node>) -> Query {
        let outputs = nodes
            .last()
            .map(|node| vec![vec![Parent::Series(0), Parent::Node(node.id)]])
            .unwrap_or_default();
        Query {
            id: QueryId(TEST_QUERY_ID),
            name: "test_query".to_string(),
            nodes: nodes.into_iter().map(|node| (node.id, node)).collect::<HashMap<_, _>>(),
            outputs,
            selector: None,
        }
    }
}
