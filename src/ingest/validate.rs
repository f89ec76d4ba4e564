use itertools::Itertools;
use log::debug;
use proctree_shared::artifacts::{ProcessTree, RawProcessNode, with_stack_headroom};
use std::mem;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Parse one frame and map it onto the persisted schema.
///
/// Transient bookkeeping fields are removed from every node; fields the schema does not
/// know are removed as well. Children keep their order. Nesting depth is unbounded.
pub fn normalize(frame: &[u8]) -> Result<ProcessTree, ValidationError> {
    if frame.iter().all(u8::is_ascii_whitespace) {
        return Err(ValidationError::Empty);
    }

    let raw = RawProcessNode::from_json_slice(frame).map_err(ValidationError::Malformed)?;
    Ok(strip_node(raw))
}

fn strip_node(mut node: RawProcessNode) -> ProcessTree {
    with_stack_headroom(move || {
        let unknown = node
            .extra_fields
            .iter()
            .filter(|name| !RawProcessNode::is_transient_field(name))
            .collect_vec();
        if !unknown.is_empty() {
            debug!("Dropping unknown fields {unknown:?} from pid {}", node.pid);
        }

        ProcessTree {
            pid: node.pid,
            comm: mem::take(&mut node.comm),
            creation_time: node.creation_time,
            exit_time: node.exit_time,
            ppid: node.ppid,
            children: mem::take(&mut node.children)
                .into_iter()
                .map(strip_node)
                .collect(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctree_shared::artifacts::{ArtifactExt, TRANSIENT_FIELDS};
    use rstest::rstest;
    use serde_json::{Value, json};

    fn node(pid: i32, ppid: i32, children: Vec<Value>) -> Value {
        json!({
            "pid": pid,
            "comm": format!("proc-{pid}"),
            "creation_time": 1_000 * pid as u64,
            "exit_time": 0,
            "ppid": ppid,
            "is_active": true,
            "is_initial": pid == 1,
            "active_children_count": children.len(),
            "children": children,
        })
    }

    fn sample_tree() -> Value {
        node(
            1,
            0,
            vec![
                node(5, 1, vec![node(9, 5, vec![]), node(6, 5, vec![])]),
                node(2, 1, vec![]),
            ],
        )
    }

    fn assert_no_transient_fields(value: &Value) {
        let object = value.as_object().unwrap();
        for field in TRANSIENT_FIELDS {
            assert!(!object.contains_key(field), "{field} survived normalization");
        }
        for child in object["children"].as_array().unwrap() {
            assert_no_transient_fields(child);
        }
    }

    #[test]
    fn test_strips_transient_fields_at_every_depth() {
        let frame = serde_json::to_vec(&sample_tree()).unwrap();
        let tree = normalize(&frame).unwrap();

        let persisted: Value = serde_json::from_slice(&tree.encode_pretty().unwrap()).unwrap();
        assert_no_transient_fields(&persisted);
        assert_eq!(tree.node_count(), 5);
    }

    #[test]
    fn test_preserves_children_order() {
        let frame = serde_json::to_vec(&sample_tree()).unwrap();
        let tree = normalize(&frame).unwrap();

        let pids = tree.children.iter().map(|c| c.pid).collect_vec();
        assert_eq!(pids, vec![5, 2]);
        let grandchildren = tree.children[0].children.iter().map(|c| c.pid).collect_vec();
        assert_eq!(grandchildren, vec![9, 6]);
        assert_eq!(tree.children[0].children[0].ppid, 5);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let frame = serde_json::to_vec(&sample_tree()).unwrap();
        let once = normalize(&frame).unwrap();
        let twice = normalize(&once.encode_pretty().unwrap()).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.encode_pretty().unwrap(), twice.encode_pretty().unwrap());
    }

    fn chain_frame(depth: usize) -> Vec<u8> {
        let mut frame = String::new();
        for pid in 1..=depth {
            frame.push_str(&format!(
                r#"{{"pid":{pid},"comm":"sh","creation_time":{pid},"exit_time":0,"ppid":{},"is_active":true,"children":["#,
                pid - 1
            ));
        }
        frame.push_str(&"]}".repeat(depth));
        frame.into_bytes()
    }

    #[rstest]
    #[case(63)]
    #[case(64)]
    #[case(200)]
    #[case(500)]
    fn test_deep_chain_is_accepted(#[case] depth: usize) {
        let tree = normalize(&chain_frame(depth)).unwrap();
        assert_eq!(tree.node_count(), depth);

        let mut deepest = &tree;
        while let Some(child) = deepest.children.first() {
            deepest = child;
        }
        assert_eq!(deepest.pid as usize, depth);
        assert_eq!(deepest.ppid as usize, depth - 1);

        let encoded = tree.encode_pretty().unwrap();
        let again = normalize(&encoded).unwrap();
        assert_eq!(again.node_count(), depth);
        assert_eq!(again.encode_pretty().unwrap(), encoded);
    }

    #[test]
    fn test_very_deep_chain_does_not_exhaust_the_stack() {
        let depth = 50_000;
        let tree = normalize(&chain_frame(depth)).unwrap();
        assert_eq!(tree.node_count(), depth);
    }

    #[test]
    fn test_deeply_nested_unknown_field_is_skipped() {
        let depth = 50_000;
        let frame = format!(
            r#"{{"pid":1,"comm":"sh","creation_time":1,"exit_time":0,"ppid":0,"env":{}{}}}"#,
            "[".repeat(depth),
            "]".repeat(depth)
        );
        let tree = normalize(frame.as_bytes()).unwrap();
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_drops_unknown_fields() {
        let frame = br#"{"pid":3,"comm":"cat","creation_time":1,"exit_time":2,"ppid":1,"cwd":"/"}"#;
        let tree = normalize(frame).unwrap();

        let encoded = String::from_utf8(tree.encode_pretty().unwrap()).unwrap();
        assert!(!encoded.contains("cwd"));
        assert!(tree.children.is_empty());
    }

    #[test]
    fn test_trailing_carriage_return_is_whitespace() {
        let frame =
            b"{\"pid\":1,\"comm\":\"init\",\"creation_time\":1,\"exit_time\":2,\"ppid\":0}\r";
        assert_eq!(normalize(frame).unwrap().pid, 1);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::blank(b"  \r")]
    fn test_empty_frames(#[case] frame: &[u8]) {
        assert!(matches!(normalize(frame), Err(ValidationError::Empty)));
    }

    #[rstest]
    #[case::syntax(b"{not json")]
    #[case::array_root(b"[1, 2, 3]")]
    #[case::number_root(b"42")]
    #[case::missing_field(br#"{"pid":1,"comm":"init","exit_time":2,"ppid":0}"#)]
    #[case::negative_time(br#"{"pid":1,"comm":"init","creation_time":-1,"exit_time":2,"ppid":0}"#)]
    #[case::bad_child(br#"{"pid":1,"comm":"init","creation_time":1,"exit_time":2,"ppid":0,"children":[{"pid":2}]}"#)]
    #[case::children_not_array(br#"{"pid":1,"comm":"init","creation_time":1,"exit_time":2,"ppid":0,"children":{}}"#)]
    #[case::invalid_utf8(b"{\"pid\":1,\"comm\":\"\xff\xfe\",\"creation_time\":1,\"exit_time\":2,\"ppid\":0}")]
    #[case::trailing_document(br#"{"pid":1,"comm":"a","creation_time":1,"exit_time":2,"ppid":0} {}"#)]
    fn test_malformed_frames(#[case] frame: &[u8]) {
        assert!(matches!(
            normalize(frame),
            Err(ValidationError::Malformed(_))
        ));
    }
}
