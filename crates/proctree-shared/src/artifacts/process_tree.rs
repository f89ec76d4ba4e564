use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, mem};

/// Scratch fields the agent keeps on each node while it builds the tree.
/// They describe the agent's own bookkeeping and are never persisted.
pub const TRANSIENT_FIELDS: [&str; 3] = ["is_active", "is_initial", "active_children_count"];

/// Free stack below which a recursive walk over a tree moves to a fresh segment.
const STACK_RED_ZONE: usize = 64 * 1024;
/// Size of each stack segment allocated for deep trees.
const STACK_SEGMENT_SIZE: usize = 2 * 1024 * 1024;

/// Run `f` with enough stack left for one more level of a recursive tree walk.
///
/// Trees have no depth bound, so every recursion over [`ProcessTree`] or
/// [`RawProcessNode`] goes through here.
pub fn with_stack_headroom<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT_SIZE, f)
}

/// A snapshot of one process and its descendants, as persisted.
///
/// Times are nanoseconds from the agent's monotonic clock. An `exit_time` of 0 marks a
/// process that was still running when the snapshot was taken, so `exit_time` may be lower
/// than `creation_time`; consumers must not assume a positive duration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessTree {
    pub pid: i32,
    pub comm: String,
    pub creation_time: u64,
    pub exit_time: u64,
    pub ppid: i32,
    #[serde(default)]
    pub children: Vec<ProcessTree>,
}

impl ProcessTree {
    /// Number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(&node.children);
        }
        count
    }
}

impl Serialize for ProcessTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        with_stack_headroom(|| {
            let mut node = serializer.serialize_struct("ProcessTree", 6)?;
            node.serialize_field("pid", &self.pid)?;
            node.serialize_field("comm", &self.comm)?;
            node.serialize_field("creation_time", &self.creation_time)?;
            node.serialize_field("exit_time", &self.exit_time)?;
            node.serialize_field("ppid", &self.ppid)?;
            node.serialize_field("children", &self.children)?;
            node.end()
        })
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        let children = mem::take(&mut self.children);
        with_stack_headroom(move || drop(children));
    }
}

impl super::ArtifactExt for ProcessTree {}

/// A node exactly as the agent sent it: the persisted fields plus the names of whatever
/// else it attached. Values of those extra fields are skipped while parsing.
#[derive(Debug)]
pub struct RawProcessNode {
    pub pid: i32,
    pub comm: String,
    pub creation_time: u64,
    pub exit_time: u64,
    pub ppid: i32,
    pub children: Vec<RawProcessNode>,
    pub extra_fields: Vec<String>,
}

impl RawProcessNode {
    /// Parse one JSON document. Nesting depth is only bounded by the input size.
    pub fn from_json_slice(input: &[u8]) -> serde_json::Result<Self> {
        let mut json = serde_json::Deserializer::from_slice(input);
        json.disable_recursion_limit();
        let node = Self::deserialize(serde_stacker::Deserializer::new(&mut json))?;
        json.end()?;
        Ok(node)
    }

    pub fn is_transient_field(name: &str) -> bool {
        TRANSIENT_FIELDS.contains(&name)
    }
}

impl Drop for RawProcessNode {
    fn drop(&mut self) {
        let children = mem::take(&mut self.children);
        with_stack_headroom(move || drop(children));
    }
}

impl<'de> Deserialize<'de> for RawProcessNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RawProcessNodeVisitor)
    }
}

struct RawProcessNodeVisitor;

impl<'de> Visitor<'de> for RawProcessNodeVisitor {
    type Value = RawProcessNode;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a process node object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawProcessNode, A::Error> {
        let mut pid = None;
        let mut comm = None;
        let mut creation_time = None;
        let mut exit_time = None;
        let mut ppid = None;
        let mut children = None;
        let mut extra_fields = Vec::new();

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "pid" => next_once(&mut map, &mut pid, "pid")?,
                "comm" => next_once(&mut map, &mut comm, "comm")?,
                "creation_time" => next_once(&mut map, &mut creation_time, "creation_time")?,
                "exit_time" => next_once(&mut map, &mut exit_time, "exit_time")?,
                "ppid" => next_once(&mut map, &mut ppid, "ppid")?,
                "children" => next_once(&mut map, &mut children, "children")?,
                other => {
                    map.next_value::<IgnoredAny>()?;
                    extra_fields.push(other.to_owned());
                }
            }
        }

        Ok(RawProcessNode {
            pid: pid.ok_or_else(|| de::Error::missing_field("pid"))?,
            comm: comm.ok_or_else(|| de::Error::missing_field("comm"))?,
            creation_time: creation_time
                .ok_or_else(|| de::Error::missing_field("creation_time"))?,
            exit_time: exit_time.ok_or_else(|| de::Error::missing_field("exit_time"))?,
            ppid: ppid.ok_or_else(|| de::Error::missing_field("ppid"))?,
            children: children.unwrap_or_default(),
            extra_fields,
        })
    }
}

/// Read the value of a field that may appear only once in a node.
fn next_once<'de, A, T>(
    map: &mut A,
    slot: &mut Option<T>,
    field: &'static str,
) -> Result<(), A::Error>
where
    A: MapAccess<'de>,
    T: Deserialize<'de>,
{
    if slot.is_some() {
        return Err(de::Error::duplicate_field(field));
    }
    *slot = Some(map.next_value()?);
    Ok(())
}
