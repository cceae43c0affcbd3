//! RFC 34 taskmap: a compact mapping from node index to the set of task
//! ranks placed on that node.
//!
//! Grounded on `original_source/src/common/libtaskmap/taskmap.c`: the same
//! block layout `{start_node, nnodes, ppn, repeat}`, the same append/coalesce
//! rules, and all four serialization forms (JSON array, wrapped
//! `{version,map}`, PMI `(vector,(...))`, raw semicolon idsets).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FluxError, FluxResult};

/// One run of `repeat` identical `[nnodes, ppn]` placements starting at node
/// `start_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub start_node: i64,
    pub nnodes: i64,
    pub ppn: i64,
    pub repeat: i64,
}

impl Block {
    fn as_row(&self) -> [i64; 4] {
        [self.start_node, self.nnodes, self.ppn, self.repeat]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Taskmap {
    blocks: Vec<Block>,
}

pub const ENCODE_WRAPPED: u32 = 1 << 0;
pub const ENCODE_PMI: u32 = 1 << 1;
pub const ENCODE_RAW: u32 = 1 << 2;

impl Taskmap {
    pub fn new() -> Self {
        Taskmap::default()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// `taskmap_append`: add `nnodes` nodes starting at `nodeid`, `ppn` tasks
    /// each, coalescing with the previous block when possible: if the new
    /// run is contiguous with the last block and shares its `ppn`, then
    /// either bump `repeat` (same `nnodes` as the last block) or extend the
    /// last block's `nnodes` (last block not yet repeated). Otherwise the
    /// run starts a new block.
    pub fn append(&mut self, nodeid: i64, nnodes: i64, ppn: i64) -> FluxResult<()> {
        if nnodes < 1 || ppn < 1 {
            return Err(FluxError::invalid("taskmap append: nnodes and ppn must be >= 1"));
        }
        if let Some(last) = self.blocks.last_mut() {
            let contiguous = last.start_node + last.nnodes * last.repeat == nodeid;
            if contiguous && last.ppn == ppn {
                if last.nnodes == nnodes {
                    last.repeat += 1;
                    return Ok(());
                } else if last.repeat == 1 {
                    last.nnodes += nnodes;
                    return Ok(());
                }
            }
        }
        self.blocks.push(Block {
            start_node: nodeid,
            nnodes,
            ppn,
            repeat: 1,
        });
        Ok(())
    }

    /// `taskmap_find_repeats`: merge adjacent blocks that became identical
    /// after construction (idempotent; safe to call repeatedly).
    pub fn coalesce(&mut self) {
        let mut merged: Vec<Block> = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            if let Some(last) = merged.last_mut() {
                if last.nnodes == block.nnodes
                    && last.ppn == block.ppn
                    && last.start_node + last.nnodes * last.repeat == block.start_node
                {
                    last.repeat += block.repeat;
                    continue;
                }
            }
            merged.push(*block);
        }
        self.blocks = merged;
    }

    pub fn nnodes(&self) -> i64 {
        self.blocks.iter().map(|b| b.nnodes * b.repeat).sum()
    }

    pub fn total_ntasks(&self) -> i64 {
        self.blocks
            .iter()
            .map(|b| b.nnodes * b.ppn * b.repeat)
            .sum()
    }

    /// `taskmap_check`: two maps describe the same job shape iff they cover
    /// the same node count and task count (RFC 34 size-match invariant).
    pub fn check(a: &Taskmap, b: &Taskmap) -> FluxResult<()> {
        if a.nnodes() != b.nnodes() {
            return Err(FluxError::invalid("taskmap check: nnodes mismatch"));
        }
        if a.total_ntasks() != b.total_ntasks() {
            return Err(FluxError::invalid("taskmap check: total ntasks mismatch"));
        }
        Ok(())
    }

    /// `taskmap_taskids(map, nodeid) -> idset string`, e.g. `"0-3"` or
    /// `"0,2,4"`. Task ids are assigned in block order, round-robin within a
    /// repeated run: node i within a repeated block of `ppn` tasks gets ids
    /// `[base, base+ppn)` where `base` accumulates across prior nodes.
    pub fn taskids(&self, nodeid: i64) -> FluxResult<String> {
        let mut taskid: i64 = 0;
        let mut node: i64 = 0;
        for block in &self.blocks {
            for _rep in 0..block.repeat {
                for _n in 0..block.nnodes {
                    if node == nodeid {
                        let ids: Vec<i64> = (taskid..taskid + block.ppn).collect();
                        return Ok(format_idset(&ids));
                    }
                    taskid += block.ppn;
                    node += 1;
                }
            }
        }
        Err(FluxError::NoSuchEntry(format!("no such node id {nodeid}")))
    }

    /// `taskmap_nodeid(map, taskid) -> node index`.
    pub fn nodeid(&self, taskid: i64) -> FluxResult<i64> {
        let mut cursor: i64 = 0;
        for block in &self.blocks {
            for rep in 0..block.repeat {
                for n in 0..block.nnodes {
                    let node = block.start_node + rep * block.nnodes + n;
                    let block_tasks = block.ppn;
                    if taskid >= cursor && taskid < cursor + block_tasks {
                        return Ok(node);
                    }
                    cursor += block_tasks;
                }
            }
        }
        Err(FluxError::NoSuchEntry(format!("no such task id {taskid}")))
    }

    // --- JSON array / wrapped forms ---

    pub fn encode_json(&self) -> Value {
        Value::Array(
            self.blocks
                .iter()
                .map(|b| Value::Array(b.as_row().iter().map(|&n| Value::from(n)).collect()))
                .collect(),
        )
    }

    pub fn encode_map(&self) -> Value {
        serde_json::json!({"version": 1, "map": self.encode_json()})
    }

    pub fn decode_json_array(v: &Value) -> FluxResult<Self> {
        let arr = v
            .as_array()
            .ok_or_else(|| FluxError::invalid("taskmap: not a JSON array"))?;
        let mut blocks = Vec::with_capacity(arr.len());
        for row in arr {
            let row = row
                .as_array()
                .ok_or_else(|| FluxError::invalid("taskmap: block row must be an array"))?;
            if row.len() != 4 {
                return Err(FluxError::invalid("taskmap: block row must have 4 elements"));
            }
            let get = |i: usize| -> FluxResult<i64> {
                row[i]
                    .as_i64()
                    .ok_or_else(|| FluxError::invalid("taskmap: block element must be an integer"))
            };
            blocks.push(Block {
                start_node: get(0)?,
                nnodes: get(1)?,
                ppn: get(2)?,
                repeat: get(3)?,
            });
        }
        Ok(Taskmap { blocks })
    }

    pub fn decode_wrapped(v: &Value) -> FluxResult<Self> {
        let version = v
            .get("version")
            .and_then(Value::as_i64)
            .ok_or_else(|| FluxError::invalid("taskmap: wrapped form missing version"))?;
        if version != 1 {
            return Err(FluxError::Unsupported(format!("taskmap version {version}")));
        }
        let map = v
            .get("map")
            .ok_or_else(|| FluxError::invalid("taskmap: wrapped form missing map"))?;
        Taskmap::decode_json_array(map)
    }

    // --- PMI_process_mapping form ---

    /// `(vector,(start,nnodes,ppn),(start,nnodes,ppn),...)`
    pub fn encode_pmi(&self) -> String {
        // PMI has no native repeat count: expand repeats into separate triples.
        let mut expanded = Vec::new();
        for b in &self.blocks {
            for r in 0..b.repeat {
                expanded.push(format!("({},{},{})", b.start_node + r * b.nnodes, b.nnodes, b.ppn));
            }
        }
        format!("(vector,{})", expanded.join(","))
    }

    pub fn decode_pmi(s: &str) -> FluxResult<Self> {
        let s = s.trim();
        let inner = s
            .strip_prefix("(vector,")
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| FluxError::invalid("taskmap: PMI form must start with (vector, and end with )"))?;
        let mut taskmap = Taskmap::new();
        let mut depth = 0i32;
        let mut cur = String::new();
        let mut triples = Vec::new();
        for c in inner.chars() {
            match c {
                '(' => {
                    depth += 1;
                    if depth > 1 {
                        cur.push(c);
                    }
                }
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        triples.push(cur.clone());
                        cur.clear();
                    } else {
                        cur.push(c);
                    }
                }
                ',' if depth <= 1 => {}
                _ => cur.push(c),
            }
        }
        for triple in triples {
            let parts: Vec<&str> = triple.split(',').collect();
            if parts.len() != 3 {
                return Err(FluxError::invalid("taskmap: PMI triple must have 3 fields"));
            }
            let start: i64 = parts[0]
                .parse()
                .map_err(|_| FluxError::invalid("taskmap: PMI field not an integer"))?;
            let nnodes: i64 = parts[1]
                .parse()
                .map_err(|_| FluxError::invalid("taskmap: PMI field not an integer"))?;
            let ppn: i64 = parts[2]
                .parse()
                .map_err(|_| FluxError::invalid("taskmap: PMI field not an integer"))?;
            taskmap.blocks.push(Block {
                start_node: start,
                nnodes,
                ppn,
                repeat: 1,
            });
        }
        taskmap.coalesce();
        Ok(taskmap)
    }

    // --- raw idset-per-node form ---

    /// `ppn0,ppn0,...;ppn1,ppn1,...;...` semicolon-separated per-node idsets,
    /// one comma/range idset per node, in node order.
    pub fn encode_raw(&self) -> FluxResult<String> {
        let n = self.nnodes();
        let mut parts = Vec::with_capacity(n as usize);
        for node in 0..n {
            parts.push(self.taskids(node)?);
        }
        Ok(parts.join(";"))
    }

    pub fn decode_raw(s: &str) -> FluxResult<Self> {
        let mut taskmap = Taskmap::new();
        let mut taskid: i64 = 0;
        let mut seen = std::collections::HashSet::new();
        for (node, field) in s.split(';').enumerate() {
            let ids = parse_idset(field)?;
            if ids.is_empty() {
                return Err(FluxError::invalid("taskmap: raw form node idset must be non-empty"));
            }
            for &id in &ids {
                if !seen.insert(id) {
                    return Err(FluxError::invalid(format!(
                        "taskmap: raw form task id {id} repeated across nodes"
                    )));
                }
            }
            let ppn = ids.len() as i64;
            let expected: Vec<i64> = (taskid..taskid + ppn).collect();
            if ids != expected {
                return Err(FluxError::invalid(format!(
                    "taskmap: raw form node {node} ids not contiguous with prior nodes"
                )));
            }
            taskmap.append(node as i64, 1, ppn)?;
            taskid += ppn;
        }
        taskmap.coalesce();
        Ok(taskmap)
    }

    /// `taskmap_decode`: dispatch on content — empty or containing
    /// `"vector,"` is PMI; absence of any of `({[]}` is raw; otherwise JSON.
    pub fn decode(s: &str) -> FluxResult<Self> {
        if s.is_empty() || s.contains("vector,") {
            return Taskmap::decode_pmi(s);
        }
        if !s.contains(['(', '{', '[', ']', '}', ')']) {
            return Taskmap::decode_raw(s);
        }
        let v: Value = serde_json::from_str(s)
            .map_err(|e| FluxError::invalid(format!("taskmap decode: {e}")))?;
        if v.is_array() {
            Taskmap::decode_json_array(&v)
        } else {
            Taskmap::decode_wrapped(&v)
        }
    }

    pub fn encode(&self, flags: u32) -> FluxResult<String> {
        valid_encode_flags(flags)?;
        if flags & ENCODE_PMI != 0 {
            Ok(self.encode_pmi())
        } else if flags & ENCODE_RAW != 0 {
            self.encode_raw()
        } else if flags & ENCODE_WRAPPED != 0 {
            Ok(self.encode_map().to_string())
        } else {
            Ok(self.encode_json().to_string())
        }
    }
}

fn valid_encode_flags(flags: u32) -> FluxResult<()> {
    let set = [ENCODE_WRAPPED, ENCODE_PMI, ENCODE_RAW]
        .iter()
        .filter(|&&f| flags & f != 0)
        .count();
    if set > 1 {
        return Err(FluxError::invalid("taskmap encode: at most one form flag may be set"));
    }
    Ok(())
}

fn format_idset(ids: &[i64]) -> String {
    if ids.is_empty() {
        return String::new();
    }
    let mut ranges: Vec<(i64, i64)> = Vec::new();
    let mut start = ids[0];
    let mut prev = ids[0];
    for &id in &ids[1..] {
        if id == prev + 1 {
            prev = id;
            continue;
        }
        ranges.push((start, prev));
        start = id;
        prev = id;
    }
    ranges.push((start, prev));
    ranges
        .into_iter()
        .map(|(a, b)| if a == b { a.to_string() } else { format!("{a}-{b}") })
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_idset(s: &str) -> FluxResult<Vec<i64>> {
    let mut ids = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((a, b)) = part.split_once('-') {
            let a: i64 = a
                .parse()
                .map_err(|_| FluxError::invalid("taskmap: malformed idset range"))?;
            let b: i64 = b
                .parse()
                .map_err(|_| FluxError::invalid("taskmap: malformed idset range"))?;
            if b < a {
                return Err(FluxError::invalid("taskmap: idset range must be non-decreasing"));
            }
            ids.extend(a..=b);
        } else {
            ids.push(
                part.parse()
                    .map_err(|_| FluxError::invalid("taskmap: malformed idset member"))?,
            );
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_coalesces_identical_runs() {
        let mut tm = Taskmap::new();
        tm.append(0, 4, 2).unwrap();
        tm.append(4, 4, 2).unwrap();
        assert_eq!(tm.blocks().len(), 1);
        assert_eq!(tm.blocks()[0].repeat, 2);
        assert_eq!(tm.nnodes(), 8);
        assert_eq!(tm.total_ntasks(), 16);
    }

    #[test]
    fn append_keeps_distinct_blocks_separate() {
        let mut tm = Taskmap::new();
        tm.append(0, 2, 2).unwrap();
        tm.append(2, 3, 4).unwrap();
        assert_eq!(tm.blocks().len(), 2);
        assert_eq!(tm.nnodes(), 5);
    }

    #[test]
    fn append_extends_contiguous_block_of_differing_size() {
        let mut tm = Taskmap::new();
        tm.append(0, 2, 2).unwrap();
        tm.append(2, 3, 2).unwrap();
        assert_eq!(tm.blocks().len(), 1);
        assert_eq!(tm.blocks()[0].nnodes, 5);
        assert_eq!(tm.blocks()[0].repeat, 1);
    }

    /// Spec scenario S5: two appends of differing nnodes and ppn stay
    /// separate blocks; taskids/nodeid are consistent with block order.
    #[test]
    fn append_scenario_s5() {
        let mut tm = Taskmap::new();
        tm.append(0, 2, 2).unwrap();
        tm.append(2, 1, 3).unwrap();
        assert_eq!(tm.encode(ENCODE_PMI).unwrap(), "(vector,(0,2,2),(2,1,3))");
        assert_eq!(tm.nodeid(3).unwrap(), 1);
        assert_eq!(tm.taskids(2).unwrap(), "4-6");
    }

    #[test]
    fn json_array_round_trips() {
        let mut tm = Taskmap::new();
        tm.append(0, 2, 3).unwrap();
        tm.append(2, 1, 1).unwrap();
        let encoded = tm.encode_json();
        let decoded = Taskmap::decode_json_array(&encoded).unwrap();
        assert_eq!(tm, decoded);
    }

    #[test]
    fn wrapped_form_round_trips() {
        let mut tm = Taskmap::new();
        tm.append(0, 3, 2).unwrap();
        let s = tm.encode(ENCODE_WRAPPED).unwrap();
        let decoded = Taskmap::decode(&s).unwrap();
        assert_eq!(tm, decoded);
    }

    #[test]
    fn pmi_form_round_trips() {
        let mut tm = Taskmap::new();
        tm.append(0, 2, 2).unwrap();
        tm.append(2, 2, 2).unwrap();
        let s = tm.encode_pmi();
        assert!(s.starts_with("(vector,"));
        let decoded = Taskmap::decode_pmi(&s).unwrap();
        assert!(Taskmap::check(&tm, &decoded).is_ok());
    }

    #[test]
    fn raw_form_round_trips() {
        let mut tm = Taskmap::new();
        tm.append(0, 3, 2).unwrap();
        let s = tm.encode_raw().unwrap();
        let decoded = Taskmap::decode_raw(&s).unwrap();
        assert_eq!(tm.total_ntasks(), decoded.total_ntasks());
        assert_eq!(tm.nnodes(), decoded.nnodes());
    }

    #[test]
    fn decode_dispatches_by_content() {
        let raw = Taskmap::decode("0;1;2").unwrap();
        assert_eq!(raw.nnodes(), 3);
        let json = Taskmap::decode("[[0,3,2,1]]").unwrap();
        assert_eq!(json.nnodes(), 3);
    }

    #[test]
    fn raw_form_rejects_overlap() {
        assert!(Taskmap::decode_raw("0;0").is_err());
    }

    #[test]
    fn taskids_and_nodeid_are_consistent() {
        let mut tm = Taskmap::new();
        tm.append(0, 2, 3).unwrap();
        let ids0 = tm.taskids(0).unwrap();
        assert_eq!(ids0, "0-2");
        assert_eq!(tm.nodeid(0).unwrap(), 0);
        assert_eq!(tm.nodeid(3).unwrap(), 1);
    }
}
