//! Compact content-path tree carried by the v3 entitlement data extension.
//!
//! Layout of the encoded bytes:
//! - zlib stream of the NUL terminated segment dictionary, least used segment first
//! - node count, one byte, or `0x80 | n` followed by `n` big-endian count bytes
//! - per node, in dictionary order: `(segment code, node code)` for every child,
//!   then the end-of-node code, the whole bit string zero padded to a byte
//!
//! Segment codes come from a Huffman trie weighted `1..=n` with the end marker at
//! `n + 1`; node codes come from a trie weighted by node position with the root
//! left out, since nothing ever points back at it.

use crate::error::{EntitlementError, Result};
use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};

type Edges = Vec<(String, usize)>;

const ROOT: usize = 0;
const END_MARKER: usize = 1;

/// Encode a list of content paths. No paths means no bytes.
pub fn encode_paths<S: AsRef<str>>(paths: &[S]) -> Result<Vec<u8>> {
    let tree = build_path_tree(paths);
    if tree[ROOT].is_empty() {
        return Ok(Vec::new());
    }

    let condensed = Condensed::from_tree(&tree);
    let segments = condensed.ordered_segments();
    let order = condensed.ordered_nodes();

    let segment_leaves: Vec<(usize, u64)> = (0..=segments.len())
        .map(|index| (index, index as u64 + 1))
        .collect();
    let segment_codes = HuffmanTrie::build(&segment_leaves)?.codes();
    let end_symbol = segments.len();

    let node_leaves: Vec<(usize, u64)> = (1..order.len()).map(|pos| (pos, pos as u64)).collect();
    let node_codes = HuffmanTrie::build(&node_leaves)?.codes();

    let segment_index: HashMap<&str, usize> = segments
        .iter()
        .enumerate()
        .map(|(index, name)| (name.as_str(), index))
        .collect();
    let position: HashMap<usize, usize> = order
        .iter()
        .enumerate()
        .map(|(pos, node)| (*node, pos))
        .collect();

    let mut out = compress_dictionary(&segments)?;
    write_node_count(&mut out, order.len());

    let mut bits = BitWriter::default();
    for node in &order {
        for (name, target) in condensed.children(*node) {
            let code = lookup(&segment_codes, segment_index.get(name.as_str()).copied())?;
            bits.extend(code);
            let code = lookup(&node_codes, position.get(target).copied())?;
            bits.extend(code);
        }
        bits.extend(lookup(&segment_codes, Some(end_symbol))?);
    }
    out.extend(bits.finish());

    Ok(out)
}

/// Recover the sorted path list from bytes produced by [`encode_paths`].
pub fn decode_paths(data: &[u8]) -> Result<Vec<String>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut decoder = ZlibDecoder::new(data);
    let mut dictionary = Vec::new();
    decoder
        .read_to_end(&mut dictionary)
        .map_err(|e| malformed(format!("segment dictionary: {}", e)))?;
    let consumed = decoder.total_in() as usize;

    let segments = split_dictionary(&dictionary)?;
    let end_symbol = segments.len();
    let segment_leaves: Vec<(usize, u64)> = (0..=segments.len())
        .map(|index| (index, index as u64 + 1))
        .collect();
    let segment_trie = HuffmanTrie::build(&segment_leaves)?;

    let rest = data
        .get(consumed..)
        .ok_or_else(|| malformed("truncated after segment dictionary"))?;
    let (node_count, body) = read_node_count(rest)?;
    if node_count < 2 {
        return Err(malformed(format!("node count {} is too small", node_count)));
    }

    let node_leaves: Vec<(usize, u64)> = (1..node_count).map(|pos| (pos, pos as u64)).collect();
    let node_trie = HuffmanTrie::build(&node_leaves)?;

    let mut reader = BitReader::new(body);
    let mut nodes: Vec<Vec<(usize, usize)>> = vec![Vec::new(); node_count];
    for edges in nodes.iter_mut() {
        loop {
            let symbol = segment_trie.decode(&mut reader)?;
            if symbol == end_symbol {
                break;
            }
            let target = node_trie.decode(&mut reader)?;
            edges.push((symbol, target));
        }
    }

    let mut paths = Vec::new();
    collect_paths(&nodes, &segments, ROOT, String::new(), 0, &mut paths)?;
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn build_path_tree<S: AsRef<str>>(paths: &[S]) -> Vec<Edges> {
    let mut nodes: Vec<Edges> = vec![Vec::new(), Vec::new()];

    for path in paths {
        let segments: Vec<&str> = path.as_ref().split('/').filter(|s| !s.is_empty()).collect();
        let mut current = ROOT;
        for (i, segment) in segments.iter().enumerate() {
            if i + 1 == segments.len() {
                let present = nodes[current]
                    .iter()
                    .any(|(name, target)| name == segment && *target == END_MARKER);
                if !present {
                    nodes[current].push((segment.to_string(), END_MARKER));
                }
                continue;
            }

            let existing = nodes[current]
                .iter()
                .find(|(name, target)| name == segment && *target != END_MARKER)
                .map(|(_, target)| *target);
            current = match existing {
                Some(next) => next,
                None => {
                    let next = nodes.len();
                    nodes.push(Vec::new());
                    nodes[current].push((segment.to_string(), next));
                    next
                }
            };
        }
    }

    nodes
}

/// Path tree with identical subtrees shared.
struct Condensed {
    nodes: Vec<Edges>,
    root: usize,
}

impl Condensed {
    fn from_tree(tree: &[Edges]) -> Self {
        let mut interned: HashMap<Edges, usize> = HashMap::new();
        let mut nodes = Vec::new();
        let root = Self::intern(tree, ROOT, &mut interned, &mut nodes);
        Self { nodes, root }
    }

    fn intern(
        tree: &[Edges],
        node: usize,
        interned: &mut HashMap<Edges, usize>,
        nodes: &mut Vec<Edges>,
    ) -> usize {
        let mut children: Edges = tree[node]
            .iter()
            .map(|(name, target)| (name.clone(), Self::intern(tree, *target, interned, nodes)))
            .collect();
        children.sort();

        if let Some(id) = interned.get(&children) {
            return *id;
        }
        let id = nodes.len();
        nodes.push(children.clone());
        interned.insert(children, id);
        id
    }

    /// Out of range ids are the placeholder node, which has no children.
    fn children(&self, node: usize) -> &[(String, usize)] {
        self.nodes.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    fn ordered_segments(&self) -> Vec<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for edges in &self.nodes {
            for (name, _) in edges {
                *counts.entry(name.as_str()).or_default() += 1;
            }
        }
        let mut segments: Vec<(usize, &str)> = counts.into_iter().map(|(name, count)| (count, name)).collect();
        segments.sort();
        segments.into_iter().map(|(_, name)| name.to_string()).collect()
    }

    /// Root first, then by number of distinct parents. A lone root plus end
    /// marker gets a placeholder so the node trie has two leaves.
    fn ordered_nodes(&self) -> Vec<usize> {
        let mut parents: Vec<HashSet<usize>> = vec![HashSet::new(); self.nodes.len()];
        for (id, edges) in self.nodes.iter().enumerate() {
            for (_, target) in edges {
                parents[*target].insert(id);
            }
        }

        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|id| (*id != self.root, parents[*id].len(), *id));
        if order.len() == 2 {
            order.push(self.nodes.len());
        }
        order
    }
}

fn compress_dictionary(segments: &[String]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    for segment in segments {
        encoder.write_all(segment.as_bytes())?;
        encoder.write_all(&[0])?;
    }
    Ok(encoder.finish()?)
}

fn split_dictionary(dictionary: &[u8]) -> Result<Vec<String>> {
    let mut parts: Vec<&[u8]> = dictionary.split(|b| *b == 0).collect();
    match parts.pop() {
        Some(tail) if tail.is_empty() => {}
        _ => return Err(malformed("segment dictionary is not NUL terminated")),
    }
    parts
        .into_iter()
        .map(|part| {
            String::from_utf8(part.to_vec()).map_err(|_| malformed("segment is not valid UTF-8"))
        })
        .collect()
}

fn write_node_count(out: &mut Vec<u8>, count: usize) {
    if count <= 127 {
        out.push(count as u8);
        return;
    }
    let bytes = (count as u64).to_be_bytes();
    let significant: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    out.push(0x80 | significant.len() as u8);
    out.extend(significant);
}

fn read_node_count(data: &[u8]) -> Result<(usize, &[u8])> {
    let (&first, rest) = data.split_first().ok_or_else(|| malformed("missing node count"))?;
    if first <= 127 {
        return Ok((first as usize, rest));
    }

    let len = (first & 0x7f) as usize;
    if len > std::mem::size_of::<usize>() || rest.len() < len {
        return Err(malformed("invalid node count length"));
    }
    let count = rest[..len].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((count, &rest[len..]))
}

fn collect_paths(
    nodes: &[Vec<(usize, usize)>],
    segments: &[String],
    node: usize,
    prefix: String,
    depth: usize,
    paths: &mut Vec<String>,
) -> Result<()> {
    if depth > nodes.len() {
        return Err(malformed("cycle in content path tree"));
    }
    let edges = nodes
        .get(node)
        .ok_or_else(|| malformed(format!("node {} out of range", node)))?;
    if edges.is_empty() {
        if !prefix.is_empty() {
            paths.push(prefix);
        }
        return Ok(());
    }
    for (segment, target) in edges {
        let name = segments
            .get(*segment)
            .ok_or_else(|| malformed(format!("segment {} out of range", segment)))?;
        collect_paths(nodes, segments, *target, format!("{}/{}", prefix, name), depth + 1, paths)?;
    }
    Ok(())
}

fn lookup<'a>(codes: &'a HashMap<usize, Vec<bool>>, symbol: Option<usize>) -> Result<&'a [bool]> {
    symbol
        .and_then(|s| codes.get(&s))
        .map(Vec::as_slice)
        .ok_or_else(|| EntitlementError::creation("content path symbol missing from Huffman trie"))
}

fn malformed(reason: impl Into<String>) -> EntitlementError {
    EntitlementError::MalformedPayload(reason.into())
}

#[derive(Debug)]
struct HuffNode {
    symbol: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

/// Huffman trie over `usize` symbols. Ties on weight go to the earliest entry
/// in the working list, merged nodes are appended at its end.
#[derive(Debug)]
struct HuffmanTrie {
    nodes: Vec<HuffNode>,
    root: usize,
}

impl HuffmanTrie {
    fn build(leaves: &[(usize, u64)]) -> Result<Self> {
        if leaves.is_empty() {
            return Err(EntitlementError::creation("cannot build an empty Huffman trie"));
        }

        let mut nodes = Vec::with_capacity(leaves.len() * 2);
        let mut pending: Vec<(usize, u64)> = Vec::with_capacity(leaves.len());
        for (symbol, weight) in leaves {
            pending.push((nodes.len(), *weight));
            nodes.push(HuffNode {
                symbol: Some(*symbol),
                left: None,
                right: None,
            });
        }

        while pending.len() > 1 {
            let first = Self::smallest(&pending, None);
            let second = Self::smallest(&pending, Some(first));
            let (left, left_weight) = pending[first];
            let (right, right_weight) = pending[second];

            pending.remove(first.max(second));
            pending.remove(first.min(second));
            pending.push((nodes.len(), left_weight + right_weight));
            nodes.push(HuffNode {
                symbol: None,
                left: Some(left),
                right: Some(right),
            });
        }

        let root = pending[0].0;
        Ok(Self { nodes, root })
    }

    fn smallest(pending: &[(usize, u64)], exclude: Option<usize>) -> usize {
        let mut smallest: Option<usize> = None;
        for (index, (_, weight)) in pending.iter().enumerate() {
            if Some(index) == exclude {
                continue;
            }
            match smallest {
                Some(s) if pending[s].1 <= *weight => {}
                _ => smallest = Some(index),
            }
        }
        smallest.unwrap_or(0)
    }

    fn codes(&self) -> HashMap<usize, Vec<bool>> {
        let mut codes = HashMap::new();
        let mut stack = vec![(self.root, Vec::new())];
        while let Some((index, path)) = stack.pop() {
            let node = &self.nodes[index];
            if let Some(symbol) = node.symbol {
                codes.insert(symbol, path);
                continue;
            }
            if let Some(left) = node.left {
                let mut left_path = path.clone();
                left_path.push(false);
                stack.push((left, left_path));
            }
            if let Some(right) = node.right {
                let mut right_path = path;
                right_path.push(true);
                stack.push((right, right_path));
            }
        }
        codes
    }

    fn decode(&self, bits: &mut BitReader<'_>) -> Result<usize> {
        let mut index = self.root;
        loop {
            let node = &self.nodes[index];
            if let Some(symbol) = node.symbol {
                return Ok(symbol);
            }
            let bit = bits.next().ok_or_else(|| malformed("node data ended mid-code"))?;
            let next = if bit { node.right } else { node.left };
            index = next.ok_or_else(|| malformed("code not present in trie"))?;
        }
    }
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitWriter {
    fn extend(&mut self, bits: &[bool]) {
        for bit in bits {
            self.current = (self.current << 1) | u8::from(*bit);
            self.filled += 1;
            if self.filled == 8 {
                self.bytes.push(self.current);
                self.current = 0;
                self.filled = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.bytes.push(self.current << (8 - self.filled));
        }
        self.bytes
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }
}

impl Iterator for BitReader<'_> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        let byte = self.data.get(self.position / 8)?;
        let bit = (byte >> (7 - self.position % 8)) & 1 == 1;
        self.position += 1;
        Some(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sorted(paths: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        out.sort();
        out.dedup();
        out
    }

    #[test]
    fn test_empty_input_encodes_to_nothing() {
        let empty: Vec<String> = Vec::new();
        assert!(encode_paths(&empty).unwrap().is_empty());
        assert!(encode_paths(&["/", ""]).unwrap().is_empty());
        assert!(decode_paths(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_single_path_uses_placeholder_node() {
        let encoded = encode_paths(&["/content"]).unwrap();
        assert!(!encoded.is_empty());
        assert_eq!(decode_paths(&encoded).unwrap(), vec!["/content".to_string()]);
    }

    #[test]
    fn test_shared_suffixes_decode_to_every_path() {
        let paths = [
            "/content/dist/rhel/server/7/$releasever/$basearch/os",
            "/content/dist/rhel/server/7/$releasever/$basearch/debug",
            "/content/dist/rhel/workstation/7/$releasever/$basearch/os",
            "/content/dist/rhel/workstation/7/$releasever/$basearch/debug",
            "/content/beta/rhel/server/7/$basearch/os",
        ];
        let decoded = decode_paths(&encode_paths(&paths).unwrap()).unwrap();
        assert_eq!(decoded, sorted(&paths));
    }

    #[test]
    fn test_identical_subtrees_are_merged() {
        let tree = build_path_tree(&["/a/x/y", "/b/x/y", "/c/x/y"]);
        let condensed = Condensed::from_tree(&tree);
        // root, one shared "x" node, one shared "y" node, end marker
        assert_eq!(condensed.nodes.len(), 4);
        assert_eq!(condensed.ordered_nodes()[0], condensed.root);
    }

    #[test]
    fn test_terminal_and_inner_segments_with_same_name() {
        let paths = ["/a", "/a/b", "/a/b/c"];
        let decoded = decode_paths(&encode_paths(&paths).unwrap()).unwrap();
        assert_eq!(decoded, sorted(&paths));
    }

    #[test]
    fn test_duplicates_and_empty_segments_collapse() {
        let paths = ["//repo//one/", "/repo/one", "/repo/two"];
        let decoded = decode_paths(&encode_paths(&paths).unwrap()).unwrap();
        assert_eq!(decoded, vec!["/repo/one".to_string(), "/repo/two".to_string()]);
    }

    #[test]
    fn test_segments_ordered_by_use_count() {
        let tree = build_path_tree(&["/common/a", "/common/b", "/other/c"]);
        let segments = Condensed::from_tree(&tree).ordered_segments();
        // a, b and c end on the shared end marker so "common" and "other" point
        // at distinct nodes; every name is used once and ties sort by name
        assert_eq!(segments, vec!["a", "b", "c", "common", "other"]);
    }

    #[test]
    fn test_large_node_count_uses_length_prefix() {
        let paths: Vec<String> = (0..300)
            .map(|i| format!("/content/product-{}/repo-{}/{}", i, i, i))
            .collect();
        let encoded = encode_paths(&paths).unwrap();
        let decoded = decode_paths(&encoded).unwrap();
        let mut expected = paths.clone();
        expected.sort();
        assert_eq!(decoded, expected);

        let mut out = Vec::new();
        write_node_count(&mut out, 300);
        assert_eq!(out, vec![0x82, 0x01, 0x2c]);
        let (count, rest) = read_node_count(&out).unwrap();
        assert_eq!(count, 300);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_huffman_codes_are_prefix_free() {
        let leaves: Vec<(usize, u64)> = (0..6).map(|i| (i, i as u64 + 1)).collect();
        let codes = HuffmanTrie::build(&leaves).unwrap().codes();
        assert_eq!(codes.len(), 6);
        for (a, code_a) in &codes {
            for (b, code_b) in &codes {
                if a != b {
                    assert!(!code_b.starts_with(code_a));
                }
            }
        }
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let encoded = encode_paths(&["/one/two", "/three/four"]).unwrap();
        let truncated = &encoded[..encoded.len() - 2];
        assert!(decode_paths(truncated).is_err());
        assert!(decode_paths(&[1, 2, 3]).is_err());
    }
}
