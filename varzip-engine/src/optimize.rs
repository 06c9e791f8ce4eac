//! Post-pass archive rewrite: store identical column streams as links.
//!
//! The finished archive is renamed aside and re-read; for every key column
//! the size stream and the data stream are hashed and, on a hash/length
//! match, compared byte-for-byte (metadata included). The resulting
//! equality edges feed the [`GraphOptimizer`], whose node/edge lists are
//! stored in the `size_nodes`/`size_edges`/`data_nodes`/`data_edges`
//! streams; explicit streams are copied into the rewritten archive, aliased
//! ones become links. The fixed streams are copied verbatim and the
//! temporary file is removed.

use std::path::Path;

use varzip_archive::{Archive, Edge, GraphOptimizer, Node};
use varzip_core::error::Result;
use varzip_core::utils::bytes_for;

use crate::buffer::FunctionMap;
use crate::config::{DESC_STREAM_DATA, DESC_STREAM_SIZE};
use varzip_core::varint;

/// Rewrite the archive at `path`, deduplicating the `no_keys` column
/// streams.
pub fn optimize_archive(path: &Path, no_keys: usize) -> Result<u64> {
    let tmp_path = path.with_extension("vz_tmp");
    std::fs::rename(path, &tmp_path)?;

    let result = rewrite(path, &tmp_path, no_keys);

    match result {
        Ok(saved) => {
            std::fs::remove_file(&tmp_path)?;
            Ok(saved)
        }
        Err(e) => {
            // Put the original archive back so a failed rewrite loses
            // nothing.
            let _ = std::fs::remove_file(path);
            let _ = std::fs::rename(&tmp_path, path);
            Err(e)
        }
    }
}

fn rewrite(path: &Path, tmp_path: &Path, no_keys: usize) -> Result<u64> {
    let old = Archive::open(tmp_path)?;
    let new = Archive::create(path)?;

    let (size_nodes, size_edges) = equality_graph(&old, no_keys, "size")?;
    let (data_nodes, data_edges) = equality_graph(&old, no_keys, "data")?;

    store_nodes(&new, "size_nodes", &size_nodes, no_keys)?;
    store_edges(&new, "size_edges", &size_edges, no_keys)?;
    store_nodes(&new, "data_nodes", &data_nodes, no_keys)?;
    store_edges(&new, "data_edges", &data_edges, no_keys)?;

    let mut saved = 0u64;
    saved += transfer_streams(&old, &new, &size_nodes, &size_edges, "size")?;
    saved += transfer_streams(&old, &new, &data_nodes, &data_edges, "data")?;

    for name in DESC_STREAM_SIZE
        .iter()
        .chain(DESC_STREAM_DATA.iter())
        .chain(["db_params", "db_meta", "db_header", "db_samples"].iter())
    {
        copy_stream(&old, &new, name)?;
    }

    new.close()?;
    log::info!("archive optimization saved {saved} bytes");

    Ok(saved)
}

// Per key column: hash the concatenated parts; on a match, verify
// byte-for-byte (metadata included) before declaring equality.
fn equality_graph(
    old: &Archive,
    no_keys: usize,
    suffix: &str,
) -> Result<(Vec<(i32, bool)>, Vec<(i32, i32)>)> {
    let mut nodes = Vec::with_capacity(no_keys);
    let mut edges = Vec::new();
    let mut hashes: Vec<(u64, u64)> = Vec::with_capacity(no_keys);

    for i in 0..no_keys {
        let sid = old.require_stream(&format!("key_{i}_{suffix}"))?;

        old.reset_part_iterator(sid);
        let mut h = 0u64;
        let mut total = 0u64;
        while let Some((data, _metadata)) = old.get_part(sid)? {
            for &c in &data {
                h = h.wrapping_add(u64::from(c).wrapping_mul(127));
            }
            total += data.len() as u64;
        }

        nodes.push(Node {
            id: i as i32,
            cost: old.compressed_size(sid),
        });

        for (j, &(hj, totj)) in hashes.iter().enumerate() {
            if hj == h && totj == total && streams_equal(old, j, i, suffix)? {
                edges.push(Edge {
                    from: j as i32,
                    to: i as i32,
                    equality: true,
                    cost: 0,
                });
                break;
            }
        }

        hashes.push((h, total));
    }

    let mut optimizer = GraphOptimizer::new();
    Ok(optimizer.optimize(&nodes, &edges))
}

fn streams_equal(old: &Archive, a: usize, b: usize, suffix: &str) -> Result<bool> {
    let sa = old.require_stream(&format!("key_{a}_{suffix}"))?;
    let sb = old.require_stream(&format!("key_{b}_{suffix}"))?;

    old.reset_part_iterator(sa);
    old.reset_part_iterator(sb);

    loop {
        match (old.get_part(sa)?, old.get_part(sb)?) {
            (None, None) => return Ok(true),
            (Some(pa), Some(pb)) if pa == pb => continue,
            _ => return Ok(false),
        }
    }
}

fn transfer_streams(
    old: &Archive,
    new: &Archive,
    nodes: &[(i32, bool)],
    edges: &[(i32, i32)],
    suffix: &str,
) -> Result<u64> {
    let mut saved = 0u64;

    for &(id, explicit) in nodes {
        let name = format!("key_{id}_{suffix}");

        if explicit {
            copy_stream(old, new, &name)?;
        } else {
            let &(from, _) = edges
                .iter()
                .find(|&&(_, to)| to == id)
                .expect("aliased node must have an incoming edge");

            let target = new.require_stream(&format!("key_{from}_{suffix}"))?;
            new.link_stream(&name, target)?;
            saved += old.compressed_size(old.require_stream(&name)?);
        }
    }

    Ok(saved)
}

fn copy_stream(old: &Archive, new: &Archive, name: &str) -> Result<()> {
    let old_id = old.require_stream(name)?;
    let new_id = new.register_stream(name)?;

    old.reset_part_iterator(old_id);
    while let Some((data, metadata)) = old.get_part(old_id)? {
        new.add_part(new_id, &data, metadata)?;
    }
    new.set_raw_size(new_id, old.raw_size(old_id));

    Ok(())
}

/// Serialize the optimizer's node list: per node one explicit-flag byte and
/// the id in `bytes_for(no_keys)` little-endian bytes; the part metadata is
/// the node count.
pub fn store_nodes(
    archive: &Archive,
    stream_name: &str,
    nodes: &[(i32, bool)],
    no_keys: usize,
) -> Result<()> {
    let sid = archive.register_stream(stream_name)?;
    let nb = bytes_for(no_keys as u64);

    let mut data = Vec::with_capacity(nodes.len() * (nb + 1));
    for &(id, explicit) in nodes {
        data.push(u8::from(explicit));
        for i in 0..nb {
            data.push(((id >> (8 * i)) & 0xff) as u8);
        }
    }

    archive.add_part(sid, &data, nodes.len() as u64)
}

/// Load a node list stored by [`store_nodes`].
pub fn load_nodes(archive: &Archive, stream_name: &str, no_keys: usize) -> Result<Vec<(i32, bool)>> {
    let Some(sid) = archive.stream_id(stream_name) else {
        // Archives that never went through the rewrite read as identity.
        return Ok((0..no_keys as i32).map(|i| (i, true)).collect());
    };

    let nb = bytes_for(no_keys as u64);
    let Some((data, count)) = archive.get_part(sid)? else {
        return Ok((0..no_keys as i32).map(|i| (i, true)).collect());
    };

    if count as usize * (nb + 1) != data.len() {
        return Err(varzip_core::error::VarzipError::corrupt_archive(
            "node list length mismatch",
        ));
    }

    let mut nodes = Vec::with_capacity(count as usize);
    let mut pos = 0usize;
    for _ in 0..count {
        let explicit = data[pos] != 0;
        pos += 1;

        let mut id = 0i32;
        for i in 0..nb {
            id += i32::from(data[pos]) << (8 * i);
            pos += 1;
        }
        nodes.push((id, explicit));
    }

    Ok(nodes)
}

/// Serialize the optimizer's edge list; the part metadata is the edge
/// count.
pub fn store_edges(
    archive: &Archive,
    stream_name: &str,
    edges: &[(i32, i32)],
    no_keys: usize,
) -> Result<()> {
    let sid = archive.register_stream(stream_name)?;
    let nb = bytes_for(no_keys as u64);

    let mut data = Vec::with_capacity(edges.len() * 2 * nb);
    for &(from, to) in edges {
        for i in 0..nb {
            data.push(((from >> (8 * i)) & 0xff) as u8);
        }
        for i in 0..nb {
            data.push(((to >> (8 * i)) & 0xff) as u8);
        }
    }

    archive.add_part(sid, &data, edges.len() as u64)
}

/// Load an edge list stored by [`store_edges`].
pub fn load_edges(archive: &Archive, stream_name: &str, no_keys: usize) -> Result<Vec<(i32, i32)>> {
    let Some(sid) = archive.stream_id(stream_name) else {
        return Ok(Vec::new());
    };

    let nb = bytes_for(no_keys as u64);
    let Some((data, count)) = archive.get_part(sid)? else {
        return Ok(Vec::new());
    };

    if count as usize * 2 * nb != data.len() {
        return Err(varzip_core::error::VarzipError::corrupt_archive(
            "edge list length mismatch",
        ));
    }

    let mut edges = Vec::with_capacity(count as usize);
    let mut pos = 0usize;
    for _ in 0..count {
        let mut from = 0i32;
        for i in 0..nb {
            from += i32::from(data[pos]) << (8 * i);
            pos += 1;
        }
        let mut to = 0i32;
        for i in 0..nb {
            to += i32::from(data[pos]) << (8 * i);
            pos += 1;
        }
        edges.push((from, to));
    }

    Ok(edges)
}

/// Serialize a byte-wise column function: entry count in the metadata, then
/// per entry two length-prefixed byte strings.
pub fn store_function(
    archive: &Archive,
    stream_name: &str,
    function: &FunctionMap,
) -> Result<()> {
    let sid = archive.register_stream(stream_name)?;

    // Sorted for a deterministic stream.
    let mut entries: Vec<(&Vec<u8>, &Vec<u8>)> = function.iter().collect();
    entries.sort();

    let mut data = Vec::new();
    for (src, dst) in entries {
        varint::put_uint(&mut data, src.len() as u64);
        data.extend_from_slice(src);
        varint::put_uint(&mut data, dst.len() as u64);
        data.extend_from_slice(dst);
    }

    archive.add_part(sid, &data, function.len() as u64)
}

/// Load a function stored by [`store_function`].
pub fn load_function(archive: &Archive, stream_name: &str) -> Result<FunctionMap> {
    let sid = archive.require_stream(stream_name)?;
    let Some((data, count)) = archive.get_part(sid)? else {
        return Ok(FunctionMap::new());
    };

    let mut function = FunctionMap::new();
    let mut pos = 0usize;
    for _ in 0..count {
        let src_len = varint::get_uint(&data, &mut pos)? as usize;
        let src = data[pos..pos + src_len].to_vec();
        pos += src_len;

        let dst_len = varint::get_uint(&data, &mut pos)? as usize;
        let dst = data[pos..pos + dst_len].to_vec();
        pos += dst_len;

        function.insert(src, dst);
    }

    Ok(function)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("varzip_opt_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_nodes_edges_roundtrip() {
        let path = temp_path("nodes");
        let archive = Archive::create(&path).unwrap();

        let nodes = vec![(0, true), (2, false), (1, true)];
        let edges = vec![(0, 2)];
        store_nodes(&archive, "data_nodes", &nodes, 3).unwrap();
        store_edges(&archive, "data_edges", &edges, 3).unwrap();
        archive.close().unwrap();

        let archive = Archive::open(&path).unwrap();
        assert_eq!(load_nodes(&archive, "data_nodes", 3).unwrap(), nodes);
        assert_eq!(load_edges(&archive, "data_edges", 3).unwrap(), edges);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_streams_read_as_identity() {
        let path = temp_path("identity");
        let archive = Archive::create(&path).unwrap();
        archive.close().unwrap();

        let archive = Archive::open(&path).unwrap();
        assert_eq!(
            load_nodes(&archive, "data_nodes", 2).unwrap(),
            vec![(0, true), (1, true)]
        );
        assert!(load_edges(&archive, "data_edges", 2).unwrap().is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_function_roundtrip() {
        let path = temp_path("function");
        let archive = Archive::create(&path).unwrap();

        let mut function = FunctionMap::new();
        function.insert(vec![1, 0, 0, 0], vec![10, 0, 0, 0]);
        function.insert(vec![2, 0, 0, 0], vec![20, 0, 0, 0]);
        store_function(&archive, "func_3_data", &function).unwrap();
        archive.close().unwrap();

        let archive = Archive::open(&path).unwrap();
        assert_eq!(load_function(&archive, "func_3_data").unwrap(), function);

        std::fs::remove_file(&path).ok();
    }
}
