//! Parallel workers executing reader/processor/writer tasks handed out by
//! the dispatcher thread, connected over bounded in-process channels -
//! see DESIGN.md for why this takes the place of the source system's N+1
//! processes over ROUTER/DEALER sockets. Every worker shares the same
//! immutable [`SharedMetadata`] and the same [`NodeStore`]; the dispatcher
//! never reaches into a worker's state directly, only via the messages
//! defined here.

use crate::config::SharedMetadata;
use crate::crs::CrsTransform;
use crate::dispatcher::Job;
use crate::error::Result;
use crate::geometry::name::NodeName;
use crate::geometry::point::PointBatch;
use crate::io::{self, StreamTransform};
use crate::node::{self, Node};
use crate::node_store::NodeStore;
use crate::tile_encoder::TileEncoder;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// One result a worker reports back to the dispatcher thread. Mirrors the
/// source system's `NEW_TASK`/`READ_DONE`/`PROCESSED`/`WRITTEN`/`ERROR`
/// message kinds one-to-one; point batches cross this boundary pre-serialized
/// (`bincode`), matching how they would cross a real process boundary.
pub enum WorkerResult {
    NewTask {
        node: NodeName,
        data: Vec<u8>,
        point_count: u64,
    },
    ReadDone,
    Processed {
        node: NodeName,
        point_count: u64,
    },
    Written {
        node: NodeName,
        point_count: u64,
    },
    Error(String),
}

pub struct WorkerPool {
    job_tx: Sender<Job>,
    result_rx: Receiver<WorkerResult>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        n: usize,
        metadata: Arc<SharedMetadata>,
        node_store: Arc<NodeStore>,
        encoder: Arc<dyn TileEncoder>,
        crs: Arc<dyn CrsTransform>,
    ) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<WorkerResult>();
        let mut handles = Vec::with_capacity(n);
        for id in 0..n.max(1) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let metadata = Arc::clone(&metadata);
            let node_store = Arc::clone(&node_store);
            let encoder = Arc::clone(&encoder);
            let crs = Arc::clone(&crs);
            let handle = std::thread::Builder::new()
                .name(format!("tiler-worker-{id}"))
                .spawn(move || worker_loop(job_rx, result_tx, metadata, node_store, encoder, crs))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        WorkerPool { job_tx, result_rx, handles }
    }

    pub fn job_sender(&self) -> Sender<Job> {
        self.job_tx.clone()
    }

    pub fn result_receiver(&self) -> Receiver<WorkerResult> {
        self.result_rx.clone()
    }

    /// Sends one `Shutdown` per worker and joins every thread - the
    /// thread/channel analogue of the source system broadcasting `SHUTDOWN`
    /// and waiting for every worker's `HALTED`.
    pub fn shutdown(self) {
        for _ in 0..self.handles.len() {
            let _ = self.job_tx.send(Job::Shutdown);
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    job_rx: Receiver<Job>,
    result_tx: Sender<WorkerResult>,
    metadata: Arc<SharedMetadata>,
    node_store: Arc<NodeStore>,
    encoder: Arc<dyn TileEncoder>,
    crs: Arc<dyn CrsTransform>,
) {
    while let Ok(job) = job_rx.recv() {
        match job {
            Job::Shutdown => break,
            Job::Read(portion) => run_read(&portion, &metadata, &crs, &result_tx),
            Job::Process { batches, .. } => run_process(batches, &metadata, &node_store, &result_tx),
            Job::Write(name) => run_write(name, &metadata, &node_store, encoder.as_ref(), &result_tx),
        }
    }
}

fn run_read(portion: &crate::dispatcher::FilePortion, metadata: &SharedMetadata, crs: &Arc<dyn CrsTransform>, result_tx: &Sender<WorkerResult>) {
    let reader_portion = io::Portion {
        start_point: portion.start,
        end_point: portion.end,
        byte_offset: portion.byte_offset,
    };
    let transform = StreamTransform {
        offset: metadata.offset,
        scale: metadata.scale,
        rotation: metadata.rotation,
        crs: Some(Arc::clone(crs)),
    };
    let stream = match io::stream_file(&portion.path, &reader_portion, transform, metadata.color_scale, metadata.attributes.intensity) {
        Ok(s) => s,
        Err(e) => {
            let _ = result_tx.send(WorkerResult::Error(e.to_string()));
            return;
        }
    };
    for batch in stream {
        match batch {
            Ok(batch) => {
                let point_count = batch.len() as u64;
                let data = bincode::serialize(&batch).expect("PointBatch is always serializable");
                let _ = result_tx.send(WorkerResult::NewTask {
                    node: NodeName::root(),
                    data,
                    point_count,
                });
            }
            Err(e) => {
                let _ = result_tx.send(WorkerResult::Error(e.to_string()));
                return;
            }
        }
    }
    let _ = result_tx.send(WorkerResult::ReadDone);
}

fn run_process(batches: Vec<(NodeName, Vec<Vec<u8>>)>, metadata: &SharedMetadata, node_store: &NodeStore, result_tx: &Sender<WorkerResult>) {
    for (name, raw_batches) in batches {
        let mut overflow = Vec::new();
        match process_one(&name, raw_batches, metadata, node_store, &mut overflow) {
            Ok(point_count) => {
                for (child_name, batch) in overflow {
                    let data = bincode::serialize(&batch).expect("PointBatch is always serializable");
                    let _ = result_tx.send(WorkerResult::NewTask {
                        node: child_name,
                        data,
                        point_count: batch.len() as u64,
                    });
                }
                let _ = result_tx.send(WorkerResult::Processed { node: name, point_count });
            }
            Err(e) => {
                let _ = result_tx.send(WorkerResult::Error(e.to_string()));
                return;
            }
        }
    }
    if let Err(e) = node_store.control_memory(metadata.cache_size_bytes) {
        let _ = result_tx.send(WorkerResult::Error(e.to_string()));
    }
}

/// Loads (or lazily creates) node `name`, inserts `raw_batches`, and flushes
/// pending points to children up to the task's depth budget - recursing
/// locally within the subtree rooted at `name`, and reporting anything that
/// crosses out of it via `overflow`. Returns the number of points this task
/// processed (the number handed in, for the dispatcher's accounting - not a
/// recursive descendant count).
fn process_one(
    name: &NodeName,
    raw_batches: Vec<Vec<u8>>,
    metadata: &SharedMetadata,
    node_store: &NodeStore,
    overflow: &mut Vec<(NodeName, PointBatch)>,
) -> Result<u64> {
    let batches: Vec<PointBatch> = raw_batches
        .iter()
        .map(|b| bincode::deserialize(b).expect("batch bytes came from bincode::serialize"))
        .collect();
    let point_count: u64 = batches.iter().map(|b| b.len() as u64).sum();
    let depth_budget = name.depth() as i64 - 1;
    let (aabb, spacing) = node::aabb_and_spacing_for(name, &metadata.root_aabb, metadata.root_spacing);
    insert_recursive(name.clone(), aabb, spacing, batches, node_store, metadata.scale, depth_budget, overflow)?;
    Ok(point_count)
}

fn insert_recursive(
    name: NodeName,
    aabb: crate::geometry::aabb::Aabb,
    spacing: f64,
    incoming: Vec<PointBatch>,
    node_store: &NodeStore,
    scale: f64,
    depth_budget: i64,
    overflow: &mut Vec<(NodeName, PointBatch)>,
) -> Result<()> {
    let existing = node_store.get(&name).map_err(|e| crate::io::io_err(node_store.working_dir(), e))?;
    let mut this_node = match existing {
        Some(bytes) => Node::from_bytes(name.clone(), aabb, spacing, &bytes),
        None => Node::new(name.clone(), aabb, spacing),
    };
    for batch in &incoming {
        this_node.insert(batch, scale);
    }

    let routed = this_node.flush_pending();
    if !routed.is_empty() {
        if depth_budget <= 0 {
            overflow.extend(routed);
        } else {
            let mut grouped: HashMap<NodeName, PointBatch> = HashMap::new();
            for (child_name, batch) in routed {
                grouped.entry(child_name).or_default().extend_from(&batch);
            }
            let subdivision = this_node.subdivision;
            let parent_aabb = this_node.aabb;
            let child_spacing = this_node.spacing / 2.0;
            for (child_name, batch) in grouped {
                let octant = child_name.octant().expect("child name always has a trailing octant digit");
                let child_aabb = parent_aabb.child_aabb(octant, subdivision).make_valid();
                insert_recursive(child_name, child_aabb, child_spacing, vec![batch], node_store, scale, depth_budget - 1, overflow)?;
            }
        }
    }

    node_store.put(name, this_node.to_bytes());
    Ok(())
}

fn run_write(name: NodeName, metadata: &SharedMetadata, node_store: &NodeStore, encoder: &dyn TileEncoder, result_tx: &Sender<WorkerResult>) {
    let bytes = match node_store.get(&name) {
        Ok(Some(b)) => b,
        Ok(None) => {
            let _ = result_tx.send(WorkerResult::Error(format!("node {name} has no stored state to write")));
            return;
        }
        Err(e) => {
            let _ = result_tx.send(WorkerResult::Error(e.to_string()));
            return;
        }
    };
    let (aabb, spacing) = node::aabb_and_spacing_for(&name, &metadata.root_aabb, metadata.root_spacing);
    let reconstituted = Node::from_bytes(name.clone(), aabb, spacing, &bytes);
    let points = reconstituted.all_points();
    let point_count = points.len() as u64;
    let encoded = encoder.encode(&points, metadata.attributes);
    let path = name.sharded_path(&metadata.out_folder, encoder.file_extension());

    let write_result = (|| -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::io::io_err(&path, e))?;
        }
        std::fs::write(&path, &encoded).map_err(|e| crate::io::io_err(&path, e))
    })();

    if let Err(e) = write_result {
        let _ = result_tx.send(WorkerResult::Error(e.to_string()));
        return;
    }
    if let Err(e) = node_store.remove(&name) {
        let _ = result_tx.send(WorkerResult::Error(e.to_string()));
        return;
    }
    let _ = result_tx.send(WorkerResult::Written { node: name, point_count });
}
