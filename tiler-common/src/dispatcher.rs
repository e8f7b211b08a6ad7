//! `TilerState`: the dispatcher's queues, counters, and job-selection policy.
//!
//! Ownership of all of this state is concentrated in one struct behind a
//! single mutex, played by a dispatcher thread - no worker ever reaches into
//! it directly, it only ever receives what the dispatcher decides to hand it
//! over a channel. This mirrors the source system's single-process-owns-the-
//! queues design, with the process/socket boundary collapsed to a thread/
//! channel boundary (see the scheduling-model design note).

use crate::geometry::name::NodeName;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Points in flight across the whole pipeline are capped at this many, to
/// bound peak memory independent of file size.
pub const MAX_POINTS_IN_PROGRESS: u64 = 60_000_000;

/// A `PROCESS` job batches `node_to_process` entries up to roughly this many
/// points before being handed to a worker.
pub const PROCESS_BATCH_TARGET: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct FilePortion {
    pub path: std::path::PathBuf,
    pub start: u64,
    pub end: u64,
    pub byte_offset: u64,
}

#[derive(Debug)]
struct ProcessEntry {
    batches: Vec<Vec<u8>>,
    point_count: u64,
}

#[derive(Debug)]
struct ProcessingEntry {
    task_count: usize,
    point_count: u64,
    started_at: Instant,
}

/// One of the three job kinds the dispatcher can hand to an idle worker.
#[derive(Debug)]
pub enum Job {
    Read(FilePortion),
    Process {
        names: Vec<NodeName>,
        batches: Vec<(NodeName, Vec<Vec<u8>>)>,
    },
    Write(NodeName),
    /// Sent once per worker when the pipeline is done (or aborting); a
    /// worker exits its loop upon receiving this rather than blocking for
    /// another job.
    Shutdown,
}

pub struct TilerState {
    file_portions: VecDeque<FilePortion>,
    node_to_process: HashMap<NodeName, ProcessEntry>,
    processing: HashMap<NodeName, ProcessingEntry>,
    waiting_to_write: Vec<NodeName>,
    ready_to_write: Vec<NodeName>,
    pub reading_jobs: u32,
    pub writing_jobs: u32,
    pub points_in_progress: u64,
    pub points_processed: u64,
    pub points_written: u64,
    max_reading_jobs: u32,
}

impl TilerState {
    pub fn new(file_portions: Vec<FilePortion>, jobs: u32) -> Self {
        TilerState {
            file_portions: file_portions.into(),
            node_to_process: HashMap::new(),
            processing: HashMap::new(),
            waiting_to_write: Vec::new(),
            ready_to_write: Vec::new(),
            reading_jobs: 0,
            writing_jobs: 0,
            points_in_progress: 0,
            points_processed: 0,
            points_written: 0,
            max_reading_jobs: jobs.max(1) / 2,
        }
    }

    pub fn is_reading_finished(&self) -> bool {
        self.file_portions.is_empty() && self.reading_jobs == 0
    }

    pub fn is_idle(&self) -> bool {
        self.file_portions.is_empty()
            && self.node_to_process.is_empty()
            && self.processing.is_empty()
            && self.waiting_to_write.is_empty()
            && self.ready_to_write.is_empty()
            && self.reading_jobs == 0
            && self.writing_jobs == 0
    }

    /// Adds a batch of serialized points destined for node `name`, to be
    /// picked up by a future `PROCESS` job. `point_count` must be strictly
    /// positive - a zero or negative count is an invariant violation.
    pub fn add_task_to_process(&mut self, name: NodeName, data: Vec<u8>, point_count: u64) {
        assert!(point_count > 0, "point_count must be strictly positive");
        let entry = self.node_to_process.entry(name).or_insert_with(|| ProcessEntry {
            batches: Vec::new(),
            point_count: 0,
        });
        entry.batches.push(data);
        entry.point_count += point_count;
    }

    pub fn can_add_reading_jobs(&self) -> bool {
        !self.file_portions.is_empty()
            && self.points_in_progress < MAX_POINTS_IN_PROGRESS
            && self.reading_jobs < self.max_reading_jobs.max(1)
    }

    /// Selects the next job for an idle worker, per the dispatch policy:
    /// writes first, then the deepest-first process batch, then reads bounded
    /// by the in-progress point budget.
    pub fn next_job(&mut self) -> Option<Job> {
        if let Some(name) = self.ready_to_write.pop() {
            self.writing_jobs += 1;
            return Some(Job::Write(name));
        }

        if !self.node_to_process.is_empty() {
            let mut names: Vec<NodeName> = self.node_to_process.keys().cloned().collect();
            names.sort_by(|a, b| b.depth().cmp(&a.depth()));

            let mut batches = Vec::new();
            let mut taken_names = Vec::new();
            let mut total_points = 0u64;
            for name in names {
                if total_points >= PROCESS_BATCH_TARGET && !taken_names.is_empty() {
                    break;
                }
                let entry = self.node_to_process.remove(&name).unwrap();
                total_points += entry.point_count;
                self.processing.insert(
                    name.clone(),
                    ProcessingEntry {
                        task_count: entry.batches.len(),
                        point_count: entry.point_count,
                        started_at: Instant::now(),
                    },
                );
                self.waiting_to_write.retain(|n| n != &name);
                batches.push((name.clone(), entry.batches));
                taken_names.push(name);
            }
            return Some(Job::Process {
                names: taken_names,
                batches,
            });
        }

        if self.can_add_reading_jobs() {
            if let Some(portion) = self.file_portions.pop_back() {
                self.reading_jobs += 1;
                return Some(Job::Read(portion));
            }
        }

        None
    }

    /// Whether node `n` may be written, given that `just_finished` just
    /// completed processing: `just_finished` must be an ancestor of (or equal
    /// to) `n`, and no node currently queued or in flight may be an ancestor.
    pub fn can_write(&self, n: &NodeName, just_finished: &NodeName) -> bool {
        if !just_finished.is_ancestor_of(n) {
            return false;
        }
        !self
            .node_to_process
            .keys()
            .chain(self.processing.keys())
            .any(|m| m.is_ancestor_of(n))
    }

    /// Records that node `f` finished a processing round, and migrates
    /// whatever is now writable from `waiting_to_write` into `ready_to_write`.
    pub fn on_processed(&mut self, f: NodeName, point_count: u64) {
        self.processing.remove(&f);
        self.points_processed += point_count;
        self.waiting_to_write.push(f.clone());

        let in_flight = !self.node_to_process.is_empty() || !self.processing.is_empty();

        if self.is_reading_finished() && in_flight {
            if self.can_write(&f, &f) {
                self.waiting_to_write.retain(|n| n != &f);
                self.ready_to_write.push(f.clone());
            }
            let mut i = self.waiting_to_write.len();
            while i > 0 {
                i -= 1;
                let n = self.waiting_to_write[i].clone();
                if self.can_write(&n, &f) {
                    self.waiting_to_write.remove(i);
                    self.ready_to_write.push(n);
                }
            }
        } else if self.is_reading_finished() {
            self.ready_to_write.append(&mut self.waiting_to_write);
        }
    }

    pub fn on_write_done(&mut self, points_written: u64) {
        self.writing_jobs -= 1;
        self.points_written += points_written;
    }

    pub fn on_read_started(&mut self, points: u64) {
        self.points_in_progress += points;
    }

    pub fn on_read_done(&mut self) {
        self.reading_jobs -= 1;
    }

    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            file_portions: self.file_portions.len(),
            node_to_process: self.node_to_process.len(),
            processing: self.processing.len(),
            waiting_to_write: self.waiting_to_write.len(),
            ready_to_write: self.ready_to_write.len(),
            reading_jobs: self.reading_jobs,
            writing_jobs: self.writing_jobs,
        }
    }
}

#[derive(Debug)]
pub struct QueueDepths {
    pub file_portions: usize,
    pub node_to_process: usize,
    pub processing: usize,
    pub waiting_to_write: usize,
    pub ready_to_write: usize,
    pub reading_jobs: u32,
    pub writing_jobs: u32,
}

impl std::fmt::Display for QueueDepths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "portions={} node_to_process={} processing={} waiting={} ready={} reading_jobs={} writing_jobs={}",
            self.file_portions,
            self.node_to_process,
            self.processing,
            self.waiting_to_write,
            self.ready_to_write,
            self.reading_jobs,
            self.writing_jobs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portion() -> FilePortion {
        FilePortion {
            path: "x.xyz".into(),
            start: 0,
            end: 100,
            byte_offset: 0,
        }
    }

    #[test]
    fn write_jobs_take_priority() {
        let mut state = TilerState::new(vec![portion()], 4);
        state.ready_to_write.push(NodeName::root());
        match state.next_job() {
            Some(Job::Write(name)) => assert_eq!(name, NodeName::root()),
            other => panic!("expected write job, got {other:?}"),
        }
    }

    #[test]
    fn process_jobs_prefer_deepest_nodes() {
        let mut state = TilerState::new(vec![], 4);
        state.add_task_to_process(NodeName::root(), vec![1], 10);
        state.add_task_to_process(NodeName::from_digits(&[1, 2]), vec![2], 10);
        match state.next_job() {
            Some(Job::Process { names, .. }) => {
                assert_eq!(names[0], NodeName::from_digits(&[1, 2]));
            }
            other => panic!("expected process job, got {other:?}"),
        }
    }

    #[test]
    fn read_jobs_only_when_nothing_else_pending() {
        let mut state = TilerState::new(vec![portion()], 4);
        match state.next_job() {
            Some(Job::Read(_)) => {}
            other => panic!("expected read job, got {other:?}"),
        }
    }

    #[test]
    #[should_panic]
    fn zero_point_count_is_fatal() {
        let mut state = TilerState::new(vec![], 4);
        state.add_task_to_process(NodeName::root(), vec![1], 0);
    }

    #[test]
    fn can_write_checks_ancestors_in_flight() {
        let mut state = TilerState::new(vec![], 4);
        let root = NodeName::root();
        let child = NodeName::from_digits(&[1]);
        state.add_task_to_process(child.clone(), vec![1], 5);
        assert!(!state.can_write(&child, &root));
    }

    #[test]
    fn on_processed_moves_writable_nodes_when_reading_finished() {
        let mut state = TilerState::new(vec![], 4);
        let root = NodeName::root();
        state.on_processed(root.clone(), 10);
        assert!(state.ready_to_write.contains(&root));
    }
}
