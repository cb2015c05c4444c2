//! Wave scheduler: an ordered list of buckets walked by an index cursor.
//!
//! Plan order is PreSync hooks, apply waves ascending (Sync hooks ride along with
//! their wave), prune waves descending, then PostSync hooks. SyncFail hooks are held
//! aside and handed out only when the attempt fails.

use std::collections::BTreeMap;

use kairo_core::{HookPhase, OperationKind, ResourceRef, SyncWave};
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, PendingOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    PreSync,
    Apply,
    Prune,
    PostSync,
}

/// A set of operations that may run concurrently.
#[derive(Debug)]
pub struct Bucket {
    pub stage: Stage,
    pub wave: SyncWave,
    pub operations: Vec<PendingOperation>,
    pub hooks: Vec<PendingOperation>,
}

/// Bucket metadata kept after the operations have been handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub stage: Stage,
    pub wave: SyncWave,
    pub resources: Vec<ResourceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Bucket at the index may start.
    Ready,
    /// Bucket at the index was handed out and is not complete yet.
    InFlight,
    Halted,
}

#[derive(Debug)]
pub struct Schedule {
    buckets: Vec<Option<Bucket>>,
    infos: Vec<BucketInfo>,
    sync_fail: Vec<PendingOperation>,
    index: usize,
    cursor: Cursor,
}

fn sort_ops(ops: &mut [PendingOperation]) {
    ops.sort_by(|a, b| a.resource.cmp(&b.resource));
}

impl Schedule {
    pub fn from_graph(graph: Graph) -> Self {
        let mut apply: BTreeMap<SyncWave, (Vec<PendingOperation>, Vec<PendingOperation>)> = BTreeMap::new();
        let mut prune: BTreeMap<SyncWave, Vec<PendingOperation>> = BTreeMap::new();
        let mut pre = Vec::new();
        let mut post = Vec::new();
        let mut sync_fail = Vec::new();

        for op in graph.operations {
            match op.kind {
                OperationKind::Prune => prune.entry(op.wave).or_default().push(op),
                _ => apply.entry(op.wave).or_default().0.push(op),
            }
        }
        for hook in graph.hooks {
            match hook.hook_phase {
                Some(HookPhase::PreSync) => pre.push(hook),
                Some(HookPhase::Sync) => apply.entry(hook.wave).or_default().1.push(hook),
                Some(HookPhase::PostSync) => post.push(hook),
                Some(HookPhase::SyncFail) => sync_fail.push(hook),
                None => {}
            }
        }

        let mut buckets = Vec::new();
        if !pre.is_empty() {
            buckets.push(Bucket { stage: Stage::PreSync, wave: 0, operations: Vec::new(), hooks: pre });
        }
        for (wave, (mut operations, hooks)) in apply {
            sort_ops(&mut operations);
            buckets.push(Bucket { stage: Stage::Apply, wave, operations, hooks });
        }
        for (wave, mut operations) in prune.into_iter().rev() {
            sort_ops(&mut operations);
            buckets.push(Bucket { stage: Stage::Prune, wave, operations, hooks: Vec::new() });
        }
        if !post.is_empty() {
            buckets.push(Bucket { stage: Stage::PostSync, wave: 0, operations: Vec::new(), hooks: post });
        }

        let infos = buckets
            .iter()
            .map(|b| BucketInfo {
                stage: b.stage,
                wave: b.wave,
                resources: b.operations.iter().chain(b.hooks.iter()).map(|o| o.resource.clone()).collect(),
            })
            .collect();
        Self { buckets: buckets.into_iter().map(Some).collect(), infos, sync_fail, index: 0, cursor: Cursor::Ready }
    }

    pub fn len(&self) -> usize { self.infos.len() }
    pub fn is_empty(&self) -> bool { self.infos.is_empty() }
    pub fn infos(&self) -> &[BucketInfo] { &self.infos }

    /// Metadata of the next bucket to start, if any is eligible.
    pub fn peek(&self) -> Option<&BucketInfo> {
        if self.cursor != Cursor::Ready { return None; }
        self.infos.get(self.index)
    }

    /// Hand out the next bucket. Returns None while the previous bucket is still in flight,
    /// after a halt, or when every bucket has completed.
    pub fn start_next(&mut self) -> Option<Bucket> {
        if self.cursor != Cursor::Ready { return None; }
        let bucket = self.buckets.get_mut(self.index)?.take()?;
        self.cursor = Cursor::InFlight;
        Some(bucket)
    }

    /// Mark the in-flight bucket terminal and make the next one eligible.
    pub fn complete(&mut self) {
        if self.cursor == Cursor::InFlight {
            self.index += 1;
            self.cursor = Cursor::Ready;
        }
    }

    /// Stop handing out buckets for this attempt.
    pub fn halt(&mut self) { self.cursor = Cursor::Halted; }

    pub fn is_halted(&self) -> bool { self.cursor == Cursor::Halted }

    pub fn is_finished(&self) -> bool { self.cursor == Cursor::Ready && self.index >= self.infos.len() }

    /// Buckets that were never handed out.
    pub fn remaining(&self) -> &[BucketInfo] {
        let from = match self.cursor {
            Cursor::InFlight => self.index + 1,
            _ => self.index,
        };
        self.infos.get(from..).unwrap_or(&[])
    }

    pub fn take_sync_fail_hooks(&mut self) -> Vec<PendingOperation> { std::mem::take(&mut self.sync_fail) }

    /// Apply operations in plan order as (wave, resource).
    pub fn apply_order(&self) -> Vec<(SyncWave, ResourceRef)> { self.order_of(Stage::Apply) }

    /// Prune operations in plan order as (wave, resource).
    pub fn prune_order(&self) -> Vec<(SyncWave, ResourceRef)> { self.order_of(Stage::Prune) }

    fn order_of(&self, stage: Stage) -> Vec<(SyncWave, ResourceRef)> {
        self.infos
            .iter()
            .filter(|b| b.stage == stage)
            .flat_map(|b| b.resources.iter().map(move |r| (b.wave, r.clone())))
            .collect()
    }
}
