use std::collections::VecDeque;

use crate::wire::BlockInfo;

use super::PIPELINE_CAPACITY;

/// One piece being downloaded from one peer: the blocks still to be
/// requested and the requests currently in flight. The pipeline never
/// holds more than [`PIPELINE_CAPACITY`] outstanding requests.
#[derive(Debug)]
pub struct PieceDownload {
    piece: u32,
    pending: VecDeque<BlockInfo>,
    pipeline: VecDeque<BlockInfo>,
}

impl PieceDownload {
    pub fn new(piece: u32, blocks: Vec<BlockInfo>) -> Self {
        Self {
            piece,
            pending: blocks.into(),
            pipeline: VecDeque::with_capacity(PIPELINE_CAPACITY),
        }
    }

    pub fn piece(&self) -> u32 {
        self.piece
    }

    /// Move pending blocks into the pipeline up to capacity and return the
    /// ones that now need REQUEST messages sent.
    pub fn fill(&mut self) -> Vec<BlockInfo> {
        let mut queued = Vec::new();
        while self.pipeline.len() < PIPELINE_CAPACITY {
            let Some(block) = self.pending.pop_front() else {
                break;
            };
            self.pipeline.push_back(block);
            queued.push(block);
        }
        queued
    }

    /// Mark an in-flight request as answered. Returns false for data we
    /// never asked for (or asked for and already gave up on).
    pub fn resolve(&mut self, piece: u32, begin: u32, length: u32) -> bool {
        if piece != self.piece {
            return false;
        }
        let position = self
            .pipeline
            .iter()
            .position(|b| b.begin == begin && b.length == length);
        match position {
            Some(index) => {
                self.pipeline.remove(index);
                true
            }
            None => false,
        }
    }

    /// Abandon the download: empties the pipeline and returns the requests
    /// that were in flight so the caller can CANCEL them. Pending blocks
    /// were never requested and need no cancel.
    pub fn drain(&mut self) -> Vec<BlockInfo> {
        self.pending.clear();
        self.pipeline.drain(..).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.pipeline.len()
    }
}
