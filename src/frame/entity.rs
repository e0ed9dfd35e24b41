use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, PoolId};
use crate::pipeline::PipeId;

/// Per-stage progress of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    NoReq,
    Requested,
    Processing,
    Complete,
    Error,
}

impl EntityState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EntityState::Complete | EntityState::Error)
    }

    /// Legal moves: NOREQ->REQUESTED->PROCESSING->{COMPLETE,ERROR}, REQUESTED->ERROR
    pub fn can_move_to(self, next: EntityState) -> bool {
        use EntityState::*;
        matches!(
            (self, next),
            (NoReq, Requested)
                | (Requested, Processing)
                | (Requested, Error)
                | (Processing, Complete)
                | (Processing, Error)
        )
    }
}

/// One stage (or DMA-out tap) of a frame with its buffer slots
#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) pipe: PipeId,
    /// Stage a DMA-out tap belongs to; taps move with their parent
    pub(crate) parent: Option<PipeId>,
    pub(crate) state: EntityState,
    pub(crate) src: Option<Buffer>,
    pub(crate) dst: Option<Buffer>,
    pub(crate) src_pool: Option<PoolId>,
    pub(crate) dst_pool: Option<PoolId>,
}

impl Entity {
    pub fn stage(pipe: PipeId, dst_pool: Option<PoolId>) -> Self {
        Self {
            pipe,
            parent: None,
            state: EntityState::Requested,
            src: None,
            dst: None,
            src_pool: None,
            dst_pool,
        }
    }

    pub fn tap(pipe: PipeId, parent: PipeId, dst_pool: Option<PoolId>, requested: bool) -> Self {
        Self {
            pipe,
            parent: Some(parent),
            state: if requested {
                EntityState::Requested
            } else {
                EntityState::NoReq
            },
            src: None,
            dst: None,
            src_pool: None,
            dst_pool,
        }
    }

    pub fn with_src_pool(mut self, pool: Option<PoolId>) -> Self {
        self.src_pool = pool;
        self
    }

    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    pub fn parent(&self) -> Option<PipeId> {
        self.parent
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_tap(&self) -> bool {
        self.parent.is_some()
    }

    pub(crate) fn holds(&self, pool: PoolId, index: usize) -> bool {
        let matches = |b: &Option<Buffer>| {
            b.as_ref()
                .map(|b| b.pool == pool && b.index == index)
                .unwrap_or(false)
        };
        matches(&self.src) || matches(&self.dst)
    }
}
