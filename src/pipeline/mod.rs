//! Stage graphs, per-stage pipes and the frame factory

pub mod factory;
pub mod graph;
pub mod pipe;

use serde::{Deserialize, Serialize};

pub use factory::FrameFactory;
pub use graph::{SrcSpec, StageGraph, StageNode, TapNode};
pub use pipe::Pipe;

use crate::{PreviewMode, ReprocessingMode};

/// Hardware stages and their DMA-out taps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipeId {
    // Preview stages
    Flite,
    Aa3,
    Isp,
    Aa3Isp,
    Mcsc,
    // Preview taps
    FliteRaw,
    Aa3c,
    McscPreview,
    McscCallback,
    McscVideo,
    McscCapture,
    // Reprocessing stages
    Aa3IspReprocessing,
    IspReprocessing,
    McscReprocessing,
    Jpeg,
    // Reprocessing taps
    McscJpegSrc,
}

impl PipeId {
    pub fn is_tap(self) -> bool {
        matches!(
            self,
            PipeId::FliteRaw
                | PipeId::Aa3c
                | PipeId::McscPreview
                | PipeId::McscCallback
                | PipeId::McscVideo
                | PipeId::McscCapture
                | PipeId::McscJpegSrc
        )
    }

    /// Stages whose completion carries 3A results
    pub fn reports_3a(self) -> bool {
        matches!(self, PipeId::Aa3 | PipeId::Aa3Isp)
    }
}

/// Graph variants a factory can build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactoryMode {
    PreviewOtf,
    PreviewM2m,
    ReprocessingPureBayer,
    ReprocessingDirtyBayer,
    ReprocessingYuv,
}

impl FactoryMode {
    pub fn preview(mode: PreviewMode) -> Self {
        match mode {
            PreviewMode::Otf => FactoryMode::PreviewOtf,
            PreviewMode::M2m => FactoryMode::PreviewM2m,
        }
    }

    pub fn reprocessing(mode: ReprocessingMode) -> Self {
        match mode {
            ReprocessingMode::PureBayer => FactoryMode::ReprocessingPureBayer,
            ReprocessingMode::DirtyBayer => FactoryMode::ReprocessingDirtyBayer,
            ReprocessingMode::Yuv => FactoryMode::ReprocessingYuv,
        }
    }

    pub fn is_reprocessing(self) -> bool {
        !matches!(self, FactoryMode::PreviewOtf | FactoryMode::PreviewM2m)
    }

    pub fn graph(self) -> &'static StageGraph {
        graph::graph_for(self)
    }
}

/// Preview entity whose output a reprocessing mode consumes
pub fn hold_node(mode: ReprocessingMode) -> PipeId {
    match mode {
        ReprocessingMode::PureBayer => PipeId::Flite,
        ReprocessingMode::DirtyBayer => PipeId::Aa3c,
        ReprocessingMode::Yuv => PipeId::McscCapture,
    }
}
