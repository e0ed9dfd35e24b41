//! Static stage tables, one per factory mode

use once_cell::sync::Lazy;

use super::{FactoryMode, PipeId};
use crate::buffer::PoolId;

/// Where a stage reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrcSpec {
    /// Fed by the sensor itself
    Sensor,
    /// On-the-fly from the previous stage, no memory in between
    Otf,
    /// The dst of an earlier stage or tap
    From(PipeId),
    /// The reprocessing input (held preview output or producer buffer)
    Input,
}

#[derive(Debug, Clone)]
pub struct TapNode {
    pub pipe: PipeId,
    /// Internal pool used unless the tap is mapped to a stream
    pub pool: Option<PoolId>,
}

#[derive(Debug, Clone)]
pub struct StageNode {
    pub pipe: PipeId,
    pub src: SrcSpec,
    pub dst: Option<PoolId>,
    pub taps: Vec<TapNode>,
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    pub mode: FactoryMode,
    pub stages: Vec<StageNode>,
}

impl StageGraph {
    pub fn stage(&self, pipe: PipeId) -> Option<&StageNode> {
        self.stages.iter().find(|s| s.pipe == pipe)
    }

    pub fn first_stage(&self) -> PipeId {
        self.stages[0].pipe
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.stages.iter().map(|s| s.pipe)
    }

    pub fn tap(&self, pipe: PipeId) -> Option<(&StageNode, &TapNode)> {
        self.stages
            .iter()
            .find_map(|s| s.taps.iter().find(|t| t.pipe == pipe).map(|t| (s, t)))
    }

    /// Stage or tap of this graph
    pub fn contains(&self, pipe: PipeId) -> bool {
        self.stage(pipe).is_some() || self.tap(pipe).is_some()
    }

    /// Stage reading the dst of `pipe`
    pub fn consumer_of(&self, pipe: PipeId) -> Option<PipeId> {
        self.stages
            .iter()
            .find(|s| s.src == SrcSpec::From(pipe))
            .map(|s| s.pipe)
    }
}

fn stage(pipe: PipeId, src: SrcSpec, dst: Option<PoolId>, taps: Vec<TapNode>) -> StageNode {
    StageNode {
        pipe,
        src,
        dst,
        taps,
    }
}

fn tap(pipe: PipeId, pool: Option<PoolId>) -> TapNode {
    TapNode { pipe, pool }
}

fn flite() -> StageNode {
    stage(
        PipeId::Flite,
        SrcSpec::Sensor,
        Some(PoolId::Bayer),
        vec![tap(PipeId::FliteRaw, None)],
    )
}

fn mcsc(src: SrcSpec) -> StageNode {
    stage(
        PipeId::Mcsc,
        src,
        None,
        vec![
            tap(PipeId::McscPreview, Some(PoolId::Scp)),
            tap(PipeId::McscCallback, None),
            tap(PipeId::McscVideo, None),
            tap(PipeId::McscCapture, Some(PoolId::YuvCapture)),
        ],
    )
}

fn mcsc_reprocessing(src: SrcSpec) -> StageNode {
    stage(
        PipeId::McscReprocessing,
        src,
        None,
        vec![tap(PipeId::McscJpegSrc, Some(PoolId::YuvReprocessing))],
    )
}

fn jpeg() -> StageNode {
    stage(PipeId::Jpeg, SrcSpec::From(PipeId::McscJpegSrc), None, vec![])
}

static PREVIEW_OTF: Lazy<StageGraph> = Lazy::new(|| StageGraph {
    mode: FactoryMode::PreviewOtf,
    stages: vec![
        flite(),
        stage(
            PipeId::Aa3Isp,
            SrcSpec::From(PipeId::Flite),
            None,
            vec![tap(PipeId::Aa3c, Some(PoolId::DirtyBayer))],
        ),
        mcsc(SrcSpec::Otf),
    ],
});

static PREVIEW_M2M: Lazy<StageGraph> = Lazy::new(|| StageGraph {
    mode: FactoryMode::PreviewM2m,
    stages: vec![
        flite(),
        stage(
            PipeId::Aa3,
            SrcSpec::From(PipeId::Flite),
            Some(PoolId::Aa3),
            vec![tap(PipeId::Aa3c, Some(PoolId::DirtyBayer))],
        ),
        stage(
            PipeId::Isp,
            SrcSpec::From(PipeId::Aa3),
            Some(PoolId::Isp),
            vec![],
        ),
        mcsc(SrcSpec::From(PipeId::Isp)),
    ],
});

static REPROCESSING_PURE_BAYER: Lazy<StageGraph> = Lazy::new(|| StageGraph {
    mode: FactoryMode::ReprocessingPureBayer,
    stages: vec![
        stage(PipeId::Aa3IspReprocessing, SrcSpec::Input, None, vec![]),
        mcsc_reprocessing(SrcSpec::Otf),
        jpeg(),
    ],
});

static REPROCESSING_DIRTY_BAYER: Lazy<StageGraph> = Lazy::new(|| StageGraph {
    mode: FactoryMode::ReprocessingDirtyBayer,
    stages: vec![
        stage(
            PipeId::IspReprocessing,
            SrcSpec::Input,
            Some(PoolId::IspReprocessing),
            vec![],
        ),
        mcsc_reprocessing(SrcSpec::From(PipeId::IspReprocessing)),
        jpeg(),
    ],
});

static REPROCESSING_YUV: Lazy<StageGraph> = Lazy::new(|| StageGraph {
    mode: FactoryMode::ReprocessingYuv,
    stages: vec![mcsc_reprocessing(SrcSpec::Input), jpeg()],
});

pub(crate) fn graph_for(mode: FactoryMode) -> &'static StageGraph {
    match mode {
        FactoryMode::PreviewOtf => &PREVIEW_OTF,
        FactoryMode::PreviewM2m => &PREVIEW_M2M,
        FactoryMode::ReprocessingPureBayer => &REPROCESSING_PURE_BAYER,
        FactoryMode::ReprocessingDirtyBayer => &REPROCESSING_DIRTY_BAYER,
        FactoryMode::ReprocessingYuv => &REPROCESSING_YUV,
    }
}
