//! Buffer pools shared by pipeline stages

pub mod allocator;
pub mod manager;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

pub use allocator::{Allocator, MmapAllocator};
pub use manager::BufferManager;

use crate::error::{Error, Result};
use crate::stream::{BufferHandle, StreamId};
use crate::utils::lock;

/// Size of the per-buffer metadata plane
pub const META_PLANE_SIZE: usize = 4096;

/// Buffer pool categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolId {
    /// Sensor output
    Bayer,
    /// 3AA DMA-out (processed bayer)
    DirtyBayer,
    /// 3AA to ISP in M2M preview
    Aa3,
    /// ISP to MCSC in M2M preview
    Isp,
    /// Internal preview scaler output
    Scp,
    /// Full-size YUV held for YUV reprocessing
    YuvCapture,
    /// ISP output of dirty-bayer reprocessing
    IspReprocessing,
    /// MCSC output feeding the JPEG encoder
    YuvReprocessing,
    /// Producer-owned buffers of one stream
    Service(StreamId),
}

impl PoolId {
    pub fn is_service(self) -> bool {
        matches!(self, PoolId::Service(_))
    }

    pub fn stream(self) -> Option<StreamId> {
        match self {
            PoolId::Service(id) => Some(id),
            _ => None,
        }
    }
}

/// Who has the buffer right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferPosition {
    None,
    InDriver,
    InHal,
    InService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferPermission {
    None,
    Available,
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationMode {
    /// Allocate `max_count` buffers up front
    AtOnce,
    /// Allocate `min_count`, grow inside `get_buffer` up to `max_count`
    OnDemand,
    /// Allocate `min_count`, grow to `max_count` on a background thread
    Silent,
}

/// Pool geometry, see [`BufferManager::set_info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub plane_count: usize,
    pub plane_sizes: Vec<usize>,
    pub strides: Vec<u32>,
    pub min_count: usize,
    pub max_count: usize,
    pub mode: AllocationMode,
    pub meta_plane: bool,
    pub map: bool,
}

impl BufferInfo {
    pub fn new(plane_sizes: Vec<usize>, strides: Vec<u32>, count: usize) -> Self {
        Self {
            plane_count: plane_sizes.len(),
            plane_sizes,
            strides,
            min_count: count,
            max_count: count,
            mode: AllocationMode::AtOnce,
            meta_plane: false,
            map: true,
        }
    }

    pub fn growable(mut self, min_count: usize, mode: AllocationMode) -> Self {
        self.min_count = min_count;
        self.mode = mode;
        self
    }

    pub fn with_meta_plane(mut self) -> Self {
        self.meta_plane = true;
        self
    }

    pub fn unmapped(mut self) -> Self {
        self.map = false;
        self
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.plane_count == 0 {
            return Err(Error::Config(format!("{}: plane count must be positive", name)));
        }
        if self.plane_sizes.len() != self.plane_count || self.strides.len() != self.plane_count {
            return Err(Error::Config(format!(
                "{}: {} planes but {} sizes and {} strides",
                name,
                self.plane_count,
                self.plane_sizes.len(),
                self.strides.len()
            )));
        }
        if self.plane_sizes.iter().any(|s| *s == 0) {
            return Err(Error::Config(format!("{}: zero-sized plane", name)));
        }
        if self.max_count == 0 || self.min_count > self.max_count {
            return Err(Error::Config(format!(
                "{}: buffer count min {} max {}",
                name, self.min_count, self.max_count
            )));
        }
        Ok(())
    }
}

/// Backing store of one plane
pub enum PlaneMemory {
    Mapped(MmapMut),
    /// Device memory the CPU never touches
    Reserved,
    External(BufferHandle),
}

pub struct Plane {
    size: usize,
    stride: u32,
    reserved: usize,
    memory: Mutex<PlaneMemory>,
    allocator: Option<Arc<dyn Allocator>>,
}

impl Plane {
    pub(crate) fn new(
        size: usize,
        stride: u32,
        reserved: usize,
        memory: PlaneMemory,
        allocator: Option<Arc<dyn Allocator>>,
    ) -> Self {
        Self {
            size,
            stride,
            reserved,
            memory: Mutex::new(memory),
            allocator,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn is_mapped(&self) -> bool {
        match &*lock(&self.memory) {
            PlaneMemory::Mapped(_) => true,
            PlaneMemory::Reserved => false,
            PlaneMemory::External(handle) => handle.memory().is_some(),
        }
    }

    /// Copy `data` into the plane; returns false when the plane is not CPU-visible
    pub fn write(&self, data: &[u8]) -> Result<bool> {
        let mut memory = lock(&self.memory);
        match &mut *memory {
            PlaneMemory::Mapped(map) => {
                if data.len() > self.size {
                    return Err(Error::Config(format!(
                        "{} bytes do not fit a {} byte plane",
                        data.len(),
                        self.size
                    )));
                }
                map[..data.len()].copy_from_slice(data);
                Ok(true)
            }
            PlaneMemory::Reserved => Ok(false),
            PlaneMemory::External(handle) => match handle.memory() {
                Some(shared) => {
                    let mut bytes = lock(shared);
                    bytes.clear();
                    bytes.extend_from_slice(data);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    pub fn fill(&self, value: u8) -> bool {
        let mut memory = lock(&self.memory);
        match &mut *memory {
            PlaneMemory::Mapped(map) => {
                map[..self.size].fill(value);
                true
            }
            PlaneMemory::Reserved => false,
            PlaneMemory::External(handle) => match handle.memory() {
                Some(shared) => {
                    lock(shared).fill(value);
                    true
                }
                None => false,
            },
        }
    }

    /// Copy of the plane contents
    pub fn read(&self) -> Option<Bytes> {
        let memory = lock(&self.memory);
        match &*memory {
            PlaneMemory::Mapped(map) => Some(Bytes::copy_from_slice(&map[..self.size])),
            PlaneMemory::Reserved => None,
            PlaneMemory::External(handle) => {
                let shared = handle.memory()?;
                let bytes = lock(shared);
                Some(Bytes::copy_from_slice(&bytes))
            }
        }
    }
}

impl Drop for Plane {
    fn drop(&mut self) {
        if let Some(allocator) = &self.allocator {
            allocator.free(self.reserved);
        }
    }
}

/// A leased pool slot. Cloning does not lease again; the pool tracks one owner per index.
#[derive(Clone)]
pub struct Buffer {
    pub pool: PoolId,
    pub index: usize,
    pub(crate) generation: u64,
    planes: Arc<[Plane]>,
    meta_plane: bool,
    handle: Option<BufferHandle>,
}

impl Buffer {
    pub(crate) fn new(
        pool: PoolId,
        index: usize,
        generation: u64,
        planes: Arc<[Plane]>,
        meta_plane: bool,
        handle: Option<BufferHandle>,
    ) -> Self {
        Self {
            pool,
            index,
            generation,
            planes,
            meta_plane,
            handle,
        }
    }

    /// All planes including the metadata plane
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Image planes only
    pub fn image_planes(&self) -> &[Plane] {
        if self.meta_plane {
            &self.planes[..self.planes.len() - 1]
        } else {
            &self.planes
        }
    }

    pub fn meta_plane(&self) -> Option<&Plane> {
        if self.meta_plane {
            self.planes.last()
        } else {
            None
        }
    }

    pub fn plane_sizes(&self) -> Vec<usize> {
        self.planes.iter().map(Plane::size).collect()
    }

    pub fn handle(&self) -> Option<&BufferHandle> {
        self.handle.as_ref()
    }

    pub fn same_slot(&self, other: &Buffer) -> bool {
        self.pool == other.pool && self.index == other.index
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("pool", &self.pool)
            .field("index", &self.index)
            .field("planes", &self.plane_sizes())
            .finish()
    }
}

/// All pools of a configured session
#[derive(Default)]
pub struct PoolRegistry {
    pools: HashMap<PoolId, Arc<BufferManager>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, manager: Arc<BufferManager>) {
        self.pools.insert(manager.pool(), manager);
    }

    pub fn get(&self, pool: PoolId) -> Result<&Arc<BufferManager>> {
        self.pools
            .get(&pool)
            .ok_or_else(|| Error::Config(format!("no pool configured for {:?}", pool)))
    }

    pub fn contains(&self, pool: PoolId) -> bool {
        self.pools.contains_key(&pool)
    }

    /// Return a buffer to its pool
    pub fn put(&self, buffer: &Buffer, position: BufferPosition) -> Result<()> {
        self.get(buffer.pool)?.put(buffer, position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BufferManager>> {
        self.pools.values()
    }

    pub fn release_all(&self) {
        for pool in self.pools.values() {
            pool.release();
        }
    }
}
