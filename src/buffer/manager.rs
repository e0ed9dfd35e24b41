use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tracing::{debug, info, instrument, warn};

use super::{
    AllocationMode, Allocator, Buffer, BufferInfo, BufferPermission, BufferPosition, Plane,
    PlaneMemory, PoolId, META_PLANE_SIZE,
};
use crate::error::{Error, Result};
use crate::stream::BufferHandle;
use crate::utils::{lock, spawn_worker};

/// Re-check interval while waiting for a returned buffer
const WAIT_INTERVAL: Duration = Duration::from_millis(5);

enum Backing {
    Internal(Arc<dyn Allocator>),
    /// Slots are bound to producer handles by `register_buffer`
    Service,
}

struct Slot {
    planes: Arc<[Plane]>,
    position: BufferPosition,
    permission: BufferPermission,
    handle: Option<BufferHandle>,
    key: Option<u32>,
}

struct PoolState {
    info: Option<BufferInfo>,
    slots: Vec<Slot>,
    available: VecDeque<usize>,
    allocated: bool,
    /// Bumped by `release`; stale buffers and the silent allocator check it
    generation: u64,
}

/// One pool of same-geometry buffers.
///
/// All state lives behind one mutex; `get_buffer`/`put_buffer` may be called from any
/// stage thread and always observe a consistent available count.
pub struct BufferManager {
    name: String,
    pool: PoolId,
    backing: Backing,
    state: Mutex<PoolState>,
    returned: Condvar,
    silent: Mutex<Option<JoinHandle<()>>>,
}

impl BufferManager {
    pub fn new(name: impl Into<String>, pool: PoolId, allocator: Arc<dyn Allocator>) -> Self {
        Self::with_backing(name.into(), pool, Backing::Internal(allocator))
    }

    /// A pool of producer-owned buffers
    pub fn new_service(name: impl Into<String>, pool: PoolId) -> Self {
        Self::with_backing(name.into(), pool, Backing::Service)
    }

    fn with_backing(name: String, pool: PoolId, backing: Backing) -> Self {
        Self {
            name,
            pool,
            backing,
            state: Mutex::new(PoolState {
                info: None,
                slots: Vec::new(),
                available: VecDeque::new(),
                allocated: false,
                generation: 0,
            }),
            returned: Condvar::new(),
            silent: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn is_service(&self) -> bool {
        matches!(self.backing, Backing::Service)
    }

    /// Configure pool geometry. Rejected once memory is allocated.
    pub fn set_info(&self, info: BufferInfo) -> Result<()> {
        info.validate(&self.name)?;

        let mut state = lock(&self.state);
        if state.allocated {
            return Err(Error::Config(format!(
                "{}: geometry change while allocated",
                self.name
            )));
        }
        debug!("{}: {:?}", self.name, info);
        state.info = Some(info);
        Ok(())
    }

    pub fn info(&self) -> Option<BufferInfo> {
        lock(&self.state).info.clone()
    }

    /// Reserve memory for the configured buffers.
    /// May be retried after a failure; a second call after success is rejected.
    #[instrument(skip(self), fields(pool = %self.name))]
    pub fn alloc(self: &Arc<Self>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.allocated {
            return Err(Error::Allocation {
                pool: self.name.clone(),
                reason: "already allocated".into(),
            });
        }
        let info = state
            .info
            .clone()
            .ok_or_else(|| Error::Config(format!("{}: alloc before set_info", self.name)))?;

        if self.is_service() {
            state.allocated = true;
            info!("{}: service pool ready for {} buffers", self.name, info.max_count);
            return Ok(());
        }

        let initial = match info.mode {
            AllocationMode::AtOnce => info.max_count,
            AllocationMode::OnDemand | AllocationMode::Silent => info.min_count,
        };

        let mut slots = Vec::with_capacity(info.max_count);
        for _ in 0..initial {
            // Partial allocations are dropped (and uncharged) on failure
            slots.push(self.new_slot(self.alloc_planes(&info)?));
        }

        state.available = (0..slots.len()).collect();
        state.slots = slots;
        state.allocated = true;
        let generation = state.generation;
        info!(
            "{}: allocated {} buffers ({:?}, max {})",
            self.name, initial, info.mode, info.max_count
        );
        self.publish(&state);
        drop(state);

        if info.mode == AllocationMode::Silent && initial < info.max_count {
            let pool = Arc::clone(self);
            let handle = spawn_worker(format!("{}-alloc", self.name), None, move || {
                pool.grow_silently(generation)
            })?;
            *lock(&self.silent) = Some(handle);
        }

        Ok(())
    }

    fn grow_silently(&self, generation: u64) {
        loop {
            let info = {
                let state = lock(&self.state);
                match &state.info {
                    Some(info)
                        if state.generation == generation && state.slots.len() < info.max_count =>
                    {
                        info.clone()
                    }
                    _ => break,
                }
            };

            let planes = match self.alloc_planes(&info) {
                Ok(planes) => planes,
                Err(e) => {
                    warn!("{}: background allocation stopped: {}", self.name, e);
                    break;
                }
            };

            let mut state = lock(&self.state);
            if state.generation != generation || state.slots.len() >= info.max_count {
                break;
            }
            let index = state.slots.len();
            state.slots.push(self.new_slot(planes));
            state.available.push_back(index);
            self.publish(&state);
            self.returned.notify_all();
        }
        debug!("{}: background allocation done", self.name);
    }

    fn alloc_planes(&self, info: &BufferInfo) -> Result<Arc<[Plane]>> {
        let Backing::Internal(allocator) = &self.backing else {
            return Err(Error::Config(format!("{}: service pools do not allocate", self.name)));
        };

        let mut planes = Vec::with_capacity(info.plane_count + 1);
        for (size, stride) in info.plane_sizes.iter().zip(&info.strides) {
            let (memory, charged) = allocator.alloc(*size, info.map).map_err(|e| match e {
                Error::Allocation { reason, .. } => Error::Allocation {
                    pool: self.name.clone(),
                    reason,
                },
                other => other,
            })?;
            planes.push(Plane::new(
                *size,
                *stride,
                charged,
                memory,
                Some(Arc::clone(allocator)),
            ));
        }
        if info.meta_plane {
            let (memory, charged) = allocator.alloc(META_PLANE_SIZE, true)?;
            planes.push(Plane::new(
                META_PLANE_SIZE,
                0,
                charged,
                memory,
                Some(Arc::clone(allocator)),
            ));
        }
        Ok(Arc::from(planes))
    }

    fn new_slot(&self, planes: Arc<[Plane]>) -> Slot {
        Slot {
            planes,
            position: BufferPosition::None,
            permission: BufferPermission::Available,
            handle: None,
            key: None,
        }
    }

    /// Lease an available buffer, or fail with `NoBufferAvailable`
    pub fn get_buffer(&self, position: BufferPosition) -> Result<Buffer> {
        let mut state = lock(&self.state);
        self.take(&mut state, position)
    }

    /// Lease a buffer, waiting up to `budget` for one to be returned
    pub fn get_buffer_timeout(&self, position: BufferPosition, budget: Duration) -> Result<Buffer> {
        let deadline = Instant::now() + budget;
        let mut state = lock(&self.state);
        loop {
            match self.take(&mut state, position) {
                Err(Error::NoBufferAvailable(_)) => {}
                other => return other,
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("{}: no buffer after {:?}", self.name, budget);
                return Err(Error::NoBufferAvailable(self.name.clone()));
            }
            let wait = WAIT_INTERVAL.min(deadline - now);
            state = self
                .returned
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn take(&self, state: &mut PoolState, position: BufferPosition) -> Result<Buffer> {
        if self.is_service() {
            return Err(Error::Config(format!(
                "{}: service buffers are obtained with register_buffer",
                self.name
            )));
        }
        if !state.allocated {
            return Err(Error::Config(format!("{}: get_buffer before alloc", self.name)));
        }

        if state.available.is_empty() {
            self.grow_on_demand(state)?;
        }

        let Some(index) = state.available.pop_front() else {
            counter!("camera_buffer_exhausted_total", "pool" => self.name.clone()).increment(1);
            return Err(Error::NoBufferAvailable(self.name.clone()));
        };

        let generation = state.generation;
        let meta_plane = state.info.as_ref().map(|i| i.meta_plane).unwrap_or(false);
        let slot = &mut state.slots[index];
        slot.position = position;
        slot.permission = BufferPermission::InProcess;
        let buffer = Buffer::new(
            self.pool,
            index,
            generation,
            Arc::clone(&slot.planes),
            meta_plane,
            None,
        );
        self.publish(state);
        Ok(buffer)
    }

    fn grow_on_demand(&self, state: &mut PoolState) -> Result<()> {
        let Some(info) = state.info.clone() else {
            return Ok(());
        };
        if info.mode != AllocationMode::OnDemand || state.slots.len() >= info.max_count {
            return Ok(());
        }
        let planes = self.alloc_planes(&info)?;
        let index = state.slots.len();
        state.slots.push(self.new_slot(planes));
        state.available.push_back(index);
        info!("{}: grew to {} buffers", self.name, state.slots.len());
        Ok(())
    }

    /// Return slot `index` to the available set; returning an available slot is a no-op
    pub fn put_buffer(&self, index: usize, position: BufferPosition) -> Result<()> {
        let mut state = lock(&self.state);
        self.put_locked(&mut state, index, position)
    }

    /// Return a leased buffer, ignoring leases from before the last `release`
    pub fn put(&self, buffer: &Buffer, position: BufferPosition) -> Result<()> {
        let mut state = lock(&self.state);
        if buffer.generation != state.generation {
            debug!("{}: dropping stale buffer {}", self.name, buffer.index);
            return Ok(());
        }
        self.put_locked(&mut state, buffer.index, position)
    }

    fn put_locked(&self, state: &mut PoolState, index: usize, position: BufferPosition) -> Result<()> {
        let service = self.is_service();
        let Some(slot) = state.slots.get_mut(index) else {
            return Err(Error::InvalidBuffer {
                pool: self.pool,
                index,
            });
        };
        if slot.permission == BufferPermission::Available {
            return Ok(());
        }

        slot.position = position;
        slot.permission = BufferPermission::Available;
        slot.key = None;
        if service {
            // The handle goes back to its owner
            slot.handle = None;
            slot.planes = Arc::from(Vec::<Plane>::new());
        }
        state.available.push_back(index);
        self.publish(state);
        self.returned.notify_all();
        Ok(())
    }

    /// Bind a producer handle to a free slot of a service pool and lease it
    pub fn register_buffer(
        &self,
        key: u32,
        handle: BufferHandle,
        fences: (Option<i32>, Option<i32>),
        position: BufferPosition,
    ) -> Result<Buffer> {
        if !self.is_service() {
            return Err(Error::Config(format!(
                "{}: only service pools take producer buffers",
                self.name
            )));
        }

        let mut state = lock(&self.state);
        let info = state
            .info
            .clone()
            .ok_or_else(|| Error::Config(format!("{}: register before set_info", self.name)))?;

        let index = match state.available.pop_front() {
            Some(index) => index,
            None if state.slots.len() < info.max_count => {
                state.slots.push(Slot {
                    planes: Arc::from(Vec::<Plane>::new()),
                    position: BufferPosition::None,
                    permission: BufferPermission::Available,
                    handle: None,
                    key: None,
                });
                state.slots.len() - 1
            }
            None => {
                counter!("camera_buffer_exhausted_total", "pool" => self.name.clone()).increment(1);
                return Err(Error::NoBufferAvailable(self.name.clone()));
            }
        };

        let planes: Vec<Plane> = info
            .plane_sizes
            .iter()
            .zip(&info.strides)
            .map(|(size, stride)| {
                Plane::new(*size, *stride, 0, PlaneMemory::External(handle.clone()), None)
            })
            .collect();
        let planes: Arc<[Plane]> = Arc::from(planes);

        let generation = state.generation;
        let slot = &mut state.slots[index];
        slot.planes = Arc::clone(&planes);
        slot.position = position;
        slot.permission = BufferPermission::InProcess;
        slot.handle = Some(handle.clone());
        slot.key = Some(key);
        if fences.0.is_some() {
            debug!("{}: request {} acquire fence {:?}", self.name, key, fences.0);
        }

        let buffer = Buffer::new(self.pool, index, generation, planes, false, Some(handle));
        self.publish(&state);
        Ok(buffer)
    }

    /// Grow an internal pool by up to `count` buffers, bounded by `max_count`
    pub fn increase(&self, count: usize) -> Result<usize> {
        let mut state = lock(&self.state);
        let info = state
            .info
            .clone()
            .ok_or_else(|| Error::Config(format!("{}: increase before set_info", self.name)))?;
        if !state.allocated {
            return Err(Error::Config(format!("{}: increase before alloc", self.name)));
        }

        let room = info.max_count.saturating_sub(state.slots.len());
        let added = count.min(room);
        for _ in 0..added {
            let planes = self.alloc_planes(&info)?;
            let index = state.slots.len();
            state.slots.push(self.new_slot(planes));
            state.available.push_back(index);
        }
        if added > 0 {
            self.returned.notify_all();
        }
        self.publish(&state);
        Ok(added)
    }

    /// Free every slot. Buffers still leased become stale and are ignored by `put`.
    pub fn release(&self) {
        let outstanding = {
            let mut state = lock(&self.state);
            let outstanding = state.slots.len() - state.available.len();
            state.generation += 1;
            state.slots.clear();
            state.available.clear();
            state.allocated = false;
            self.publish(&state);
            outstanding
        };
        self.returned.notify_all();

        if outstanding > 0 {
            warn!("{}: released with {} buffers leased", self.name, outstanding);
        }
        if let Some(handle) = lock(&self.silent).take() {
            let _ = handle.join();
        }
        debug!("{}: released", self.name);
    }

    pub fn num_available(&self) -> usize {
        lock(&self.state).available.len()
    }

    pub fn allocated_count(&self) -> usize {
        lock(&self.state).slots.len()
    }

    pub fn is_allocated(&self) -> bool {
        lock(&self.state).allocated
    }

    pub fn status(&self, index: usize) -> Option<(BufferPosition, BufferPermission)> {
        lock(&self.state)
            .slots
            .get(index)
            .map(|slot| (slot.position, slot.permission))
    }

    pub fn dump(&self) {
        let state = lock(&self.state);
        info!(
            "{}: {}/{} available, allocated={}",
            self.name,
            state.available.len(),
            state.slots.len(),
            state.allocated
        );
        for (index, slot) in state.slots.iter().enumerate() {
            if slot.permission != BufferPermission::Available {
                debug!(
                    "{}[{}]: {:?} {:?} key={:?}",
                    self.name, index, slot.position, slot.permission, slot.key
                );
            }
        }
    }

    fn publish(&self, state: &PoolState) {
        gauge!("camera_buffers_available", "pool" => self.name.clone())
            .set(state.available.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MmapAllocator;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::thread;

    fn pool(count: usize) -> Arc<BufferManager> {
        let allocator: Arc<dyn Allocator> = Arc::new(MmapAllocator::new(64 << 20));
        let pool = Arc::new(BufferManager::new("bayer", PoolId::Bayer, allocator));
        pool.set_info(BufferInfo::new(vec![4096, 2048], vec![64, 64], count))
            .unwrap();
        pool.alloc().unwrap();
        pool
    }

    #[test]
    fn set_info_rejects_bad_geometry() {
        let allocator: Arc<dyn Allocator> = Arc::new(MmapAllocator::new(1 << 20));
        let pool = BufferManager::new("isp", PoolId::Isp, allocator);

        let mut none = BufferInfo::new(vec![], vec![], 2);
        none.plane_count = 0;
        assert!(matches!(pool.set_info(none), Err(Error::Config(_))));

        let mut mismatched = BufferInfo::new(vec![64, 64], vec![8], 2);
        mismatched.plane_count = 2;
        assert!(matches!(pool.set_info(mismatched), Err(Error::Config(_))));

        let inverted = BufferInfo::new(vec![64], vec![8], 2).growable(3, AllocationMode::OnDemand);
        assert!(matches!(pool.set_info(inverted), Err(Error::Config(_))));
    }

    #[test]
    fn alloc_twice_is_rejected() {
        let pool = pool(2);
        assert!(matches!(pool.alloc(), Err(Error::Allocation { .. })));
    }

    #[test]
    fn exhausted_pool_reports_no_buffer() {
        let pool = pool(2);
        let _a = pool.get_buffer(BufferPosition::InHal).unwrap();
        let _b = pool.get_buffer(BufferPosition::InHal).unwrap();
        assert!(matches!(
            pool.get_buffer(BufferPosition::InHal),
            Err(Error::NoBufferAvailable(_))
        ));
    }

    #[test]
    fn put_is_benign_when_already_available() {
        let pool = pool(2);
        let buffer = pool.get_buffer(BufferPosition::InHal).unwrap();
        pool.put_buffer(buffer.index, BufferPosition::None).unwrap();
        pool.put_buffer(buffer.index, BufferPosition::None).unwrap();
        assert_eq!(pool.num_available(), 2);
        assert!(matches!(
            pool.put_buffer(9, BufferPosition::None),
            Err(Error::InvalidBuffer { index: 9, .. })
        ));
    }

    #[test]
    fn round_trip_keeps_geometry() {
        let pool = pool(1);
        let first = pool.get_buffer(BufferPosition::InHal).unwrap();
        let sizes = first.plane_sizes();
        pool.put(&first, BufferPosition::None).unwrap();

        let again = pool.get_buffer(BufferPosition::InHal).unwrap();
        assert_eq!(again.index, first.index);
        assert_eq!(again.plane_sizes(), sizes);
        assert_eq!(sizes, vec![4096, 2048]);
    }

    #[test]
    fn concurrent_leases_never_share_an_index() {
        let pool = pool(4);
        let leased = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let leased = Arc::clone(&leased);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let buffer = pool
                            .get_buffer_timeout(BufferPosition::InHal, Duration::from_secs(5))
                            .unwrap();
                        assert!(lock(&leased).insert(buffer.index), "index leased twice");
                        thread::yield_now();
                        assert!(lock(&leased).remove(&buffer.index));
                        pool.put(&buffer, BufferPosition::None).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.num_available(), 4);
    }

    #[test]
    fn waiter_is_served_only_after_a_put() {
        let pool = pool(4);
        let held: Vec<_> = (0..4)
            .map(|_| pool.get_buffer(BufferPosition::InHal).unwrap())
            .collect();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let buffer = pool
                    .get_buffer_timeout(BufferPosition::InHal, Duration::from_secs(5))
                    .unwrap();
                tx.send(buffer.index).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        pool.put(&held[2], BufferPosition::None).unwrap();
        let index = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();

        assert_eq!(index, held[2].index);
        assert_eq!(pool.num_available(), 0);
    }

    #[test]
    fn on_demand_grows_up_to_max() {
        let allocator: Arc<dyn Allocator> = Arc::new(MmapAllocator::new(1 << 20));
        let pool = Arc::new(BufferManager::new("jpeg", PoolId::YuvReprocessing, allocator));
        pool.set_info(BufferInfo::new(vec![1024], vec![32], 3).growable(1, AllocationMode::OnDemand))
            .unwrap();
        pool.alloc().unwrap();
        assert_eq!(pool.allocated_count(), 1);

        let a = pool.get_buffer(BufferPosition::InHal).unwrap();
        let b = pool.get_buffer(BufferPosition::InHal).unwrap();
        let c = pool.get_buffer(BufferPosition::InHal).unwrap();
        assert_eq!(pool.allocated_count(), 3);
        assert!(pool.get_buffer(BufferPosition::InHal).is_err());
        assert_eq!(
            [a.index, b.index, c.index].iter().collect::<HashSet<_>>().len(),
            3
        );
    }

    #[test]
    fn silent_allocation_fills_in_background() {
        let allocator: Arc<dyn Allocator> = Arc::new(MmapAllocator::new(1 << 20));
        let pool = Arc::new(BufferManager::new("scp", PoolId::Scp, allocator));
        pool.set_info(BufferInfo::new(vec![1024], vec![32], 4).growable(1, AllocationMode::Silent))
            .unwrap();
        pool.alloc().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.allocated_count() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.allocated_count(), 4);
        assert_eq!(pool.num_available(), 4);
        pool.release();
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn budget_exhaustion_fails_alloc() {
        let page = page_size::get();
        let allocator: Arc<dyn Allocator> = Arc::new(MmapAllocator::new(page * 2));
        let pool = Arc::new(BufferManager::new("isp", PoolId::Isp, allocator.clone()));
        pool.set_info(BufferInfo::new(vec![page], vec![0], 3)).unwrap();

        assert!(matches!(pool.alloc(), Err(Error::Allocation { .. })));
        assert_eq!(allocator.in_use(), 0);
        assert!(!pool.is_allocated());
    }

    #[test]
    fn meta_plane_is_appended() {
        let allocator: Arc<dyn Allocator> = Arc::new(MmapAllocator::new(1 << 20));
        let pool = Arc::new(BufferManager::new("3aa", PoolId::Aa3, allocator));
        pool.set_info(BufferInfo::new(vec![512], vec![16], 1).with_meta_plane())
            .unwrap();
        pool.alloc().unwrap();

        let buffer = pool.get_buffer(BufferPosition::InHal).unwrap();
        assert_eq!(buffer.plane_count(), 2);
        assert_eq!(buffer.image_planes().len(), 1);
        assert_eq!(buffer.meta_plane().map(Plane::size), Some(META_PLANE_SIZE));
    }

    #[test]
    fn service_pool_binds_and_returns_handles() {
        let pool = Arc::new(BufferManager::new_service("preview", PoolId::Service(3)));
        pool.set_info(BufferInfo::new(vec![64], vec![8], 2).growable(0, AllocationMode::OnDemand))
            .unwrap();
        pool.alloc().unwrap();

        let a = pool
            .register_buffer(1, BufferHandle::with_memory(10, 64), (None, None), BufferPosition::InHal)
            .unwrap();
        let _b = pool
            .register_buffer(2, BufferHandle::opaque(11), (None, None), BufferPosition::InHal)
            .unwrap();
        assert!(matches!(
            pool.register_buffer(3, BufferHandle::opaque(12), (None, None), BufferPosition::InHal),
            Err(Error::NoBufferAvailable(_))
        ));

        assert!(a.image_planes()[0].write(&[7; 16]).unwrap());
        assert_eq!(a.handle().and_then(|h| h.contents()), Some(vec![7; 16]));

        pool.put(&a, BufferPosition::InService).unwrap();
        assert_eq!(pool.num_available(), 1);
        assert_eq!(
            pool.status(a.index),
            Some((BufferPosition::InService, BufferPermission::Available))
        );
        assert!(pool.get_buffer(BufferPosition::InHal).is_err());
    }

    #[test]
    fn stale_buffers_are_ignored_after_release() {
        let pool = pool(2);
        let buffer = pool.get_buffer(BufferPosition::InHal).unwrap();
        pool.release();
        pool.alloc().unwrap();
        pool.put(&buffer, BufferPosition::None).unwrap();
        assert_eq!(pool.num_available(), 2);
    }
}
