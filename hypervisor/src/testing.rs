//! In-memory collaborators for driving the exit handlers in unit tests.

use {
    crate::{
        allocator::FramePool,
        error::HypervisorError,
        global_const::PAGE_SIZE,
        host::{CpuidSource, EnvId, EnvType, HostKernel, IpcMessage},
        intel::{
            ept::{AccessType, EptBridge},
            vm::{GuestConfig, Vm, VmxGuestInfo},
            vmcs::{VmcsAccess, VM_EXIT_INSTRUCTION_LEN},
        },
    },
    alloc::{
        alloc::{alloc_zeroed, dealloc, Layout},
        boxed::Box,
        collections::BTreeMap,
        sync::Arc,
        vec::Vec,
    },
    core::cell::Cell,
    spin::Mutex,
    x86::cpuid::CpuIdResult,
};

/// Length reported for every exiting instruction (VMCALL, CPUID and friends are 2-3 bytes).
pub const TEST_INSTRUCTION_LEN: u64 = 3;

/// Host physical address the test frame pools pretend to start at.
const TEST_POOL_BASE_PA: u64 = 0x4000_0000;

/// A [`FramePool`] over a heap buffer, with the direct map pointing into it.
pub struct TestMemory {
    buffer: *mut u8,
    layout: Layout,
    pool: FramePool,
}

// The buffer is owned by the pool, which serializes access to it.
unsafe impl Send for TestMemory {}
unsafe impl Sync for TestMemory {}

impl TestMemory {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames.max(1) * PAGE_SIZE, PAGE_SIZE).unwrap();
        let buffer = unsafe { alloc_zeroed(layout) };
        assert!(!buffer.is_null());

        let direct_map_base = (buffer as u64).wrapping_sub(TEST_POOL_BASE_PA);
        let pool = unsafe { FramePool::new(TEST_POOL_BASE_PA, frames, direct_map_base) };

        Self { buffer, layout, pool }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn base_pa(&self) -> u64 {
        TEST_POOL_BASE_PA
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.buffer, self.layout) };
    }
}

/// A VMCS backed by a field map. Unwritten fields read as zero.
#[derive(Debug, Clone)]
pub struct FakeVmcs {
    fields: BTreeMap<u32, u64>,
}

impl Default for FakeVmcs {
    fn default() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(VM_EXIT_INSTRUCTION_LEN, TEST_INSTRUCTION_LEN);
        Self { fields }
    }
}

impl VmcsAccess for FakeVmcs {
    fn read(&self, field: u32) -> u64 {
        self.fields.get(&field).copied().unwrap_or(0)
    }

    fn write(&mut self, field: u32, value: u64) {
        self.fields.insert(field, value);
    }
}

/// A page map from guest physical to host virtual addresses.
///
/// Clones share the same map, so a test can keep a handle while the `Vm` owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeEpt {
    pages: Arc<Mutex<BTreeMap<u64, (u64, AccessType)>>>,
}

impl FakeEpt {
    pub fn gpa_to_hva(&self, gpa: u64) -> Option<u64> {
        let offset = gpa % PAGE_SIZE as u64;
        self.pages.lock().get(&(gpa - offset)).map(|&(hva, _)| hva + offset)
    }

    pub fn access_at(&self, gpa: u64) -> Option<AccessType> {
        self.pages.lock().get(&(gpa - gpa % PAGE_SIZE as u64)).map(|&(_, access)| access)
    }

    pub fn mapping_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl EptBridge for FakeEpt {
    fn map_hva_to_gpa(&mut self, hva: u64, gpa: u64, access: AccessType, overwrite: bool) -> Result<(), HypervisorError> {
        assert_eq!(gpa % PAGE_SIZE as u64, 0, "unaligned GPA {:#x}", gpa);

        let mut pages = self.pages.lock();
        if pages.contains_key(&gpa) && !overwrite {
            return Err(HypervisorError::EptMappingFailed(gpa));
        }
        pages.insert(gpa, (hva, access));
        Ok(())
    }

    fn gpa_to_hva(&self, gpa: u64) -> Option<u64> {
        FakeEpt::gpa_to_hva(self, gpa)
    }
}

/// A host kernel that records every call made into it.
#[derive(Debug)]
pub struct FakeHost {
    pub envs: Vec<(EnvId, EnvType)>,
    pub send_result: i32,
    pub recv_result: Result<IpcMessage, i32>,

    pub sends: Vec<(EnvId, u32, u64, u32)>,
    pub recvs: Vec<(EnvId, u64)>,
    pub eoi_count: usize,
    pub suspended: Vec<EnvId>,
    pub shells_spawned: usize,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            envs: Vec::new(),
            send_result: 0,
            recv_result: Err(-3),
            sends: Vec::new(),
            recvs: Vec::new(),
            eoi_count: 0,
            suspended: Vec::new(),
            shells_spawned: 0,
        }
    }
}

impl FakeHost {
    pub fn with_envs(envs: &[(EnvId, EnvType)]) -> Self {
        Self {
            envs: envs.to_vec(),
            ..Default::default()
        }
    }
}

impl HostKernel for FakeHost {
    fn find_env_by_type(&self, env_type: EnvType) -> Option<EnvId> {
        self.envs.iter().find(|(_, t)| *t == env_type).map(|&(id, _)| id)
    }

    fn ipc_try_send(&mut self, to: EnvId, value: u32, page_kva: u64, perm: u32) -> i32 {
        self.sends.push((to, value, page_kva, perm));
        self.send_result
    }

    fn ipc_recv(&mut self, guest: EnvId, dst_gpa: u64) -> Result<IpcMessage, i32> {
        self.recvs.push((guest, dst_gpa));
        self.recv_result
    }

    fn lapic_eoi(&mut self) {
        self.eoi_count += 1;
    }

    fn suspend_env(&mut self, guest: EnvId) {
        self.suspended.push(guest);
    }

    fn spawn_shell(&mut self) {
        self.shells_spawned += 1;
    }
}

/// Returns the same CPUID result for every query and remembers the last one.
pub struct ScriptedCpuid {
    result: CpuIdResult,
    last_query: Cell<Option<(u32, u32)>>,
}

impl ScriptedCpuid {
    pub fn new(result: CpuIdResult) -> Self {
        Self {
            result,
            last_query: Cell::new(None),
        }
    }

    pub fn last_query(&self) -> Option<(u32, u32)> {
        self.last_query.get()
    }
}

impl CpuidSource for ScriptedCpuid {
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        self.last_query.set(Some((leaf, sub_leaf)));
        self.result
    }
}

/// A guest of `phys_size` bytes with a fresh VMCS and EPT.
pub fn test_vm(phys_size: u64) -> Vm {
    test_vm_with_ept(phys_size, FakeEpt::default())
}

/// Like [`test_vm`], with an EPT the caller keeps a handle to.
pub fn test_vm_with_ept(phys_size: u64, ept: FakeEpt) -> Vm {
    let guest_info = VmxGuestInfo::from_config(&GuestConfig::new(1, phys_size)).unwrap();
    Vm::new(1, guest_info, Box::new(FakeVmcs::default()), Box::new(ept), 1)
}
