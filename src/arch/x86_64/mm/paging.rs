//! Page-table management.
//!
//! The paging tree has four or five levels depending on the CPU. One slot
//! of the top table is permanently reserved and points back to the top
//! table itself; the virtual range decoded through that slot is the
//! *remap window*, and writing one of its leaf PTEs makes any physical
//! frame addressable at a fixed virtual address. All table editing goes
//! through the window, so no page table ever needs a permanent mapping.

use core::sync::atomic::{AtomicU8, Ordering};

use bit_field::BitField;
use hermit_sync::{InterruptSpinMutex, SpinMutex};
use memory_addresses::{PhysAddr, VirtAddr};
use thiserror::Error;

use crate::arch::kernel::processor;
use crate::mm::physicalmem;

pub const PAGE_SIZE: usize = 4096;
const TABLE_ENTRIES: u64 = 512;
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Top-table slot that points back to the top table (the remap window).
pub const REMAP_SLOT: u16 = 384;
/// Walker slots, one per paging level (level 1 uses `+ 1` and so on).
const WALKER_SLOT_BASE: u16 = 500;
/// Slot used to zero freshly allocated table frames.
const SCRATCH_SLOT: u16 = 506;
/// Firmware-table windows.
pub const TEMP_MAP_ACPI_START: u16 = 508;
pub const TEMP_MAP_ACPI_END: u16 = 509;
/// Frame-manager bootstrap windows.
pub const TEMP_MAP_PFMGR_START: u16 = 510;
pub const TEMP_MAP_PFMGR_END: u16 = 511;

/// Number of active paging levels, fixed at early init.
static PAGING_LEVELS: AtomicU8 = AtomicU8::new(4);

/// A generic interface to support all possible page sizes.
pub trait PageSize: Copy {
	/// The page size in bytes.
	const SIZE: usize;
}

/// A 4 KiB page mapped in the last-level table.
#[derive(Clone, Copy)]
pub enum BasePageSize {}
impl PageSize for BasePageSize {
	const SIZE: usize = 4096;
}

/// A 2 MiB page mapped one level above.
#[derive(Clone, Copy)]
pub enum LargePageSize {}
impl PageSize for LargePageSize {
	const SIZE: usize = 2 * 1024 * 1024;
}

bitflags::bitflags! {
	/// Flags of an entry in any table of the tree.
	///
	/// See Intel Vol. 3A, Tables 4-14 through 4-19.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct PteFlags: u64 {
		const PRESENT = 1 << 0;
		const WRITABLE = 1 << 1;
		const USER_ACCESSIBLE = 1 << 2;
		const WRITE_THROUGH = 1 << 3;
		const CACHE_DISABLE = 1 << 4;
		const ACCESSED = 1 << 5;
		const DIRTY = 1 << 6;
		/// PAT bit on 4 KiB leaf entries.
		const PAT = 1 << 7;
		const GLOBAL = 1 << 8;
		const EXECUTE_DISABLE = 1 << 63;
	}
}

bitflags::bitflags! {
	/// Protection and caching attributes as the upper layers see them.
	///
	/// Caching flags select a PAT index; the absence of `EXECUTABLE`
	/// sets NX when the CPU supports it.
	#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
	pub struct MemAttr: u32 {
		const WRITABLE = 1 << 0;
		const USER = 1 << 1;
		const EXECUTABLE = 1 << 4;
		const GUARD = 1 << 5;
		const STRONG_UNCACHED = 1 << 6;
		const UNCACHEABLE = 1 << 7;
		const WRITE_COMBINE = 1 << 8;
		const WRITE_THROUGH = 1 << 9;
		const WRITE_BACK = 1 << 10;
		const WRITE_PROTECT = 1 << 11;
	}
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PagingError {
	#[error("out of physical frames")]
	NoFrames,
	#[error("no table is allocated for the requested range")]
	TableNotAllocated,
	#[error("cannot create a paging structure")]
	CreateFail,
}

/// Translate attribute bits into leaf-PTE bits.
///
/// PAT assignment (fixed at init): PA0=WB, PA1=WT, PA2=UC-, PA3=UC,
/// PA4=WC, PA5=WP, PA6=UC-, PA7=UC. The index is encoded through the
/// PAT/PCD/PWT bits of the entry.
pub(crate) fn attr_to_pte_bits(attr: MemAttr, nx_supported: bool) -> PteFlags {
	let mut flags = PteFlags::PRESENT;

	if attr.contains(MemAttr::WRITABLE) && !attr.contains(MemAttr::GUARD) {
		flags |= PteFlags::WRITABLE;
	}
	if attr.contains(MemAttr::USER) {
		flags |= PteFlags::USER_ACCESSIBLE;
	}
	if !attr.contains(MemAttr::EXECUTABLE) && nx_supported {
		flags |= PteFlags::EXECUTE_DISABLE;
	}

	// PAT index selection; write-back is index 0 and needs no bits.
	if attr.contains(MemAttr::WRITE_THROUGH) {
		flags |= PteFlags::WRITE_THROUGH; // index 1
	} else if attr.contains(MemAttr::UNCACHEABLE) {
		flags |= PteFlags::CACHE_DISABLE; // index 2, UC-
	} else if attr.contains(MemAttr::STRONG_UNCACHED) {
		flags |= PteFlags::CACHE_DISABLE | PteFlags::WRITE_THROUGH; // index 3, UC
	} else if attr.contains(MemAttr::WRITE_COMBINE) {
		flags |= PteFlags::PAT; // index 4
	} else if attr.contains(MemAttr::WRITE_PROTECT) {
		flags |= PteFlags::PAT | PteFlags::WRITE_THROUGH; // index 5
	}

	flags
}

/// Recover the attribute bits of a leaf entry.
pub fn pte_bits_to_attr(flags: PteFlags) -> MemAttr {
	let mut attr = MemAttr::empty();

	if flags.contains(PteFlags::WRITABLE) {
		attr |= MemAttr::WRITABLE;
	}
	if flags.contains(PteFlags::USER_ACCESSIBLE) {
		attr |= MemAttr::USER;
	}
	if !flags.contains(PteFlags::EXECUTE_DISABLE) {
		attr |= MemAttr::EXECUTABLE;
	}

	match (
		flags.contains(PteFlags::PAT),
		flags.contains(PteFlags::CACHE_DISABLE),
		flags.contains(PteFlags::WRITE_THROUGH),
	) {
		(false, false, false) => attr |= MemAttr::WRITE_BACK,
		(false, false, true) => attr |= MemAttr::WRITE_THROUGH,
		(false, true, false) => attr |= MemAttr::UNCACHEABLE,
		(false, true, true) => attr |= MemAttr::STRONG_UNCACHED,
		(true, false, false) => attr |= MemAttr::WRITE_COMBINE,
		(true, false, true) => attr |= MemAttr::WRITE_PROTECT,
		// Indices 6 and 7 repeat UC-/UC.
		(true, true, false) => attr |= MemAttr::UNCACHEABLE,
		(true, true, true) => attr |= MemAttr::STRONG_UNCACHED,
	}

	attr
}

/// Index of `vaddr` in the table at the given level (level 1 is the leaf
/// table).
fn table_index(vaddr: u64, level: u8) -> u64 {
	(vaddr >> (12 + 9 * u64::from(level - 1))) & (TABLE_ENTRIES - 1)
}

/// Bytes covered by one entry at the given level.
fn level_step(level: u8) -> u64 {
	1 << (12 + 9 * u64::from(level - 1))
}

fn sign_extend(vaddr: u64, levels: u8) -> u64 {
	let shift = if levels == 5 { 56 } else { 47 };
	if vaddr.get_bit(shift) {
		vaddr | !((1 << (shift + 1)) - 1)
	} else {
		vaddr
	}
}

/// Base of the remap window: the virtual range that decodes through the
/// reserved top slot at every non-leaf level.
fn window_base(levels: u8) -> u64 {
	let slot = u64::from(REMAP_SLOT);
	let mut base = 0;
	// All levels except the last translation step run through REMAP_SLOT.
	for level in (2..=levels).rev() {
		base |= slot << (12 + 9 * u64::from(level - 1));
	}
	sign_extend(base, levels)
}

/// Fixed virtual address of a window slot.
pub(crate) fn window_vaddr(slot: u16) -> VirtAddr {
	let levels = PAGING_LEVELS.load(Ordering::Relaxed);
	VirtAddr::new(window_base(levels) + u64::from(slot) * PAGE_SIZE as u64)
}

#[inline]
fn flush_page(vaddr: VirtAddr) {
	#[cfg(target_os = "none")]
	x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.as_u64()));
	#[cfg(not(target_os = "none"))]
	let _ = vaddr;
}

/// Reload CR3, flushing all non-global translations of this CPU.
pub fn flush_tlb_local() {
	#[cfg(target_os = "none")]
	unsafe {
		let (frame, flags) = x86_64::registers::control::Cr3::read_raw();
		x86_64::registers::control::Cr3::write_raw(frame, flags);
	}
}

/// The top table, visible through the window's own reserved slot.
#[cfg(target_os = "none")]
fn top_table_entry(slot: u16) -> *mut u64 {
	let table = window_vaddr(REMAP_SLOT).as_u64() as *mut u64;
	unsafe { table.add(usize::from(slot)) }
}

/// Map a frame into a window slot and return its fixed virtual address.
///
/// Slot ownership is by subsystem (frame manager, firmware windows,
/// walker); callers serialize among themselves.
#[cfg(target_os = "none")]
pub(crate) fn temp_map(phys: PhysAddr, slot: u16) -> VirtAddr {
	debug_assert_eq!(phys.as_u64() % PAGE_SIZE as u64, 0);
	debug_assert_ne!(slot, REMAP_SLOT);

	let vaddr = window_vaddr(slot);
	unsafe {
		*top_table_entry(slot) =
			(phys.as_u64() & ENTRY_ADDR_MASK) | (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
	}
	flush_page(vaddr);
	vaddr
}

/// Clear a window slot.
#[cfg(target_os = "none")]
pub(crate) fn temp_unmap(vaddr: VirtAddr) {
	let levels = PAGING_LEVELS.load(Ordering::Relaxed);
	let offset = vaddr.as_u64() - window_base(levels);
	let slot = (offset / PAGE_SIZE as u64) as u16;
	debug_assert_ne!(slot, REMAP_SLOT);

	unsafe {
		*top_table_entry(slot) = 0;
	}
	flush_page(vaddr);
}

/// One paging tree. The kernel owns a single shared instance; the lock
/// also serializes use of the walker window slots.
pub struct PagingContext {
	inner: SpinMutex<PagingTree>,
}

struct PagingTree {
	root: PhysAddr,
	levels: u8,
}

/// Serializes walks of all contexts; the walker slots are global.
static WALKER_LOCK: InterruptSpinMutex<()> = InterruptSpinMutex::new(());

/// What a walk does at its four decision points.
trait WalkerOps {
	/// Allocate missing intermediate tables while descending.
	const CREATES_TABLES: bool;
	/// Release tables that became empty while ascending.
	const FREES_TABLES: bool;

	/// A leaf table (or an intermediate one) is missing. `Ok(())` skips
	/// the covered range, an error aborts the walk.
	fn missing_table(&mut self) -> Result<(), PagingError> {
		Ok(())
	}

	/// Act on one leaf entry.
	fn leaf(&mut self, entry: &mut u64, vaddr: u64) -> Result<(), PagingError>;
}

#[cfg(target_os = "none")]
struct Walker<'o, O: WalkerOps> {
	levels: u8,
	/// Physical frame of the table currently entered per level.
	table_phys: [u64; 6],
	/// Which table is mapped in each level's walker slot right now.
	mapped: [u64; 6],
	ops: &'o mut O,
}

#[cfg(target_os = "none")]
impl<'o, O: WalkerOps> Walker<'o, O> {
	fn new(root: PhysAddr, levels: u8, ops: &'o mut O) -> Self {
		let mut table_phys = [0; 6];
		table_phys[usize::from(levels)] = root.as_u64();
		Self {
			levels,
			table_phys,
			mapped: [0; 6],
			ops,
		}
	}

	/// The entries of the table entered at `level`, remapping the level's
	/// window slot only when the table changed.
	fn table(&mut self, level: u8) -> *mut u64 {
		let phys = self.table_phys[usize::from(level)];
		let slot = WALKER_SLOT_BASE + u16::from(level);
		if self.mapped[usize::from(level)] != phys {
			temp_map(PhysAddr::new(phys), slot);
			self.mapped[usize::from(level)] = phys;
		}
		window_vaddr(slot).as_u64() as *mut u64
	}

	fn read_entry(&mut self, level: u8, index: u64) -> u64 {
		unsafe { self.table(level).add(index as usize).read_volatile() }
	}

	fn write_entry(&mut self, level: u8, index: u64, value: u64) {
		unsafe {
			self.table(level).add(index as usize).write_volatile(value);
		}
	}

	fn table_is_empty(&mut self, level: u8) -> bool {
		let table = self.table(level);
		(0..TABLE_ENTRIES as usize).all(|i| unsafe { table.add(i).read_volatile() } == 0)
	}

	/// Allocate and zero a new table frame for the entry at
	/// `(level, index)`.
	fn create_table(&mut self, level: u8, index: u64) -> Result<u64, PagingError> {
		let frame = physicalmem::alloc_frame().map_err(|_| PagingError::NoFrames)?;

		let scratch = temp_map(frame, SCRATCH_SLOT);
		unsafe {
			core::ptr::write_bytes(scratch.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
		}
		temp_unmap(scratch);

		self.write_entry(
			level,
			index,
			(frame.as_u64() & ENTRY_ADDR_MASK)
				| (PteFlags::PRESENT | PteFlags::WRITABLE).bits(),
		);
		Ok(frame.as_u64())
	}

	/// Drive the walk across `[virt, virt + len)`.
	fn walk(&mut self, virt: u64, len: u64) -> Result<(), PagingError> {
		let end = virt + len;
		let mut vaddr = virt & !(PAGE_SIZE as u64 - 1);

		'outer: while vaddr < end {
			// Descend from the top level to the leaf table.
			let mut level = self.levels;
			while level > 1 {
				let index = table_index(vaddr, level);
				let entry = self.read_entry(level, index);

				let next_phys = if entry & PteFlags::PRESENT.bits() != 0 {
					entry & ENTRY_ADDR_MASK
				} else if O::CREATES_TABLES {
					self.create_table(level, index)?
				} else {
					self.ops.missing_table()?;
					// Skip everything the absent table would cover.
					let step = level_step(level);
					vaddr = (vaddr & !(step - 1)) + step;
					continue 'outer;
				};

				level -= 1;
				self.table_phys[usize::from(level)] = next_phys;
			}

			// Act on the leaf entries of this table.
			let mut index = table_index(vaddr, 1);
			while index < TABLE_ENTRIES && vaddr < end {
				let mut entry = self.read_entry(1, index);
				self.ops.leaf(&mut entry, vaddr)?;
				self.write_entry(1, index, entry);
				index += 1;
				vaddr += PAGE_SIZE as u64;
			}

			if O::FREES_TABLES {
				self.release_empty_tables(vaddr - PAGE_SIZE as u64)?;
			}
		}

		Ok(())
	}

	/// Walk up from the leaf table, releasing tables that became empty.
	fn release_empty_tables(&mut self, vaddr: u64) -> Result<(), PagingError> {
		for level in 1..self.levels {
			if !self.table_is_empty(level) {
				break;
			}

			let frame = self.table_phys[usize::from(level)];
			let parent_index = table_index(vaddr, level + 1);
			self.write_entry(level + 1, parent_index, 0);
			self.mapped[usize::from(level)] = 0;
			physicalmem::free_frame(PhysAddr::new(frame));
		}
		Ok(())
	}
}

struct MapOp {
	phys: u64,
	bits: u64,
}

impl WalkerOps for MapOp {
	const CREATES_TABLES: bool = true;
	const FREES_TABLES: bool = false;

	fn leaf(&mut self, entry: &mut u64, _vaddr: u64) -> Result<(), PagingError> {
		*entry = (self.phys & ENTRY_ADDR_MASK) | self.bits;
		self.phys += PAGE_SIZE as u64;
		Ok(())
	}
}

struct AllocOp {
	bits: u64,
}

impl WalkerOps for AllocOp {
	const CREATES_TABLES: bool = true;
	const FREES_TABLES: bool = false;

	fn leaf(&mut self, entry: &mut u64, _vaddr: u64) -> Result<(), PagingError> {
		let frame = physicalmem::alloc_frame().map_err(|_| PagingError::NoFrames)?;
		*entry = (frame.as_u64() & ENTRY_ADDR_MASK) | self.bits;
		Ok(())
	}
}

struct UnmapOp;

impl WalkerOps for UnmapOp {
	const CREATES_TABLES: bool = false;
	const FREES_TABLES: bool = true;

	fn leaf(&mut self, entry: &mut u64, _vaddr: u64) -> Result<(), PagingError> {
		*entry = 0;
		Ok(())
	}
}

struct FreeOp;

impl WalkerOps for FreeOp {
	const CREATES_TABLES: bool = false;
	const FREES_TABLES: bool = true;

	fn leaf(&mut self, entry: &mut u64, _vaddr: u64) -> Result<(), PagingError> {
		if *entry & PteFlags::PRESENT.bits() != 0 {
			physicalmem::free_frame(PhysAddr::new(*entry & ENTRY_ADDR_MASK));
		}
		*entry = 0;
		Ok(())
	}
}

struct ChangeAttrOp {
	bits: u64,
}

impl WalkerOps for ChangeAttrOp {
	const CREATES_TABLES: bool = false;
	const FREES_TABLES: bool = false;

	fn missing_table(&mut self) -> Result<(), PagingError> {
		Err(PagingError::TableNotAllocated)
	}

	fn leaf(&mut self, entry: &mut u64, _vaddr: u64) -> Result<(), PagingError> {
		if *entry & PteFlags::PRESENT.bits() == 0 {
			return Err(PagingError::TableNotAllocated);
		}
		*entry = (*entry & ENTRY_ADDR_MASK) | self.bits;
		Ok(())
	}
}

/// Ensures intermediate tables exist; leaves stay untouched.
struct BackendOp;

impl WalkerOps for BackendOp {
	const CREATES_TABLES: bool = true;
	const FREES_TABLES: bool = false;

	fn leaf(&mut self, _entry: &mut u64, _vaddr: u64) -> Result<(), PagingError> {
		Ok(())
	}
}

/// Reads one leaf entry.
struct LookupOp {
	result: Option<u64>,
}

impl WalkerOps for LookupOp {
	const CREATES_TABLES: bool = false;
	const FREES_TABLES: bool = false;

	fn leaf(&mut self, entry: &mut u64, _vaddr: u64) -> Result<(), PagingError> {
		if *entry & PteFlags::PRESENT.bits() != 0 {
			self.result = Some(*entry);
		}
		Ok(())
	}
}

impl PagingContext {
	pub(crate) const fn from_root(root: PhysAddr, levels: u8) -> Self {
		Self {
			inner: SpinMutex::new(PagingTree { root, levels }),
		}
	}

	pub fn root(&self) -> PhysAddr {
		self.inner.lock().root
	}

	#[cfg(target_os = "none")]
	fn run<O: WalkerOps>(&self, virt: VirtAddr, len: u64, ops: &mut O) -> Result<(), PagingError> {
		let tree = self.inner.lock();
		let _window = WALKER_LOCK.lock();
		let mut walker = Walker::new(tree.root, tree.levels, ops);
		walker.walk(virt.as_u64(), len)
	}

	#[cfg(not(target_os = "none"))]
	fn run<O: WalkerOps>(
		&self,
		_virt: VirtAddr,
		_len: u64,
		_ops: &mut O,
	) -> Result<(), PagingError> {
		unimplemented!("page tables can only be edited on the target")
	}

	/// Create leaf entries mapping `phys..phys+len` at `virt..virt+len`.
	pub fn map(
		&self,
		virt: VirtAddr,
		len: u64,
		phys: PhysAddr,
		attr: MemAttr,
	) -> Result<(), PagingError> {
		trace!("map {virt:p} len {len:#x} -> {phys:p} ({attr:?})");
		let bits = attr_to_pte_bits(attr, processor::supports_nx()).bits();
		let mut op = MapOp {
			phys: phys.as_u64(),
			bits,
		};
		self.run(virt, len, &mut op)?;
		self.invalidate(virt, len);
		Ok(())
	}

	/// Like `map`, but the frames come from the frame manager with no
	/// contiguity requirement.
	pub fn alloc(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError> {
		trace!("alloc {virt:p} len {len:#x} ({attr:?})");
		let bits = attr_to_pte_bits(attr, processor::supports_nx()).bits();
		let mut op = AllocOp { bits };
		self.run(virt, len, &mut op)?;
		self.invalidate(virt, len);
		Ok(())
	}

	/// Rewrite the attribute bits of existing leaf entries.
	pub fn change_attr(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError> {
		trace!("change_attr {virt:p} len {len:#x} ({attr:?})");
		let bits = attr_to_pte_bits(attr, processor::supports_nx()).bits();
		let mut op = ChangeAttrOp { bits };
		self.run(virt, len, &mut op)?;
		self.invalidate(virt, len);
		Ok(())
	}

	/// Clear leaf entries without touching the referenced frames.
	pub fn unmap(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
		trace!("unmap {virt:p} len {len:#x}");
		self.run(virt, len, &mut UnmapOp)?;
		self.invalidate(virt, len);
		Ok(())
	}

	/// Clear leaf entries and return the referenced frames.
	pub fn free(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
		trace!("free {virt:p} len {len:#x}");
		self.run(virt, len, &mut FreeOp)?;
		self.invalidate(virt, len);
		Ok(())
	}

	/// Make sure every intermediate table for the range exists.
	///
	/// There is no inverse entry point: `unmap` and `free` reclaim
	/// tables that become empty as part of their walk.
	pub fn allocate_backend(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
		self.run(virt, len, &mut BackendOp)
	}

	pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
		let mut op = LookupOp { result: None };
		let page = virt.as_u64() & !(PAGE_SIZE as u64 - 1);
		self.run(VirtAddr::new(page), PAGE_SIZE as u64, &mut op).ok()?;
		let entry = op.result?;
		Some(PhysAddr::new(
			(entry & ENTRY_ADDR_MASK) | (virt.as_u64() & (PAGE_SIZE as u64 - 1)),
		))
	}

	/// Flush the range locally, then ask every other CPU to drop its
	/// stale translations. Fire-and-forget: the context lock is held by
	/// the caller for the duration of the mutation, and late CPUs refetch
	/// on their next miss.
	pub fn invalidate(&self, virt: VirtAddr, len: u64) {
		let mut vaddr = virt.as_u64() & !(PAGE_SIZE as u64 - 1);
		let end = virt.as_u64() + len;
		while vaddr < end {
			flush_page(VirtAddr::new(vaddr));
			vaddr += PAGE_SIZE as u64;
		}

		#[cfg(all(target_os = "none", feature = "smp"))]
		crate::arch::kernel::send_tlb_invalidate_broadcast();
	}
}

/// The shared kernel paging context.
static KERNEL_CONTEXT: hermit_sync::OnceCell<PagingContext> = hermit_sync::OnceCell::new();

pub(crate) fn kernel_context() -> &'static PagingContext {
	KERNEL_CONTEXT.get().expect("paging is not initialized")
}

pub fn kernel_root_table() -> PhysAddr {
	kernel_context().root()
}

pub fn uses_5_levels() -> bool {
	PAGING_LEVELS.load(Ordering::Relaxed) == 5
}

/// Reload the kernel root table into CR3 (used by APs and the
/// invalidation IPI).
pub fn reload_root_table() {
	#[cfg(target_os = "none")]
	unsafe {
		let root = kernel_root_table();
		let frame = x86_64::structures::paging::PhysFrame::containing_address(
			x86_64::PhysAddr::new(root.as_u64()),
		);
		x86_64::registers::control::Cr3::write(frame, x86_64::registers::control::Cr3Flags::empty());
	}
}

/// Identity-map one low-memory frame (AP trampoline).
pub fn identity_map_page(phys: PhysAddr) {
	kernel_context()
		.map(
			VirtAddr::new(phys.as_u64()),
			PAGE_SIZE as u64,
			phys,
			MemAttr::WRITABLE | MemAttr::EXECUTABLE,
		)
		.expect("cannot identity-map a low frame");
}

pub fn identity_unmap_page(phys: PhysAddr) {
	kernel_context()
		.unmap(VirtAddr::new(phys.as_u64()), PAGE_SIZE as u64)
		.expect("cannot remove an identity mapping");
}

/// Early table editing, used only while the boot tables are active: the
/// frames of the new hierarchy still sit in boot-identity-mapped memory
/// and are written directly.
#[cfg(target_os = "none")]
mod early {
	use super::*;

	fn entries(phys: u64) -> *mut u64 {
		phys as *mut u64
	}

	pub(super) fn map_range(
		root: u64,
		levels: u8,
		mut virt: u64,
		len: u64,
		mut phys: u64,
		bits: u64,
	) {
		let end = virt + len;
		while virt < end {
			let mut table = root;
			let mut level = levels;
			while level > 1 {
				let index = table_index(virt, level);
				let entry = unsafe { entries(table).add(index as usize).read() };
				let next = if entry & PteFlags::PRESENT.bits() != 0 {
					entry & ENTRY_ADDR_MASK
				} else {
					let frame = physicalmem::early_alloc_frame()
						.expect("out of frames while building the kernel tables");
					unsafe {
						core::ptr::write_bytes(frame.as_u64() as *mut u8, 0, PAGE_SIZE);
						entries(table).add(index as usize).write(
							(frame.as_u64() & ENTRY_ADDR_MASK)
								| (PteFlags::PRESENT | PteFlags::WRITABLE).bits(),
						);
					}
					frame.as_u64()
				};
				table = next;
				level -= 1;
			}

			let index = table_index(virt, 1);
			unsafe {
				entries(table)
					.add(index as usize)
					.write((phys & ENTRY_ADDR_MASK) | bits);
			}
			virt += PAGE_SIZE as u64;
			phys += PAGE_SIZE as u64;
		}
	}
}

/// Number of paging levels the boot shim enabled.
#[cfg(target_os = "none")]
fn detect_levels() -> u8 {
	use x86_64::registers::control::{Cr4, Cr4Flags};
	if Cr4::read().contains(Cr4Flags::L5_PAGING) { 5 } else { 4 }
}

/// Record the active paging depth; the window works against the boot
/// tables from here on (their top table carries the recursive slot).
#[cfg(target_os = "none")]
pub fn early_init() {
	let levels = detect_levels();
	PAGING_LEVELS.store(levels, Ordering::Relaxed);
	info!("Paging runs with {levels} levels");
}

/// Build the kernel's own paging hierarchy and switch to it.
///
/// Runs once on the boot processor, after the frame manager's first
/// phase. The fresh top table reserves the window slot pointing to
/// itself.
#[cfg(target_os = "none")]
pub fn init() {
	use crate::arch::mm as layout;

	let levels = PAGING_LEVELS.load(Ordering::Relaxed);
	let nx = processor::supports_nx();

	let root = physicalmem::early_alloc_frame().expect("out of frames for the kernel root table");
	unsafe {
		core::ptr::write_bytes(root.as_u64() as *mut u8, 0, PAGE_SIZE);
		// The self-referential window slot.
		(root.as_u64() as *mut u64).add(usize::from(REMAP_SLOT)).write(
			(root.as_u64() & ENTRY_ADDR_MASK)
				| (PteFlags::PRESENT | PteFlags::WRITABLE).bits(),
		);
	}

	// Map the kernel image section by section.
	for section in layout::kernel_sections() {
		if section.virt_end <= section.virt_start {
			continue;
		}
		let mut attr = MemAttr::WRITE_BACK;
		if section.writable {
			attr |= MemAttr::WRITABLE;
		}
		if section.executable {
			attr |= MemAttr::EXECUTABLE;
		}
		let virt = section.virt_start & !(PAGE_SIZE as u64 - 1);
		let len = (section.virt_end - virt + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
		let phys = layout::image_virt_to_phys(VirtAddr::new(virt));

		early::map_range(
			root.as_u64(),
			levels,
			virt,
			len,
			phys.as_u64(),
			attr_to_pte_bits(attr, nx).bits() | PteFlags::GLOBAL.bits(),
		);
	}

	KERNEL_CONTEXT
		.set(PagingContext::from_root(root, levels))
		.map_err(drop)
		.expect("paging is initialized twice");

	reload_root_table();
	info!("Switched to the kernel page tables (root {root:p})");
}

/// Claim the invalidation vector: the handler reloads CR3, which is a
/// full non-global flush.
pub(crate) fn install_invalidation_handler() {
	use crate::arch::kernel::interrupts::PAGE_INVALIDATE_VECTOR;
	use crate::arch::kernel::isr::{self, IsrInfo, IsrStatus};

	fn invalidate_handler(_cookie: usize, _info: &IsrInfo) -> IsrStatus {
		flush_tlb_local();
		IsrStatus::Handled
	}

	isr::install(invalidate_handler, 0, PAGE_INVALIDATE_VECTOR, false);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn attr_translation_round_trip() {
		let cases = [
			MemAttr::WRITABLE | MemAttr::WRITE_BACK,
			MemAttr::WRITE_THROUGH,
			MemAttr::UNCACHEABLE,
			MemAttr::STRONG_UNCACHED,
			MemAttr::WRITE_COMBINE | MemAttr::WRITABLE,
			MemAttr::WRITE_PROTECT,
		];

		for attr in cases {
			let bits = attr_to_pte_bits(attr, true);
			let back = pte_bits_to_attr(bits);
			assert_eq!(
				back & (MemAttr::WRITABLE | MemAttr::USER),
				attr & (MemAttr::WRITABLE | MemAttr::USER),
				"{attr:?}"
			);
			// Caching class must survive the round trip.
			let caching = MemAttr::STRONG_UNCACHED
				| MemAttr::UNCACHEABLE
				| MemAttr::WRITE_COMBINE
				| MemAttr::WRITE_THROUGH
				| MemAttr::WRITE_PROTECT;
			let attr_caching = attr & caching;
			if attr_caching.is_empty() {
				assert!(back.contains(MemAttr::WRITE_BACK), "{attr:?}");
			} else {
				assert_eq!(back & caching, attr_caching, "{attr:?}");
			}
		}
	}

	#[test]
	fn nx_follows_executable_and_support() {
		let exec = attr_to_pte_bits(MemAttr::EXECUTABLE, true);
		assert!(!exec.contains(PteFlags::EXECUTE_DISABLE));

		let data = attr_to_pte_bits(MemAttr::WRITABLE, true);
		assert!(data.contains(PteFlags::EXECUTE_DISABLE));

		let no_nx = attr_to_pte_bits(MemAttr::WRITABLE, false);
		assert!(!no_nx.contains(PteFlags::EXECUTE_DISABLE));
	}

	#[test]
	fn guard_attr_is_never_writable() {
		let bits = attr_to_pte_bits(MemAttr::WRITABLE | MemAttr::GUARD, true);
		assert!(!bits.contains(PteFlags::WRITABLE));
		assert!(bits.contains(PteFlags::PRESENT));
	}

	#[test]
	fn window_addresses() {
		// With four levels the window sits in the high half and each slot
		// is one page apart.
		let base = window_base(4);
		assert_eq!(base >> 39 & 0x1FF, u64::from(REMAP_SLOT));
		assert_eq!(base >> 30 & 0x1FF, u64::from(REMAP_SLOT));
		assert_eq!(base >> 21 & 0x1FF, u64::from(REMAP_SLOT));
		assert_eq!(base & 0x1F_FFFF, 0);
		// Canonical high-half address.
		assert_eq!(base >> 48, 0xFFFF);

		let five = window_base(5);
		assert_eq!(five >> 48 & 0x1FF, u64::from(REMAP_SLOT));
	}

	#[test]
	fn level_math() {
		assert_eq!(table_index(0xFFFF_FFFF_FFFF_F000, 1), 511);
		assert_eq!(table_index(0x0000_0000_0020_0000, 2), 1);
		assert_eq!(level_step(1), 4096);
		assert_eq!(level_step(2), 2 * 1024 * 1024);
		assert_eq!(level_step(3), 1024 * 1024 * 1024);
	}
}
