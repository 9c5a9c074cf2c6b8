//! Virtual address-space management.
//!
//! A context owns two extent sets, free and allocated, that partition
//! its managed regions. Placement is first-fit from low addresses within
//! the requested region. Extent storage lives in slot pages the context
//! allocates from itself; the kernel context is seeded with two static
//! slot pages at init.

use core::ptr::NonNull;

use hermit_sync::{OnceCell, SpinMutex};
use memory_addresses::{PhysAddr, VirtAddr};

use crate::arch::mm::paging::{MemAttr, PAGE_SIZE, PagingContext, PagingError};
use crate::mm::extent::{Extent, ExtentList, SLOT_SIZE, split};

pub use crate::mm::extent::{VmError, VmFlags};

/// Entries each list keeps in reserve so a single operation can never
/// run dry mid-way.
const MIN_SPARE_ENTRIES: usize = 4;

/// Managed low-half region: 4 MiB up to the canonical boundary.
const LOW_REGION_START: u64 = 0x0040_0000;
const LOW_REGION_END: u64 = 0x0000_8000_0000_0000;

/// Managed high-half region: the top-table slots between the kernel
/// image and the remap window.
const HIGH_REGION_START: u64 = 0xFFFF_8080_0000_0000;
const HIGH_REGION_END: u64 = 0xFFFF_C000_0000_0000;

/// The paging operations a context drives. The kernel context uses the
/// real page-table manager; tests substitute a recorder.
pub(crate) trait VmBackend: Send + Sync {
	fn allocate_backend(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError>;
	fn allocate_pages(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError>;
	fn map_pages(
		&self,
		virt: VirtAddr,
		len: u64,
		phys: PhysAddr,
		attr: MemAttr,
	) -> Result<(), PagingError>;
	fn release_pages(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError>;
	fn unmap_pages(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError>;
	fn change_attr(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError>;

	/// Writable view of a freshly backed slot page. The kernel backend
	/// returns the virtual address itself.
	fn slot_page_ptr(&self, virt: VirtAddr) -> NonNull<u8> {
		NonNull::new(virt.as_mut_ptr()).unwrap()
	}
}

impl VmBackend for PagingContext {
	fn allocate_backend(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
		PagingContext::allocate_backend(self, virt, len)
	}

	fn allocate_pages(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError> {
		self.alloc(virt, len, attr)
	}

	fn map_pages(
		&self,
		virt: VirtAddr,
		len: u64,
		phys: PhysAddr,
		attr: MemAttr,
	) -> Result<(), PagingError> {
		self.map(virt, len, phys, attr)
	}

	fn release_pages(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
		self.free(virt, len)
	}

	fn unmap_pages(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
		self.unmap(virt, len)
	}

	fn change_attr(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError> {
		PagingContext::change_attr(self, virt, len, attr)
	}
}

struct VasInner {
	free: ExtentList,
	alloc: ExtentList,
	backend: &'static dyn VmBackend,
	default_region: VmFlags,
}

/// One virtual address space.
pub struct VasContext {
	inner: SpinMutex<VasInner>,
}

fn page_align_up(len: u64) -> u64 {
	len.next_multiple_of(PAGE_SIZE as u64)
}

fn region_of_addr(addr: u64) -> Option<VmFlags> {
	if (LOW_REGION_START..LOW_REGION_END).contains(&addr) {
		Some(VmFlags::LOW_MEM)
	} else if (HIGH_REGION_START..HIGH_REGION_END).contains(&addr) {
		Some(VmFlags::HIGH_MEM)
	} else {
		None
	}
}

impl VasContext {
	fn new(backend: &'static dyn VmBackend, default_region: VmFlags) -> Self {
		Self {
			inner: SpinMutex::new(VasInner {
				free: ExtentList::new(),
				alloc: ExtentList::new(),
				backend,
				default_region,
			}),
		}
	}

	/// Seed the managed regions and the initial slot pages.
	///
	/// # Safety
	///
	/// The slot pages must be writable, page-sized and owned by this
	/// context for its lifetime.
	unsafe fn bootstrap(&self, free_slot: NonNull<u8>, alloc_slot: NonNull<u8>) {
		let mut inner = self.inner.lock();
		unsafe {
			inner.free.add_slot_page(free_slot);
			inner.alloc.add_slot_page(alloc_slot);
		}

		inner
			.free
			.insert(Extent {
				base: LOW_REGION_START,
				length: LOW_REGION_END - LOW_REGION_START,
				flags: VmFlags::LOW_MEM,
				prot: MemAttr::empty(),
			})
			.unwrap();
		inner
			.free
			.insert(Extent {
				base: HIGH_REGION_START,
				length: HIGH_REGION_END - HIGH_REGION_START,
				flags: VmFlags::HIGH_MEM,
				prot: MemAttr::empty(),
			})
			.unwrap();
	}

	/// Reserve a virtual range and establish backing.
	///
	/// `vaddr` of `None` means automatic placement; the region is then
	/// chosen by `flags` or the context default. With `LAZY`, paging is
	/// deferred to the first fault.
	pub fn alloc(
		&self,
		vaddr: Option<VirtAddr>,
		len: u64,
		flags: VmFlags,
		prot: MemAttr,
	) -> Result<VirtAddr, VmError> {
		self.reserve_and_back(vaddr, len, flags | VmFlags::ALLOCATED, prot, None)
	}

	/// Like [`Self::alloc`], but the backing frames are caller-provided.
	pub fn map(
		&self,
		vaddr: Option<VirtAddr>,
		len: u64,
		phys: PhysAddr,
		flags: VmFlags,
		prot: MemAttr,
	) -> Result<VirtAddr, VmError> {
		self.reserve_and_back(vaddr, len, flags | VmFlags::MAPPED, prot, Some(phys))
	}

	fn reserve_and_back(
		&self,
		vaddr: Option<VirtAddr>,
		len: u64,
		flags: VmFlags,
		prot: MemAttr,
		phys: Option<PhysAddr>,
	) -> Result<VirtAddr, VmError> {
		let len = page_align_up(len);
		if len == 0 {
			return Err(VmError::NoEntry);
		}

		let mut inner = self.inner.lock();
		ensure_capacity(&mut inner)?;

		// Carve the request out of the free set.
		let (ext, base) = match vaddr {
			Some(addr) => {
				let base = addr.as_u64();
				// The whole request must fall inside one managed region.
				let region = region_of_addr(base);
				if region.is_none() || region != region_of_addr(base + len - 1) {
					return Err(VmError::NoEntry);
				}
				// A fixed request must lie inside one free extent.
				let ext = inner
					.free
					.extract(|free| free.contains(base, len))
					.ok_or(VmError::NoMemory)?;
				(ext, base)
			}
			None => {
				let mut region = flags.region();
				if region.is_empty() {
					region = inner.default_region;
				}
				let fit = inner.free.find_fit(len, region).ok_or(VmError::NoMemory)?;
				let base = fit.base;
				let ext = inner.free.extract(|free| *free == fit).unwrap();
				(ext, base)
			}
		};

		let (left, right) = split(&ext, base, len);
		for remainder in [left, right].into_iter().flatten() {
			// Capacity was ensured above; reinserting cannot fail.
			inner.free.insert(remainder).unwrap();
		}

		let region = ext.flags.region();
		let allocated = Extent {
			base,
			length: len,
			flags: flags | region,
			prot,
		};

		// Realize the backing unless it is deferred to the fault path.
		if !flags.contains(VmFlags::LAZY) {
			let virt = VirtAddr::new(base);
			let backing = inner.backend.allocate_backend(virt, len).and_then(|()| {
				match phys {
					Some(phys) => inner.backend.map_pages(virt, len, phys, prot),
					None => inner.backend.allocate_pages(virt, len, prot),
				}
			});

			if let Err(err) = backing {
				debug!("Backing {base:#X}+{len:#X} failed: {err:?}");
				// Unwind both steps, then give the extent back. Frames
				// the caller provided stay theirs.
				let _ = match phys {
					Some(_) => inner.backend.unmap_pages(virt, len),
					None => inner.backend.release_pages(virt, len),
				};
				inner.free.insert(Extent {
					base,
					length: len,
					flags: region,
					prot: MemAttr::empty(),
				})?;
				return Err(VmError::NoMemory);
			}
		}

		inner.alloc.insert(allocated)?;
		Ok(VirtAddr::new(base))
	}

	/// Release an allocated range and return its frames.
	pub fn free(&self, addr: VirtAddr, len: u64) -> Result<(), VmError> {
		self.release(addr, len, VmFlags::ALLOCATED)
	}

	/// Drop the translation of a mapped range, keeping the frames.
	pub fn unmap(&self, addr: VirtAddr, len: u64) -> Result<(), VmError> {
		self.release(addr, len, VmFlags::MAPPED)
	}

	fn release(&self, addr: VirtAddr, len: u64, kind: VmFlags) -> Result<(), VmError> {
		let base = addr.as_u64();
		let len = page_align_up(len);

		let mut inner = self.inner.lock();
		ensure_capacity(&mut inner)?;

		// Locked extents veto the whole request before anything changes.
		if inner
			.alloc
			.find(|ext| ext.overlaps(base, len) && ext.flags.contains(VmFlags::LOCKED))
			.is_some()
		{
			return Err(VmError::Locked);
		}

		let ext = inner
			.alloc
			.extract(|ext| ext.contains(base, len) && ext.flags.contains(kind))
			.ok_or(VmError::NoEntry)?;

		let (left, right) = split(&ext, base, len);
		for remainder in [left, right].into_iter().flatten() {
			inner.alloc.insert(remainder).unwrap();
		}

		let virt = VirtAddr::new(base);
		// Frames the manager allocated go back to the frame manager;
		// caller-provided frames only lose their translation. Pages a
		// lazy extent never backed are skipped by the table walk.
		let result = if kind == VmFlags::ALLOCATED {
			inner.backend.release_pages(virt, len)
		} else {
			inner.backend.unmap_pages(virt, len)
		};
		if let Err(err) = result {
			warn!("Releasing translation at {base:#X} failed: {err:?}");
		}

		inner.free.insert(Extent {
			base,
			length: len,
			flags: ext.flags.region(),
			prot: MemAttr::empty(),
		})?;
		Ok(())
	}

	/// Change the protection of part of an allocated range.
	///
	/// Extent bookkeeping and the page-table edit happen under one lock
	/// hold; no intermediate state is observable.
	pub fn change_attr(
		&self,
		addr: VirtAddr,
		len: u64,
		set: MemAttr,
		clear: MemAttr,
		mut out_old_prot: Option<&mut MemAttr>,
	) -> Result<(), VmError> {
		let base = addr.as_u64();
		let len = page_align_up(len);

		let mut inner = self.inner.lock();
		ensure_capacity(&mut inner)?;

		let ext = inner
			.alloc
			.find(|ext| ext.contains(base, len))
			.ok_or(VmError::NoEntry)?;

		let old_prot = ext.prot;
		let new_prot = (old_prot | set) & !clear;
		if let Some(out) = out_old_prot.as_deref_mut() {
			*out = old_prot;
		}
		if new_prot == old_prot {
			return Ok(());
		}

		// Page tables first: if the edit fails the extent sets were
		// never touched.
		if !ext.flags.contains(VmFlags::LAZY) {
			inner
				.backend
				.change_attr(VirtAddr::new(base), len, new_prot)
				.map_err(|_| VmError::NoEntry)?;
		}

		let ext = inner.alloc.extract(|stored| *stored == ext).unwrap();
		let (left, right) = split(&ext, base, len);
		for remainder in [left, right].into_iter().flatten() {
			inner.alloc.insert(remainder).unwrap();
		}
		inner.alloc.insert(Extent {
			base,
			length: len,
			flags: ext.flags,
			prot: new_prot,
		})?;

		Ok(())
	}

	/// Resolve a fault at `addr`: back the page if it belongs to a lazy
	/// extent.
	pub fn resolve_fault(&self, addr: VirtAddr) -> bool {
		let page = addr.as_u64() & !(PAGE_SIZE as u64 - 1);

		let mut inner = self.inner.lock();
		let Some(ext) = inner.alloc.find(|ext| {
			ext.contains(page, PAGE_SIZE as u64) && ext.flags.contains(VmFlags::LAZY)
		}) else {
			return false;
		};

		let virt = VirtAddr::new(page);
		let backed = inner
			.backend
			.allocate_backend(virt, PAGE_SIZE as u64)
			.and_then(|()| inner.backend.allocate_pages(virt, PAGE_SIZE as u64, ext.prot));

		match backed {
			Ok(()) => true,
			Err(err) => {
				error!("Cannot back lazy page {page:#X}: {err:?}");
				false
			}
		}
	}

	/// Whole-list compact pass: rebuild the free set so every possible
	/// join is applied. Merging on insert already runs to a fixed
	/// point, so this is a safety valve, not a correctness requirement.
	pub fn compact(&self) {
		let mut inner = self.inner.lock();

		let mut extents: smallvec::SmallVec<[Extent; 32]> = smallvec::SmallVec::new();
		while let Some(ext) = inner.free.extract(|_| true) {
			extents.push(ext);
		}
		for ext in extents {
			// Entries were just released, reinsertion cannot run dry.
			inner.free.insert(ext).unwrap();
		}
	}

	/// Verify the extent sets still partition the managed regions; used
	/// by diagnostics.
	pub fn check_consistency(&self) -> bool {
		let inner = self.inner.lock();
		let free_bytes: u64 = inner.free.iter().map(|ext| ext.length).sum();
		let alloc_bytes: u64 = inner.alloc.iter().map(|ext| ext.length).sum();
		let managed = (LOW_REGION_END - LOW_REGION_START) + (HIGH_REGION_END - HIGH_REGION_START);

		for free in inner.free.iter() {
			for alloc in inner.alloc.iter() {
				if free.overlaps(alloc.base, alloc.length) {
					return false;
				}
			}
		}

		free_bytes + alloc_bytes == managed
	}

	pub fn print_information(&self) {
		let inner = self.inner.lock();
		infoheader!(" VIRTUAL ADDRESS SPACE ");
		for ext in inner.alloc.iter() {
			info!(
				"{:#016X} - {:#016X} {:?} {:?}",
				ext.base,
				ext.end(),
				ext.flags,
				ext.prot
			);
		}
		infofooter!();
	}
}

/// Top up the entry reserve of both extent sets.
///
/// A fresh slot page is carved from the context's own free set with
/// `PERMANENT | LOCKED`; recursion terminates because the reserve is
/// checked before any entry of the current operation is consumed.
fn ensure_capacity(inner: &mut VasInner) -> Result<(), VmError> {
	loop {
		let free_short = inner.free.avail_entries() < MIN_SPARE_ENTRIES;
		let alloc_short = inner.alloc.avail_entries() < MIN_SPARE_ENTRIES;
		if !free_short && !alloc_short {
			return Ok(());
		}

		// Carve one slot page out of the high region.
		let fit = inner
			.free
			.find_fit(SLOT_SIZE as u64, VmFlags::HIGH_MEM)
			.ok_or(VmError::NoMemory)?;
		let ext = inner.free.extract(|stored| *stored == fit).unwrap();
		let base = ext.base;

		let (left, right) = split(&ext, base, SLOT_SIZE as u64);
		for remainder in [left, right].into_iter().flatten() {
			inner.free.insert(remainder)?;
		}

		let virt = VirtAddr::new(base);
		let backed = inner
			.backend
			.allocate_backend(virt, SLOT_SIZE as u64)
			.and_then(|()| {
				inner
					.backend
					.allocate_pages(virt, SLOT_SIZE as u64, MemAttr::WRITABLE)
			});
		if backed.is_err() {
			let _ = inner.free.insert(Extent {
				base,
				length: SLOT_SIZE as u64,
				flags: VmFlags::HIGH_MEM,
				prot: MemAttr::empty(),
			});
			return Err(VmError::NoMemory);
		}

		// Tracking the slot page itself consumes an allocated-set entry,
		// so a dry allocated set always gets the page first.
		let give_to_free = free_short && inner.alloc.avail_entries() > 0;

		let page = inner.backend.slot_page_ptr(virt);
		unsafe {
			if give_to_free {
				inner.free.add_slot_page(page);
			} else {
				inner.alloc.add_slot_page(page);
			}
		}

		inner.alloc.insert(Extent {
			base,
			length: SLOT_SIZE as u64,
			flags: VmFlags::HIGH_MEM
				| VmFlags::ALLOCATED
				| VmFlags::PERMANENT
				| VmFlags::LOCKED,
			prot: MemAttr::WRITABLE,
		})?;

		debug!("Added an extent slot page at {base:#X}");
	}
}

static KERNEL_CONTEXT: OnceCell<VasContext> = OnceCell::new();

pub fn kernel_context() -> &'static VasContext {
	KERNEL_CONTEXT.get().expect("the kernel address space is not initialized")
}

/// Route a page fault to the owning context.
///
/// Returns `true` when the fault was resolved (lazy backing).
pub fn handle_page_fault(addr: VirtAddr, _error_code: u64) -> bool {
	let Some(ctx) = KERNEL_CONTEXT.get() else {
		return false;
	};
	ctx.resolve_fault(addr)
}

/// Bring up the kernel address space on the boot processor.
#[cfg(target_os = "none")]
pub fn init() {
	#[repr(align(4096))]
	struct BootSlotPage([u8; SLOT_SIZE]);

	static mut BOOT_SLOT_PAGES: [BootSlotPage; 2] =
		[BootSlotPage([0; SLOT_SIZE]), BootSlotPage([0; SLOT_SIZE])];

	let ctx = VasContext::new(
		crate::arch::mm::paging::kernel_context(),
		VmFlags::HIGH_MEM,
	);

	unsafe {
		let pages = core::ptr::addr_of_mut!(BOOT_SLOT_PAGES);
		let free_slot = NonNull::new((*pages)[0].0.as_mut_ptr()).unwrap();
		let alloc_slot = NonNull::new((*pages)[1].0.as_mut_ptr()).unwrap();
		ctx.bootstrap(free_slot, alloc_slot);
	}

	KERNEL_CONTEXT
		.set(ctx)
		.map_err(drop)
		.expect("the kernel address space is initialized twice");
	info!("Kernel address space manages the low and high halves");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use std::alloc::{Layout, alloc_zeroed};
	use std::boxed::Box;
	use std::collections::BTreeMap;
	use std::sync::Mutex;
	use std::vec::Vec;

	use super::*;

	/// Records backing operations instead of editing page tables.
	#[derive(Default)]
	struct MockBackend {
		/// Backed pages with their current attributes.
		pages: Mutex<BTreeMap<u64, MemAttr>>,
		/// Remaining allocations before a forced failure.
		fail_after: Mutex<Option<usize>>,
	}

	impl MockBackend {
		fn page_count(&self) -> usize {
			self.pages.lock().unwrap().len()
		}

		fn should_fail(&self) -> bool {
			let mut guard = self.fail_after.lock().unwrap();
			if let Some(remaining) = guard.as_mut() {
				if *remaining == 0 {
					return true;
				}
				*remaining -= 1;
			}
			false
		}
	}

	impl VmBackend for MockBackend {
		fn allocate_backend(&self, _virt: VirtAddr, _len: u64) -> Result<(), PagingError> {
			Ok(())
		}

		fn allocate_pages(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError> {
			if self.should_fail() {
				return Err(PagingError::NoFrames);
			}
			let mut pages = self.pages.lock().unwrap();
			for page in (virt.as_u64()..virt.as_u64() + len).step_by(PAGE_SIZE) {
				pages.insert(page, attr);
			}
			Ok(())
		}

		fn map_pages(
			&self,
			virt: VirtAddr,
			len: u64,
			_phys: PhysAddr,
			attr: MemAttr,
		) -> Result<(), PagingError> {
			self.allocate_pages(virt, len, attr)
		}

		fn release_pages(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
			let mut pages = self.pages.lock().unwrap();
			for page in (virt.as_u64()..virt.as_u64() + len).step_by(PAGE_SIZE) {
				pages.remove(&page);
			}
			Ok(())
		}

		fn unmap_pages(&self, virt: VirtAddr, len: u64) -> Result<(), PagingError> {
			self.release_pages(virt, len)
		}

		fn change_attr(&self, virt: VirtAddr, len: u64, attr: MemAttr) -> Result<(), PagingError> {
			let mut pages = self.pages.lock().unwrap();
			for page in (virt.as_u64()..virt.as_u64() + len).step_by(PAGE_SIZE) {
				match pages.get_mut(&page) {
					Some(stored) => *stored = attr,
					None => return Err(PagingError::TableNotAllocated),
				}
			}
			Ok(())
		}

		fn slot_page_ptr(&self, _virt: VirtAddr) -> NonNull<u8> {
			// Host tests need real memory behind slot pages.
			let layout = Layout::from_size_align(SLOT_SIZE, SLOT_SIZE).unwrap();
			NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap()
		}
	}

	fn new_context() -> (&'static VasContext, &'static MockBackend) {
		let backend: &'static MockBackend = Box::leak(Box::new(MockBackend::default()));
		let ctx = Box::leak(Box::new(VasContext::new(backend, VmFlags::HIGH_MEM)));

		let layout = Layout::from_size_align(SLOT_SIZE, SLOT_SIZE).unwrap();
		unsafe {
			let free_slot = NonNull::new(alloc_zeroed(layout)).unwrap();
			let alloc_slot = NonNull::new(alloc_zeroed(layout)).unwrap();
			ctx.bootstrap(free_slot, alloc_slot);
		}
		(ctx, backend)
	}

	#[test]
	fn auto_placement_is_first_fit_high() {
		let (ctx, backend) = new_context();

		let first = ctx
			.alloc(None, 0x4000, VmFlags::empty(), MemAttr::WRITABLE)
			.unwrap();
		let second = ctx
			.alloc(None, 0x1000, VmFlags::empty(), MemAttr::WRITABLE)
			.unwrap();

		assert_eq!(first.as_u64(), HIGH_REGION_START);
		assert_eq!(second.as_u64(), HIGH_REGION_START + 0x4000);
		assert_eq!(backend.page_count(), 5);
		assert!(ctx.check_consistency());
	}

	#[test]
	fn region_flag_selects_low_half() {
		let (ctx, _) = new_context();

		let low = ctx
			.alloc(None, 0x2000, VmFlags::LOW_MEM, MemAttr::WRITABLE)
			.unwrap();
		assert_eq!(low.as_u64(), LOW_REGION_START);
	}

	#[test]
	fn fixed_request_must_fit_one_extent() {
		let (ctx, backend) = new_context();

		let addr = VirtAddr::new(HIGH_REGION_START + 0x10_0000);
		let got = ctx
			.alloc(Some(addr), 0x2000, VmFlags::empty(), MemAttr::WRITABLE)
			.unwrap();
		assert_eq!(got, addr);

		// The same range is taken now; a second fixed request fails with
		// no side effects.
		let pages_before = backend.page_count();
		let err = ctx.alloc(Some(addr), 0x2000, VmFlags::empty(), MemAttr::WRITABLE);
		assert_eq!(err, Err(VmError::NoMemory));
		assert_eq!(backend.page_count(), pages_before);
		assert!(ctx.check_consistency());
	}

	#[test]
	fn alloc_free_restores_the_extent_sets() {
		let (ctx, backend) = new_context();

		// Snapshot, exercise, compare.
		let before: Vec<Extent> = {
			let inner = ctx.inner.lock();
			inner.free.iter().collect()
		};

		let addr = ctx
			.alloc(None, 0x3000, VmFlags::empty(), MemAttr::WRITABLE)
			.unwrap();
		ctx.free(addr, 0x3000).unwrap();

		let after: Vec<Extent> = {
			let inner = ctx.inner.lock();
			inner.free.iter().collect()
		};

		let mut before_sorted = before;
		let mut after_sorted = after;
		before_sorted.sort_by_key(|ext| ext.base);
		after_sorted.sort_by_key(|ext| ext.base);
		assert_eq!(before_sorted, after_sorted);
		assert_eq!(backend.page_count(), 0);
	}

	#[test]
	fn free_extents_of_equal_kind_never_stay_adjacent() {
		let (ctx, _) = new_context();

		// Allocate three neighbors, free them out of order.
		let a = ctx.alloc(None, 0x1000, VmFlags::empty(), MemAttr::WRITABLE).unwrap();
		let b = ctx.alloc(None, 0x1000, VmFlags::empty(), MemAttr::WRITABLE).unwrap();
		let c = ctx.alloc(None, 0x1000, VmFlags::empty(), MemAttr::WRITABLE).unwrap();

		ctx.free(a, 0x1000).unwrap();
		ctx.free(c, 0x1000).unwrap();
		ctx.free(b, 0x1000).unwrap();

		let inner = ctx.inner.lock();
		let extents: Vec<Extent> = inner.free.iter().collect();
		for first in &extents {
			for second in &extents {
				if first.base != second.base {
					assert!(
						first.end() != second.base
							|| first.flags.region() != second.flags.region()
							|| first.prot != second.prot,
						"adjacent unmerged extents at {:#X}",
						first.end()
					);
				}
			}
		}
	}

	#[test]
	fn locked_extents_veto_free() {
		let (ctx, backend) = new_context();

		let addr = ctx
			.alloc(
				None,
				0x2000,
				VmFlags::PERMANENT | VmFlags::LOCKED,
				MemAttr::WRITABLE,
			)
			.unwrap();

		let pages = backend.page_count();
		assert_eq!(ctx.free(addr, 0x2000), Err(VmError::Locked));
		assert_eq!(ctx.free(addr, 0x1000), Err(VmError::Locked));
		assert_eq!(backend.page_count(), pages);
	}

	#[test]
	fn change_attr_round_trip_restores_protection() {
		let (ctx, _) = new_context();

		let addr = ctx
			.alloc(None, 0x4000, VmFlags::empty(), MemAttr::WRITABLE)
			.unwrap();

		// Protect the first page, then undo it.
		let mut old = MemAttr::empty();
		ctx.change_attr(
			addr,
			0x1000,
			MemAttr::WRITE_THROUGH,
			MemAttr::WRITABLE,
			Some(&mut old),
		)
		.unwrap();
		assert_eq!(old, MemAttr::WRITABLE);

		ctx.change_attr(
			addr,
			0x1000,
			MemAttr::WRITABLE,
			MemAttr::WRITE_THROUGH,
			None,
		)
		.unwrap();

		let inner = ctx.inner.lock();
		// After the round trip there is a single extent again with the
		// original protection.
		let stored: Vec<Extent> = inner
			.alloc
			.iter()
			.filter(|ext| ext.contains(addr.as_u64(), 0x1000))
			.collect();
		assert_eq!(stored.len(), 1);
		assert_eq!(stored[0].prot, MemAttr::WRITABLE);
		assert_eq!(stored[0].length, 0x4000);
	}

	#[test]
	fn backing_failure_rolls_back_the_reservation() {
		let (ctx, backend) = new_context();
		*backend.fail_after.lock().unwrap() = Some(0);

		let err = ctx.alloc(None, 0x2000, VmFlags::empty(), MemAttr::WRITABLE);
		assert_eq!(err, Err(VmError::NoMemory));
		assert!(ctx.check_consistency());

		// Allocation works again once the backend recovers.
		*backend.fail_after.lock().unwrap() = None;
		let addr = ctx.alloc(None, 0x2000, VmFlags::empty(), MemAttr::WRITABLE);
		assert_eq!(addr.unwrap().as_u64(), HIGH_REGION_START);
	}

	#[test]
	fn lazy_allocation_is_backed_by_the_fault_path() {
		let (ctx, backend) = new_context();

		let addr = ctx
			.alloc(None, 0x3000, VmFlags::LAZY, MemAttr::WRITABLE)
			.unwrap();
		assert_eq!(backend.page_count(), 0);

		// A fault inside the range backs exactly one page.
		assert!(ctx.resolve_fault(VirtAddr::new(addr.as_u64() + 0x1000)));
		assert_eq!(backend.page_count(), 1);

		// A fault outside any lazy extent stays unresolved.
		assert!(!ctx.resolve_fault(VirtAddr::new(HIGH_REGION_START + 0x100_0000)));
	}

	#[test]
	fn compact_is_idempotent_on_a_merged_list() {
		let (ctx, _) = new_context();

		let addr = ctx
			.alloc(None, 0x2000, VmFlags::empty(), MemAttr::WRITABLE)
			.unwrap();
		ctx.free(addr, 0x2000).unwrap();

		let before: Vec<Extent> = {
			let inner = ctx.inner.lock();
			inner.free.iter().collect()
		};
		ctx.compact();
		let mut after: Vec<Extent> = {
			let inner = ctx.inner.lock();
			inner.free.iter().collect()
		};

		let mut before = before;
		before.sort_by_key(|ext| ext.base);
		after.sort_by_key(|ext| ext.base);
		assert_eq!(before, after);
		assert!(ctx.check_consistency());
	}

	#[test]
	fn slot_pages_replenish_themselves() {
		let (ctx, _) = new_context();

		// Burn through far more extents than two slot pages can track.
		let mut addrs = Vec::new();
		for index in 0..400 {
			let addr = ctx
				.alloc(
					Some(VirtAddr::new(HIGH_REGION_START + 0x100_0000 + index * 0x2000)),
					0x1000,
					VmFlags::empty(),
					MemAttr::WRITABLE,
				)
				.unwrap();
			addrs.push(addr);
		}

		for addr in addrs {
			ctx.free(addr, 0x1000).unwrap();
		}
		assert!(ctx.check_consistency());
	}
}
