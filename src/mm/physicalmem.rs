//! Physical frame manager.
//!
//! Every usable firmware range carries its tracking data in its own top
//! frames: a header plus a bitmap with one bit per 4 KiB frame (set =
//! busy). Busy firmware ranges carry a header only. Ranges are linked by
//! physical address in ascending base order.
//!
//! The manager runs in two phases. Before the kernel address space
//! exists it reaches headers and bitmaps through the paging remap window
//! (slots 510/511); once the kernel context is up, `init` maps all
//! tracking data permanently and swaps the access operations.

use core::sync::atomic::{AtomicUsize, Ordering};

use hermit_sync::InterruptTicketMutex;
use memory_addresses::PhysAddr;
use smallvec::SmallVec;
use thiserror::Error;

use crate::env::{self, MemoryKind, RegionFlags};

pub const PAGE_SIZE: u64 = 4096;
const FRAMES_PER_WORD: u64 = 64;

/// Frames below this line are never handed out without `ISA_DMA`.
const LOW_MEMORY: u64 = 0x10_0000;
/// `ISA_DMA` requests are confined below this line.
const ISA_DMA_LIMIT: u64 = 0x100_0000;

bitflags::bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
	pub struct AllocFlags: u8 {
		/// The request must be satisfied by one contiguous run.
		const CONTIG = 1 << 0;
		/// Search from the highest range downwards.
		const HIGHEST = 1 << 1;
		/// Allocate ISA-DMA-capable memory (below 16 MiB).
		const ISA_DMA = 1 << 2;
		/// The visitor may terminate the walk early.
		const CB_STOP = 1 << 3;
		/// Begin searching at the caller-provided address.
		const PREFERRED_ADDR = 1 << 4;
	}
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
	#[error("not enough free page frames")]
	NoFrames,
	#[error("the visitor reported an error")]
	Visitor,
}

/// Continuation code returned by allocation visitors and free providers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VisitControl {
	Continue,
	Stop,
	Error,
}

/// Invoked with `(phys_base, bytes_available)`; returns the bytes
/// actually consumed (frames beyond that are released again) and a
/// continuation code.
pub type AllocVisitor<'a> = &'a mut dyn FnMut(PhysAddr, u64) -> (u64, VisitControl);

/// Yields `(phys_base, bytes)` chunks to release, `None` when done.
pub type FreeProvider<'a> = &'a mut dyn FnMut() -> Option<(PhysAddr, u64)>;

/// Tracking header at the tail of every range. Lives in the tracked
/// physical memory itself.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct RangeHeader {
	pub base: u64,
	pub len: u64,
	pub kind: u32,
	pub domain: u32,
	/// Bytes of tracking data (header + bitmap), page aligned.
	pub struct_len: u64,
	/// Physical address of the next header of the same chain, 0 at the
	/// tail.
	pub next_range: u64,
	pub total_frames: u64,
	pub avail_frames: u64,
	/// Scan cursor: first frame index worth looking at.
	pub next_lookup: u64,
}

const HEADER_BYTES: u64 = core::mem::size_of::<RangeHeader>() as u64;

fn bitmap_bytes(range_len: u64) -> u64 {
	(range_len / PAGE_SIZE).div_ceil(FRAMES_PER_WORD) * 8
}

/// Bytes of tracking data for a range of the given length.
fn track_len(range_len: u64) -> u64 {
	(HEADER_BYTES + bitmap_bytes(range_len)).next_multiple_of(PAGE_SIZE)
}

/// How the manager reaches tracking data in the current phase.
pub(crate) trait PhysAccess {
	fn read_header(&mut self, range_phys: u64) -> RangeHeader;
	fn write_header(&mut self, range_phys: u64, header: &RangeHeader);
	/// Load / store one bitmap word of the range at `range_phys`.
	fn load_word(&mut self, range_phys: u64, word_index: u64) -> u64;
	fn store_word(&mut self, range_phys: u64, word_index: u64, value: u64);
}

/// Access through a pair of adjacent remap-window slots.
///
/// The bootstrap phase owns the frame-manager slots; the reserved-range
/// report, whose headers never get a permanent mapping, goes through the
/// firmware-table slots instead.
#[cfg(target_os = "none")]
struct WindowAccess {
	mapped_page: u64,
	first_slot: u16,
	second_slot: u16,
}

#[cfg(target_os = "none")]
impl WindowAccess {
	/// Bootstrap access, slots 510/511.
	const fn bootstrap() -> Self {
		use crate::arch::mm::paging;

		Self {
			mapped_page: u64::MAX,
			first_slot: paging::TEMP_MAP_PFMGR_START,
			second_slot: paging::TEMP_MAP_PFMGR_END,
		}
	}

	/// Firmware-table access, slots 508/509.
	const fn firmware() -> Self {
		use crate::arch::mm::paging;

		Self {
			mapped_page: u64::MAX,
			first_slot: paging::TEMP_MAP_ACPI_START,
			second_slot: paging::TEMP_MAP_ACPI_END,
		}
	}

	/// Map the page containing `phys` (and its successor, for structures
	/// that straddle a page edge) and return the access pointer.
	fn window(&mut self, phys: u64) -> *mut u8 {
		use crate::arch::mm::paging;

		let page = phys & !(PAGE_SIZE - 1);
		if self.mapped_page != page {
			paging::temp_map(PhysAddr::new(page), self.first_slot);
			paging::temp_map(PhysAddr::new(page + PAGE_SIZE), self.second_slot);
			self.mapped_page = page;
		}
		let base = paging::window_vaddr(self.first_slot).as_u64();
		(base + (phys - page)) as *mut u8
	}
}

#[cfg(target_os = "none")]
impl PhysAccess for WindowAccess {
	fn read_header(&mut self, range_phys: u64) -> RangeHeader {
		unsafe { core::ptr::read_unaligned(self.window(range_phys).cast()) }
	}

	fn write_header(&mut self, range_phys: u64, header: &RangeHeader) {
		unsafe {
			core::ptr::write_unaligned(self.window(range_phys).cast(), *header);
		}
	}

	fn load_word(&mut self, range_phys: u64, word_index: u64) -> u64 {
		let phys = range_phys + HEADER_BYTES + word_index * 8;
		unsafe { core::ptr::read_unaligned(self.window(phys).cast()) }
	}

	fn store_word(&mut self, range_phys: u64, word_index: u64, value: u64) {
		let phys = range_phys + HEADER_BYTES + word_index * 8;
		unsafe {
			core::ptr::write_unaligned(self.window(phys).cast(), value);
		}
	}
}

/// Steady-state access through permanent kernel mappings.
struct MappedAccess {
	ranges: SmallVec<[(u64, *mut u8); 16]>,
}

// The raw pointers reference kernel-global mappings.
unsafe impl Send for MappedAccess {}

impl MappedAccess {
	fn vaddr(&self, range_phys: u64) -> *mut u8 {
		self.ranges
			.iter()
			.find(|(phys, _)| *phys == range_phys)
			.map(|(_, vaddr)| *vaddr)
			.expect("range tracking is not mapped")
	}
}

impl PhysAccess for MappedAccess {
	fn read_header(&mut self, range_phys: u64) -> RangeHeader {
		unsafe { core::ptr::read(self.vaddr(range_phys).cast()) }
	}

	fn write_header(&mut self, range_phys: u64, header: &RangeHeader) {
		unsafe {
			core::ptr::write(self.vaddr(range_phys).cast(), *header);
		}
	}

	fn load_word(&mut self, range_phys: u64, word_index: u64) -> u64 {
		unsafe {
			*self
				.vaddr(range_phys)
				.add((HEADER_BYTES + word_index * 8) as usize)
				.cast()
		}
	}

	fn store_word(&mut self, range_phys: u64, word_index: u64, value: u64) {
		unsafe {
			*self
				.vaddr(range_phys)
				.add((HEADER_BYTES + word_index * 8) as usize)
				.cast::<u64>() = value;
		}
	}
}

struct PfmState {
	/// First free-range header, ordered by base address.
	free_head: u64,
	/// First busy-range header.
	busy_head: u64,
	/// Steady-state access table; `None` while bootstrapping.
	mapped: Option<MappedAccess>,
}

static PFM: InterruptTicketMutex<PfmState> = InterruptTicketMutex::new(PfmState {
	free_head: 0,
	busy_head: 0,
	mapped: None,
});

pub static TOTAL_MEMORY: AtomicUsize = AtomicUsize::new(0);

pub fn total_memory_size() -> usize {
	TOTAL_MEMORY.load(Ordering::Relaxed)
}

// --- bitmap primitives, shared by both phases ---------------------------

/// Mark `count` frames starting at `first` busy. Returns how many were
/// actually newly marked (all of them, barring double-allocation bugs).
fn mark_frames(access: &mut dyn PhysAccess, range_phys: u64, first: u64, count: u64) {
	let mut index = first;
	let end = first + count;
	while index < end {
		let word_index = index / FRAMES_PER_WORD;
		let mut word = access.load_word(range_phys, word_index);

		// Mark only the frames of this request, never the whole word.
		while index < end && index / FRAMES_PER_WORD == word_index {
			debug_assert_eq!(word & (1 << (index % FRAMES_PER_WORD)), 0);
			word |= 1 << (index % FRAMES_PER_WORD);
			index += 1;
		}
		access.store_word(range_phys, word_index, word);
	}
}

/// Like [`mark_frames`], but tolerates frames that are already busy.
/// Used while reserving boot-time regions, which may overlap (the boot
/// paging structures can sit inside the kernel image). Returns the
/// number of newly marked frames.
#[cfg(target_os = "none")]
fn mark_frames_new(access: &mut dyn PhysAccess, range_phys: u64, first: u64, count: u64) -> u64 {
	let mut newly_marked = 0;
	let mut index = first;
	let end = first + count;
	while index < end {
		let word_index = index / FRAMES_PER_WORD;
		let mut word = access.load_word(range_phys, word_index);

		while index < end && index / FRAMES_PER_WORD == word_index {
			let bit = 1 << (index % FRAMES_PER_WORD);
			if word & bit == 0 {
				word |= bit;
				newly_marked += 1;
			}
			index += 1;
		}
		access.store_word(range_phys, word_index, word);
	}
	newly_marked
}

fn clear_frames(access: &mut dyn PhysAccess, range_phys: u64, first: u64, count: u64) {
	let mut index = first;
	let end = first + count;
	while index < end {
		let word_index = index / FRAMES_PER_WORD;
		let mut word = access.load_word(range_phys, word_index);

		while index < end && index / FRAMES_PER_WORD == word_index {
			debug_assert_ne!(word & (1 << (index % FRAMES_PER_WORD)), 0);
			word &= !(1 << (index % FRAMES_PER_WORD));
			index += 1;
		}
		access.store_word(range_phys, word_index, word);
	}
}

/// Find the next run of free frames at or after `from`.
///
/// Whole bitmap words are tested first ("all zero" matches 64 frames at
/// once); only partial words fall back to per-bit scanning. Returns
/// `(first_frame, run_length)` with `run_length <= max_len`.
fn find_free_run(
	access: &mut dyn PhysAccess,
	range_phys: u64,
	total_frames: u64,
	from: u64,
	max_len: u64,
) -> Option<(u64, u64)> {
	let mut index = from;

	// Locate the first free frame.
	loop {
		if index >= total_frames {
			return None;
		}

		let word_index = index / FRAMES_PER_WORD;
		let word = access.load_word(range_phys, word_index);

		if word == u64::MAX {
			// Mass-match: the whole word is busy.
			index = (word_index + 1) * FRAMES_PER_WORD;
			continue;
		}

		let bit = index % FRAMES_PER_WORD;
		if word & (1 << bit) == 0 {
			break;
		}
		index += 1;
	}

	let start = index;

	// Extend the run.
	while index < total_frames && index - start < max_len {
		let word_index = index / FRAMES_PER_WORD;
		let word = access.load_word(range_phys, word_index);

		if word == 0 && index % FRAMES_PER_WORD == 0 {
			// Mass-match: 64 free frames at once.
			index = ((word_index + 1) * FRAMES_PER_WORD).min(total_frames);
			continue;
		}

		let bit = index % FRAMES_PER_WORD;
		if word & (1 << bit) != 0 {
			break;
		}
		index += 1;
	}

	Some((start, (index - start).min(max_len)))
}

/// Find a contiguous run of exactly `len` frames, scanning the whole
/// range from frame 0.
fn find_contig_run(
	access: &mut dyn PhysAccess,
	range_phys: u64,
	total_frames: u64,
	len: u64,
) -> Option<u64> {
	let mut from = 0;
	while let Some((start, run)) = find_free_run(access, range_phys, total_frames, from, len) {
		if run >= len {
			return Some(start);
		}
		from = start + run + 1;
	}
	None
}

// --- the allocation walk -------------------------------------------------

struct RangeCursor {
	phys: u64,
	header: RangeHeader,
}

fn collect_ranges(access: &mut dyn PhysAccess, head: u64) -> SmallVec<[RangeCursor; 16]> {
	let mut ranges = SmallVec::new();
	let mut phys = head;
	while phys != 0 {
		let header = access.read_header(phys);
		let next = header.next_range;
		ranges.push(RangeCursor { phys, header });
		phys = next;
	}
	ranges
}

/// Frame-index window of a range that the given flags permit.
fn permitted_window(header: &RangeHeader, flags: AllocFlags) -> Option<(u64, u64)> {
	let range_start = header.base;
	let range_end = header.base + header.total_frames * PAGE_SIZE;

	let (low, high) = if flags.contains(AllocFlags::ISA_DMA) {
		(LOW_MEMORY, ISA_DMA_LIMIT)
	} else {
		(LOW_MEMORY.max(ISA_DMA_LIMIT), u64::MAX)
	};

	let start = range_start.max(low);
	let end = range_end.min(high);
	if start >= end {
		return None;
	}
	Some(((start - range_start) / PAGE_SIZE, (end - range_start) / PAGE_SIZE))
}

fn alloc_with_access(
	access: &mut dyn PhysAccess,
	free_head: u64,
	start: PhysAddr,
	pages: u64,
	flags: AllocFlags,
	visit: AllocVisitor<'_>,
) -> Result<(), FrameError> {
	let mut ranges = collect_ranges(access, free_head);
	if flags.contains(AllocFlags::HIGHEST) {
		ranges.reverse();
	}

	let mut remaining = pages;

	for cursor in &mut ranges {
		if remaining == 0 {
			break;
		}

		let Some((window_first, window_end)) = permitted_window(&cursor.header, flags) else {
			continue;
		};
		if cursor.header.avail_frames == 0 {
			continue;
		}

		if flags.contains(AllocFlags::CONTIG) {
			// A contiguous request rescans the whole range.
			let Some(first) =
				find_contig_run(access, cursor.phys, cursor.header.total_frames, remaining)
			else {
				continue;
			};
			if first < window_first || first + remaining > window_end {
				continue;
			}

			mark_frames(access, cursor.phys, first, remaining);
			cursor.header.avail_frames -= remaining;
			cursor.header.next_lookup = first + remaining;

			let base = PhysAddr::new(cursor.header.base + first * PAGE_SIZE);
			let (used, control) = visit(base, remaining * PAGE_SIZE);
			let used_frames = used.div_ceil(PAGE_SIZE).min(remaining);
			if used_frames < remaining {
				clear_frames(
					access,
					cursor.phys,
					first + used_frames,
					remaining - used_frames,
				);
				cursor.header.avail_frames += remaining - used_frames;
			}
			access.write_header(cursor.phys, &cursor.header);

			return match control {
				VisitControl::Error => Err(FrameError::Visitor),
				_ => Ok(()),
			};
		}

		// Scattered allocation: walk free runs starting at the cursor.
		let mut from = if flags.contains(AllocFlags::PREFERRED_ADDR) {
			let start = start.as_u64();
			if start >= cursor.header.base
				&& start < cursor.header.base + cursor.header.total_frames * PAGE_SIZE
			{
				(start - cursor.header.base) / PAGE_SIZE
			} else {
				cursor.header.next_lookup
			}
		} else {
			cursor.header.next_lookup
		};
		from = from.max(window_first);

		let mut wrapped = false;
		loop {
			if remaining == 0 {
				break;
			}

			let found = find_free_run(access, cursor.phys, window_end, from, remaining);
			let Some((first, run)) = found else {
				if wrapped {
					break;
				}
				// Retry from the window start once; the cursor may have
				// skipped freed frames.
				wrapped = true;
				from = window_first;
				continue;
			};

			mark_frames(access, cursor.phys, first, run);
			cursor.header.avail_frames -= run;
			cursor.header.next_lookup = first + run;
			access.write_header(cursor.phys, &cursor.header);

			let base = PhysAddr::new(cursor.header.base + first * PAGE_SIZE);
			let (used, control) = visit(base, run * PAGE_SIZE);
			let used_frames = used.div_ceil(PAGE_SIZE).min(run);

			if used_frames < run {
				clear_frames(access, cursor.phys, first + used_frames, run - used_frames);
				cursor.header.avail_frames += run - used_frames;
				cursor.header.next_lookup = first + used_frames;
				access.write_header(cursor.phys, &cursor.header);
			}

			remaining -= used_frames;

			match control {
				VisitControl::Continue => {}
				VisitControl::Stop => {
					if remaining > 0 && !flags.contains(AllocFlags::CB_STOP) {
						return Err(FrameError::NoFrames);
					}
					return Ok(());
				}
				VisitControl::Error => return Err(FrameError::Visitor),
			}

			from = first + run;
		}
	}

	if remaining > 0 {
		return Err(FrameError::NoFrames);
	}
	Ok(())
}

fn free_with_access(
	access: &mut dyn PhysAccess,
	free_head: u64,
	provide: FreeProvider<'_>,
) -> Result<(), FrameError> {
	let mut ranges = collect_ranges(access, free_head);

	while let Some((base, bytes)) = provide() {
		let base = base.as_u64();
		let frames = bytes.div_ceil(PAGE_SIZE);

		let Some(cursor) = ranges.iter_mut().find(|r| {
			base >= r.header.base && base + bytes <= r.header.base + r.header.len
		}) else {
			warn!("freeing {base:#X} which no range tracks");
			continue;
		};

		let first = (base - cursor.header.base) / PAGE_SIZE;
		clear_frames(access, cursor.phys, first, frames);
		cursor.header.avail_frames += frames;
		// Pull the cursor back so the freed frames are found again.
		cursor.header.next_lookup = cursor.header.next_lookup.min(first);
		access.write_header(cursor.phys, &cursor.header);
	}

	Ok(())
}

// --- public interface ----------------------------------------------------

fn with_access<R>(
	state: &mut PfmState,
	f: impl FnOnce(&mut dyn PhysAccess, u64) -> R,
) -> R {
	let free_head = state.free_head;
	if let Some(mapped) = state.mapped.as_mut() {
		f(mapped, free_head)
	} else {
		#[cfg(target_os = "none")]
		{
			let mut early = WindowAccess::bootstrap();
			f(&mut early, free_head)
		}
		#[cfg(not(target_os = "none"))]
		unreachable!("the bootstrap phase only exists on the target")
	}
}

/// Allocate `pages` frames, handing them to `visit` in contiguous
/// chunks.
pub fn alloc(
	start: PhysAddr,
	pages: u64,
	flags: AllocFlags,
	visit: AllocVisitor<'_>,
) -> Result<(), FrameError> {
	let mut state = PFM.lock();
	with_access(&mut state, |access, free_head| {
		alloc_with_access(access, free_head, start, pages, flags, visit)
	})
}

/// Release frames yielded by `provide`.
pub fn free(provide: FreeProvider<'_>) -> Result<(), FrameError> {
	let mut state = PFM.lock();
	with_access(&mut state, |access, free_head| {
		free_with_access(access, free_head, provide)
	})
}

/// Allocate one frame anywhere.
pub fn alloc_frame() -> Result<PhysAddr, FrameError> {
	let mut result = PhysAddr::zero();
	alloc(PhysAddr::zero(), 1, AllocFlags::empty(), &mut |base, _avail| {
		result = base;
		(PAGE_SIZE, VisitControl::Stop)
	})?;
	Ok(result)
}

/// Return one frame.
pub fn free_frame(frame: PhysAddr) {
	let mut chunk = Some((frame, PAGE_SIZE));
	let _ = free(&mut || chunk.take());
}

/// One frame during bootstrap, identity-reachable for table building.
#[cfg(target_os = "none")]
pub(crate) fn early_alloc_frame() -> Result<PhysAddr, FrameError> {
	alloc_frame()
}

// --- initialization ------------------------------------------------------

fn kind_code(kind: MemoryKind) -> u32 {
	match kind {
		MemoryKind::Usable => 0,
		MemoryKind::Reserved => 1,
		MemoryKind::AcpiReclaim => 2,
		MemoryKind::AcpiNvs => 3,
		MemoryKind::Bad => 4,
	}
}

/// Phase 1: walk the firmware map, lay the tracking structures into the
/// usable ranges, and mark everything that is already occupied.
#[cfg(target_os = "none")]
pub fn early_init() {
	use crate::arch::mm as layout;

	let mut access = WindowAccess::bootstrap();
	let mut state = PFM.lock();

	let kernel_start = layout::kernel_load_addr().as_u64();
	let kernel_len = layout::kernel_image_len();
	let (boot_paging_start, boot_paging_end) = layout::boot_paging_range();

	// Busy ranges get bare headers in the first frames after the image.
	let busy_store = (kernel_start + kernel_len).next_multiple_of(PAGE_SIZE);
	let mut busy_cursor = busy_store;
	let mut busy_prev: u64 = 0;

	// First pass: record every non-usable range, so the size of the
	// header store is known before any bitmap is marked.
	for region in env::memory_map() {
		if region.kind == MemoryKind::Usable && region.flags.contains(RegionFlags::ENABLED) {
			continue;
		}

		let header = RangeHeader {
			base: region.base,
			len: region.length,
			kind: kind_code(region.kind),
			domain: region.proximity_domain,
			struct_len: HEADER_BYTES,
			next_range: 0,
			total_frames: 0,
			avail_frames: 0,
			next_lookup: 0,
		};
		access.write_header(busy_cursor, &header);

		if busy_prev != 0 {
			let mut prev = access.read_header(busy_prev);
			prev.next_range = busy_cursor;
			access.write_header(busy_prev, &prev);
		} else {
			state.busy_head = busy_cursor;
		}
		busy_prev = busy_cursor;
		busy_cursor += HEADER_BYTES.next_multiple_of(64);
	}
	let busy_store_len = busy_cursor.next_multiple_of(PAGE_SIZE) - busy_store;

	let mut free_prev: u64 = 0;
	let mut total_frames: u64 = 0;

	// Second pass: lay tracking data into every usable range.
	for region in env::memory_map() {
		if region.kind != MemoryKind::Usable || !region.flags.contains(RegionFlags::ENABLED) {
			continue;
		}

		let tracking = track_len(region.length);
		if region.length <= tracking {
			continue;
		}

		// The tracking block sits in the top frames of its own range.
		let range_phys = (region.base + region.length - tracking) & !(PAGE_SIZE - 1);
		let frames = region.length / PAGE_SIZE;

		let mut header = RangeHeader {
			base: region.base,
			len: region.length,
			kind: kind_code(region.kind),
			domain: region.proximity_domain,
			struct_len: tracking,
			next_range: 0,
			total_frames: frames,
			avail_frames: frames,
			next_lookup: 0,
		};
		access.write_header(range_phys, &header);

		// Clear the bitmap.
		for word_index in 0..bitmap_bytes(region.length) / 8 {
			access.store_word(range_phys, word_index, 0);
		}

		// Everything already occupied inside this range becomes busy:
		// the kernel image, the boot paging structures, the busy-header
		// store, and the tracking block itself.
		let mut mark = |start: u64, len: u64, header: &mut RangeHeader| {
			let range_end = region.base + region.length;
			let clamped_start = start.max(region.base);
			let clamped_end = (start + len).min(range_end);
			if clamped_start >= clamped_end {
				return;
			}
			let first = (clamped_start - region.base) / PAGE_SIZE;
			let count = (clamped_end - clamped_start).div_ceil(PAGE_SIZE);
			let newly_marked = mark_frames_new(&mut access, range_phys, first, count);
			header.avail_frames -= newly_marked;
		};

		mark(kernel_start, kernel_len, &mut header);
		mark(
			boot_paging_start.as_u64(),
			boot_paging_end.as_u64() - boot_paging_start.as_u64(),
			&mut header,
		);
		mark(busy_store, busy_store_len, &mut header);
		mark(range_phys, tracking, &mut header);

		access.write_header(range_phys, &header);

		if free_prev != 0 {
			let mut prev = access.read_header(free_prev);
			prev.next_range = range_phys;
			access.write_header(free_prev, &prev);
		} else {
			state.free_head = range_phys;
		}
		free_prev = range_phys;
		total_frames += header.avail_frames;

		debug!(
			"Tracking usable range {:#X}..{:#X} ({} free frames)",
			region.base,
			region.base + region.length,
			header.avail_frames
		);
	}

	TOTAL_MEMORY.store((total_frames * PAGE_SIZE) as usize, Ordering::Relaxed);
	info!(
		"Frame manager bootstrapped with {} MiB of free memory",
		total_frames * PAGE_SIZE / (1024 * 1024)
	);
}

/// Phase 2: map every range's tracking data into the kernel address
/// space and swap to the steady-state access routines.
#[cfg(target_os = "none")]
pub fn init() {
	use crate::arch::mm::paging::MemAttr;
	use crate::mm::virtualmem::{self, VmFlags};

	// Collect the chain first; mapping goes through the address-space
	// manager, whose table walker allocates frames from this allocator.
	let chain: SmallVec<[(u64, u64); 16]> = {
		let state = PFM.lock();
		let mut early = WindowAccess::bootstrap();
		let mut chain = SmallVec::new();
		let mut phys = state.free_head;
		while phys != 0 {
			let header = early.read_header(phys);
			chain.push((phys, header.struct_len));
			phys = header.next_range;
		}
		chain
	};

	let kernel_vas = virtualmem::kernel_context();
	let mut mapped = MappedAccess {
		ranges: SmallVec::new(),
	};

	for (phys, struct_len) in chain {
		let vaddr = kernel_vas
			.map(
				None,
				struct_len,
				PhysAddr::new(phys),
				VmFlags::HIGH_MEM | VmFlags::PERMANENT,
				MemAttr::WRITABLE,
			)
			.expect("cannot map frame-tracking data");

		mapped.ranges.push((phys, vaddr.as_mut_ptr()));
	}

	// The operations swap: from here on every path uses the permanent
	// mappings.
	PFM.lock().mapped = Some(mapped);
	info!("Frame manager switched to steady-state access");
}

/// Log the free regions and return the total number of free bytes.
pub fn print_free_memory() -> u64 {
	let mut state = PFM.lock();
	let mut total = 0;

	infoheader!(" PHYSICAL MEMORY ");
	with_access(&mut state, |access, free_head| {
		let mut phys = free_head;
		while phys != 0 {
			let header = access.read_header(phys);
			info!(
				"{:#016X} - {:#016X} ({} / {} frames free)",
				header.base,
				header.base + header.len,
				header.avail_frames,
				header.total_frames
			);
			total += header.avail_frames * PAGE_SIZE;
			phys = header.next_range;
		}
	});
	infoentry!("Total free", "{} KiB", total / 1024);
	infofooter!();

	total
}

/// Log the reserved firmware ranges.
///
/// Their bare headers keep no permanent mapping, so the walk runs
/// through the firmware window slots; the manager lock keeps the chain
/// stable meanwhile.
#[cfg(target_os = "none")]
pub fn print_reserved_memory() {
	let state = PFM.lock();
	let mut access = WindowAccess::firmware();

	infoheader!(" RESERVED MEMORY ");
	let mut phys = state.busy_head;
	while phys != 0 {
		let header = access.read_header(phys);
		info!(
			"{:#016X} - {:#016X} type {} domain {}",
			header.base,
			header.base + header.len,
			header.kind,
			header.domain
		);
		phys = header.next_range;
	}
	infofooter!();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use std::collections::HashMap;
	use std::vec::Vec;

	use super::*;

	/// Tracking data held in plain memory for the tests.
	struct TestAccess {
		headers: HashMap<u64, RangeHeader>,
		bitmaps: HashMap<u64, Vec<u64>>,
	}

	impl TestAccess {
		fn with_range(base: u64, len: u64) -> (Self, u64) {
			let range_phys = base + len - track_len(len);
			let frames = len / PAGE_SIZE;
			let header = RangeHeader {
				base,
				len,
				total_frames: frames,
				avail_frames: frames,
				struct_len: track_len(len),
				..RangeHeader::default()
			};

			let words = (bitmap_bytes(len) / 8) as usize;
			let mut access = Self {
				headers: HashMap::new(),
				bitmaps: HashMap::new(),
			};
			access.headers.insert(range_phys, header);
			access.bitmaps.insert(range_phys, vec![0; words]);
			(access, range_phys)
		}

		fn busy_count(&self, range_phys: u64) -> u64 {
			self.bitmaps[&range_phys]
				.iter()
				.map(|w| u64::from(w.count_ones()))
				.sum()
		}
	}

	impl PhysAccess for TestAccess {
		fn read_header(&mut self, range_phys: u64) -> RangeHeader {
			self.headers[&range_phys]
		}

		fn write_header(&mut self, range_phys: u64, header: &RangeHeader) {
			self.headers.insert(range_phys, *header);
		}

		fn load_word(&mut self, range_phys: u64, word_index: u64) -> u64 {
			self.bitmaps[&range_phys][word_index as usize]
		}

		fn store_word(&mut self, range_phys: u64, word_index: u64, value: u64) {
			self.bitmaps.get_mut(&range_phys).unwrap()[word_index as usize] = value;
		}
	}

	// 16 MiB of "RAM" starting right at the ISA DMA limit, so plain
	// requests are allowed everywhere in it.
	const BASE: u64 = 0x100_0000;
	const LEN: u64 = 16 * 1024 * 1024;

	fn collect_all(pages: u64, flags: AllocFlags, access: &mut TestAccess, head: u64) -> Vec<(u64, u64)> {
		let mut chunks = Vec::new();
		alloc_with_access(
			access,
			head,
			PhysAddr::zero(),
			pages,
			flags,
			&mut |base, avail| {
				chunks.push((base.as_u64(), avail));
				(avail, VisitControl::Continue)
			},
		)
		.unwrap();
		chunks
	}

	#[test]
	fn alloc_marks_only_used_frames() {
		let (mut access, head) = TestAccess::with_range(BASE, LEN);

		// Take 3 frames out of a visit that offers more.
		alloc_with_access(
			&mut access,
			head,
			PhysAddr::zero(),
			3,
			AllocFlags::empty(),
			&mut |_base, avail| {
				assert!(avail >= 3 * PAGE_SIZE);
				(3 * PAGE_SIZE, VisitControl::Stop)
			},
		)
		.unwrap();

		// Exactly three bits are set, not a whole 64-frame word.
		assert_eq!(access.busy_count(head), 3);
		assert_eq!(
			access.read_header(head).avail_frames,
			LEN / PAGE_SIZE - 3
		);
	}

	#[test]
	fn frames_are_never_handed_out_twice() {
		let (mut access, head) = TestAccess::with_range(BASE, LEN);

		let first = collect_all(64, AllocFlags::empty(), &mut access, head);
		let second = collect_all(64, AllocFlags::empty(), &mut access, head);

		let mut seen = std::collections::HashSet::new();
		for (base, bytes) in first.iter().chain(second.iter()) {
			for frame in (*base..*base + *bytes).step_by(PAGE_SIZE as usize) {
				assert!(seen.insert(frame), "frame {frame:#X} handed out twice");
			}
		}
	}

	#[test]
	fn free_returns_frames() {
		let (mut access, head) = TestAccess::with_range(BASE, LEN);
		let chunks = collect_all(10, AllocFlags::empty(), &mut access, head);
		assert_eq!(access.busy_count(head), 10);

		let mut iter = chunks.into_iter();
		free_with_access(&mut access, head, &mut || {
			iter.next().map(|(base, bytes)| (PhysAddr::new(base), bytes))
		})
		.unwrap();

		assert_eq!(access.busy_count(head), 0);
		assert_eq!(access.read_header(head).avail_frames, LEN / PAGE_SIZE);
	}

	#[test]
	fn contig_allocation_is_one_chunk() {
		let (mut access, head) = TestAccess::with_range(BASE, LEN);

		// Fragment the start of the range: frames 0..3 and 5..8 busy,
		// frame 4 free.
		mark_frames(&mut access, head, 0, 3);
		mark_frames(&mut access, head, 5, 3);

		let chunks = collect_all(100, AllocFlags::CONTIG, &mut access, head);
		assert_eq!(chunks.len(), 1);
		let (base, bytes) = chunks[0];
		assert_eq!(bytes, 100 * PAGE_SIZE);
		// The run must skip the fragmented head of the range.
		assert!(base >= BASE + 8 * PAGE_SIZE);
	}

	#[test]
	fn exhaustion_reports_no_frames() {
		let small_len = 1024 * 1024; // 256 frames
		let (mut access, head) = TestAccess::with_range(BASE, small_len);
		let usable = small_len / PAGE_SIZE;

		let result = alloc_with_access(
			&mut access,
			head,
			PhysAddr::zero(),
			usable + 1,
			AllocFlags::empty(),
			&mut |_base, avail| (avail, VisitControl::Continue),
		);
		assert_eq!(result, Err(FrameError::NoFrames));
	}

	#[test]
	fn isa_dma_stays_low() {
		// A range straddling the 16 MiB line.
		let (mut access, head) = TestAccess::with_range(0x80_0000, 32 * 1024 * 1024);

		let chunks = collect_all(4, AllocFlags::ISA_DMA, &mut access, head);
		for (base, bytes) in chunks {
			assert!(base + bytes <= ISA_DMA_LIMIT);
			assert!(base >= LOW_MEMORY);
		}
	}

	#[test]
	fn preferred_address_starts_there() {
		let (mut access, head) = TestAccess::with_range(BASE, LEN);
		let preferred = BASE + 8 * 1024 * 1024;

		let mut first_base = 0;
		alloc_with_access(
			&mut access,
			head,
			PhysAddr::new(preferred),
			1,
			AllocFlags::PREFERRED_ADDR,
			&mut |base, _avail| {
				first_base = base.as_u64();
				(PAGE_SIZE, VisitControl::Stop)
			},
		)
		.unwrap();

		assert_eq!(first_base, preferred);
	}

	#[test]
	fn visitor_error_propagates() {
		let (mut access, head) = TestAccess::with_range(BASE, LEN);

		let result = alloc_with_access(
			&mut access,
			head,
			PhysAddr::zero(),
			4,
			AllocFlags::empty(),
			&mut |_base, _avail| (0, VisitControl::Error),
		);
		assert_eq!(result, Err(FrameError::Visitor));
	}

	#[test]
	fn cursor_accelerates_and_wraps() {
		let (mut access, head) = TestAccess::with_range(BASE, LEN);

		let first = collect_all(4, AllocFlags::empty(), &mut access, head);
		let second = collect_all(4, AllocFlags::empty(), &mut access, head);
		// Successive allocations move forward.
		assert!(second[0].0 > first[0].0);

		// Free the first chunk; the cursor must wrap back and find it.
		let mut iter = first.clone().into_iter();
		free_with_access(&mut access, head, &mut || {
			iter.next().map(|(base, bytes)| (PhysAddr::new(base), bytes))
		})
		.unwrap();

		let third = collect_all(4, AllocFlags::empty(), &mut access, head);
		assert_eq!(third[0].0, first[0].0);
	}
}
